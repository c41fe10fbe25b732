// ferret - coverage-guided fuzzing for EVM smart contracts
// Copyright (C) 2026 ferret contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Campaign metrics.
//!
//! Workers accumulate locally and flush into the shared atomics; the
//! fuzzer snapshots the totals for reporting.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters a worker accumulates between flushes.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkerMetrics {
    /// Sequences executed.
    pub sequences_tested: u64,
    /// Calls executed.
    pub calls_tested: u64,
    /// Candidate executions spent shrinking.
    pub shrink_executions: u64,
}

/// Shared campaign-wide counters.
#[derive(Debug, Default)]
pub struct CampaignMetrics {
    sequences_tested: AtomicU64,
    calls_tested: AtomicU64,
    shrink_executions: AtomicU64,
    workers_spawned: AtomicU64,
    worker_resets: AtomicU64,
}

/// A point-in-time copy of the campaign counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Sequences executed across all workers.
    pub sequences_tested: u64,
    /// Calls executed across all workers.
    pub calls_tested: u64,
    /// Candidate executions spent shrinking.
    pub shrink_executions: u64,
    /// Workers spawned over the campaign.
    pub workers_spawned: u64,
    /// Workers recycled after hitting their reset limit.
    pub worker_resets: u64,
}

impl CampaignMetrics {
    /// New zeroed metrics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one worker's local counters into the totals.
    pub fn flush_worker(&self, metrics: WorkerMetrics) {
        self.sequences_tested.fetch_add(metrics.sequences_tested, Ordering::Relaxed);
        self.calls_tested.fetch_add(metrics.calls_tested, Ordering::Relaxed);
        self.shrink_executions.fetch_add(metrics.shrink_executions, Ordering::Relaxed);
    }

    /// Record a worker being spawned.
    pub fn record_worker_spawned(&self) {
        self.workers_spawned.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a worker hitting its reset limit.
    pub fn record_worker_reset(&self) {
        self.worker_resets.fetch_add(1, Ordering::Relaxed);
    }

    /// Calls executed so far (cheap, for limit checks).
    pub fn calls_tested(&self) -> u64 {
        self.calls_tested.load(Ordering::Relaxed)
    }

    /// Copy of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sequences_tested: self.sequences_tested.load(Ordering::Relaxed),
            calls_tested: self.calls_tested.load(Ordering::Relaxed),
            shrink_executions: self.shrink_executions.load(Ordering::Relaxed),
            workers_spawned: self.workers_spawned.load(Ordering::Relaxed),
            worker_resets: self.worker_resets.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flush_accumulates() {
        let metrics = CampaignMetrics::new();
        metrics.record_worker_spawned();
        metrics.flush_worker(WorkerMetrics {
            sequences_tested: 3,
            calls_tested: 40,
            shrink_executions: 5,
        });
        metrics.flush_worker(WorkerMetrics {
            sequences_tested: 1,
            calls_tested: 2,
            shrink_executions: 0,
        });

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.sequences_tested, 4);
        assert_eq!(snapshot.calls_tested, 42);
        assert_eq!(snapshot.shrink_executions, 5);
        assert_eq!(snapshot.workers_spawned, 1);
    }
}
