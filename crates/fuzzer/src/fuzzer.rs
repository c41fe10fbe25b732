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

//! The fuzzer: worker scheduling and campaign lifecycle.
//!
//! Worker slots are managed with a bounded semaphore plus a free-index
//! queue: spawning pops an index, a worker exit pushes it back and
//! releases the permit. Workers run on blocking threads; the scheduler
//! itself is async so timeouts and shutdown compose with the backend.

use crate::{
    config::FuzzerConfig,
    contracts::ContractDefinition,
    corpus::Corpus,
    metrics::MetricsSnapshot,
    testing::TestCase,
    worker::{EvmFactory, FuzzerWorker, Services, StateFactory, WorkerExit},
};
use parking_lot::Mutex;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Result of a finished campaign.
#[derive(Debug)]
pub struct FuzzingSummary {
    /// Final campaign counters.
    pub metrics: MetricsSnapshot,
    /// Every test case with its final status.
    pub test_cases: Vec<TestCase>,
    /// Distinct program counters covered.
    pub coverage_points: usize,
    /// Wall-clock duration of the campaign.
    pub elapsed: Duration,
}

impl FuzzingSummary {
    /// Whether any test case failed.
    pub fn has_failures(&self) -> bool {
        self.test_cases
            .iter()
            .any(|case| case.status == crate::testing::TestCaseStatus::Failed)
    }
}

/// The campaign driver.
pub struct Fuzzer {
    config: Arc<FuzzerConfig>,
    contracts: Vec<Arc<ContractDefinition>>,
    services: Arc<Services>,
    state_factory: Arc<dyn StateFactory>,
    evm_factory: Arc<dyn EvmFactory>,
}

impl Fuzzer {
    /// New fuzzer over the given contract definitions and factories.
    ///
    /// The corpus is opened from the configured directory, or kept in
    /// memory when none is configured.
    pub fn new(
        config: FuzzerConfig,
        contracts: Vec<ContractDefinition>,
        state_factory: Arc<dyn StateFactory>,
        evm_factory: Arc<dyn EvmFactory>,
    ) -> eyre::Result<Self> {
        Self::with_shutdown(
            config,
            contracts,
            state_factory,
            evm_factory,
            tokio::sync::broadcast::channel(1).0,
        )
    }

    /// Like [`Self::new`], sharing an external shutdown channel.
    ///
    /// Hand the same channel to the remote backend so that cancellation
    /// (timeout, test limit, external stop) also aborts its inflight
    /// requests.
    pub fn with_shutdown(
        config: FuzzerConfig,
        contracts: Vec<ContractDefinition>,
        state_factory: Arc<dyn StateFactory>,
        evm_factory: Arc<dyn EvmFactory>,
        shutdown: tokio::sync::broadcast::Sender<()>,
    ) -> eyre::Result<Self> {
        let corpus = match &config.corpus_dir {
            Some(dir) => Corpus::open(dir)?,
            None => Corpus::ephemeral(),
        };
        Ok(Self {
            config: Arc::new(config),
            contracts: contracts.into_iter().map(Arc::new).collect(),
            services: Arc::new(Services::with_shutdown(corpus, shutdown)),
            state_factory,
            evm_factory,
        })
    }

    /// The shared campaign services (registry, corpus, metrics,
    /// shutdown channel).
    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    /// Run the campaign to completion: until the test limit, the
    /// timeout, or an external [`Services::cancel`].
    pub async fn run(&self) -> eyre::Result<FuzzingSummary> {
        let started = Instant::now();
        let worker_count = self.config.workers.max(1);
        info!(
            workers = worker_count,
            contracts = self.contracts.len(),
            test_limit = self.config.test_limit,
            timeout = self.config.timeout,
            "Starting fuzzing campaign"
        );

        // Arm the global deadline.
        if self.config.timeout > 0 {
            let services = self.services.clone();
            let timeout = Duration::from_secs(self.config.timeout);
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                warn!("Campaign timeout reached");
                services.cancel();
            });
        }

        let campaign_seed = self.config.seed.unwrap_or_else(rand::random);
        debug!(campaign_seed, "Campaign seed resolved");

        let semaphore = Arc::new(Semaphore::new(worker_count));
        let free_slots: Arc<Mutex<Vec<usize>>> =
            Arc::new(Mutex::new((0..worker_count).rev().collect()));
        let mut join_set = tokio::task::JoinSet::new();
        let mut spawned: u64 = 0;

        while !self.services.is_cancelled() {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("worker semaphore never closes");
            if self.services.is_cancelled() {
                break;
            }

            let index = free_slots
                .lock()
                .pop()
                .expect("a held permit guarantees a free slot");
            let worker = FuzzerWorker::new(
                index,
                // Every spawn gets a distinct stream, including respawns
                // of the same slot.
                campaign_seed.wrapping_add(spawned),
                self.config.clone(),
                self.contracts.clone(),
                self.services.clone(),
                self.state_factory.clone(),
                self.evm_factory.clone(),
            );
            spawned += 1;
            self.services.metrics.record_worker_spawned();

            let free_slots = free_slots.clone();
            join_set.spawn(async move {
                let result = tokio::task::spawn_blocking(move || worker.run()).await;
                // Slot returns before the permit releases, so the next
                // acquirer always finds a free index.
                free_slots.lock().push(index);
                drop(permit);
                result
            });

            // Reap finished workers without blocking the spawn loop.
            while let Some(joined) = join_set.try_join_next() {
                Self::handle_worker_exit(joined);
            }
        }

        while let Some(joined) = join_set.join_next().await {
            Self::handle_worker_exit(joined);
        }

        self.services.registry.finalize();
        let summary = FuzzingSummary {
            metrics: self.services.metrics.snapshot(),
            test_cases: self.services.registry.cases(),
            coverage_points: self.services.coverage.covered_points(),
            elapsed: started.elapsed(),
        };
        info!(
            sequences = summary.metrics.sequences_tested,
            calls = summary.metrics.calls_tested,
            coverage = summary.coverage_points,
            failures = summary.test_cases.iter().filter(|c| c.status == crate::testing::TestCaseStatus::Failed).count(),
            "Campaign finished"
        );
        Ok(summary)
    }

    fn handle_worker_exit(
        joined: Result<Result<eyre::Result<WorkerExit>, tokio::task::JoinError>, tokio::task::JoinError>,
    ) {
        match joined {
            Ok(Ok(Ok(WorkerExit::ResetLimit))) => {
                debug!("Worker recycled after reset limit");
            }
            Ok(Ok(Ok(WorkerExit::Finished))) => {}
            Ok(Ok(Err(err))) => warn!(%err, "Worker failed"),
            Ok(Err(err)) => warn!(%err, "Worker thread panicked"),
            Err(err) => warn!(%err, "Worker task failed to join"),
        }
    }
}
