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

//! Campaign-wide coverage maps.
//!
//! Executed program counters are tracked per code hash (not per address:
//! two instances of one contract share coverage). A sequence whose calls
//! reach new ground is worth keeping in the corpus.

use alloy_primitives::B256;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

/// Shared coverage maps keyed by code hash.
#[derive(Default)]
pub struct CoverageMaps {
    maps: RwLock<HashMap<B256, HashSet<u64>>>,
}

impl CoverageMaps {
    /// New empty maps.
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge executed `(code hash, pc)` pairs. Returns whether anything
    /// new was covered.
    pub fn update(&self, coverage: &[(B256, u64)]) -> bool {
        if coverage.is_empty() {
            return false;
        }

        // Cheap read-only pass first; most calls cover nothing new.
        {
            let maps = self.maps.read();
            if coverage
                .iter()
                .all(|(hash, pc)| maps.get(hash).is_some_and(|pcs| pcs.contains(pc)))
            {
                return false;
            }
        }

        let mut maps = self.maps.write();
        let mut changed = false;
        for (hash, pc) in coverage {
            changed |= maps.entry(*hash).or_default().insert(*pc);
        }
        changed
    }

    /// Total number of covered program counters.
    pub fn covered_points(&self) -> usize {
        self.maps.read().values().map(HashSet::len).sum()
    }

    /// Number of distinct code bodies touched.
    pub fn covered_codes(&self) -> usize {
        self.maps.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_reports_new_ground_only_once() {
        let maps = CoverageMaps::new();
        let code = B256::with_last_byte(1);

        assert!(maps.update(&[(code, 0), (code, 1)]));
        assert!(!maps.update(&[(code, 0), (code, 1)]));
        assert!(maps.update(&[(code, 2)]));
        assert_eq!(maps.covered_points(), 3);
        assert_eq!(maps.covered_codes(), 1);
    }

    #[test]
    fn test_empty_update_is_not_new() {
        let maps = CoverageMaps::new();
        assert!(!maps.update(&[]));
    }

    #[test]
    fn test_coverage_is_shared_per_code_hash() {
        let maps = CoverageMaps::new();
        let a = B256::with_last_byte(1);
        let b = B256::with_last_byte(2);

        assert!(maps.update(&[(a, 7)]));
        // The same pc under a different code hash is new ground.
        assert!(maps.update(&[(b, 7)]));
        assert_eq!(maps.covered_codes(), 2);
    }
}
