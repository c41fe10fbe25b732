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

//! Campaign configuration.
//!
//! Plain serde structs with defaults; loading them from files or flags is
//! the embedder's concern.

use crate::testing::AssertionConfig;
use alloy_primitives::{address, Address};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default sender accounts, pre-funded on every worker chain.
pub const DEFAULT_SENDERS: [Address; 3] = [
    address!("0000000000000000000000000000000000010000"),
    address!("0000000000000000000000000000000000020000"),
    address!("0000000000000000000000000000000000030000"),
];

/// Top-level fuzzing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FuzzerConfig {
    /// Number of parallel workers.
    pub workers: usize,
    /// Sequences a worker executes before its slot is recycled; bounds
    /// chain-state growth.
    pub worker_reset_limit: u64,
    /// Maximum calls per generated sequence.
    pub call_sequence_length: usize,
    /// Stop after this many executed calls (0 = unlimited).
    pub test_limit: u64,
    /// Stop after this many seconds (0 = no deadline).
    pub timeout: u64,
    /// Campaign seed; derived from entropy when absent.
    pub seed: Option<u64>,
    /// Gas limit of each block on the test chains.
    pub block_gas_limit: u64,
    /// Gas budget of each generated transaction.
    pub transaction_gas_limit: u64,
    /// Candidate executions each shrink run may spend.
    pub shrink_limit: u64,
    /// Corpus directory; the corpus stays in memory when absent.
    pub corpus_dir: Option<PathBuf>,
    /// Accounts transactions are sent from.
    pub sender_addresses: Vec<Address>,
    /// Account contracts are deployed from.
    pub deployer_address: Address,
    /// Contract names in deployment order.
    pub deployment_order: Vec<String>,
    /// Test-provider configuration.
    pub testing: TestingConfig,
    /// Forked-mode configuration; unforked when absent.
    pub fork: Option<ForkConfig>,
}

impl Default for FuzzerConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            worker_reset_limit: 50,
            call_sequence_length: 100,
            test_limit: 0,
            timeout: 0,
            seed: None,
            block_gas_limit: 125_000_000,
            transaction_gas_limit: 12_500_000,
            shrink_limit: 250,
            corpus_dir: None,
            sender_addresses: DEFAULT_SENDERS.to_vec(),
            deployer_address: DEFAULT_SENDERS[2],
            deployment_order: Vec::new(),
            testing: TestingConfig::default(),
            fork: None,
        }
    }
}

/// Configuration of the three test providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TestingConfig {
    /// Method-name prefixes treated as property tests.
    pub property_prefixes: Vec<String>,
    /// Method-name prefixes treated as optimization tests.
    pub optimization_prefixes: Vec<String>,
    /// Assertion-mode settings.
    pub assertion: AssertionConfig,
}

impl Default for TestingConfig {
    fn default() -> Self {
        Self {
            property_prefixes: vec!["property_".into()],
            optimization_prefixes: vec!["optimize_".into()],
            assertion: AssertionConfig::default(),
        }
    }
}

impl TestingConfig {
    /// All prefixes naming test methods rather than fuzzable surface.
    pub fn test_method_prefixes(&self) -> Vec<String> {
        let mut prefixes = self.property_prefixes.clone();
        prefixes.extend(self.optimization_prefixes.iter().cloned());
        prefixes
    }
}

/// Forked-mode configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForkConfig {
    /// The remote JSON-RPC endpoint.
    pub endpoint: String,
    /// Block height every read is pinned to.
    pub height: u64,
    /// Number of pooled HTTP clients.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Retry budget for failed dispatches.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Working directory for the on-disk RPC cache; cache stays
    /// memory-only when absent.
    #[serde(default)]
    pub workdir: Option<PathBuf>,
}

fn default_pool_size() -> usize {
    ferret_fork::DEFAULT_POOL_SIZE
}

fn default_max_retries() -> u32 {
    ferret_fork::DEFAULT_MAX_RETRIES
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let config = FuzzerConfig::default();
        assert!(config.workers > 0);
        assert!(config.call_sequence_length > 0);
        assert!(config.transaction_gas_limit <= config.block_gas_limit);
        assert_eq!(config.sender_addresses.len(), 3);
        assert!(config.fork.is_none());
    }

    #[test]
    fn test_partial_deserialization_fills_defaults() {
        let config: FuzzerConfig =
            serde_json::from_str(r#"{"workers": 2, "test_limit": 1000}"#).unwrap();
        assert_eq!(config.workers, 2);
        assert_eq!(config.test_limit, 1000);
        assert_eq!(config.call_sequence_length, 100);
        assert_eq!(config.testing.property_prefixes, vec!["property_".to_string()]);
    }

    #[test]
    fn test_fork_config_defaults() {
        let fork: ForkConfig = serde_json::from_str(
            r#"{"endpoint": "https://rpc.example", "height": 1000000}"#,
        )
        .unwrap();
        assert_eq!(fork.pool_size, ferret_fork::DEFAULT_POOL_SIZE);
        assert_eq!(fork.max_retries, ferret_fork::DEFAULT_MAX_RETRIES);
        assert!(fork.workdir.is_none());
    }
}
