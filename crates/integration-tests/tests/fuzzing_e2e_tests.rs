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

//! End-to-end fuzzing campaigns over the scripted EVM.

use alloy_primitives::{Bytes, B256, I256, U256};
use ferret_fork::{EmptyBackend, StateBackend};
use ferret_fuzzer::{
    panic_codes, AbiType, BackendStateFactory, ContractDefinition, Fuzzer, FuzzerConfig,
    MethodDefinition, TestCaseKind, TestCaseStatus,
};
use ferret_integration_tests::{behaviors, Behavior, SimEvmFactory};
use std::sync::Arc;

const COUNT_SLOT: B256 = B256::ZERO;

fn empty_state_factory() -> Arc<BackendStateFactory> {
    Arc::new(BackendStateFactory::new(Arc::new(EmptyBackend) as Arc<dyn StateBackend>))
}

fn quick_config(seed: u64, test_limit: u64) -> FuzzerConfig {
    FuzzerConfig {
        workers: 2,
        worker_reset_limit: 25,
        call_sequence_length: 6,
        test_limit,
        timeout: 60,
        seed: Some(seed),
        shrink_limit: 50,
        ..FuzzerConfig::default()
    }
}

fn counter_contract(methods: Vec<MethodDefinition>) -> ContractDefinition {
    ContractDefinition::new("Vault", Bytes::from_static(&[0x60, 0x80, 0x60, 0x40]), methods)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn property_violation_is_found_and_shrunk() {
    ferret_common::logging::ensure_test_logging(None);

    let contract = counter_contract(vec![
        MethodDefinition::new("setCount", vec![AbiType::Uint]),
        MethodDefinition::new("property_countSmall", vec![]),
    ]);
    let evm_factory = Arc::new(SimEvmFactory::new(behaviors(&[
        ("setCount(uint256)", Behavior::StoreArg { slot: COUNT_SLOT }),
        (
            "property_countSmall()",
            Behavior::BoolSlotBelow { slot: COUNT_SLOT, threshold: U256::from(1_000) },
        ),
    ])));

    let fuzzer = Fuzzer::new(
        quick_config(1234, 5_000),
        vec![contract],
        empty_state_factory(),
        evm_factory,
    )
    .unwrap();
    let summary = fuzzer.run().await.unwrap();

    assert!(summary.has_failures());
    let case = summary
        .test_cases
        .iter()
        .find(|c| c.id == "Vault.property_countSmall()")
        .expect("property case registered");
    assert_eq!(case.kind, TestCaseKind::Property);
    assert_eq!(case.status, TestCaseStatus::Failed);

    // The surfaced sequence is shrunk to the single violating call and
    // carries an execution trace.
    let sequence = case.sequence.as_ref().expect("failing sequence attached");
    assert_eq!(sequence.len(), 1);
    let violating = &sequence.elements[0];
    assert_eq!(violating.contract.as_deref(), Some("Vault"));
    assert!(case.trace.is_some());

    // The failure fed the corpus.
    assert!(summary.metrics.sequences_tested > 0);
    assert!(summary.metrics.shrink_executions > 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn optimization_maximum_is_tracked() {
    ferret_common::logging::ensure_test_logging(None);

    let contract = counter_contract(vec![
        MethodDefinition::new("setCount", vec![AbiType::Uint]),
        MethodDefinition::new("optimize_count", vec![]),
    ]);
    let evm_factory = Arc::new(SimEvmFactory::new(behaviors(&[
        ("setCount(uint256)", Behavior::StoreArg { slot: COUNT_SLOT }),
        ("optimize_count()", Behavior::IntSlot { slot: COUNT_SLOT }),
    ])));

    let mut config = quick_config(99, 2_000);
    config.shrink_limit = 20;
    let fuzzer =
        Fuzzer::new(config, vec![contract], empty_state_factory(), evm_factory).unwrap();
    let summary = fuzzer.run().await.unwrap();

    let case = summary
        .test_cases
        .iter()
        .find(|c| c.id == "Vault.optimize_count()")
        .expect("optimization case registered");
    assert_eq!(case.kind, TestCaseKind::Optimization);
    // Optimization tests do not fail; they carry their best value and
    // the sequence that reached it.
    assert_eq!(case.status, TestCaseStatus::Passed);
    let value = case.value.expect("an improved value was recorded");
    assert!(value > I256::ZERO);
    assert!(case.sequence.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn assertion_panic_is_a_failure() {
    ferret_common::logging::ensure_test_logging(None);

    let contract =
        counter_contract(vec![MethodDefinition::new("poke", vec![AbiType::Uint])]);
    let evm_factory = Arc::new(SimEvmFactory::new(behaviors(&[(
        "poke(uint256)",
        Behavior::PanicIfArgAbove {
            threshold: U256::from(100),
            code: panic_codes::ASSERT_FAILED,
        },
    )])));

    let fuzzer = Fuzzer::new(
        quick_config(7, 5_000),
        vec![contract],
        empty_state_factory(),
        evm_factory,
    )
    .unwrap();
    let summary = fuzzer.run().await.unwrap();

    let case = summary
        .test_cases
        .iter()
        .find(|c| c.id == "Vault.poke(uint256)")
        .expect("assertion case registered");
    assert_eq!(case.kind, TestCaseKind::Assertion);
    assert_eq!(case.status, TestCaseStatus::Failed);

    let sequence = case.sequence.as_ref().expect("failing sequence attached");
    assert_eq!(sequence.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn worker_slots_are_recycled() {
    ferret_common::logging::ensure_test_logging(None);

    let contract = counter_contract(vec![
        MethodDefinition::new("setCount", vec![AbiType::Uint]),
        MethodDefinition::new("property_alwaysHolds", vec![]),
    ]);
    let evm_factory = Arc::new(SimEvmFactory::new(behaviors(&[
        ("setCount(uint256)", Behavior::StoreArg { slot: COUNT_SLOT }),
        (
            "property_alwaysHolds()",
            Behavior::BoolSlotBelow { slot: COUNT_SLOT, threshold: U256::MAX },
        ),
    ])));

    let mut config = quick_config(5, 600);
    config.workers = 3;
    config.worker_reset_limit = 2;
    config.call_sequence_length = 4;
    let fuzzer =
        Fuzzer::new(config, vec![contract], empty_state_factory(), evm_factory).unwrap();
    let summary = fuzzer.run().await.unwrap();

    // Slots were reused: more workers were spawned than exist at once,
    // and every exit released exactly one slot (or the campaign could
    // not have kept spawning).
    assert!(summary.metrics.worker_resets >= 1);
    assert!(summary.metrics.workers_spawned > 3);
    assert!(!summary.has_failures());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn timeout_cancels_the_campaign() {
    ferret_common::logging::ensure_test_logging(None);

    let contract = counter_contract(vec![MethodDefinition::new(
        "setCount",
        vec![AbiType::Uint],
    )]);
    let evm_factory = Arc::new(SimEvmFactory::new(behaviors(&[(
        "setCount(uint256)",
        Behavior::StoreArg { slot: COUNT_SLOT },
    )])));

    let mut config = quick_config(3, 0);
    config.timeout = 1;
    let fuzzer =
        Fuzzer::new(config, vec![contract], empty_state_factory(), evm_factory).unwrap();

    let started = std::time::Instant::now();
    let summary = fuzzer.run().await.unwrap();
    assert!(started.elapsed().as_secs() < 30);
    assert!(summary.metrics.sequences_tested > 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn corpus_persists_between_campaigns() {
    ferret_common::logging::ensure_test_logging(None);

    let tmp = tempfile::TempDir::new().unwrap();
    let contract = counter_contract(vec![
        MethodDefinition::new("setCount", vec![AbiType::Uint]),
        MethodDefinition::new("property_countSmall", vec![]),
    ]);
    let table = behaviors(&[
        ("setCount(uint256)", Behavior::StoreArg { slot: COUNT_SLOT }),
        (
            "property_countSmall()",
            Behavior::BoolSlotBelow { slot: COUNT_SLOT, threshold: U256::from(1_000) },
        ),
    ]);

    let mut config = quick_config(11, 1_500);
    config.corpus_dir = Some(tmp.path().to_path_buf());
    let fuzzer = Fuzzer::new(
        config.clone(),
        vec![contract.clone()],
        empty_state_factory(),
        Arc::new(SimEvmFactory::new(table.clone())),
    )
    .unwrap();
    fuzzer.run().await.unwrap();

    let entries = std::fs::read_dir(tmp.path()).unwrap().count();
    assert!(entries > 0, "the campaign persisted corpus entries");

    // A second campaign over the same directory starts from the
    // persisted corpus.
    let fuzzer2 = Fuzzer::new(
        config,
        vec![contract],
        empty_state_factory(),
        Arc::new(SimEvmFactory::new(table)),
    )
    .unwrap();
    assert!(!fuzzer2.services().corpus.is_empty());
}
