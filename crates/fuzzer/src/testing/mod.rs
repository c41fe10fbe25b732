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

//! Test cases and test providers.
//!
//! Three provider kinds share one interface: property tests
//! (`property_*` predicates probed after every call), assertion tests
//! (panic-code reverts of ordinary methods), and optimization tests
//! (`optimize_*` objectives maximized over the campaign). Providers
//! register test cases per deployed contract and emit shrink requests
//! from their post-call checks.

mod assertion;
mod optimization;
mod property;

pub use assertion::*;
pub use optimization::*;
pub use property::*;

use crate::{
    calls::CallMessage,
    chain::{CallOutcome, ChainAccess, ExecutionError, ExecutionTrace},
    contracts::DeployedContract,
    sequence::{CallSequence, CallSequenceElement},
};
use alloy_primitives::{Address, I256, U256};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Standard Solidity `Panic(uint256)` codes.
pub mod panic_codes {
    /// `assert(false)` / compiler-inserted checks.
    pub const ASSERT_FAILED: u64 = 0x01;
    /// Arithmetic over/underflow.
    pub const ARITHMETIC: u64 = 0x11;
    /// Division or modulo by zero.
    pub const DIVISION_BY_ZERO: u64 = 0x12;
    /// Conversion into an invalid enum value.
    pub const ENUM_CONVERSION: u64 = 0x21;
    /// Incorrectly encoded storage byte array.
    pub const STORAGE_ENCODING: u64 = 0x22;
    /// Out-of-bounds array access.
    pub const ARRAY_OUT_OF_BOUNDS: u64 = 0x32;
    /// Too much memory allocated.
    pub const MEMORY_ALLOCATION: u64 = 0x41;
    /// Call into a zero-initialized internal function variable.
    pub const ZERO_FUNCTION_POINTER: u64 = 0x51;
}

/// Kind of a test case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestCaseKind {
    /// A `property_*` predicate that must hold after every call.
    Property,
    /// An ordinary method that must never panic.
    Assertion,
    /// An `optimize_*` objective to maximize.
    Optimization,
}

/// Lifecycle of a test case. Transitions are monotonic:
/// `NotStarted → Running → (Passed | Failed)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestCaseStatus {
    /// Registered but not yet exercised.
    NotStarted,
    /// Being exercised by the campaign.
    Running,
    /// Survived the campaign.
    Passed,
    /// A violating sequence was found.
    Failed,
}

/// One test case tracked across the campaign.
#[derive(Debug, Clone)]
pub struct TestCase {
    /// Unique id, `<contract>.<method signature>`.
    pub id: String,
    /// The kind of test.
    pub kind: TestCaseKind,
    /// Lifecycle status.
    pub status: TestCaseStatus,
    /// Name of the contract under test.
    pub contract: String,
    /// Deployment address of the contract under test.
    pub address: Address,
    /// Canonical signature of the tested method.
    pub method_signature: String,
    /// Best value seen so far (optimization tests).
    pub value: Option<I256>,
    /// The violating or maximizing sequence.
    pub sequence: Option<CallSequence>,
    /// Execution trace attached to the surfaced sequence.
    pub trace: Option<ExecutionTrace>,
    /// Human-readable failure message.
    pub message: Option<String>,
}

impl TestCase {
    /// New not-yet-started test case.
    pub fn new(
        kind: TestCaseKind,
        contract: impl Into<String>,
        address: Address,
        method_signature: impl Into<String>,
    ) -> Self {
        let contract = contract.into();
        let method_signature = method_signature.into();
        Self {
            id: format!("{contract}.{method_signature}"),
            kind,
            status: TestCaseStatus::NotStarted,
            contract,
            address,
            method_signature,
            value: None,
            sequence: None,
            trace: None,
            message: None,
        }
    }
}

/// Shared registry of test cases: exclusive per-entry writes, optimistic
/// reads.
#[derive(Default)]
pub struct TestCaseRegistry {
    cases: DashMap<String, TestCase>,
}

impl TestCaseRegistry {
    /// New empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a test case and mark it running. Re-registration by other
    /// workers of the same campaign is a no-op.
    pub fn register(&self, case: TestCase) {
        let mut entry = self.cases.entry(case.id.clone()).or_insert(case);
        if entry.status == TestCaseStatus::NotStarted {
            entry.status = TestCaseStatus::Running;
        }
    }

    /// Status of a test case.
    pub fn status(&self, id: &str) -> Option<TestCaseStatus> {
        self.cases.get(id).map(|case| case.status)
    }

    /// Mark a test case failed with the surfaced sequence. The first
    /// failure wins; later reports are ignored.
    pub fn mark_failed(
        &self,
        id: &str,
        message: impl Into<String>,
        sequence: CallSequence,
        trace: Option<ExecutionTrace>,
    ) {
        if let Some(mut case) = self.cases.get_mut(id) {
            if case.status == TestCaseStatus::Failed {
                return;
            }
            case.status = TestCaseStatus::Failed;
            case.message = Some(message.into());
            case.sequence = Some(sequence);
            case.trace = trace;
            info!(id, "Test case failed");
        }
    }

    /// Record an improved optimization value. Returns whether `value`
    /// strictly beat the stored maximum.
    pub fn update_optimum(
        &self,
        id: &str,
        value: I256,
        sequence: CallSequence,
        trace: Option<ExecutionTrace>,
    ) -> bool {
        let Some(mut case) = self.cases.get_mut(id) else { return false };
        if case.value.is_some_and(|current| value <= current) {
            return false;
        }
        case.value = Some(value);
        case.sequence = Some(sequence);
        case.trace = trace;
        info!(id, %value, "New optimization maximum");
        true
    }

    /// Best value currently recorded for an optimization test.
    pub fn current_optimum(&self, id: &str) -> Option<I256> {
        self.cases.get(id).and_then(|case| case.value)
    }

    /// Mark every case that never failed as passed; called once at the
    /// end of the campaign.
    pub fn finalize(&self) {
        for mut case in self.cases.iter_mut() {
            if matches!(case.status, TestCaseStatus::NotStarted | TestCaseStatus::Running) {
                case.status = TestCaseStatus::Passed;
            }
        }
    }

    /// Snapshot of every test case.
    pub fn cases(&self) -> Vec<TestCase> {
        self.cases.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Snapshot of the failed test cases.
    pub fn failed_cases(&self) -> Vec<TestCase> {
        self.cases
            .iter()
            .filter(|entry| entry.status == TestCaseStatus::Failed)
            .map(|entry| entry.value().clone())
            .collect()
    }
}

/// What a shrunk candidate must preserve.
#[derive(Debug, Clone)]
pub enum ShrinkGoal {
    /// The property probe must still fail (revert, or return `false`).
    PropertyFails {
        /// The contract under test.
        address: Address,
        /// The property probe call.
        call: CallMessage,
    },
    /// Some executed call to `(address, selector)` must still panic with
    /// one of the given codes (or revert, when enabled).
    CallPanics {
        /// The contract under test.
        address: Address,
        /// Selector of the asserted method.
        selector: [u8; 4],
        /// Panic codes that count as failure.
        panic_codes: Vec<U256>,
        /// Whether a plain revert counts as failure too.
        fail_on_revert: bool,
    },
    /// The objective probe must still reach at least `target`.
    ValueAtLeast {
        /// The contract under test.
        address: Address,
        /// The objective probe call.
        call: CallMessage,
        /// The value to preserve.
        target: I256,
    },
}

impl ShrinkGoal {
    /// The contract the goal targets; candidates are rejected when it is
    /// no longer deployed at this address.
    pub fn target_address(&self) -> Address {
        match self {
            Self::PropertyFails { address, .. }
            | Self::CallPanics { address, .. }
            | Self::ValueAtLeast { address, .. } => *address,
        }
    }
}

/// A shrink request emitted by a provider's post-call check.
#[derive(Debug, Clone)]
pub struct ShrinkRequest {
    /// The test case the request belongs to.
    pub test_id: String,
    /// What the shrunk sequence must preserve.
    pub goal: ShrinkGoal,
}

/// Uniform interface of the three test provider kinds.
pub trait TestProvider: Send {
    /// Short provider name for logs.
    fn name(&self) -> &'static str;

    /// React to a contract appearing on the worker's chain: register
    /// matching test cases.
    fn on_contract_deployed(&mut self, registry: &TestCaseRegistry, contract: &DeployedContract);

    /// React to a contract disappearing from the worker's chain.
    fn on_contract_removed(&mut self, registry: &TestCaseRegistry, address: Address);

    /// Check the executed prefix after a call; emit shrink requests for
    /// every fresh violation or improvement.
    fn check_post_call(
        &mut self,
        chain: &mut dyn ChainAccess,
        registry: &TestCaseRegistry,
        executed: &[CallSequenceElement],
    ) -> Result<Vec<ShrinkRequest>, ExecutionError>;
}

/// Decode an ABI `bool` return value. `None` when the output is not a
/// single word.
pub fn decode_bool(outcome: &CallOutcome) -> Option<bool> {
    (outcome.output.len() == 32).then(|| outcome.output.iter().any(|b| *b != 0))
}

/// Decode an ABI `int256` return value.
pub fn decode_int256(outcome: &CallOutcome) -> Option<I256> {
    (outcome.output.len() == 32)
        .then(|| I256::from_raw(U256::from_be_slice(&outcome.output[..32])))
}
