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

//! Assertion testing: ordinary methods must never trip a configured
//! panic code.

use super::{
    panic_codes, ShrinkGoal, ShrinkRequest, TestCase, TestCaseKind, TestCaseRegistry,
    TestCaseStatus, TestProvider,
};
use crate::{
    chain::{CallStatus, ChainAccess, ExecutionError},
    contracts::DeployedContract,
    sequence::CallSequenceElement,
};
use alloy_primitives::{Address, U256};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// Assertion-mode configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssertionConfig {
    /// Whether assertion testing runs at all.
    pub enabled: bool,
    /// Panic codes that count as failures.
    pub panic_codes: Vec<u64>,
    /// Whether a plain revert counts as a failure too.
    pub fail_on_revert: bool,
}

impl Default for AssertionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            panic_codes: vec![panic_codes::ASSERT_FAILED],
            fail_on_revert: false,
        }
    }
}

/// Watches executed calls for configured panic codes (and optionally
/// plain reverts) on registered methods.
pub struct AssertionTestProvider {
    config: AssertionConfig,
    excluded_prefixes: Vec<String>,
    // (target address, selector) -> test case id
    methods: HashMap<(Address, [u8; 4]), String>,
}

impl AssertionTestProvider {
    /// New provider. Methods whose name matches one of
    /// `excluded_prefixes` (the property/optimization surfaces) are not
    /// asserted.
    pub fn new(config: AssertionConfig, excluded_prefixes: Vec<String>) -> Self {
        Self { config, excluded_prefixes, methods: HashMap::new() }
    }

    fn failure_of(&self, element: &CallSequenceElement) -> Option<String> {
        let outcome = element.outcome.as_ref()?;
        if outcome.status != CallStatus::Revert {
            return None;
        }
        if let Some(code) = outcome.panic_code() {
            if self.config.panic_codes.iter().any(|c| U256::from(*c) == code) {
                return Some(format!("panic code 0x{code:x}"));
            }
            return None;
        }
        self.config.fail_on_revert.then(|| "call reverted".to_string())
    }
}

impl TestProvider for AssertionTestProvider {
    fn name(&self) -> &'static str {
        "assertion"
    }

    fn on_contract_deployed(&mut self, registry: &TestCaseRegistry, contract: &DeployedContract) {
        if !self.config.enabled {
            return;
        }
        for method in &contract.definition.methods {
            if self.excluded_prefixes.iter().any(|p| method.name.starts_with(p.as_str())) {
                continue;
            }
            let case = TestCase::new(
                TestCaseKind::Assertion,
                contract.name(),
                contract.address,
                method.signature(),
            );
            let test_id = case.id.clone();
            registry.register(case);
            debug!(test_id, "Registered assertion test");
            self.methods.insert((contract.address, method.selector()), test_id);
        }
    }

    fn on_contract_removed(&mut self, _registry: &TestCaseRegistry, address: Address) {
        self.methods.retain(|(addr, _), _| *addr != address);
    }

    fn check_post_call(
        &mut self,
        _chain: &mut dyn ChainAccess,
        registry: &TestCaseRegistry,
        executed: &[CallSequenceElement],
    ) -> Result<Vec<ShrinkRequest>, ExecutionError> {
        // Only the call that just executed can introduce a new failure.
        let Some(element) = executed.last() else { return Ok(Vec::new()) };
        let Some(to) = element.call.to else { return Ok(Vec::new()) };
        let Some(selector) = element.call.data.selector() else { return Ok(Vec::new()) };
        let Some(test_id) = self.methods.get(&(to, selector)) else { return Ok(Vec::new()) };

        if registry.status(test_id) == Some(TestCaseStatus::Failed) {
            return Ok(Vec::new());
        }
        let Some(_reason) = self.failure_of(element) else { return Ok(Vec::new()) };

        Ok(vec![ShrinkRequest {
            test_id: test_id.clone(),
            goal: ShrinkGoal::CallPanics {
                address: to,
                selector,
                panic_codes: self.config.panic_codes.iter().map(|c| U256::from(*c)).collect(),
                fail_on_revert: self.config.fail_on_revert,
            },
        }])
    }
}
