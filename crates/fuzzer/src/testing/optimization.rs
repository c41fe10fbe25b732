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

//! Optimization testing: maximize `optimize_*` objectives.

use super::{
    decode_int256, ShrinkGoal, ShrinkRequest, TestCase, TestCaseKind, TestCaseRegistry,
    TestProvider,
};
use crate::{
    calls::{CallData, CallMessage},
    chain::{ChainAccess, ExecutionError},
    contracts::DeployedContract,
    sequence::CallSequenceElement,
};
use alloy_primitives::{Address, I256};
use tracing::debug;

struct OptimizationTarget {
    test_id: String,
    address: Address,
    probe: CallMessage,
}

/// Probes every registered `optimize_*` method after each call and
/// requests a shrink whenever the returned `int256` strictly beats the
/// recorded maximum.
pub struct OptimizationTestProvider {
    prefixes: Vec<String>,
    sender: Address,
    gas_limit: u64,
    targets: Vec<OptimizationTarget>,
}

impl OptimizationTestProvider {
    /// New provider matching methods against `prefixes`.
    pub fn new(prefixes: Vec<String>, sender: Address, gas_limit: u64) -> Self {
        Self { prefixes, sender, gas_limit, targets: Vec::new() }
    }

    fn matches(&self, name: &str) -> bool {
        self.prefixes.iter().any(|prefix| name.starts_with(prefix.as_str()))
    }
}

impl TestProvider for OptimizationTestProvider {
    fn name(&self) -> &'static str {
        "optimization"
    }

    fn on_contract_deployed(&mut self, registry: &TestCaseRegistry, contract: &DeployedContract) {
        for method in &contract.definition.methods {
            // Objectives take no inputs and return an int256.
            if !self.matches(&method.name) || !method.inputs.is_empty() {
                continue;
            }
            let signature = method.signature();
            let case = TestCase::new(
                TestCaseKind::Optimization,
                contract.name(),
                contract.address,
                signature.clone(),
            );
            let test_id = case.id.clone();
            registry.register(case);

            debug!(test_id, "Registered optimization test");
            self.targets.push(OptimizationTarget {
                test_id,
                address: contract.address,
                probe: CallMessage::call(
                    self.sender,
                    contract.address,
                    CallData::abi(signature, Vec::new()),
                    self.gas_limit,
                ),
            });
        }
    }

    fn on_contract_removed(&mut self, _registry: &TestCaseRegistry, address: Address) {
        self.targets.retain(|target| target.address != address);
    }

    fn check_post_call(
        &mut self,
        chain: &mut dyn ChainAccess,
        registry: &TestCaseRegistry,
        _executed: &[CallSequenceElement],
    ) -> Result<Vec<ShrinkRequest>, ExecutionError> {
        let mut requests = Vec::new();

        for target in &self.targets {
            let outcome = match chain.view_call(&target.probe) {
                Ok(outcome) if outcome.is_success() => outcome,
                // A reverting or failing objective simply yields nothing.
                Ok(_) => continue,
                Err(err) => {
                    debug!(%err, test_id = target.test_id, "Objective probe failed to execute");
                    continue;
                }
            };
            let Some(value) = decode_int256(&outcome) else { continue };

            let current = registry.current_optimum(&target.test_id).unwrap_or(I256::MIN);
            if value > current {
                requests.push(ShrinkRequest {
                    test_id: target.test_id.clone(),
                    goal: ShrinkGoal::ValueAtLeast {
                        address: target.address,
                        call: target.probe.clone(),
                        target: value,
                    },
                });
            }
        }
        Ok(requests)
    }
}
