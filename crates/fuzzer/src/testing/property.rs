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

//! Property testing: `property_*` predicates probed after every call.

use super::{
    decode_bool, ShrinkGoal, ShrinkRequest, TestCase, TestCaseKind, TestCaseRegistry,
    TestCaseStatus, TestProvider,
};
use crate::{
    calls::{CallData, CallMessage},
    chain::{ChainAccess, ExecutionError},
    contracts::DeployedContract,
    sequence::CallSequenceElement,
};
use alloy_primitives::Address;
use tracing::debug;

struct PropertyTarget {
    test_id: String,
    address: Address,
    probe: CallMessage,
}

/// Probes every registered `property_*` method with a read-only call
/// after each executed call; a revert, a call failure, or a `false`
/// return is a violation.
pub struct PropertyTestProvider {
    prefixes: Vec<String>,
    sender: Address,
    gas_limit: u64,
    targets: Vec<PropertyTarget>,
}

impl PropertyTestProvider {
    /// New provider matching methods against `prefixes`, probing from
    /// `sender` with the given gas budget.
    pub fn new(prefixes: Vec<String>, sender: Address, gas_limit: u64) -> Self {
        Self { prefixes, sender, gas_limit, targets: Vec::new() }
    }

    fn matches(&self, name: &str) -> bool {
        self.prefixes.iter().any(|prefix| name.starts_with(prefix.as_str()))
    }
}

impl TestProvider for PropertyTestProvider {
    fn name(&self) -> &'static str {
        "property"
    }

    fn on_contract_deployed(&mut self, registry: &TestCaseRegistry, contract: &DeployedContract) {
        for method in &contract.definition.methods {
            // Property predicates take no inputs and return a bool.
            if !self.matches(&method.name) || !method.inputs.is_empty() {
                continue;
            }
            let signature = method.signature();
            let case = TestCase::new(
                TestCaseKind::Property,
                contract.name(),
                contract.address,
                signature.clone(),
            );
            let test_id = case.id.clone();
            registry.register(case);

            debug!(test_id, "Registered property test");
            self.targets.push(PropertyTarget {
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
        // Cases already failed (possibly by another worker) need no
        // further probing on this chain.
        self.targets
            .retain(|target| registry.status(&target.test_id) != Some(TestCaseStatus::Failed));

        let mut requests = Vec::new();
        for target in &self.targets {
            let violated = match chain.view_call(&target.probe) {
                Ok(outcome) if outcome.is_success() => decode_bool(&outcome) != Some(true),
                Ok(_) => true,
                Err(err) => {
                    debug!(%err, test_id = target.test_id, "Property probe failed to execute");
                    true
                }
            };

            if violated {
                requests.push(ShrinkRequest {
                    test_id: target.test_id.clone(),
                    goal: ShrinkGoal::PropertyFails {
                        address: target.address,
                        call: target.probe.clone(),
                    },
                });
            }
        }
        Ok(requests)
    }
}
