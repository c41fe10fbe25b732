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

//! Contract definitions the fuzzer deploys and targets.
//!
//! Compilation and ABI discovery happen upstream; the fuzzer receives
//! ready-made definitions: a name, deployable byte code, and the method
//! surface in a reduced ABI form.

use crate::abi::{selector, AbiType};
use alloy_primitives::{Address, Bytes};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A callable method in reduced ABI form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodDefinition {
    /// Method name.
    pub name: String,
    /// Parameter types in declaration order.
    pub inputs: Vec<AbiType>,
}

impl MethodDefinition {
    /// New method definition.
    pub fn new(name: impl Into<String>, inputs: Vec<AbiType>) -> Self {
        Self { name: name.into(), inputs }
    }

    /// Canonical signature, e.g. `withdraw(uint256)`.
    pub fn signature(&self) -> String {
        let params: Vec<&str> = self.inputs.iter().map(AbiType::sol_name).collect();
        format!("{}({})", self.name, params.join(","))
    }

    /// 4-byte selector of the canonical signature.
    pub fn selector(&self) -> [u8; 4] {
        selector(&self.signature())
    }
}

/// A contract the fuzzer can deploy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractDefinition {
    /// Contract name, unique within a campaign.
    pub name: String,
    /// Deployable byte code.
    pub bytecode: Bytes,
    /// The callable method surface.
    pub methods: Vec<MethodDefinition>,
}

impl ContractDefinition {
    /// New definition.
    pub fn new(
        name: impl Into<String>,
        bytecode: Bytes,
        methods: Vec<MethodDefinition>,
    ) -> Self {
        Self { name: name.into(), bytecode, methods }
    }

    /// Resolve a method by canonical signature, falling back to the
    /// method name for entries persisted before signatures were stored.
    // TODO: drop the name-based fallback once corpora written by the v1
    // sequence format have been migrated or cleaned.
    pub fn resolve_method(&self, signature: &str) -> Option<&MethodDefinition> {
        if let Some(method) = self.methods.iter().find(|m| m.signature() == signature) {
            return Some(method);
        }
        let name = signature.split('(').next()?;
        self.methods.iter().find(|m| m.name == name)
    }
}

/// A contract instance deployed on a worker's chain.
#[derive(Debug, Clone)]
pub struct DeployedContract {
    /// Address the instance lives at.
    pub address: Address,
    /// The definition it was deployed from.
    pub definition: Arc<ContractDefinition>,
}

impl DeployedContract {
    /// The definition's name.
    pub fn name(&self) -> &str {
        &self.definition.name
    }
}

/// Resolve a method signature against a set of definitions, returning the
/// owning definition as well.
pub fn resolve_method<'a>(
    contracts: &'a [Arc<ContractDefinition>],
    contract_name: Option<&str>,
    signature: &str,
) -> Option<(&'a ContractDefinition, &'a MethodDefinition)> {
    let candidates = contracts
        .iter()
        .filter(|c| contract_name.is_none_or(|name| c.name == name));
    for contract in candidates {
        if let Some(method) = contract.resolve_method(signature) {
            return Some((contract, method));
        }
    }
    None
}
