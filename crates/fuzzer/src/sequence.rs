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

//! Call sequences.
//!
//! A call sequence is the unit the fuzzer generates, executes, shrinks
//! and persists. Its content hash covers only the inputs (delays and the
//! canonical transaction of each element), never execution results, so
//! re-running a sequence cannot change its identity.

use crate::{calls::CallMessage, chain::CallOutcome, chain::ExecutionTrace};
use alloy_primitives::{keccak256, B256};
use serde::{Deserialize, Serialize};

/// Where a call landed on the chain: `(block number, index in block)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainRef {
    /// Number of the block the call was appended to.
    pub block_number: u64,
    /// Index of the transaction within that block.
    pub tx_index: usize,
}

/// One element of a call sequence.
///
/// The delays are suggestive: the executor floors them to one for fresh
/// blocks, caps the number delay to the timestamp delay, and coalesces
/// zero-number-delay elements into the pending block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSequenceElement {
    /// Name of the targeted contract, when known.
    pub contract: Option<String>,
    /// The call to execute.
    pub call: CallMessage,
    /// Blocks to skip before this call.
    pub block_number_delay: u64,
    /// Seconds to skip before this call.
    pub block_timestamp_delay: u64,
    /// Set by the executor: where the call landed.
    #[serde(skip)]
    pub chain_ref: Option<ChainRef>,
    /// Set by the executor: the call's outcome.
    #[serde(skip)]
    pub outcome: Option<CallOutcome>,
    /// Attached by the tracing executor variant.
    #[serde(skip)]
    pub trace: Option<ExecutionTrace>,
}

impl CallSequenceElement {
    /// New element with the given delays and no execution results.
    pub fn new(
        contract: Option<String>,
        call: CallMessage,
        block_number_delay: u64,
        block_timestamp_delay: u64,
    ) -> Self {
        Self {
            contract,
            call,
            block_number_delay,
            block_timestamp_delay,
            chain_ref: None,
            outcome: None,
            trace: None,
        }
    }

    /// Copy with execution results stripped, as fed back into mutation or
    /// persisted to the corpus.
    pub fn without_results(&self) -> Self {
        Self::new(
            self.contract.clone(),
            self.call.clone(),
            self.block_number_delay,
            self.block_timestamp_delay,
        )
    }
}

/// An ordered list of calls executed on a test chain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallSequence {
    /// The elements in execution order.
    pub elements: Vec<CallSequenceElement>,
}

impl CallSequence {
    /// A sequence over the given elements.
    pub fn new(elements: Vec<CallSequenceElement>) -> Self {
        Self { elements }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Whether the sequence holds no elements.
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Content hash over `(Δblocks, Δseconds, canonical tx hash)` of each
    /// element. Stable across re-runs; execution results never
    /// contribute.
    pub fn hash(&self) -> B256 {
        let mut buf = Vec::with_capacity(self.elements.len() * 48);
        for element in &self.elements {
            buf.extend_from_slice(&element.block_number_delay.to_be_bytes());
            buf.extend_from_slice(&element.block_timestamp_delay.to_be_bytes());
            buf.extend_from_slice(element.call.canonical_hash().as_slice());
        }
        keccak256(&buf)
    }

    /// Copy with all execution results stripped.
    pub fn without_results(&self) -> Self {
        Self::new(self.elements.iter().map(CallSequenceElement::without_results).collect())
    }
}
