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

//! A scripted EVM standing in for the real engine.
//!
//! Methods are dispatched by selector against a table of small behaviors
//! (store an argument, compare a slot against a threshold, panic on big
//! arguments, read a foreign account's slot). State flows through the
//! same `ForkedState` the production chain uses, so the overlay sees
//! every touch exactly as it would under a real EVM.

use alloy_primitives::{Address, Bytes, B256, U256};
use ferret_fuzzer::{
    BlockHeader, CallMessage, CallOutcome, CallStatus, Evm, EvmFactory, ExecutionError,
    FrameKind, FuzzerState, TraceFrame, Tracer, PANIC_SELECTOR,
};
use std::collections::HashMap;

const SIM_GAS_PER_CALL: u64 = 21_000;

/// Scripted method behaviors.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Store the first `uint256` argument into `slot` of the callee.
    StoreArg {
        /// Target slot.
        slot: B256,
    },
    /// Return the bool `slot < threshold` (a property predicate).
    BoolSlotBelow {
        /// Inspected slot.
        slot: B256,
        /// Exclusive upper bound.
        threshold: U256,
    },
    /// Return `slot` as an `int256` (an optimization objective).
    IntSlot {
        /// Inspected slot.
        slot: B256,
    },
    /// Panic with `code` when the first argument exceeds `threshold`.
    PanicIfArgAbove {
        /// Inclusive threshold.
        threshold: U256,
        /// Emitted `Panic(uint256)` code.
        code: u64,
    },
    /// Return the bool `foreign slot != value`; reads another account's
    /// storage, driving the overlay's remote import path.
    BoolRemoteSlotNot {
        /// The foreign account.
        address: Address,
        /// Inspected slot.
        slot: B256,
        /// The violating value.
        value: B256,
    },
    /// Succeed without effect.
    Noop,
}

/// The scripted EVM.
pub struct SimEvm {
    behaviors: HashMap<[u8; 4], Behavior>,
}

impl SimEvm {
    /// New EVM over a selector-keyed behavior table.
    pub fn new(behaviors: HashMap<[u8; 4], Behavior>) -> Self {
        Self { behaviors }
    }

    fn state_err(e: impl std::fmt::Display) -> ExecutionError {
        ExecutionError::State(e.to_string())
    }

    fn arg0(msg: &CallMessage) -> U256 {
        let input = msg.input_bytes();
        if input.len() >= 36 {
            U256::from_be_slice(&input[4..36])
        } else {
            U256::ZERO
        }
    }

    fn bool_word(value: bool) -> Bytes {
        let mut word = [0u8; 32];
        word[31] = value as u8;
        Bytes::copy_from_slice(&word)
    }

    fn panic_output(code: u64) -> Bytes {
        let mut out = PANIC_SELECTOR.to_vec();
        out.extend_from_slice(&U256::from(code).to_be_bytes::<32>());
        Bytes::from(out)
    }

    fn run_behavior(
        &self,
        state: &mut FuzzerState,
        callee: Address,
        msg: &CallMessage,
        behavior: &Behavior,
    ) -> Result<(CallStatus, Bytes), ExecutionError> {
        match behavior {
            Behavior::StoreArg { slot } => {
                let value = B256::from(Self::arg0(msg));
                state.set_storage(callee, *slot, value).map_err(Self::state_err)?;
                Ok((CallStatus::Success, Bytes::new()))
            }
            Behavior::BoolSlotBelow { slot, threshold } => {
                let current = state.get_storage(callee, *slot).map_err(Self::state_err)?;
                let holds = U256::from_be_bytes(current.0) < *threshold;
                Ok((CallStatus::Success, Self::bool_word(holds)))
            }
            Behavior::IntSlot { slot } => {
                let current = state.get_storage(callee, *slot).map_err(Self::state_err)?;
                Ok((CallStatus::Success, Bytes::copy_from_slice(current.as_slice())))
            }
            Behavior::PanicIfArgAbove { threshold, code } => {
                if Self::arg0(msg) > *threshold {
                    Ok((CallStatus::Revert, Self::panic_output(*code)))
                } else {
                    Ok((CallStatus::Success, Bytes::new()))
                }
            }
            Behavior::BoolRemoteSlotNot { address, slot, value } => {
                let current = state.get_storage(*address, *slot).map_err(Self::state_err)?;
                Ok((CallStatus::Success, Self::bool_word(current != *value)))
            }
            Behavior::Noop => Ok((CallStatus::Success, Bytes::new())),
        }
    }
}

impl Evm for SimEvm {
    fn execute_call(
        &mut self,
        state: &mut FuzzerState,
        _header: &BlockHeader,
        msg: &CallMessage,
        tracer: Option<&mut dyn Tracer>,
    ) -> Result<CallOutcome, ExecutionError> {
        let mut created = None;
        let mut coverage = Vec::new();

        let (status, output) = match msg.to {
            None => {
                // CREATE: install the init code verbatim as runtime code.
                let nonce =
                    state.get_nonce(msg.from).map_err(Self::state_err)?;
                let address = msg.from.create(nonce);
                state.set_nonce(msg.from, nonce + 1).map_err(Self::state_err)?;
                state.set_code(address, msg.input_bytes()).map_err(Self::state_err)?;
                created = Some(address);
                (CallStatus::Success, Bytes::new())
            }
            Some(callee) => {
                let code = state.get_code(callee).map_err(Self::state_err)?;
                if code.is_empty() {
                    // Plain transfer to an EOA.
                    (CallStatus::Success, Bytes::new())
                } else {
                    let input = msg.input_bytes();
                    let selector: [u8; 4] = match input.get(..4) {
                        Some(bytes) => bytes.try_into().expect("sliced to 4"),
                        None => [0u8; 4],
                    };
                    let code_hash = state.get_code_hash(callee).map_err(Self::state_err)?;
                    coverage.push((code_hash, u32::from_be_bytes(selector) as u64));

                    match self.behaviors.get(&selector) {
                        Some(behavior) => {
                            let behavior = behavior.clone();
                            self.run_behavior(state, callee, msg, &behavior)?
                        }
                        None => (CallStatus::Success, Bytes::new()),
                    }
                }
            }
        };

        if let Some(tracer) = tracer {
            tracer.record_frame(TraceFrame {
                depth: 0,
                kind: if created.is_some() { FrameKind::Create } else { FrameKind::Call },
                from: msg.from,
                to: msg.to,
                value: msg.value,
                input: msg.input_bytes(),
                output: output.clone(),
                status,
            });
        }

        Ok(CallOutcome {
            status,
            output,
            gas_used: SIM_GAS_PER_CALL,
            created_contract: created,
            destroyed_contracts: Vec::new(),
            coverage,
        })
    }
}

/// Factory handing every worker chain its own scripted EVM.
pub struct SimEvmFactory {
    behaviors: HashMap<[u8; 4], Behavior>,
}

impl SimEvmFactory {
    /// New factory over a behavior table.
    pub fn new(behaviors: HashMap<[u8; 4], Behavior>) -> Self {
        Self { behaviors }
    }
}

impl EvmFactory for SimEvmFactory {
    fn create_evm(&self) -> Box<dyn Evm> {
        Box::new(SimEvm::new(self.behaviors.clone()))
    }
}

/// Helper: build a behavior table from `(signature, behavior)` pairs.
pub fn behaviors(entries: &[(&str, Behavior)]) -> HashMap<[u8; 4], Behavior> {
    entries
        .iter()
        .map(|(signature, behavior)| {
            (ferret_fuzzer::selector(signature), behavior.clone())
        })
        .collect()
}
