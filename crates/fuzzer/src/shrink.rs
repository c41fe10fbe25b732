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

//! Sequence shrinking.
//!
//! Minimizes a violating (or optimizing) sequence by repeatedly proposing
//! smaller candidates: drop one element, then simplify values toward
//! zero. Every candidate is re-executed from the worker's base snapshot
//! and accepted only if the goal still holds; a candidate is always
//! rejected when the targeted contract is no longer deployed at its
//! original address.

use crate::{
    abi::AbiValue,
    calls::CallData,
    chain::{CallStatus, Evm, ExecutionError, ExecutionTrace, TestChain, TraceVerbosity},
    executor::{execute_call_sequence_with_tracer, execute_elements},
    sequence::{CallSequence, CallSequenceElement},
    testing::{decode_bool, decode_int256, ShrinkGoal},
};
use alloy_primitives::I256;
use ferret_fork::SnapId;
use tracing::{debug, trace};

/// Result of a shrink run.
pub struct ShrinkOutcome {
    /// The minimized sequence, with execution results of the final run.
    pub sequence: CallSequence,
    /// Trace of the final element of the minimized sequence.
    pub trace: Option<ExecutionTrace>,
    /// The achieved objective value (optimization goals only).
    pub value: Option<I256>,
    /// Candidate executions spent.
    pub executions: u64,
}

/// Shrink `elements` against `goal`, spending at most `budget` candidate
/// executions, then re-execute the result under a tracer.
pub fn shrink_sequence<E: Evm>(
    chain: &mut TestChain<E>,
    base_snap: SnapId,
    elements: Vec<CallSequenceElement>,
    goal: &ShrinkGoal,
    budget: u64,
) -> ShrinkOutcome {
    let mut current: Vec<CallSequenceElement> =
        elements.iter().map(CallSequenceElement::without_results).collect();
    let mut executions = 0u64;

    // Pass 1: drop elements, latest first; later calls are the most
    // likely to be incidental.
    let mut changed = true;
    while changed && executions < budget {
        changed = false;
        let mut index = current.len();
        while index > 0 && executions < budget {
            index -= 1;
            if current.len() == 1 {
                break;
            }
            let mut candidate = current.clone();
            candidate.remove(index);
            executions += 1;
            if goal_holds(chain, base_snap, &candidate, goal) {
                trace!(index, "Shrinker dropped element");
                current = candidate;
                changed = true;
            }
        }
    }

    // Pass 2: simplify values toward zero.
    let mut simplified = true;
    while simplified && executions < budget {
        simplified = false;
        for index in 0..current.len() {
            if executions >= budget {
                break;
            }
            let Some(candidate) = simplify_element(&current, index) else { continue };
            executions += 1;
            if goal_holds(chain, base_snap, &candidate, goal) {
                trace!(index, "Shrinker simplified element values");
                current = candidate;
                simplified = true;
            }
        }
    }

    // Final run under the tracer for the surfaced result.
    chain.revert_to_snapshot(base_snap);
    let (executed, error) = execute_call_sequence_with_tracer(
        chain,
        |i| current.get(i).map(CallSequenceElement::without_results),
        None::<fn(&mut TestChain<E>, &[CallSequenceElement]) -> Result<bool, ExecutionError>>,
        TraceVerbosity::Final,
    );
    if let Some(err) = error {
        debug!(%err, "Final shrink execution errored");
    }

    let value = match goal {
        ShrinkGoal::ValueAtLeast { call, .. } => match chain.view_call(call) {
            Ok(outcome) if outcome.is_success() => decode_int256(&outcome),
            _ => None,
        },
        _ => None,
    };

    let trace = executed.last().and_then(|element| element.trace.clone());
    debug!(
        from = elements.len(),
        to = executed.len(),
        executions,
        "Shrink finished"
    );
    ShrinkOutcome { sequence: CallSequence::new(executed), trace, value, executions }
}

/// Re-execute a candidate from the base snapshot and decide whether the
/// goal still holds.
fn goal_holds<E: Evm>(
    chain: &mut TestChain<E>,
    base_snap: SnapId,
    candidate: &[CallSequenceElement],
    goal: &ShrinkGoal,
) -> bool {
    chain.revert_to_snapshot(base_snap);
    let (executed, error) = execute_elements(chain, candidate);
    if error.is_some() || executed.len() != candidate.len() {
        return false;
    }

    // The verifier always re-checks the target is still a contract at
    // its original address; a candidate that un-deploys it proves
    // nothing.
    match chain.code_at(goal.target_address()) {
        Ok(code) if !code.is_empty() => {}
        _ => return false,
    }

    match goal {
        ShrinkGoal::PropertyFails { call, .. } => match chain.view_call(call) {
            Ok(outcome) if outcome.is_success() => decode_bool(&outcome) != Some(true),
            Ok(_) => true,
            Err(_) => true,
        },
        ShrinkGoal::CallPanics { address, selector, panic_codes, fail_on_revert } => {
            executed.iter().any(|element| {
                element.call.to == Some(*address)
                    && element.call.data.selector() == Some(*selector)
                    && element.outcome.as_ref().is_some_and(|outcome| {
                        if outcome.status != CallStatus::Revert {
                            return false;
                        }
                        match outcome.panic_code() {
                            Some(code) => panic_codes.contains(&code),
                            None => *fail_on_revert,
                        }
                    })
            })
        }
        ShrinkGoal::ValueAtLeast { call, target, .. } => match chain.view_call(call) {
            Ok(outcome) if outcome.is_success() => {
                decode_int256(&outcome).is_some_and(|value| value >= *target)
            }
            _ => false,
        },
    }
}

/// Produce a simplified copy of `elements[index]`, or `None` when there
/// is nothing left to simplify.
fn simplify_element(
    elements: &[CallSequenceElement],
    index: usize,
) -> Option<Vec<CallSequenceElement>> {
    let element = &elements[index];
    let mut call = element.call.clone();
    let mut changed = false;

    if !call.value.is_zero() {
        call.value >>= 1;
        changed = true;
    }

    if let Some(abi) = call.data.as_abi() {
        let mut values = abi.input_values.clone();
        for value in &mut values {
            match value {
                AbiValue::Uint(v) if !v.is_zero() => {
                    *v >>= 1;
                    changed = true;
                }
                AbiValue::Int(v) if !v.is_zero() => {
                    *v /= I256::try_from(2i64).expect("2 fits");
                    changed = true;
                }
                AbiValue::Bytes(bytes) if !bytes.is_empty() => {
                    *bytes = bytes.slice(..bytes.len() / 2);
                    changed = true;
                }
                AbiValue::String(s) if !s.is_empty() => {
                    s.truncate(s.len() / 2);
                    changed = true;
                }
                _ => {}
            }
        }
        if changed {
            call.data = CallData::abi(abi.method_signature.clone(), values);
        }
    }

    if !changed {
        return None;
    }

    let mut candidate = elements.to_vec();
    candidate[index] = CallSequenceElement::new(
        element.contract.clone(),
        call,
        element.block_number_delay,
        element.block_timestamp_delay,
    );
    Some(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calls::CallMessage;
    use alloy_primitives::{address, Bytes, U256};

    #[test]
    fn test_simplify_halves_values() {
        let call = CallMessage::call(
            address!("0000000000000000000000000000000000010000"),
            address!("00000000000000000000000000000000000000aa"),
            CallData::abi(
                "deposit(uint256,bytes)",
                vec![
                    AbiValue::Uint(U256::from(100)),
                    AbiValue::Bytes(Bytes::from_static(&[1, 2, 3, 4])),
                ],
            ),
            100_000,
        );
        let elements = vec![CallSequenceElement::new(None, call, 0, 0)];

        let candidate = simplify_element(&elements, 0).unwrap();
        let abi = candidate[0].call.data.as_abi().unwrap();
        assert_eq!(abi.input_values[0], AbiValue::Uint(U256::from(50)));
        assert_eq!(abi.input_values[1], AbiValue::Bytes(Bytes::from_static(&[1, 2])));
    }

    #[test]
    fn test_simplify_reports_exhaustion() {
        let call = CallMessage::call(
            address!("0000000000000000000000000000000000010000"),
            address!("00000000000000000000000000000000000000aa"),
            CallData::abi("poke(uint256)", vec![AbiValue::Uint(U256::ZERO)]),
            100_000,
        );
        let elements = vec![CallSequenceElement::new(None, call, 0, 0)];
        assert!(simplify_element(&elements, 0).is_none());
    }
}
