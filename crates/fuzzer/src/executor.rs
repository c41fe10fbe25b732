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

//! The call-sequence executor.
//!
//! Packs a sequence of calls into blocks on a test chain, honoring the
//! elements' block delays, rolling over to a fresh block when an append
//! fails on a non-empty block, recording chain references, and invoking
//! an optional post-call check that can cut the sequence short.

use crate::{
    chain::{Evm, ExecutionError, TestChain, TraceVerbosity},
    sequence::{CallSequenceElement, ChainRef},
};
use tracing::{debug, warn};

/// Execute elements fetched one at a time until the fetch runs dry, the
/// post-call check requests a break, or an element fails fatally.
///
/// The fetch closure maps an index to the element to execute there; the
/// check closure sees the executed prefix after every call and returns
/// `true` to stop. Any remaining pending block is committed on every exit
/// path, and the executed prefix is always returned alongside the error,
/// if any.
pub fn execute_call_sequence<E, F, C>(
    chain: &mut TestChain<E>,
    mut fetch: F,
    mut post_check: Option<C>,
) -> (Vec<CallSequenceElement>, Option<ExecutionError>)
where
    E: Evm,
    F: FnMut(usize) -> Option<CallSequenceElement>,
    C: FnMut(&mut TestChain<E>, &[CallSequenceElement]) -> Result<bool, ExecutionError>,
{
    let mut executed: Vec<CallSequenceElement> = Vec::new();

    loop {
        let Some(mut element) = fetch(executed.len()) else { break };

        // Block boundary resolution. A positive number delay asks for a
        // fresh block; a zero delay coalesces into the pending one.
        if chain.pending_block().is_some() && element.block_number_delay > 0 {
            chain.commit_pending_block();
        }
        if chain.pending_block().is_none() {
            if let Err(err) = chain
                .create_pending_block(element.block_number_delay, element.block_timestamp_delay)
            {
                return (executed, Some(err));
            }
        }

        let appended = match chain.append_call(&element.call) {
            Ok(appended) => Ok(appended),
            Err(err) => {
                let pending_txs =
                    chain.pending_block().map(|p| p.tx_count()).unwrap_or_default();
                if pending_txs > 0 {
                    // Roll over: the call may simply not fit the block
                    // that has already accumulated transactions.
                    debug!(%err, "Append failed on a non-empty block, rolling over");
                    chain.commit_pending_block();
                    if let Err(err) = chain.create_pending_block(
                        element.block_number_delay,
                        element.block_timestamp_delay,
                    ) {
                        return (executed, Some(err));
                    }
                    chain.append_call(&element.call)
                } else {
                    // A fresh, empty block rejected the call: fatal, and
                    // reported unchanged.
                    Err(err)
                }
            }
        };

        let (tx_index, outcome) = match appended {
            Ok(appended) => appended,
            Err(err) => {
                warn!(%err, "Call sequence aborted");
                chain.commit_pending_block();
                return (executed, Some(err));
            }
        };

        let block_number =
            chain.pending_block().map(|p| p.header.number).unwrap_or_default();
        element.chain_ref = Some(ChainRef { block_number, tx_index });
        element.outcome = Some(outcome);
        executed.push(element);

        if let Some(check) = post_check.as_mut() {
            match check(chain, &executed) {
                Ok(true) => break,
                Ok(false) => {}
                Err(err) => {
                    chain.commit_pending_block();
                    return (executed, Some(err));
                }
            }
        }
    }

    chain.commit_pending_block();
    (executed, None)
}

/// Tracing variant: executes with trace capture enabled and attaches the
/// captured traces to every element or only the last one, per the
/// verbosity selector. Attachment is by canonical transaction hash.
pub fn execute_call_sequence_with_tracer<E, F, C>(
    chain: &mut TestChain<E>,
    fetch: F,
    post_check: Option<C>,
    verbosity: TraceVerbosity,
) -> (Vec<CallSequenceElement>, Option<ExecutionError>)
where
    E: Evm,
    F: FnMut(usize) -> Option<CallSequenceElement>,
    C: FnMut(&mut TestChain<E>, &[CallSequenceElement]) -> Result<bool, ExecutionError>,
{
    chain.set_tracing(true);
    let (mut executed, error) = execute_call_sequence(chain, fetch, post_check);

    match verbosity {
        TraceVerbosity::All => {
            for element in &mut executed {
                element.trace = chain.take_trace(&element.call.canonical_hash());
            }
        }
        TraceVerbosity::Final => {
            if let Some(element) = executed.last_mut() {
                element.trace = chain.take_trace(&element.call.canonical_hash());
            }
        }
    }

    chain.set_tracing(false);
    (executed, error)
}

/// Convenience wrapper: execute a whole sequence of prepared elements
/// without a post-call check.
pub fn execute_elements<E: Evm>(
    chain: &mut TestChain<E>,
    elements: &[CallSequenceElement],
) -> (Vec<CallSequenceElement>, Option<ExecutionError>) {
    execute_call_sequence(
        chain,
        |i| elements.get(i).map(CallSequenceElement::without_results),
        None::<fn(&mut TestChain<E>, &[CallSequenceElement]) -> Result<bool, ExecutionError>>,
    )
}
