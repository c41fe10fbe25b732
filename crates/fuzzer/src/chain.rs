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

//! The per-worker test chain and the EVM seam.
//!
//! The EVM proper is an external collaborator behind the [`Evm`] trait:
//! it executes one call message against the forked state under a block
//! header, optionally feeding a [`Tracer`]. [`TestChain`] supplies
//! everything around that seam: pending-block management, block gas
//! accounting, snapshotting, contract lifecycle events and per-call trace
//! capture.

use crate::{calls::CallMessage, contracts::ContractDefinition};
use alloy_primitives::{Address, Bytes, B256, U256};
use ferret_fork::{ForkedState, SnapId, StateBackend};
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::Arc,
};
use thiserror::Error;
use tracing::{debug, trace};

/// The forked state type every worker chain executes against. The
/// backend is type-erased so workers stay monomorphic over the EVM only.
pub type FuzzerState = ForkedState<Arc<dyn StateBackend>>;

/// Selector of Solidity's `Panic(uint256)` error.
pub const PANIC_SELECTOR: [u8; 4] = [0x4e, 0x48, 0x7b, 0x71];

/// Execution failures of the chain and the executor.
#[derive(Debug, Clone, Error)]
pub enum ExecutionError {
    /// The transaction's gas budget does not fit the pending block.
    #[error("transaction gas limit {gas_limit} exceeds remaining block gas {remaining}")]
    BlockGasLimitReached {
        /// Gas budget of the rejected transaction.
        gas_limit: u64,
        /// Gas still available in the pending block.
        remaining: u64,
    },
    /// The message is not executable at all.
    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),
    /// The EVM reported a fatal failure (not a plain revert).
    #[error("EVM failure: {0}")]
    Evm(String),
    /// Forked state access failed underneath the EVM.
    #[error("state access failed: {0}")]
    State(String),
    /// A chain operation was used out of order.
    #[error("no pending block")]
    NoPendingBlock,
}

/// Result status of one executed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallStatus {
    /// Execution completed.
    Success,
    /// Execution reverted; the output carries the revert data.
    Revert,
    /// Execution halted (out of gas, invalid opcode, ...).
    Halt,
}

/// Outcome of one executed call, as reported by the EVM seam.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallOutcome {
    /// Result status.
    pub status: CallStatus,
    /// Return or revert data.
    pub output: Bytes,
    /// Gas consumed.
    pub gas_used: u64,
    /// Address of a contract created by this call.
    pub created_contract: Option<Address>,
    /// Contracts removed by this call (SELFDESTRUCT).
    pub destroyed_contracts: Vec<Address>,
    /// Executed program counters as `(code hash, pc)` pairs, for
    /// coverage-guided corpus feedback.
    pub coverage: Vec<(B256, u64)>,
}

impl CallOutcome {
    /// Whether the call completed without revert or halt.
    pub fn is_success(&self) -> bool {
        self.status == CallStatus::Success
    }

    /// The `Panic(uint256)` code carried by a revert, if any.
    pub fn panic_code(&self) -> Option<U256> {
        if self.status != CallStatus::Revert || self.output.len() != 36 {
            return None;
        }
        (self.output[..4] == PANIC_SELECTOR)
            .then(|| U256::from_be_slice(&self.output[4..36]))
    }
}

/// Kind of a traced frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameKind {
    /// Plain or value-carrying call.
    Call,
    /// `STATICCALL`
    StaticCall,
    /// `DELEGATECALL`
    DelegateCall,
    /// `CREATE`/`CREATE2`
    Create,
}

/// One frame of an execution trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceFrame {
    /// Call depth, 0 for the outermost frame.
    pub depth: usize,
    /// Frame kind.
    pub kind: FrameKind,
    /// Caller.
    pub from: Address,
    /// Callee; `None` for a not-yet-resolved CREATE target.
    pub to: Option<Address>,
    /// Value transferred.
    pub value: U256,
    /// Input data.
    pub input: Bytes,
    /// Return or revert data.
    pub output: Bytes,
    /// Frame result.
    pub status: CallStatus,
}

/// A captured execution trace, attached to failing sequences.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionTrace {
    /// The recorded frames in execution order.
    pub frames: Vec<TraceFrame>,
}

impl fmt::Display for ExecutionTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for frame in &self.frames {
            let target = frame
                .to
                .map(|to| to.to_string())
                .unwrap_or_else(|| "<create>".to_string());
            writeln!(
                f,
                "{:indent$}[{:?}] {} -> {} value: {} status: {:?}",
                "",
                frame.kind,
                frame.from,
                target,
                frame.value,
                frame.status,
                indent = frame.depth * 2
            )?;
        }
        Ok(())
    }
}

/// How much of a traced sequence keeps its traces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TraceVerbosity {
    /// Attach the trace of the final element only.
    #[default]
    Final,
    /// Attach a trace to every element.
    All,
}

/// Receives trace frames during execution.
pub trait Tracer {
    /// Record one completed frame.
    fn record_frame(&mut self, frame: TraceFrame);
}

/// A [`Tracer`] that collects frames into an [`ExecutionTrace`].
#[derive(Default)]
pub struct CollectingTracer {
    frames: Vec<TraceFrame>,
}

impl CollectingTracer {
    /// New empty tracer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Finish and return the collected trace.
    pub fn into_trace(self) -> ExecutionTrace {
        ExecutionTrace { frames: self.frames }
    }
}

impl Tracer for CollectingTracer {
    fn record_frame(&mut self, frame: TraceFrame) {
        self.frames.push(frame);
    }
}

/// Header of a (pending or committed) block on the test chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Block number.
    pub number: u64,
    /// Block timestamp in seconds.
    pub timestamp: u64,
    /// Block gas limit.
    pub gas_limit: u64,
}

/// The block currently accepting transactions.
#[derive(Debug)]
pub struct PendingBlock {
    /// The block header.
    pub header: BlockHeader,
    /// Canonical hashes of the appended transactions.
    pub tx_hashes: Vec<B256>,
    /// Gas consumed so far.
    pub gas_used: u64,
}

impl PendingBlock {
    /// Number of appended transactions.
    pub fn tx_count(&self) -> usize {
        self.tx_hashes.len()
    }
}

/// A committed block, kept in light form.
#[derive(Debug, Clone)]
pub struct CommittedBlock {
    /// The block header.
    pub header: BlockHeader,
    /// Number of transactions the block carried.
    pub tx_count: usize,
}

/// Contract lifecycle events emitted by the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContractEvent {
    /// A contract was created.
    Deployed {
        /// Address of the new contract.
        address: Address,
    },
    /// A contract was removed (SELFDESTRUCT or revert of its creation).
    Removed {
        /// Address of the removed contract.
        address: Address,
    },
}

/// The EVM seam: executes one call message against the forked state.
///
/// Implementations must call back into the state for reads/writes so the
/// overlay sees every touch, and must report creations, destructions and
/// coverage in the outcome; the chain maintains the surrounding
/// bookkeeping.
pub trait Evm: Send {
    /// Execute `msg` against `state` under `header`. A plain revert is a
    /// successful execution with [`CallStatus::Revert`]; errors are
    /// reserved for messages that cannot execute at all.
    fn execute_call(
        &mut self,
        state: &mut FuzzerState,
        header: &BlockHeader,
        msg: &CallMessage,
        tracer: Option<&mut dyn Tracer>,
    ) -> Result<CallOutcome, ExecutionError>;
}

impl Evm for Box<dyn Evm> {
    fn execute_call(
        &mut self,
        state: &mut FuzzerState,
        header: &BlockHeader,
        msg: &CallMessage,
        tracer: Option<&mut dyn Tracer>,
    ) -> Result<CallOutcome, ExecutionError> {
        (**self).execute_call(state, header, msg, tracer)
    }
}

/// A worker-private test chain.
pub struct TestChain<E> {
    evm: E,
    state: FuzzerState,
    head: BlockHeader,
    pending: Option<PendingBlock>,
    blocks: Vec<CommittedBlock>,
    block_gas_limit: u64,
    events: VecDeque<ContractEvent>,
    traces: HashMap<B256, ExecutionTrace>,
    tracing: bool,
}

impl<E: Evm> TestChain<E> {
    /// New chain at genesis (block 0, timestamp 0).
    pub fn new(evm: E, state: FuzzerState, block_gas_limit: u64) -> Self {
        Self {
            evm,
            state,
            head: BlockHeader { number: 0, timestamp: 0, gas_limit: block_gas_limit },
            pending: None,
            blocks: Vec::new(),
            block_gas_limit,
            events: VecDeque::new(),
            traces: HashMap::new(),
            tracing: false,
        }
    }

    /// The most recently committed block header.
    pub fn head(&self) -> &BlockHeader {
        &self.head
    }

    /// The block currently accepting transactions, if any.
    pub fn pending_block(&self) -> Option<&PendingBlock> {
        self.pending.as_ref()
    }

    /// Committed blocks, oldest first.
    pub fn blocks(&self) -> &[CommittedBlock] {
        &self.blocks
    }

    /// The underlying forked state.
    pub fn state(&self) -> &FuzzerState {
        &self.state
    }

    /// Mutable access to the forked state.
    pub fn state_mut(&mut self) -> &mut FuzzerState {
        &mut self.state
    }

    /// Create the pending block from the suggested delays.
    ///
    /// The timestamp always advances by at least one second; the number
    /// advances by at least one block but never faster than the
    /// timestamp, since each block must carry a unique timestamp.
    pub fn create_pending_block(
        &mut self,
        number_delay: u64,
        timestamp_delay: u64,
    ) -> Result<(), ExecutionError> {
        if self.pending.is_some() {
            return Err(ExecutionError::InvalidTransaction(
                "a pending block already exists".into(),
            ));
        }
        let dt = timestamp_delay.max(1);
        let dn = number_delay.max(1).min(dt);
        let header = BlockHeader {
            number: self.head.number + dn,
            timestamp: self.head.timestamp + dt,
            gas_limit: self.block_gas_limit,
        };
        trace!(number = header.number, timestamp = header.timestamp, "Created pending block");
        self.pending = Some(PendingBlock { header, tx_hashes: Vec::new(), gas_used: 0 });
        Ok(())
    }

    /// Append and execute a call on the pending block, returning its
    /// transaction index and outcome.
    ///
    /// The state snapshots before execution so that a revert of the
    /// enclosing sequence unwinds the call's writes and overlay records.
    pub fn append_call(
        &mut self,
        msg: &CallMessage,
    ) -> Result<(usize, CallOutcome), ExecutionError> {
        let pending = self.pending.as_ref().ok_or(ExecutionError::NoPendingBlock)?;

        let remaining = pending.header.gas_limit.saturating_sub(pending.gas_used);
        if msg.gas_limit > remaining {
            return Err(ExecutionError::BlockGasLimitReached {
                gas_limit: msg.gas_limit,
                remaining,
            });
        }

        let header = pending.header;
        let tx_snap = self.state.snapshot();
        let outcome = match self.execute_on_state(&header, msg) {
            Ok(outcome) => outcome,
            Err(err) => {
                // Discard partial writes of the failed execution.
                self.state.revert_to_snapshot(tx_snap);
                return Err(err);
            }
        };

        self.apply_outcome(&outcome)?;

        let pending = self.pending.as_mut().expect("pending checked above");
        pending.gas_used += outcome.gas_used;
        pending.tx_hashes.push(msg.canonical_hash());
        Ok((pending.tx_count() - 1, outcome))
    }

    /// Commit the pending block, advancing the head. A no-op without a
    /// pending block.
    pub fn commit_pending_block(&mut self) {
        if let Some(pending) = self.pending.take() {
            debug!(
                number = pending.header.number,
                txs = pending.tx_count(),
                "Committed block"
            );
            self.head = pending.header;
            self.blocks
                .push(CommittedBlock { header: pending.header, tx_count: pending.tx_count() });
        }
    }

    /// Execute a call against the current state under a snapshot that is
    /// reverted afterwards. Used for read-only probes such as property
    /// checks.
    pub fn view_call(&mut self, msg: &CallMessage) -> Result<CallOutcome, ExecutionError> {
        let header = self
            .pending
            .as_ref()
            .map(|p| p.header)
            .unwrap_or(BlockHeader {
                number: self.head.number + 1,
                timestamp: self.head.timestamp + 1,
                gas_limit: self.block_gas_limit,
            });
        let snap = self.state.snapshot();
        let result = self.execute_on_state(&header, msg);
        self.state.revert_to_snapshot(snap);
        result
    }

    /// Deploy a contract definition, creating a pending block if needed.
    /// Returns the deployment address.
    pub fn deploy_contract(
        &mut self,
        definition: &ContractDefinition,
        deployer: Address,
    ) -> Result<Address, ExecutionError> {
        if self.pending.is_none() {
            self.create_pending_block(1, 1)?;
        }
        let gas_limit = self
            .pending
            .as_ref()
            .map(|p| p.header.gas_limit.saturating_sub(p.gas_used))
            .unwrap_or(self.block_gas_limit);
        let msg = CallMessage::create(deployer, definition.bytecode.clone(), gas_limit);
        let (_, outcome) = self.append_call(&msg)?;

        outcome.created_contract.ok_or_else(|| {
            ExecutionError::Evm(format!("deployment of {} produced no contract", definition.name))
        })
    }

    /// Take a state snapshot.
    pub fn snapshot(&mut self) -> SnapId {
        self.state.snapshot()
    }

    /// Revert the state to a snapshot. Block headers are not rewound;
    /// the chain keeps moving forward in numbers and timestamps.
    pub fn revert_to_snapshot(&mut self, snap: SnapId) -> bool {
        self.state.revert_to_snapshot(snap)
    }

    /// Code deployed at `addr`, empty when absent.
    pub fn code_at(&mut self, addr: Address) -> Result<Bytes, ExecutionError> {
        self.state.get_code(addr).map_err(|e| ExecutionError::State(e.to_string()))
    }

    /// Enable or disable trace capture. Disabling clears captured traces.
    pub fn set_tracing(&mut self, enabled: bool) {
        self.tracing = enabled;
        if !enabled {
            self.traces.clear();
        }
    }

    /// Take the captured trace of a transaction by canonical hash.
    pub fn take_trace(&mut self, tx_hash: &B256) -> Option<ExecutionTrace> {
        self.traces.remove(tx_hash)
    }

    /// Drain the contract lifecycle events emitted since the last drain.
    pub fn drain_events(&mut self) -> Vec<ContractEvent> {
        self.events.drain(..).collect()
    }

    fn execute_on_state(
        &mut self,
        header: &BlockHeader,
        msg: &CallMessage,
    ) -> Result<CallOutcome, ExecutionError> {
        if self.tracing {
            let mut tracer = CollectingTracer::new();
            let outcome =
                self.evm.execute_call(&mut self.state, header, msg, Some(&mut tracer))?;
            self.traces.insert(msg.canonical_hash(), tracer.into_trace());
            Ok(outcome)
        } else {
            self.evm.execute_call(&mut self.state, header, msg, None)
        }
    }

    fn apply_outcome(&mut self, outcome: &CallOutcome) -> Result<(), ExecutionError> {
        if let Some(address) = outcome.created_contract {
            self.state
                .create_contract(address)
                .map_err(|e| ExecutionError::State(e.to_string()))?;
            self.events.push_back(ContractEvent::Deployed { address });
        }
        for address in &outcome.destroyed_contracts {
            self.state.remove_account(*address);
            self.events.push_back(ContractEvent::Removed { address: *address });
        }
        Ok(())
    }
}

/// Object-safe chain access handed to test providers.
pub trait ChainAccess {
    /// Execute a call under a snapshot that is reverted afterwards.
    fn view_call(&mut self, msg: &CallMessage) -> Result<CallOutcome, ExecutionError>;

    /// Code deployed at `addr`.
    fn code_at(&mut self, addr: Address) -> Result<Bytes, ExecutionError>;
}

impl<E: Evm> ChainAccess for TestChain<E> {
    fn view_call(&mut self, msg: &CallMessage) -> Result<CallOutcome, ExecutionError> {
        Self::view_call(self, msg)
    }

    fn code_at(&mut self, addr: Address) -> Result<Bytes, ExecutionError> {
        Self::code_at(self, addr)
    }
}
