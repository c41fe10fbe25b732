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

//! The journaled account/storage store a test chain executes against.
//!
//! Reads that miss locally are materialized through the overlay from the
//! backend; writes mark state dirty so the overlay refuses later
//! re-imports. Snapshots checkpoint the journal, and reverting unwinds
//! both the local state and the overlay's records.

use crate::{
    backend::StateBackend,
    cache::StateObject,
    error::{BackendError, RemoteStateError, RemoteStorageError},
    overlay::{ForkOverlay, SnapId},
};
use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use revm::primitives::KECCAK_EMPTY;
use std::collections::{BTreeMap, HashMap};
use tracing::trace;

/// A locally materialized account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountEntry {
    /// Balance in wei.
    pub balance: U256,
    /// Account nonce.
    pub nonce: u64,
    /// Deployed code, empty for EOAs.
    pub code: Bytes,
    /// keccak256 of `code`, [`KECCAK_EMPTY`] when empty.
    pub code_hash: B256,
}

impl Default for AccountEntry {
    fn default() -> Self {
        Self { balance: U256::ZERO, nonce: 0, code: Bytes::new(), code_hash: KECCAK_EMPTY }
    }
}

impl AccountEntry {
    /// Whether balance, nonce and code are all zero (EIP-161 emptiness).
    pub fn is_empty(&self) -> bool {
        self.balance.is_zero() && self.nonce == 0 && self.code.is_empty()
    }

    fn from_object(obj: StateObject) -> Self {
        let code_hash = if obj.code.is_empty() { KECCAK_EMPTY } else { keccak256(&obj.code) };
        Self { balance: obj.balance, nonce: obj.nonce, code: obj.code, code_hash }
    }
}

enum JournalEntry {
    AccountCreated(Address),
    AccountChanged(Address, AccountEntry),
    AccountRemoved(Address, AccountEntry, HashMap<B256, B256>),
    StorageChanged(Address, B256, Option<B256>),
}

/// Forked state with snapshot/revert support.
///
/// Owned by exactly one worker; not internally locked.
pub struct ForkedState<B> {
    overlay: ForkOverlay<B>,
    accounts: HashMap<Address, AccountEntry>,
    storage: HashMap<Address, HashMap<B256, B256>>,
    // Code bodies by hash, retained across reverts as a lookup cache for
    // the revm bridge.
    contracts: HashMap<B256, Bytes>,
    journal: Vec<JournalEntry>,
    checkpoints: BTreeMap<SnapId, usize>,
    next_snap: SnapId,
}

impl<B: StateBackend> ForkedState<B> {
    /// New state over `backend` with nothing materialized.
    pub fn new(backend: B) -> Self {
        Self {
            overlay: ForkOverlay::new(backend),
            accounts: HashMap::new(),
            storage: HashMap::new(),
            contracts: HashMap::new(),
            journal: Vec::new(),
            checkpoints: BTreeMap::new(),
            next_snap: 0,
        }
    }

    /// The overlay tracking dirty state.
    pub fn overlay(&self) -> &ForkOverlay<B> {
        &self.overlay
    }

    /// Mutable access to the overlay, for callers that drive it directly.
    pub fn overlay_mut(&mut self) -> &mut ForkOverlay<B> {
        &mut self.overlay
    }

    /// The snapshot id new records are attributed to: the most recently
    /// taken snapshot, or 0 before the first one.
    pub fn current_snap(&self) -> SnapId {
        self.next_snap.saturating_sub(1)
    }

    /// Take a snapshot and return its id. Ids increase monotonically and
    /// are never reused, even after reverts.
    pub fn snapshot(&mut self) -> SnapId {
        let id = self.next_snap;
        self.next_snap += 1;
        self.checkpoints.insert(id, self.journal.len());
        trace!(id, "Took state snapshot");
        id
    }

    /// Revert to the snapshot `id`, unwinding local changes made after it
    /// and the overlay records taken strictly after it. Returns false for
    /// an unknown (or already unwound) snapshot id.
    pub fn revert_to_snapshot(&mut self, id: SnapId) -> bool {
        let Some(&mark) = self.checkpoints.get(&id) else {
            return false;
        };
        while self.journal.len() > mark {
            let entry = self.journal.pop().expect("journal length checked");
            self.undo(entry);
        }
        // Later snapshots are gone; `id` itself stays revertable.
        self.checkpoints.split_off(&(id + 1));
        self.overlay.notify_reverted_to_snapshot(id);
        trace!(id, "Reverted state to snapshot");
        true
    }

    fn undo(&mut self, entry: JournalEntry) {
        match entry {
            JournalEntry::AccountCreated(addr) => {
                self.accounts.remove(&addr);
            }
            JournalEntry::AccountChanged(addr, prev) => {
                self.accounts.insert(addr, prev);
            }
            JournalEntry::AccountRemoved(addr, prev, prev_storage) => {
                self.accounts.insert(addr, prev);
                self.storage.insert(addr, prev_storage);
            }
            JournalEntry::StorageChanged(addr, slot, prev) => match prev {
                Some(value) => {
                    self.storage.entry(addr).or_default().insert(slot, value);
                }
                None => {
                    if let Some(slots) = self.storage.get_mut(&addr) {
                        slots.remove(&slot);
                        if slots.is_empty() {
                            self.storage.remove(&addr);
                        }
                    }
                }
            },
        }
    }

    /// Whether a state object exists for `addr`.
    ///
    /// Note the documented divergence from a pruning state DB: an account
    /// materialized by a successful import exists even when its balance,
    /// nonce and code are all zero.
    pub fn exist(&self, addr: &Address) -> bool {
        self.accounts.contains_key(addr)
    }

    /// EIP-161 emptiness; absent accounts are empty.
    pub fn empty(&self, addr: &Address) -> bool {
        self.accounts.get(addr).is_none_or(|entry| entry.is_empty())
    }

    /// Balance of `addr`, importing lazily on first touch.
    pub fn get_balance(&mut self, addr: Address) -> Result<U256, BackendError> {
        self.ensure_read(addr)?;
        Ok(self.accounts.get(&addr).map(|e| e.balance).unwrap_or_default())
    }

    /// Nonce of `addr`, importing lazily on first touch.
    pub fn get_nonce(&mut self, addr: Address) -> Result<u64, BackendError> {
        self.ensure_read(addr)?;
        Ok(self.accounts.get(&addr).map(|e| e.nonce).unwrap_or_default())
    }

    /// Code of `addr`, importing lazily on first touch.
    pub fn get_code(&mut self, addr: Address) -> Result<Bytes, BackendError> {
        self.ensure_read(addr)?;
        Ok(self.accounts.get(&addr).map(|e| e.code.clone()).unwrap_or_default())
    }

    /// Code hash of `addr`, [`KECCAK_EMPTY`] for absent accounts.
    pub fn get_code_hash(&mut self, addr: Address) -> Result<B256, BackendError> {
        self.ensure_read(addr)?;
        Ok(self.accounts.get(&addr).map(|e| e.code_hash).unwrap_or(KECCAK_EMPTY))
    }

    /// The locally materialized account entry, if any.
    pub fn account(&self, addr: &Address) -> Option<&AccountEntry> {
        self.accounts.get(addr)
    }

    /// Code body by hash, serving the revm bridge.
    pub fn code_by_hash(&self, hash: &B256) -> Option<Bytes> {
        self.contracts.get(hash).cloned()
    }

    /// Storage slot of `addr`, importing lazily on first touch. A dirty
    /// refusal from the overlay falls back to the local view: zero.
    pub fn get_storage(&mut self, addr: Address, slot: B256) -> Result<B256, BackendError> {
        if let Some(value) = self.storage.get(&addr).and_then(|slots| slots.get(&slot)) {
            return Ok(*value);
        }

        match self.overlay.import_storage_at(addr, slot, self.current_snap()) {
            Ok(value) => {
                // Keep the imported value local so a revert unwinds it and
                // a later re-import stays possible.
                self.journal.push(JournalEntry::StorageChanged(addr, slot, None));
                self.storage.entry(addr).or_default().insert(slot, value);
                Ok(value)
            }
            Err(RemoteStorageError::CannotQueryDirtySlot { .. }) => Ok(B256::ZERO),
            Err(RemoteStorageError::Backend(err)) => Err(err),
        }
    }

    /// Write a storage slot, materializing the account if needed and
    /// marking the slot dirty.
    pub fn set_storage(
        &mut self,
        addr: Address,
        slot: B256,
        value: B256,
    ) -> Result<(), BackendError> {
        self.materialize(addr)?;
        self.overlay.mark_slot_written(addr, slot, self.current_snap());

        let prev = self.storage.get(&addr).and_then(|slots| slots.get(&slot)).copied();
        self.journal.push(JournalEntry::StorageChanged(addr, slot, prev));
        self.storage.entry(addr).or_default().insert(slot, value);
        Ok(())
    }

    /// Set the balance of `addr`.
    pub fn set_balance(&mut self, addr: Address, balance: U256) -> Result<(), BackendError> {
        self.mutate(addr, |entry| entry.balance = balance)
    }

    /// Set the nonce of `addr`.
    pub fn set_nonce(&mut self, addr: Address, nonce: u64) -> Result<(), BackendError> {
        self.mutate(addr, |entry| entry.nonce = nonce)
    }

    /// Set the code of `addr`.
    pub fn set_code(&mut self, addr: Address, code: Bytes) -> Result<(), BackendError> {
        let code_hash = if code.is_empty() { KECCAK_EMPTY } else { keccak256(&code) };
        if !code.is_empty() {
            self.contracts.insert(code_hash, code.clone());
        }
        self.mutate(addr, |entry| {
            entry.code = code;
            entry.code_hash = code_hash;
        })
    }

    /// Record a CREATE/CREATE2 at `addr`: materializes the account and
    /// blocks remote storage reads for it.
    pub fn create_contract(&mut self, addr: Address) -> Result<(), BackendError> {
        self.materialize(addr)?;
        self.overlay.mark_contract_deployed(addr, self.current_snap());
        Ok(())
    }

    /// Remove an account and its storage (SELFDESTRUCT).
    pub fn remove_account(&mut self, addr: Address) {
        if let Some(entry) = self.accounts.remove(&addr) {
            let slots = self.storage.remove(&addr).unwrap_or_default();
            self.journal.push(JournalEntry::AccountRemoved(addr, entry, slots));
        }
    }

    /// Materialize `addr` locally through an explicit import.
    ///
    /// Unlike the read paths, a successful all-zero import still creates
    /// the state object: this is the single documented divergence from a
    /// pruning state DB.
    pub fn import_account(&mut self, addr: Address) -> Result<(), BackendError> {
        self.materialize(addr)
    }

    /// Read-path materialization: a successful import of a non-empty
    /// object creates the local account; an all-zero import or a dirty
    /// refusal leaves the local view untouched.
    fn ensure_read(&mut self, addr: Address) -> Result<(), BackendError> {
        if self.accounts.contains_key(&addr) {
            return Ok(());
        }
        match self.overlay.import_state_object(addr, self.current_snap()) {
            Ok(obj) if obj.is_empty() => Ok(()),
            Ok(obj) => {
                self.insert_imported(addr, obj);
                Ok(())
            }
            Err(RemoteStateError::CannotQueryDirtyAccount(_)) => Ok(()),
            Err(RemoteStateError::Backend(err)) => Err(err),
        }
    }

    fn materialize(&mut self, addr: Address) -> Result<(), BackendError> {
        if self.accounts.contains_key(&addr) {
            return Ok(());
        }
        match self.overlay.import_state_object(addr, self.current_snap()) {
            Ok(obj) => {
                self.insert_imported(addr, obj);
                Ok(())
            }
            Err(RemoteStateError::CannotQueryDirtyAccount(_)) => {
                // Previously imported or written; the local view is
                // authoritative, so start from an empty object.
                self.journal.push(JournalEntry::AccountCreated(addr));
                self.accounts.insert(addr, AccountEntry::default());
                Ok(())
            }
            Err(RemoteStateError::Backend(err)) => Err(err),
        }
    }

    fn insert_imported(&mut self, addr: Address, obj: StateObject) {
        let entry = AccountEntry::from_object(obj);
        if !entry.code.is_empty() {
            self.contracts.insert(entry.code_hash, entry.code.clone());
        }
        self.journal.push(JournalEntry::AccountCreated(addr));
        self.accounts.insert(addr, entry);
    }

    fn mutate(
        &mut self,
        addr: Address,
        f: impl FnOnce(&mut AccountEntry),
    ) -> Result<(), BackendError> {
        self.materialize(addr)?;
        self.overlay.mark_account_written(addr, self.current_snap());

        let entry = self.accounts.get_mut(&addr).expect("materialized above");
        self.journal.push(JournalEntry::AccountChanged(addr, entry.clone()));
        f(entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::EmptyBackend;
    use alloy_primitives::address;
    use std::sync::Arc;

    /// Backend with a fixed population, standing in for a remote chain.
    #[derive(Default)]
    struct FixtureBackend {
        accounts: HashMap<Address, StateObject>,
        slots: HashMap<(Address, B256), B256>,
    }

    impl StateBackend for FixtureBackend {
        fn state_object(&self, addr: Address) -> Result<StateObject, BackendError> {
            Ok(self.accounts.get(&addr).cloned().unwrap_or_default())
        }

        fn storage_at(&self, addr: Address, slot: B256) -> Result<B256, BackendError> {
            Ok(self.slots.get(&(addr, slot)).copied().unwrap_or_default())
        }
    }

    fn remote_state() -> ForkedState<Arc<FixtureBackend>> {
        let mut backend = FixtureBackend::default();
        let rich = address!("00000000000000000000000000000000000000aa");
        backend.accounts.insert(
            rich,
            StateObject {
                balance: U256::from(100),
                nonce: 7,
                code: Bytes::from_static(&[0x60, 0x60]),
            },
        );
        backend.slots.insert(
            (address!("00000000000000000000000000000000000000c0"), B256::with_last_byte(0xab)),
            B256::with_last_byte(0x2a),
        );
        ForkedState::new(Arc::new(backend))
    }

    #[test]
    fn test_first_touch_reads_import_remote_state() {
        ferret_common::logging::ensure_test_logging(None);

        let mut state = remote_state();
        let rich = address!("00000000000000000000000000000000000000aa");

        assert_eq!(state.get_balance(rich).unwrap(), U256::from(100));
        assert_eq!(state.get_nonce(rich).unwrap(), 7);
        assert_eq!(state.get_code(rich).unwrap().as_ref(), &[0x60, 0x60]);
        assert!(state.exist(&rich));

        let holder = address!("00000000000000000000000000000000000000c0");
        let slot = B256::with_last_byte(0xab);
        assert_eq!(state.get_storage(holder, slot).unwrap(), B256::with_last_byte(0x2a));
    }

    #[test]
    fn test_reads_after_import_use_the_local_view() {
        let mut state = remote_state();
        let rich = address!("00000000000000000000000000000000000000aa");

        assert_eq!(state.get_balance(rich).unwrap(), U256::from(100));
        state.set_balance(rich, U256::from(5)).unwrap();

        // The overlay refuses a re-import; the local write wins.
        assert_eq!(state.get_balance(rich).unwrap(), U256::from(5));
        assert!(state.overlay().is_account_dirty(&rich));
    }

    #[test]
    fn test_snapshot_revert_unwinds_writes_and_imports() {
        let mut state = remote_state();
        let rich = address!("00000000000000000000000000000000000000aa");
        let holder = address!("00000000000000000000000000000000000000c0");
        let slot = B256::with_last_byte(0xab);

        // A chain snapshots before executing each transaction, so records
        // taken during a transaction sit strictly above the base.
        let base = state.snapshot();
        let _tx1 = state.snapshot();
        assert_eq!(state.get_storage(holder, slot).unwrap(), B256::with_last_byte(0x2a));
        state.set_balance(rich, U256::from(1)).unwrap();
        let tx2 = state.snapshot();
        state.set_storage(holder, slot, B256::with_last_byte(0x99)).unwrap();

        assert!(state.revert_to_snapshot(tx2));
        assert_eq!(state.get_storage(holder, slot).unwrap(), B256::with_last_byte(0x2a));

        assert!(state.revert_to_snapshot(base));
        // Both the local values and the overlay records are gone, so the
        // imports happen again and serve the remote values.
        assert!(!state.exist(&rich));
        assert_eq!(state.get_storage(holder, slot).unwrap(), B256::with_last_byte(0x2a));
        assert_eq!(state.get_balance(rich).unwrap(), U256::from(100));

        assert!(!state.revert_to_snapshot(99));
    }

    #[test]
    fn test_locally_deployed_contract_storage_stays_local() {
        let mut state = remote_state();
        let deployed = address!("00000000000000000000000000000000000000dd");

        state.create_contract(deployed).unwrap();
        state.set_code(deployed, Bytes::from_static(&[0xfe])).unwrap();

        // No remote data for a local contract: unwritten slots read zero.
        assert_eq!(state.get_storage(deployed, B256::with_last_byte(1)).unwrap(), B256::ZERO);
        state.set_storage(deployed, B256::with_last_byte(1), B256::with_last_byte(2)).unwrap();
        assert_eq!(
            state.get_storage(deployed, B256::with_last_byte(1)).unwrap(),
            B256::with_last_byte(2)
        );
    }

    #[test]
    fn test_empty_backend_existence_divergence() {
        ferret_common::logging::ensure_test_logging(None);

        let mut state = ForkedState::new(EmptyBackend);
        let touched = address!("00000000000000000000000000000000000000aa");
        let untouched = address!("00000000000000000000000000000000000000bb");
        let imported = address!("00000000000000000000000000000000000000cc");

        state.set_nonce(touched, 5).unwrap();
        assert_eq!(state.get_nonce(touched).unwrap(), 5);

        // A plain read of a never-touched account does not materialize it.
        assert_eq!(state.get_nonce(untouched).unwrap(), 0);
        assert!(state.empty(&untouched));
        assert!(!state.exist(&untouched));

        // An explicit import of an all-zero account does: the documented
        // divergence from EIP-161-style pruning.
        state.import_account(imported).unwrap();
        assert!(state.empty(&imported));
        assert!(state.exist(&imported));
    }

    #[test]
    fn test_selfdestruct_round_trip() {
        let mut state = remote_state();
        let rich = address!("00000000000000000000000000000000000000aa");

        assert_eq!(state.get_balance(rich).unwrap(), U256::from(100));
        let snap = state.snapshot();

        state.remove_account(rich);
        assert!(!state.exist(&rich));

        assert!(state.revert_to_snapshot(snap));
        assert!(state.exist(&rich));
        assert_eq!(state.get_balance(rich).unwrap(), U256::from(100));
    }
}
