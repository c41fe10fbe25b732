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

//! Snapshot-aware dirty-state bookkeeping for forked execution.
//!
//! Once an account or slot has been imported from the remote source or
//! locally modified, serving the remote value again would overwrite local
//! progress, so the overlay refuses a second import until every record of
//! the first has been unwound by a snapshot revert. Records are kept per
//! snapshot id so that reverting un-dirties exactly the state touched
//! after the target snapshot.
//!
//! The overlay is single-threaded by design: each worker owns its chain,
//! its state and this overlay outright.

use crate::{
    backend::StateBackend,
    cache::StateObject,
    error::{RemoteStateError, RemoteStorageError},
};
use alloy_primitives::{Address, B256};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::trace;

/// Identifier of an EVM state checkpoint. Monotonically increasing,
/// never reused after a revert.
pub type SnapId = u64;

/// Dirty-state bookkeeping over a [`StateBackend`].
///
/// Three record shards are kept per snapshot id, mirrored by three
/// membership sets for O(1) dirtiness checks. The shards always hold a
/// key at the *earliest* snapshot that touched it: reverting to that
/// snapshot or anything later must still see the key as dirty, so later
/// touches never re-record.
pub struct ForkOverlay<B> {
    backend: B,
    slots_by_snap: BTreeMap<SnapId, HashMap<Address, HashSet<B256>>>,
    accounts_by_snap: BTreeMap<SnapId, HashSet<Address>>,
    deploys_by_snap: BTreeMap<SnapId, HashSet<Address>>,
    accounts_imported: HashSet<Address>,
    slots_imported: HashMap<Address, HashSet<B256>>,
    contracts_deployed: HashSet<Address>,
}

impl<B: StateBackend> ForkOverlay<B> {
    /// New overlay over `backend` with no recorded state.
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            slots_by_snap: BTreeMap::new(),
            accounts_by_snap: BTreeMap::new(),
            deploys_by_snap: BTreeMap::new(),
            accounts_imported: HashSet::new(),
            slots_imported: HashMap::new(),
            contracts_deployed: HashSet::new(),
        }
    }

    /// The backend serving first-touch reads.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Import an account object from the remote source.
    ///
    /// Refused with the dirty-account error if any record for `addr`
    /// survives; on success the account is recorded at `snap` and becomes
    /// dirty itself.
    pub fn import_state_object(
        &mut self,
        addr: Address,
        snap: SnapId,
    ) -> Result<StateObject, RemoteStateError> {
        if self.accounts_imported.contains(&addr) {
            return Err(RemoteStateError::CannotQueryDirtyAccount(addr));
        }

        let obj = self.backend.state_object(addr)?;
        self.accounts_by_snap.entry(snap).or_default().insert(addr);
        self.accounts_imported.insert(addr);
        trace!(%addr, snap, "Imported account object");
        Ok(obj)
    }

    /// Import a storage slot value from the remote source.
    ///
    /// Refused without consulting the backend when the slot is dirty or
    /// when `addr` is a locally deployed contract (the remote chain cannot
    /// have data for a contract that only exists locally).
    pub fn import_storage_at(
        &mut self,
        addr: Address,
        slot: B256,
        snap: SnapId,
    ) -> Result<B256, RemoteStorageError> {
        if self.contracts_deployed.contains(&addr)
            || self.slots_imported.get(&addr).is_some_and(|slots| slots.contains(&slot))
        {
            return Err(RemoteStorageError::CannotQueryDirtySlot { address: addr, slot });
        }

        let value = self.backend.storage_at(addr, slot)?;
        self.record_slot(addr, slot, snap);
        trace!(%addr, %slot, snap, "Imported storage slot");
        Ok(value)
    }

    /// Record that local execution wrote account-level state (balance,
    /// nonce or code) of `addr`.
    pub fn mark_account_written(&mut self, addr: Address, snap: SnapId) {
        // Earliest-snapshot rule: a surviving record must not move to a
        // later snapshot, or a revert past the later one would wrongly
        // allow a re-import.
        if self.accounts_imported.insert(addr) {
            self.accounts_by_snap.entry(snap).or_default().insert(addr);
        }
    }

    /// Record that local execution wrote a storage slot of `addr`.
    pub fn mark_slot_written(&mut self, addr: Address, slot: B256, snap: SnapId) {
        if !self.slots_imported.get(&addr).is_some_and(|slots| slots.contains(&slot)) {
            self.record_slot(addr, slot, snap);
        }
    }

    /// Record that local execution deployed a contract at `addr`
    /// (CREATE/CREATE2).
    pub fn mark_contract_deployed(&mut self, addr: Address, snap: SnapId) {
        if self.contracts_deployed.insert(addr) {
            self.deploys_by_snap.entry(snap).or_default().insert(addr);
        }
    }

    /// Unwind every record taken strictly after `snap`.
    ///
    /// Records taken at `snap` itself survive: the revert leaves the state
    /// as of that snapshot in place, so it stays dirty.
    pub fn notify_reverted_to_snapshot(&mut self, snap: SnapId) {
        let bound = snap.saturating_add(1);

        for (_, accounts) in self.accounts_by_snap.split_off(&bound) {
            for addr in accounts {
                self.accounts_imported.remove(&addr);
            }
        }

        for (_, slots) in self.slots_by_snap.split_off(&bound) {
            for (addr, keys) in slots {
                if let Some(imported) = self.slots_imported.get_mut(&addr) {
                    for key in keys {
                        imported.remove(&key);
                    }
                    if imported.is_empty() {
                        self.slots_imported.remove(&addr);
                    }
                }
            }
        }

        for (_, deploys) in self.deploys_by_snap.split_off(&bound) {
            for addr in deploys {
                self.contracts_deployed.remove(&addr);
            }
        }

        trace!(snap, "Unwound overlay records past snapshot");
    }

    /// Whether account-level state of `addr` is dirty.
    pub fn is_account_dirty(&self, addr: &Address) -> bool {
        self.accounts_imported.contains(addr)
    }

    /// Whether the given slot of `addr` is dirty.
    pub fn is_slot_dirty(&self, addr: &Address, slot: &B256) -> bool {
        self.contracts_deployed.contains(addr)
            || self.slots_imported.get(addr).is_some_and(|slots| slots.contains(slot))
    }

    /// Whether `addr` was deployed by local execution.
    pub fn is_locally_deployed(&self, addr: &Address) -> bool {
        self.contracts_deployed.contains(addr)
    }

    fn record_slot(&mut self, addr: Address, slot: B256, snap: SnapId) {
        self.slots_by_snap.entry(snap).or_default().entry(addr).or_default().insert(slot);
        self.slots_imported.entry(addr).or_default().insert(slot);
    }
}
