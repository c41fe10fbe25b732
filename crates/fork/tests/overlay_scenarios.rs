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

//! Overlay scenarios driven with explicit snapshot ids.

use alloy_primitives::{address, Address, Bytes, B256, U256};
use ferret_fork::{BackendError, ForkOverlay, StateBackend, StateObject};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

/// Backend fixture that counts how often the wire would be hit.
#[derive(Default)]
struct CountingBackend {
    accounts: Mutex<HashMap<Address, StateObject>>,
    slots: Mutex<HashMap<(Address, B256), B256>>,
    account_reads: AtomicUsize,
    slot_reads: AtomicUsize,
}

impl CountingBackend {
    fn with_account(self, addr: Address, obj: StateObject) -> Self {
        self.accounts.lock().insert(addr, obj);
        self
    }

    fn with_slot(self, addr: Address, slot: B256, value: B256) -> Self {
        self.slots.lock().insert((addr, slot), value);
        self
    }
}

impl StateBackend for CountingBackend {
    fn state_object(&self, addr: Address) -> Result<StateObject, BackendError> {
        self.account_reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.accounts.lock().get(&addr).cloned().unwrap_or_default())
    }

    fn storage_at(&self, addr: Address, slot: B256) -> Result<B256, BackendError> {
        self.slot_reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.slots.lock().get(&(addr, slot)).copied().unwrap_or_default())
    }
}

/// Dirty re-import after a same-snapshot revert.
#[test]
fn dirty_reimport_after_same_snap_revert() {
    ferret_common::logging::ensure_test_logging(None);

    let addr = address!("00000000000000000000000000000000000000aa");
    let backend = Arc::new(CountingBackend::default().with_account(
        addr,
        StateObject {
            balance: U256::from(100),
            nonce: 7,
            code: Bytes::from_static(&[0x60, 0x60]),
        },
    ));
    let mut overlay = ForkOverlay::new(backend.clone());

    let first = overlay.import_state_object(addr, 5).unwrap();
    assert_eq!(first.balance, U256::from(100));
    assert_eq!(first.nonce, 7);
    assert_eq!(first.code.as_ref(), &[0x60, 0x60]);

    assert!(overlay.import_state_object(addr, 5).unwrap_err().is_dirty());

    // Reverting to the recording snapshot leaves the record in place.
    overlay.notify_reverted_to_snapshot(5);
    assert!(overlay.import_state_object(addr, 5).unwrap_err().is_dirty());

    // Reverting below it un-dirties; the import serves the same values.
    overlay.notify_reverted_to_snapshot(4);
    let again = overlay.import_state_object(addr, 5).unwrap();
    assert_eq!(again, first);

    // The dirty refusals never consulted the backend.
    assert_eq!(backend.account_reads.load(Ordering::Relaxed), 2);
}

/// Two writers of one slot: the earliest snapshot rules.
#[test]
fn two_writer_slot_earliest_snap_rule() {
    ferret_common::logging::ensure_test_logging(None);

    let addr = address!("00000000000000000000000000000000000000c0");
    let slot = B256::with_last_byte(0xab);
    let backend = Arc::new(
        CountingBackend::default().with_slot(addr, slot, B256::with_last_byte(0x2a)),
    );
    let mut overlay = ForkOverlay::new(backend.clone());

    overlay.mark_slot_written(addr, slot, 3);
    overlay.mark_slot_written(addr, slot, 4);

    // The slot was first written at snapshot 3: reverting to 3 keeps it
    // dirty even though it was also written at 4.
    overlay.notify_reverted_to_snapshot(3);
    assert!(overlay.import_storage_at(addr, slot, 5).unwrap_err().is_dirty());
    assert_eq!(backend.slot_reads.load(Ordering::Relaxed), 0);

    overlay.notify_reverted_to_snapshot(2);
    assert_eq!(overlay.import_storage_at(addr, slot, 5).unwrap(), B256::with_last_byte(0x2a));
    assert_eq!(backend.slot_reads.load(Ordering::Relaxed), 1);
}

/// A deployment recorded at a snapshot blocks storage imports until the
/// chain reverts below that snapshot.
#[test]
fn deployment_blocks_remote_storage_reads() {
    ferret_common::logging::ensure_test_logging(None);

    let addr = address!("00000000000000000000000000000000000000cc");
    let slot = B256::with_last_byte(0x01);
    let backend =
        Arc::new(CountingBackend::default().with_slot(addr, slot, B256::with_last_byte(0x07)));
    let mut overlay = ForkOverlay::new(backend.clone());

    overlay.mark_contract_deployed(addr, 6);
    for snap in [6u64, 7, 9] {
        assert!(overlay.import_storage_at(addr, slot, snap).unwrap_err().is_dirty());
    }
    assert_eq!(backend.slot_reads.load(Ordering::Relaxed), 0);

    overlay.notify_reverted_to_snapshot(5);
    assert_eq!(overlay.import_storage_at(addr, slot, 6).unwrap(), B256::with_last_byte(0x07));
}

/// Backend failures propagate with the dirty flag unset.
#[test]
fn backend_failure_is_not_a_dirty_refusal() {
    struct FailingBackend;
    impl StateBackend for FailingBackend {
        fn state_object(&self, _addr: Address) -> Result<StateObject, BackendError> {
            Err(BackendError::Transport("connection refused".into()))
        }
        fn storage_at(&self, _addr: Address, _slot: B256) -> Result<B256, BackendError> {
            Err(BackendError::Transport("connection refused".into()))
        }
    }

    let mut overlay = ForkOverlay::new(FailingBackend);
    let addr = address!("00000000000000000000000000000000000000ff");

    let err = overlay.import_state_object(addr, 1).unwrap_err();
    assert!(!err.is_dirty());

    // The failed import recorded nothing: a later attempt hits the
    // backend again rather than reporting dirty state.
    let err = overlay.import_state_object(addr, 1).unwrap_err();
    assert!(!err.is_dirty());
}
