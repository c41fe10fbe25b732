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

//! revm database bridge over [`ForkedState`].
//!
//! Lets a revm-based EVM mount the forked state directly: cold account and
//! storage reads flow through the overlay and the remote backend, local
//! state is served as-is.
//!
//! Only the by-value [`Database`] trait is implemented. Reads may
//! materialize state through the overlay, so the shared-reference
//! `DatabaseRef` contract cannot be honored without interior mutability
//! the owning worker does not need.

use crate::{backend::StateBackend, error::ForkDbError, state::ForkedState};
use alloy_primitives::{keccak256, Address, B256, U256};
use revm::{
    primitives::KECCAK_EMPTY,
    state::{AccountInfo, Bytecode},
    Database,
};

impl<B: StateBackend> Database for ForkedState<B> {
    type Error = ForkDbError;

    fn basic(&mut self, address: Address) -> Result<Option<AccountInfo>, Self::Error> {
        self.get_balance(address).map_err(ForkDbError::from_error)?;
        Ok(self.account(&address).map(|entry| AccountInfo {
            balance: entry.balance,
            nonce: entry.nonce,
            code_hash: entry.code_hash,
            account_id: None,
            code: Some(Bytecode::new_raw(entry.code.clone())),
        }))
    }

    fn code_by_hash(&mut self, code_hash: B256) -> Result<Bytecode, Self::Error> {
        if code_hash == KECCAK_EMPTY {
            return Ok(Bytecode::default());
        }
        ForkedState::code_by_hash(self, &code_hash)
            .map(Bytecode::new_raw)
            .ok_or_else(|| ForkDbError::new(format!("unknown code hash {code_hash}")))
    }

    fn storage(&mut self, address: Address, index: U256) -> Result<U256, Self::Error> {
        let slot = B256::from(index);
        let value = self.get_storage(address, slot).map_err(ForkDbError::from_error)?;
        Ok(U256::from_be_bytes(value.0))
    }

    fn block_hash(&mut self, number: u64) -> Result<B256, Self::Error> {
        // The test chain keeps no real header history; derive a stable
        // pseudo-hash the way revm's EmptyDB does.
        Ok(keccak256(number.to_be_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::EmptyBackend;
    use alloy_primitives::{address, Bytes};

    #[test]
    fn test_basic_reflects_local_state() {
        let mut state = ForkedState::new(EmptyBackend);
        let addr = address!("0000000000000000000000000000000000000077");

        assert!(state.basic(addr).unwrap().is_none());

        state.set_balance(addr, U256::from(9)).unwrap();
        state.set_code(addr, Bytes::from_static(&[0x60, 0x00])).unwrap();

        let info = state.basic(addr).unwrap().unwrap();
        assert_eq!(info.balance, U256::from(9));
        assert_eq!(info.code_hash, keccak256([0x60, 0x00]));

        let code = Database::code_by_hash(&mut state, info.code_hash).unwrap();
        assert_eq!(code.original_byte_slice(), &[0x60, 0x00]);
    }

    #[test]
    fn test_storage_round_trips_through_words() {
        let mut state = ForkedState::new(EmptyBackend);
        let addr = address!("0000000000000000000000000000000000000078");

        state.set_storage(addr, B256::from(U256::from(3)), B256::from(U256::from(77))).unwrap();
        assert_eq!(Database::storage(&mut state, addr, U256::from(3)).unwrap(), U256::from(77));
        assert_eq!(Database::storage(&mut state, addr, U256::from(4)).unwrap(), U256::ZERO);
    }

    #[test]
    fn test_block_hash_is_stable() {
        let mut state = ForkedState::new(EmptyBackend);
        let first = state.block_hash(42).unwrap();
        let again = state.block_hash(42).unwrap();
        assert_eq!(first, again);
        assert_ne!(first, state.block_hash(43).unwrap());
    }
}
