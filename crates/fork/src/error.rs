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

//! Error types of the fork layer.

use alloy_primitives::{Address, B256};
use revm::database_interface::DBErrorMarker;
use std::fmt;
use thiserror::Error;

/// Failure of the remote backend.
///
/// Every variant is cloneable so that deduplicated requests can hand the
/// same error to every waiter.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    /// The HTTP request itself failed (connection, timeout, non-success
    /// status). Retried by the dispatcher.
    #[error("transport failure talking to the remote endpoint: {0}")]
    Transport(String),
    /// The response body could not be decoded. Retried by the dispatcher.
    #[error("failed to decode remote response: {0}")]
    Decode(String),
    /// The endpoint answered with a JSON-RPC error object. Terminal.
    #[error("remote endpoint returned an error: {0}")]
    Rpc(String),
    /// The request was cancelled before completion.
    #[error("request cancelled")]
    Cancelled,
}

impl BackendError {
    /// Whether the dispatcher should retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Decode(_))
    }
}

/// Failure to import an account object from the remote source.
#[derive(Debug, Clone, Error)]
pub enum RemoteStateError {
    /// The account has been imported or locally modified already; serving
    /// the remote value again would overwrite local progress. The EVM must
    /// fall back to its local view.
    #[error("account {0} is dirty and cannot be re-queried from the remote source")]
    CannotQueryDirtyAccount(Address),
    /// The backend failed to produce the account object.
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl RemoteStateError {
    /// Whether this is the dirty-account refusal rather than a backend
    /// failure.
    pub fn is_dirty(&self) -> bool {
        matches!(self, Self::CannotQueryDirtyAccount(_))
    }
}

/// Failure to import a storage slot from the remote source.
#[derive(Debug, Clone, Error)]
pub enum RemoteStorageError {
    /// The slot has been imported or written already, or belongs to a
    /// locally deployed contract the remote chain cannot know about.
    #[error("slot {slot} of account {address} is dirty and cannot be re-queried from the remote source")]
    CannotQueryDirtySlot {
        /// Account owning the slot.
        address: Address,
        /// The refused slot key.
        slot: B256,
    },
    /// The backend failed to produce the slot value.
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl RemoteStorageError {
    /// Whether this is the dirty-slot refusal rather than a backend
    /// failure.
    pub fn is_dirty(&self) -> bool {
        matches!(self, Self::CannotQueryDirtySlot { .. })
    }
}

/// A cloneable error type for the revm database bridge.
#[derive(Clone, Debug)]
pub struct ForkDbError {
    message: String,
}

impl ForkDbError {
    /// Create a new error with a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }

    /// Create from any error type.
    pub fn from_error<E: std::error::Error>(err: E) -> Self {
        Self::new(err.to_string())
    }
}

impl fmt::Display for ForkDbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "forked state error: {}", self.message)
    }
}

impl std::error::Error for ForkDbError {}

impl DBErrorMarker for ForkDbError {}
