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

//! Forked state for ferret test chains.
//!
//! When a fuzzing campaign runs against a fork, account and storage reads
//! that miss locally are materialized lazily from a remote JSON-RPC source
//! pinned at a block height. This crate provides the pieces of that path,
//! leaves first:
//!
//! - [`cache`]: thread-safe in-memory and on-disk caches for account
//!   objects and storage slots, keyed on disk by `(endpoint, height)`.
//! - [`backend`]: the deduplicating, retrying, connection-pooled RPC
//!   client fronting the caches, plus the empty backend for unforked runs.
//! - [`overlay`]: snapshot-aware dirty-state bookkeeping that decides when
//!   a remote read is still allowed.
//! - [`state`]: the journaled account/storage store a test chain executes
//!   against, with snapshot/revert support.
//! - [`db`]: the `revm` database bridge over [`state::ForkedState`].

pub mod backend;
pub mod cache;
pub mod db;
pub mod error;
pub mod overlay;
pub mod state;

pub use backend::*;
pub use cache::*;
pub use db::*;
pub use error::*;
pub use overlay::*;
pub use state::*;
