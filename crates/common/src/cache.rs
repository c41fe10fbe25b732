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

//! Cache path utilities.
//!
//! The on-disk fork cache is keyed by `(endpoint, block height)`:
//! `<workdir>/cache/<keccak(endpoint)>/<height>/`. Account and storage
//! entries live in `accounts/` and `storage/` below that.

use alloy_primitives::{keccak256, Address, B256};
use std::path::{Path, PathBuf};

/// Trait for cache path layouts rooted at a working directory.
pub trait CachePath {
    /// Returns the cache root: `<workdir>/cache`.
    fn cache_dir(&self) -> PathBuf;

    /// Returns the cache dir for one `(endpoint, height)` pair:
    /// `<cache_root>/<keccak(endpoint)>/<height>`.
    fn fork_cache_dir(&self, endpoint: &str, height: u64) -> PathBuf {
        let endpoint_hash = hex::encode(keccak256(endpoint.as_bytes()));
        self.cache_dir().join(endpoint_hash).join(height.to_string())
    }
}

/// Cache path layout for ferret, rooted at an explicit working directory.
#[derive(Debug, Clone)]
pub struct FerretCachePath {
    workdir: PathBuf,
}

impl FerretCachePath {
    /// New cache path rooted at `workdir`.
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self { workdir: workdir.into() }
    }
}

impl CachePath for FerretCachePath {
    fn cache_dir(&self) -> PathBuf {
        self.workdir.join("cache")
    }
}

/// File name of a cached account entry below `accounts/`.
pub fn account_file_name(addr: &Address) -> String {
    hex::encode(addr.as_slice())
}

/// Directory / file names of a cached storage entry below `storage/`.
pub fn storage_file_name(addr: &Address, slot: &B256) -> (String, String) {
    (hex::encode(addr.as_slice()), hex::encode(slot.as_slice()))
}

/// Path of the `accounts` subtree of a fork cache dir.
pub fn accounts_dir(fork_cache_dir: &Path) -> PathBuf {
    fork_cache_dir.join("accounts")
}

/// Path of the `storage` subtree of a fork cache dir.
pub fn storage_dir(fork_cache_dir: &Path) -> PathBuf {
    fork_cache_dir.join("storage")
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;

    #[test]
    fn test_fork_cache_dir_is_keyed_by_endpoint_and_height() {
        let paths = FerretCachePath::new("/tmp/ferret-test");

        let a = paths.fork_cache_dir("https://rpc-one.example", 1_000_000);
        let b = paths.fork_cache_dir("https://rpc-two.example", 1_000_000);
        let c = paths.fork_cache_dir("https://rpc-one.example", 2_000_000);

        assert_ne!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("/tmp/ferret-test/cache"));
        assert!(a.ends_with("1000000"));
    }

    #[test]
    fn test_entry_file_names_are_hex() {
        let addr = address!("00000000000000000000000000000000000000aa");
        assert_eq!(account_file_name(&addr), format!("{:0>40}", "aa"));

        let (dir, file) = storage_file_name(&addr, &B256::with_last_byte(0x01));
        assert_eq!(dir, account_file_name(&addr));
        assert_eq!(file.len(), 64);
        assert!(file.ends_with("01"));
    }
}
