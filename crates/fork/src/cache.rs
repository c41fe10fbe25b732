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

//! State caches for remote reads.
//!
//! Two independent caches behind one trait: account objects and storage
//! slots. The in-memory variant is a pair of read-write-locked maps; the
//! persistent variant adds a read-through disk tree whose writes are
//! flushed off the hot path by a background thread.

use alloy_primitives::{Address, Bytes, B256, U256};
use ferret_common::cache::{account_file_name, accounts_dir, storage_dir, storage_file_name};
use parking_lot::RwLock;
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::mpsc,
    thread,
};
use tracing::{debug, trace, warn};

/// An account object as served by the remote source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateObject {
    /// Account balance in wei.
    pub balance: U256,
    /// Account nonce.
    pub nonce: u64,
    /// Deployed byte code, empty for EOAs.
    pub code: Bytes,
}

impl StateObject {
    /// Whether balance, nonce and code are all zero.
    pub fn is_empty(&self) -> bool {
        self.balance.is_zero() && self.nonce == 0 && self.code.is_empty()
    }

    /// Serialize into the on-disk entry format: 32-byte big-endian
    /// balance, 8-byte little-endian nonce, 4-byte little-endian code
    /// length, code bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 + 8 + 4 + self.code.len());
        out.extend_from_slice(&self.balance.to_be_bytes::<32>());
        out.extend_from_slice(&self.nonce.to_le_bytes());
        out.extend_from_slice(&(self.code.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.code);
        out
    }

    /// Decode an on-disk entry. Returns `None` for truncated or otherwise
    /// malformed input.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 44 {
            return None;
        }
        let balance = U256::from_be_bytes::<32>(bytes[..32].try_into().ok()?);
        let nonce = u64::from_le_bytes(bytes[32..40].try_into().ok()?);
        let code_len = u32::from_le_bytes(bytes[40..44].try_into().ok()?) as usize;
        if bytes.len() != 44 + code_len {
            return None;
        }
        let code = Bytes::copy_from_slice(&bytes[44..]);
        Some(Self { balance, nonce, code })
    }
}

/// The two state caches behind a single interface.
///
/// Readers may proceed in parallel; writers exclude all. A `get` never
/// observes a torn value: entries are handed out by whole-value clone
/// under the read lock.
#[auto_impl::auto_impl(&, Arc)]
pub trait StateCache: Send + Sync {
    /// Cached account object, or `None` on miss.
    fn account(&self, addr: &Address) -> Option<StateObject>;

    /// Unconditionally cache an account object.
    fn put_account(&self, addr: Address, obj: StateObject);

    /// Cached slot value; a miss is reported when either the address or
    /// the slot key is absent.
    fn slot(&self, addr: &Address, key: &B256) -> Option<B256>;

    /// Cache a slot value, lazily creating the per-account map.
    fn put_slot(&self, addr: Address, key: B256, value: B256);
}

/// In-memory only state cache.
#[derive(Default)]
pub struct MemoryStateCache {
    accounts: RwLock<HashMap<Address, StateObject>>,
    slots: RwLock<HashMap<Address, HashMap<B256, B256>>>,
}

impl MemoryStateCache {
    /// New empty cache.
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateCache for MemoryStateCache {
    fn account(&self, addr: &Address) -> Option<StateObject> {
        self.accounts.read().get(addr).cloned()
    }

    fn put_account(&self, addr: Address, obj: StateObject) {
        self.accounts.write().insert(addr, obj);
    }

    fn slot(&self, addr: &Address, key: &B256) -> Option<B256> {
        self.slots.read().get(addr).and_then(|m| m.get(key)).copied()
    }

    fn put_slot(&self, addr: Address, key: B256, value: B256) {
        self.slots.write().entry(addr).or_default().insert(key, value);
    }
}

enum FlushItem {
    Account(Address, StateObject),
    Slot(Address, B256, B256),
}

/// State cache persisted under `<fork-cache-dir>/{accounts,storage}/`.
///
/// Reads are served from the in-memory front, which is populated from disk
/// at construction. Writes update memory synchronously and are flushed to
/// disk by a background thread; a flush failure is logged and never
/// surfaces to the caller.
pub struct PersistentStateCache {
    memory: MemoryStateCache,
    flusher: mpsc::Sender<FlushItem>,
}

impl PersistentStateCache {
    /// Open (or create) the cache tree rooted at `dir` and load every
    /// readable entry. Individually corrupt files are removed and treated
    /// as misses.
    pub fn open(dir: impl Into<PathBuf>) -> eyre::Result<Self> {
        let dir = dir.into();
        let accounts_path = accounts_dir(&dir);
        let storage_path = storage_dir(&dir);
        fs::create_dir_all(&accounts_path)?;
        fs::create_dir_all(&storage_path)?;

        let memory = MemoryStateCache::new();
        let (loaded_accounts, loaded_slots) = Self::populate(&memory, &accounts_path, &storage_path);
        if loaded_accounts + loaded_slots > 0 {
            debug!(
                accounts = loaded_accounts,
                slots = loaded_slots,
                dir = %dir.display(),
                "Loaded persisted fork cache"
            );
        }

        let (tx, rx) = mpsc::channel();
        let flush_dir = dir.clone();
        thread::Builder::new()
            .name("ferret-cache-flush".into())
            .spawn(move || Self::flush_loop(rx, flush_dir))?;

        Ok(Self { memory, flusher: tx })
    }

    fn populate(
        memory: &MemoryStateCache,
        accounts_path: &Path,
        storage_path: &Path,
    ) -> (usize, usize) {
        let mut accounts = 0usize;
        let mut slots = 0usize;

        if let Ok(entries) = fs::read_dir(accounts_path) {
            for entry in entries.flatten() {
                let path = entry.path();
                let Some(addr) = parse_address_file_name(&path) else {
                    remove_corrupt(&path);
                    continue;
                };
                let Some(obj) = fs::read(&path).ok().and_then(|b| StateObject::decode(&b)) else {
                    remove_corrupt(&path);
                    continue;
                };
                memory.put_account(addr, obj);
                accounts += 1;
            }
        }

        if let Ok(entries) = fs::read_dir(storage_path) {
            for account_dir in entries.flatten() {
                let Some(addr) = parse_address_file_name(&account_dir.path()) else {
                    continue;
                };
                let Ok(files) = fs::read_dir(account_dir.path()) else { continue };
                for file in files.flatten() {
                    let path = file.path();
                    let Some(key) = parse_slot_file_name(&path) else {
                        remove_corrupt(&path);
                        continue;
                    };
                    let Some(value) = fs::read(&path).ok().and_then(|b| parse_slot_value(&b))
                    else {
                        remove_corrupt(&path);
                        continue;
                    };
                    memory.put_slot(addr, key, value);
                    slots += 1;
                }
            }
        }

        (accounts, slots)
    }

    fn flush_loop(rx: mpsc::Receiver<FlushItem>, dir: PathBuf) {
        // Drain in batches so a burst of imports becomes one pass of file
        // writes rather than one wakeup per entry.
        while let Ok(first) = rx.recv() {
            let mut batch = vec![first];
            while let Ok(item) = rx.try_recv() {
                batch.push(item);
            }
            for item in batch {
                let result = match item {
                    FlushItem::Account(addr, obj) => {
                        let path = accounts_dir(&dir).join(account_file_name(&addr));
                        fs::write(path, obj.encode())
                    }
                    FlushItem::Slot(addr, key, value) => {
                        let (sub, file) = storage_file_name(&addr, &key);
                        let account_dir = storage_dir(&dir).join(sub);
                        fs::create_dir_all(&account_dir)
                            .and_then(|_| fs::write(account_dir.join(file), value.as_slice()))
                    }
                };
                if let Err(e) = result {
                    warn!("Failed to flush fork cache entry: {e}");
                }
            }
        }
        trace!("Fork cache flusher exiting");
    }
}

impl StateCache for PersistentStateCache {
    fn account(&self, addr: &Address) -> Option<StateObject> {
        self.memory.account(addr)
    }

    fn put_account(&self, addr: Address, obj: StateObject) {
        self.memory.put_account(addr, obj.clone());
        let _ = self.flusher.send(FlushItem::Account(addr, obj));
    }

    fn slot(&self, addr: &Address, key: &B256) -> Option<B256> {
        self.memory.slot(addr, key)
    }

    fn put_slot(&self, addr: Address, key: B256, value: B256) {
        self.memory.put_slot(addr, key, value);
        let _ = self.flusher.send(FlushItem::Slot(addr, key, value));
    }
}

fn parse_address_file_name(path: &Path) -> Option<Address> {
    let name = path.file_name()?.to_str()?;
    let raw = hex::decode(name).ok()?;
    (raw.len() == 20).then(|| Address::from_slice(&raw))
}

fn parse_slot_file_name(path: &Path) -> Option<B256> {
    let name = path.file_name()?.to_str()?;
    let raw = hex::decode(name).ok()?;
    (raw.len() == 32).then(|| B256::from_slice(&raw))
}

fn parse_slot_value(bytes: &[u8]) -> Option<B256> {
    (bytes.len() == 32).then(|| B256::from_slice(bytes))
}

fn remove_corrupt(path: &Path) {
    warn!("Removing corrupt fork cache file: {}", path.display());
    let _ = fs::remove_file(path);
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn obj(balance: u64, nonce: u64, code: &[u8]) -> StateObject {
        StateObject { balance: U256::from(balance), nonce, code: Bytes::copy_from_slice(code) }
    }

    #[test]
    fn test_account_codec_round_trip() {
        ferret_common::logging::ensure_test_logging(None);

        let original = obj(1_000_000, 7, &[0x60, 0x60, 0x60, 0x40]);
        let decoded = StateObject::decode(&original.encode()).unwrap();
        assert_eq!(decoded, original);

        let empty = StateObject::default();
        assert_eq!(StateObject::decode(&empty.encode()).unwrap(), empty);
        assert!(empty.is_empty());
    }

    #[test]
    fn test_account_codec_rejects_malformed_input() {
        assert!(StateObject::decode(&[]).is_none());
        assert!(StateObject::decode(&[0u8; 43]).is_none());

        // Length prefix claiming more code than present.
        let mut bytes = obj(1, 1, b"ab").encode();
        bytes.truncate(bytes.len() - 1);
        assert!(StateObject::decode(&bytes).is_none());
    }

    #[test]
    fn test_memory_cache_miss_semantics() {
        let cache = MemoryStateCache::new();
        let addr = address!("00000000000000000000000000000000000000aa");

        assert!(cache.account(&addr).is_none());
        assert!(cache.slot(&addr, &B256::with_last_byte(1)).is_none());

        cache.put_slot(addr, B256::with_last_byte(1), B256::with_last_byte(9));
        // Same address, different key is still a miss.
        assert!(cache.slot(&addr, &B256::with_last_byte(2)).is_none());
        assert_eq!(cache.slot(&addr, &B256::with_last_byte(1)), Some(B256::with_last_byte(9)));
    }

    #[test]
    fn test_memory_cache_concurrent_readers_and_writers() {
        ferret_common::logging::ensure_test_logging(None);

        let cache = Arc::new(MemoryStateCache::new());
        let working_set: Vec<Address> =
            (0u8..8).map(|i| Address::with_last_byte(i)).collect();

        let mut handles = Vec::new();
        for t in 0..4u64 {
            let cache = cache.clone();
            let addrs = working_set.clone();
            handles.push(thread::spawn(move || {
                for i in 0..2_000u64 {
                    let addr = addrs[(i % addrs.len() as u64) as usize];
                    cache.put_account(addr, obj(t * 10_000 + i, i, b"code"));
                    cache.put_slot(addr, B256::with_last_byte(i as u8), B256::with_last_byte(t as u8));
                }
            }));
        }
        for t in 0..4u64 {
            let cache = cache.clone();
            let addrs = working_set.clone();
            handles.push(thread::spawn(move || {
                for i in 0..2_000u64 {
                    let addr = addrs[((i + t) % addrs.len() as u64) as usize];
                    if let Some(read) = cache.account(&addr) {
                        // A whole-value read must never be torn: the code
                        // field is constant across all writers.
                        assert_eq!(read.code.as_ref(), b"code");
                    }
                    let _ = cache.slot(&addr, &B256::with_last_byte(i as u8));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_persistent_cache_round_trip() {
        ferret_common::logging::ensure_test_logging(None);

        let tmp = TempDir::new().unwrap();
        let addr = address!("00000000000000000000000000000000000000cc");
        let account = obj(42, 3, &[0xfe]);

        {
            let cache = PersistentStateCache::open(tmp.path()).unwrap();
            cache.put_account(addr, account.clone());
            cache.put_slot(addr, B256::with_last_byte(5), B256::with_last_byte(7));
            // Cache drops here; the flusher drains the channel before the
            // thread exits, but give it a moment to write.
        }
        std::thread::sleep(std::time::Duration::from_millis(200));

        let reopened = PersistentStateCache::open(tmp.path()).unwrap();
        assert_eq!(reopened.account(&addr), Some(account));
        assert_eq!(reopened.slot(&addr, &B256::with_last_byte(5)), Some(B256::with_last_byte(7)));
    }

    #[test]
    fn test_persistent_cache_corrupt_file_is_a_miss() {
        ferret_common::logging::ensure_test_logging(None);

        let tmp = TempDir::new().unwrap();
        let addr = address!("00000000000000000000000000000000000000dd");

        {
            let cache = PersistentStateCache::open(tmp.path()).unwrap();
            cache.put_account(addr, obj(1, 1, b""));
        }
        std::thread::sleep(std::time::Duration::from_millis(200));

        // Truncate the entry on disk.
        let file = accounts_dir(tmp.path()).join(account_file_name(&addr));
        fs::write(&file, [0u8; 3]).unwrap();

        let reopened = PersistentStateCache::open(tmp.path()).unwrap();
        assert!(reopened.account(&addr).is_none());
        // The corrupt file was deleted during load.
        assert!(!file.exists());
    }
}
