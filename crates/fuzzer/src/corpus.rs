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

//! The corpus: interesting call sequences retained for mutation.
//!
//! Entries live in memory behind short locks and, when a directory is
//! configured, as one JSON file per entry named by the sequence's content
//! hash. Load-time decode failures skip the entry; save failures are
//! logged and never fail the campaign.

use crate::{
    contracts::{resolve_method, ContractDefinition},
    sequence::CallSequence,
};
use alloy_primitives::B256;
use parking_lot::RwLock;
use rand::Rng;
use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Corpus failures.
#[derive(Debug, Error)]
pub enum CorpusError {
    /// Filesystem access failed.
    #[error("corpus I/O failure: {0}")]
    Io(#[from] std::io::Error),
    /// An entry could not be decoded.
    #[error("failed to decode corpus entry {path}: {source}")]
    Decode {
        /// Path of the offending entry.
        path: PathBuf,
        /// The decode failure.
        source: serde_json::Error,
    },
}

/// Report of a corpus clean pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorpusCleanReport {
    /// Entries that decoded and resolved.
    pub valid: usize,
    /// Entries that failed to decode or resolve.
    pub invalid: usize,
    /// Total entries examined.
    pub total: usize,
}

/// Thread-safe corpus of call sequences.
pub struct Corpus {
    directory: Option<PathBuf>,
    entries: RwLock<Vec<Arc<CallSequence>>>,
    hashes: RwLock<HashSet<B256>>,
}

impl Corpus {
    /// In-memory corpus without persistence.
    pub fn ephemeral() -> Self {
        Self {
            directory: None,
            entries: RwLock::new(Vec::new()),
            hashes: RwLock::new(HashSet::new()),
        }
    }

    /// Corpus persisted under `directory`, loading every decodable entry.
    /// Undecodable entries are skipped and reported.
    pub fn open(directory: impl Into<PathBuf>) -> Result<Self, CorpusError> {
        let directory = directory.into();
        fs::create_dir_all(&directory)?;

        let corpus = Self {
            directory: Some(directory.clone()),
            entries: RwLock::new(Vec::new()),
            hashes: RwLock::new(HashSet::new()),
        };

        let mut loaded = 0usize;
        let mut skipped = 0usize;
        for path in Self::entry_paths(&directory)? {
            match Self::read_entry(&path) {
                Ok(sequence) => {
                    corpus.insert(sequence);
                    loaded += 1;
                }
                Err(err) => {
                    warn!(%err, "Skipping unreadable corpus entry");
                    skipped += 1;
                }
            }
        }
        if loaded + skipped > 0 {
            info!(loaded, skipped, dir = %directory.display(), "Loaded corpus");
        }
        Ok(corpus)
    }

    /// Number of retained sequences.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the corpus holds no sequences.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Add a sequence (results stripped). Returns whether it was new; a
    /// failed disk write is logged but does not fail the add.
    pub fn add(&self, sequence: &CallSequence) -> bool {
        if sequence.is_empty() {
            return false;
        }
        let sequence = sequence.without_results();
        let hash = sequence.hash();
        if !self.hashes.write().insert(hash) {
            return false;
        }

        if let Some(directory) = &self.directory {
            let path = directory.join(format!("{}.json", hex::encode(hash)));
            match serde_json::to_vec_pretty(&sequence) {
                Ok(bytes) => {
                    if let Err(err) = fs::write(&path, bytes) {
                        warn!(%err, path = %path.display(), "Failed to persist corpus entry");
                    }
                }
                Err(err) => warn!(%err, "Failed to serialize corpus entry"),
            }
        }

        debug!(%hash, "New corpus entry");
        self.entries.write().push(Arc::new(sequence));
        true
    }

    /// A uniformly random entry, if any.
    pub fn random(&self, rng: &mut impl Rng) -> Option<Arc<CallSequence>> {
        let entries = self.entries.read();
        if entries.is_empty() {
            return None;
        }
        let index = rng.random_range(0..entries.len());
        Some(entries[index].clone())
    }

    /// Validate every on-disk entry against the given contract
    /// definitions, deleting invalid entries unless `dry_run`.
    ///
    /// An entry is valid when it decodes and every tagged call resolves
    /// to a known method.
    pub fn clean(
        &self,
        contracts: &[Arc<ContractDefinition>],
        dry_run: bool,
    ) -> Result<CorpusCleanReport, CorpusError> {
        let Some(directory) = &self.directory else {
            return Ok(CorpusCleanReport { valid: 0, invalid: 0, total: 0 });
        };

        let mut report = CorpusCleanReport { valid: 0, invalid: 0, total: 0 };
        for path in Self::entry_paths(directory)? {
            report.total += 1;
            let valid = match Self::read_entry(&path) {
                Ok(sequence) => sequence.elements.iter().all(|element| {
                    element.call.data.as_abi().is_none_or(|abi| {
                        resolve_method(
                            contracts,
                            element.contract.as_deref(),
                            &abi.method_signature,
                        )
                        .is_some()
                    })
                }),
                Err(err) => {
                    debug!(%err, "Corpus entry failed to decode");
                    false
                }
            };

            if valid {
                report.valid += 1;
            } else {
                report.invalid += 1;
                if !dry_run {
                    if let Err(err) = fs::remove_file(&path) {
                        warn!(%err, path = %path.display(), "Failed to delete invalid corpus entry");
                    }
                }
            }
        }

        info!(
            valid = report.valid,
            invalid = report.invalid,
            total = report.total,
            dry_run,
            "Corpus clean finished"
        );
        Ok(report)
    }

    fn insert(&self, sequence: CallSequence) {
        let hash = sequence.hash();
        if self.hashes.write().insert(hash) {
            self.entries.write().push(Arc::new(sequence));
        }
    }

    fn entry_paths(directory: &Path) -> Result<Vec<PathBuf>, CorpusError> {
        let mut paths: Vec<PathBuf> = fs::read_dir(directory)?
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();
        Ok(paths)
    }

    fn read_entry(path: &Path) -> Result<CallSequence, CorpusError> {
        let bytes = fs::read(path)?;
        serde_json::from_slice(&bytes)
            .map_err(|source| CorpusError::Decode { path: path.to_path_buf(), source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        abi::{AbiType, AbiValue},
        calls::{CallData, CallMessage},
        contracts::MethodDefinition,
        sequence::CallSequenceElement,
    };
    use alloy_primitives::{address, Bytes, U256};
    use rand::{rngs::StdRng, SeedableRng};
    use tempfile::TempDir;

    fn sample_sequence(nonce: u64) -> CallSequence {
        let mut call = CallMessage::call(
            address!("0000000000000000000000000000000000010000"),
            address!("00000000000000000000000000000000000000aa"),
            CallData::abi("poke(uint256)", vec![AbiValue::Uint(U256::from(nonce))]),
            100_000,
        );
        call.nonce = nonce;
        CallSequence::new(vec![CallSequenceElement::new(Some("Target".into()), call, 0, 0)])
    }

    fn target_definition() -> Arc<ContractDefinition> {
        Arc::new(ContractDefinition::new(
            "Target",
            Bytes::from_static(&[0x60]),
            vec![MethodDefinition::new("poke", vec![AbiType::Uint])],
        ))
    }

    #[test]
    fn test_add_deduplicates_by_content_hash() {
        let corpus = Corpus::ephemeral();
        assert!(corpus.add(&sample_sequence(1)));
        assert!(!corpus.add(&sample_sequence(1)));
        assert!(corpus.add(&sample_sequence(2)));
        assert_eq!(corpus.len(), 2);
    }

    #[test]
    fn test_round_trip_through_directory() {
        ferret_common::logging::ensure_test_logging(None);

        let tmp = TempDir::new().unwrap();
        {
            let corpus = Corpus::open(tmp.path()).unwrap();
            assert!(corpus.add(&sample_sequence(1)));
            assert!(corpus.add(&sample_sequence(2)));
        }

        let reloaded = Corpus::open(tmp.path()).unwrap();
        assert_eq!(reloaded.len(), 2);

        let mut rng = StdRng::seed_from_u64(7);
        assert!(reloaded.random(&mut rng).is_some());
    }

    #[test]
    fn test_unreadable_entries_are_skipped_at_load() {
        ferret_common::logging::ensure_test_logging(None);

        let tmp = TempDir::new().unwrap();
        {
            let corpus = Corpus::open(tmp.path()).unwrap();
            corpus.add(&sample_sequence(1));
        }
        fs::write(tmp.path().join("garbage.json"), b"{not json").unwrap();

        let reloaded = Corpus::open(tmp.path()).unwrap();
        assert_eq!(reloaded.len(), 1);
    }

    #[test]
    fn test_clean_reports_and_deletes_invalid_entries() {
        ferret_common::logging::ensure_test_logging(None);

        let tmp = TempDir::new().unwrap();
        let corpus = Corpus::open(tmp.path()).unwrap();
        corpus.add(&sample_sequence(1));

        // One undecodable file and one sequence calling an unknown method.
        fs::write(tmp.path().join("broken.json"), b"]").unwrap();
        let mut unknown = sample_sequence(2);
        unknown.elements[0].call.data = CallData::abi("vanished(uint256)", vec![]);
        fs::write(
            tmp.path().join("unknown.json"),
            serde_json::to_vec(&unknown).unwrap(),
        )
        .unwrap();

        let contracts = vec![target_definition()];

        let dry = corpus.clean(&contracts, true).unwrap();
        assert_eq!(dry, CorpusCleanReport { valid: 1, invalid: 2, total: 3 });
        // Dry run deleted nothing.
        assert_eq!(Corpus::entry_paths(tmp.path()).unwrap().len(), 3);

        let wet = corpus.clean(&contracts, false).unwrap();
        assert_eq!(wet, CorpusCleanReport { valid: 1, invalid: 2, total: 3 });
        assert_eq!(Corpus::entry_paths(tmp.path()).unwrap().len(), 1);
    }

    #[test]
    fn test_legacy_name_resolution_keeps_entry_valid() {
        ferret_common::logging::ensure_test_logging(None);

        let tmp = TempDir::new().unwrap();
        let corpus = Corpus::open(tmp.path()).unwrap();

        // Signature with stale parameter types still resolves by name.
        let mut legacy = sample_sequence(1);
        legacy.elements[0].call.data = CallData::abi("poke(address)", vec![]);
        corpus.add(&legacy);

        let report = corpus.clean(&[target_definition()], true).unwrap();
        assert_eq!(report.invalid, 0);
    }
}
