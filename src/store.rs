// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Transactional key-value view over consensus state.
//!
//! The store is the single mutation surface of the core. Keys are built so
//! lexicographic order equals numeric order (big-endian integer segments),
//! and prefix scans return entries in ascending key order, which is what the
//! deterministic-iteration rules rely on. Values are DAG-CBOR encoded; the
//! encoding doubles as the hashing-visible canonical form.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend: {0}")]
    Backend(String),
    #[error("encoding object for key space {key_space}: {reason}")]
    Encode { key_space: &'static str, reason: String },
    #[error("decoding object for key space {key_space}: {reason}")]
    Decode { key_space: &'static str, reason: String },
}

/// Owned view of the consensus store handed to each component.
pub trait StateStore {
    fn read(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;
    fn write(&mut self, key: &[u8], value: Vec<u8>) -> Result<(), StoreError>;
    fn delete(&mut self, key: &[u8]) -> Result<(), StoreError>;
    fn exists(&self, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.read(key)?.is_some())
    }
    /// All entries under `prefix`, ascending by key.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError>;
}

/// In-memory store over an ordered map. The ordered map is load-bearing:
/// prefix scans must come back sorted.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl StateStore for MemoryStore {
    fn read(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.entries.get(key).cloned())
    }

    fn write(&mut self, key: &[u8], value: Vec<u8>) -> Result<(), StoreError> {
        self.entries.insert(key.to_vec(), value);
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        Ok(self
            .entries
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

pub fn get_obj<T: DeserializeOwned>(
    store: &dyn StateStore,
    key: &[u8],
    key_space: &'static str,
) -> Result<Option<T>, StoreError> {
    match store.read(key)? {
        Some(bytes) => {
            let value =
                serde_ipld_dagcbor::from_slice(&bytes).map_err(|e| StoreError::Decode {
                    key_space,
                    reason: e.to_string(),
                })?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

pub fn put_obj<T: Serialize>(
    store: &mut dyn StateStore,
    key: &[u8],
    value: &T,
    key_space: &'static str,
) -> Result<(), StoreError> {
    let bytes = serde_ipld_dagcbor::to_vec(value).map_err(|e| StoreError::Encode {
        key_space,
        reason: e.to_string(),
    })?;
    store.write(key, bytes)
}

/// Key builders for every persisted entity. Integer segments are big-endian
/// so lexicographic key order matches numeric order.
pub mod keys {
    use crate::types::Address;

    fn keyed(prefix: &[u8], id: u64) -> Vec<u8> {
        let mut key = prefix.to_vec();
        key.push(b'/');
        key.extend_from_slice(&id.to_be_bytes());
        key
    }

    fn with_segment(mut key: Vec<u8>, segment: &[u8]) -> Vec<u8> {
        key.push(b'/');
        key.extend_from_slice(segment);
        key
    }

    pub fn epoch_bls(epoch_id: u64) -> Vec<u8> {
        keyed(b"bls", epoch_id)
    }

    pub fn group_validation(new_epoch_id: u64) -> Vec<u8> {
        keyed(b"groupval", new_epoch_id)
    }

    pub fn active_participants(epoch_id: u64) -> Vec<u8> {
        keyed(b"active", epoch_id)
    }

    pub fn epoch_group(epoch_id: u64, model_id: &str) -> Vec<u8> {
        with_segment(keyed(b"group", epoch_id), model_id.as_bytes())
    }

    pub fn store_commit(poc_start: u64, participant: &Address) -> Vec<u8> {
        with_segment(keyed(b"commit", poc_start), participant.as_bytes())
    }

    pub fn store_commit_prefix(poc_start: u64) -> Vec<u8> {
        let mut key = keyed(b"commit", poc_start);
        key.push(b'/');
        key
    }

    pub fn weight_distribution(poc_start: u64, participant: &Address) -> Vec<u8> {
        with_segment(keyed(b"dist", poc_start), participant.as_bytes())
    }

    pub fn weight_distribution_prefix(poc_start: u64) -> Vec<u8> {
        let mut key = keyed(b"dist", poc_start);
        key.push(b'/');
        key
    }

    pub fn validation(poc_start: u64, validator: &Address, target: &Address) -> Vec<u8> {
        with_segment(
            with_segment(keyed(b"val", poc_start), validator.as_bytes()),
            target.as_bytes(),
        )
    }

    pub fn validation_prefix(poc_start: u64) -> Vec<u8> {
        let mut key = keyed(b"val", poc_start);
        key.push(b'/');
        key
    }

    pub fn seed(epoch_id: u64, participant: &Address) -> Vec<u8> {
        with_segment(keyed(b"seed", epoch_id), participant.as_bytes())
    }

    pub fn seed_prefix(epoch_id: u64) -> Vec<u8> {
        let mut key = keyed(b"seed", epoch_id);
        key.push(b'/');
        key
    }
}
