//! Clear-text Store
//!
//! Maps every handle the mock coprocessor has produced to its cleartext value and
//! arithmetic flags. Entries are write-once: a second write with a different payload
//! is a consistency violation, except for randomized handles which may be replaced.
//!
//! The store can be backed by a JSON snapshot so that cleartexts survive across test
//! runs sharing the same chain state.

use alloy_primitives::{Address, B256, U256, Uint};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use crate::handle::{FheType, Handle};

/// Cleartext value wide enough for the largest value type (2048 bits).
pub type ClearValue = Uint<2048, 32>;

/// Widens a 256-bit word into a [`ClearValue`].
pub fn widen(word: U256) -> ClearValue {
    ClearValue::from_be_slice(&word.to_be_bytes::<32>())
}

/// Truncates a [`ClearValue`] to its low 256 bits.
pub fn narrow(value: &ClearValue) -> U256 {
    let bytes = value.to_be_bytes_vec();
    U256::from_be_slice(&bytes[bytes.len() - 32..])
}

/// Flags recorded alongside a cleartext.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearTextFlags {
    /// A division or remainder had a zero divisor.
    pub division_by_zero: bool,
    /// The exact result did not fit the value type.
    pub overflow: bool,
    /// A subtraction went below zero.
    pub underflow: bool,
    /// The value was trivially encrypted from a public plaintext.
    pub trivial: bool,
}

impl ClearTextFlags {
    /// Flags of a trivially encrypted value.
    pub const TRIVIAL: Self =
        Self { division_by_zero: false, overflow: false, underflow: false, trivial: true };
}

/// A cleartext value and its flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearTextEntry {
    /// The declared value type.
    pub value_type: FheType,
    /// The cleartext, always below `2^bit_width`.
    pub value: ClearValue,
    /// Arithmetic flags.
    #[serde(flatten)]
    pub flags: ClearTextFlags,
}

impl ClearTextEntry {
    /// Creates an entry with no flags set.
    pub fn new(value_type: FheType, value: ClearValue) -> Self {
        Self { value_type, value, flags: ClearTextFlags::default() }
    }

    /// Sets the flags of this entry.
    pub const fn with_flags(mut self, flags: ClearTextFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Interprets the value as a boolean.
    pub fn as_bool(&self) -> bool {
        !self.value.is_zero()
    }

    /// Returns the low 256 bits of the value.
    pub fn as_u256(&self) -> U256 {
        narrow(&self.value)
    }

    /// Interprets the low 160 bits of the value as an address.
    pub fn as_address(&self) -> Address {
        Address::from_word(B256::from(self.as_u256().to_be_bytes::<32>()))
    }

    /// Returns the value as big-endian bytes sized for the value type.
    pub fn as_bytes(&self) -> Vec<u8> {
        let bytes = self.value.to_be_bytes_vec();
        bytes[bytes.len() - self.value_type.byte_size()..].to_vec()
    }
}

/// Errors that can occur during store operations.
#[derive(Debug, Display, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The handle has not been produced by the coprocessor yet.
    #[display("cleartext of handle {_0} has not been computed")]
    NotComputed(Handle),

    /// A handle was written twice with different payloads.
    #[display("conflicting cleartext for handle {_0}")]
    Consistency(Handle),

    /// Reading or writing the snapshot failed.
    #[display("cleartext snapshot error: {_0}")]
    Snapshot(String),
}

impl std::error::Error for StoreError {}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotRecord {
    handle: Handle,
    #[serde(flatten)]
    entry: ClearTextEntry,
}

/// Handle → cleartext map, optionally persisted to a JSON snapshot.
#[derive(Debug, Default)]
pub struct ClearTextStore {
    entries: HashMap<Handle, ClearTextEntry>,
    path: Option<PathBuf>,
    dirty: bool,
}

impl ClearTextStore {
    /// Creates an empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a store persisted at `path`, loading the snapshot if it exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let entries = if path.exists() { Self::load(&path)? } else { HashMap::new() };
        Ok(Self { entries, path: Some(path), dirty: false })
    }

    fn load(path: &Path) -> Result<HashMap<Handle, ClearTextEntry>, StoreError> {
        let data = fs::read_to_string(path).map_err(|e| StoreError::Snapshot(e.to_string()))?;
        let records: Vec<SnapshotRecord> =
            serde_json::from_str(&data).map_err(|e| StoreError::Snapshot(e.to_string()))?;
        Ok(records.into_iter().map(|r| (r.handle, r.entry)).collect())
    }

    /// Writes the snapshot if the store is persisted and has unsaved writes.
    pub fn flush(&mut self) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if !self.dirty {
            return Ok(());
        }

        let mut records: Vec<SnapshotRecord> = self
            .entries
            .iter()
            .map(|(handle, entry)| SnapshotRecord { handle: *handle, entry: entry.clone() })
            .collect();
        records.sort_by_key(|r| r.handle);

        let data =
            serde_json::to_string_pretty(&records).map_err(|e| StoreError::Snapshot(e.to_string()))?;
        fs::write(path, data).map_err(|e| StoreError::Snapshot(e.to_string()))?;
        self.dirty = false;
        Ok(())
    }

    /// Stores the cleartext of `handle`.
    ///
    /// Returns `true` if the store changed. Rewriting an identical entry is a no-op;
    /// a different payload is only accepted when `allow_replace` is set.
    pub fn put(
        &mut self,
        handle: Handle,
        entry: ClearTextEntry,
        allow_replace: bool,
    ) -> Result<bool, StoreError> {
        match self.entries.get(&handle) {
            Some(existing) if *existing == entry => Ok(false),
            Some(_) if !allow_replace => Err(StoreError::Consistency(handle)),
            _ => {
                self.entries.insert(handle, entry);
                self.dirty = true;
                Ok(true)
            }
        }
    }

    /// Returns the entry of `handle`.
    pub fn get(&self, handle: &Handle) -> Result<&ClearTextEntry, StoreError> {
        self.entries.get(handle).ok_or(StoreError::NotComputed(*handle))
    }

    /// Returns the cleartext value of `handle`.
    pub fn value(&self, handle: &Handle) -> Result<ClearValue, StoreError> {
        self.get(handle).map(|e| e.value)
    }

    /// Returns true if `handle` has a cleartext.
    pub fn contains(&self, handle: &Handle) -> bool {
        self.entries.contains_key(handle)
    }

    /// Returns the number of stored cleartexts.
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing has been stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(n: u8) -> Handle {
        B256::repeat_byte(n)
    }

    fn entry(value: u64) -> ClearTextEntry {
        ClearTextEntry::new(FheType::Uint64, ClearValue::from(value))
    }

    #[test]
    fn test_new_store_is_empty() {
        let store = ClearTextStore::new();
        assert!(store.is_empty());
        assert_eq!(store.count(), 0);
    }

    #[test]
    fn test_get_missing_is_not_computed() {
        let store = ClearTextStore::new();
        assert_eq!(store.get(&handle(1)), Err(StoreError::NotComputed(handle(1))));
    }

    #[test]
    fn test_put_and_get() {
        let mut store = ClearTextStore::new();
        assert!(store.put(handle(1), entry(42), false).unwrap());
        assert_eq!(store.value(&handle(1)).unwrap(), ClearValue::from(42u64));
        assert_eq!(store.count(), 1);
    }

    #[test]
    fn test_identical_rewrite_is_noop() {
        let mut store = ClearTextStore::new();
        store.put(handle(1), entry(42), false).unwrap();
        assert!(!store.put(handle(1), entry(42), false).unwrap());
        assert_eq!(store.count(), 1);
    }

    #[test]
    fn test_conflicting_rewrite_fails() {
        let mut store = ClearTextStore::new();
        store.put(handle(1), entry(42), false).unwrap();
        assert_eq!(store.put(handle(1), entry(43), false), Err(StoreError::Consistency(handle(1))));
        assert_eq!(store.value(&handle(1)).unwrap(), ClearValue::from(42u64));
    }

    #[test]
    fn test_randomized_entries_can_be_replaced() {
        let mut store = ClearTextStore::new();
        store.put(handle(1), entry(42), true).unwrap();
        assert!(store.put(handle(1), entry(7), true).unwrap());
        assert_eq!(store.value(&handle(1)).unwrap(), ClearValue::from(7u64));
    }

    #[test]
    fn test_entry_views() {
        let e = ClearTextEntry::new(FheType::Uint16, ClearValue::from(0x1234u64));
        assert_eq!(e.as_bytes(), vec![0x12, 0x34]);
        assert_eq!(e.as_u256(), U256::from(0x1234));
        assert!(e.as_bool());

        let addr = Address::repeat_byte(0xab);
        let e = ClearTextEntry::new(FheType::Address, widen(U256::from_be_slice(addr.as_slice())));
        assert_eq!(e.as_address(), addr);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cleartexts.json");

        let mut store = ClearTextStore::open(&path).unwrap();
        store.put(handle(1), entry(42), false).unwrap();
        store
            .put(handle(2), entry(7).with_flags(ClearTextFlags { overflow: true, ..Default::default() }), false)
            .unwrap();
        store.flush().unwrap();

        let reopened = ClearTextStore::open(&path).unwrap();
        assert_eq!(reopened.count(), 2);
        assert_eq!(reopened.get(&handle(1)).unwrap(), &entry(42));
        assert!(reopened.get(&handle(2)).unwrap().flags.overflow);
    }

    #[test]
    fn test_flush_without_path_is_noop() {
        let mut store = ClearTextStore::new();
        store.put(handle(1), entry(1), false).unwrap();
        store.flush().unwrap();
    }
}
