//! Decryption correlation store
//!
//! Correlates `DecryptionRequested` and `DecryptionFulfilled` events by request id.
//! Events may arrive in either order; an entry is complete once both halves are
//! present and consistent with each other.
//!
//! The store keeps two disjoint pending sets (requests waiting for a result and
//! results waiting for their request), a handle → request ids index and the block
//! range covered by stored events, so revert recovery can cheaply tell whether any
//! entry is affected.

use alloy_primitives::U256;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, error};

use super::events::{DecryptionRequestEvent, DecryptionResultEvent, GatewayEvent};
use crate::{
    fulfill::{DecryptedValue, decode_for_handles},
    handle::Handle,
};

/// Errors raised by the correlation store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecryptionError {
    /// Two events for the same request id disagree.
    #[error("inconsistent events for decryption request {request_id}: {reason}")]
    Consistency {
        /// The request id.
        request_id: U256,
        /// What disagreed.
        reason: &'static str,
    },
}

/// Lifecycle state of a stored request id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Request seen, result outstanding.
    RequestOnly,
    /// Result seen before its request.
    ResultOnly,
    /// Both halves present.
    Complete,
}

/// The events stored for one request id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestEntry {
    /// The request event, if seen.
    pub request: Option<DecryptionRequestEvent>,
    /// The result event, if seen.
    pub result: Option<DecryptionResultEvent>,
}

impl RequestEntry {
    /// Returns the lifecycle state, or `None` for an entry with neither half.
    pub const fn state(&self) -> Option<EntryState> {
        match (&self.request, &self.result) {
            (Some(_), Some(_)) => Some(EntryState::Complete),
            (Some(_), None) => Some(EntryState::RequestOnly),
            (None, Some(_)) => Some(EntryState::ResultOnly),
            (None, None) => None,
        }
    }

    fn blocks(&self) -> impl Iterator<Item = u64> + '_ {
        self.request
            .iter()
            .map(|r| r.block_number)
            .chain(self.result.iter().map(|r| r.block_number))
    }
}

/// A request paired with its result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedDecryption {
    /// The request event.
    pub request: DecryptionRequestEvent,
    /// The result event.
    pub result: DecryptionResultEvent,
    /// Values decoded from the result, when it succeeded and matches the handle types.
    pub values: Option<Vec<DecryptedValue>>,
}

impl CompletedDecryption {
    fn new(request: DecryptionRequestEvent, result: DecryptionResultEvent) -> Self {
        let values = if result.success {
            decode_for_handles(&request.handles, &result.result).ok()
        } else {
            None
        };
        Self { request, result, values }
    }
}

fn consistency(request_id: U256, reason: &'static str) -> DecryptionError {
    error!(target: "fhevm::decryption", %request_id, reason, "consistency violation");
    DecryptionError::Consistency { request_id, reason }
}

/// Event-sourced correlation of decryption requests and results.
#[derive(Debug, Default)]
pub struct DecryptionStore {
    entries: BTreeMap<U256, RequestEntry>,
    waiting_for_result: BTreeSet<U256>,
    waiting_for_request: BTreeSet<U256>,
    handle_index: HashMap<Handle, BTreeSet<U256>>,
    min_block: Option<u64>,
    max_block: Option<u64>,
    skip_request_id_zero: bool,
}

impl DecryptionStore {
    /// Creates an empty store.
    ///
    /// With `skip_request_id_zero` set, request id 0 is never reported as pending.
    pub fn new(skip_request_id_zero: bool) -> Self {
        Self { skip_request_id_zero, ..Default::default() }
    }

    /// Returns true if request id 0 is excluded from the pending set.
    pub const fn skips_request_id_zero(&self) -> bool {
        self.skip_request_id_zero
    }

    /// Ingests a gateway event.
    pub fn push(&mut self, event: GatewayEvent) -> Result<bool, DecryptionError> {
        match event {
            GatewayEvent::Request(request) => self.push_request(request),
            GatewayEvent::Result(result) => self.push_result(result),
        }
    }

    /// Ingests a request event.
    ///
    /// Returns `false` if the identical request was already stored.
    pub fn push_request(&mut self, event: DecryptionRequestEvent) -> Result<bool, DecryptionError> {
        let id = event.request_id;
        let had_result = match self.entries.get(&id) {
            Some(entry) => {
                if let Some(existing) = &entry.request {
                    if *existing == event {
                        return Ok(false);
                    }
                    return Err(consistency(id, "divergent duplicate request"));
                }
                if let Some(result) = &entry.result {
                    if result.address != event.address {
                        return Err(consistency(id, "request and result emitted by different gateways"));
                    }
                    if result.block_number < event.block_number {
                        return Err(consistency(id, "result precedes its request"));
                    }
                }
                entry.result.is_some()
            }
            None => false,
        };

        for handle in &event.handles {
            self.handle_index.entry(*handle).or_default().insert(id);
        }
        self.track_block(event.block_number);
        debug!(
            target: "fhevm::decryption",
            request_id = %id,
            block = event.block_number,
            handles = event.handles.len(),
            "request stored"
        );

        if had_result {
            self.waiting_for_request.remove(&id);
        } else {
            self.waiting_for_result.insert(id);
        }
        self.entries.entry(id).or_default().request = Some(event);
        Ok(true)
    }

    /// Ingests a result event.
    ///
    /// Returns `false` if the identical result was already stored.
    pub fn push_result(&mut self, event: DecryptionResultEvent) -> Result<bool, DecryptionError> {
        let id = event.request_id;
        let had_request = match self.entries.get(&id) {
            Some(entry) => {
                if let Some(existing) = &entry.result {
                    if *existing == event {
                        return Ok(false);
                    }
                    return Err(consistency(id, "divergent duplicate result"));
                }
                if let Some(request) = &entry.request {
                    if request.address != event.address {
                        return Err(consistency(id, "request and result emitted by different gateways"));
                    }
                    if event.block_number < request.block_number {
                        return Err(consistency(id, "result precedes its request"));
                    }
                }
                entry.request.is_some()
            }
            None => false,
        };

        self.track_block(event.block_number);
        debug!(
            target: "fhevm::decryption",
            request_id = %id,
            block = event.block_number,
            success = event.success,
            "result stored"
        );

        if had_request {
            self.waiting_for_result.remove(&id);
        } else {
            self.waiting_for_request.insert(id);
        }
        self.entries.entry(id).or_default().result = Some(event);
        Ok(true)
    }

    fn track_block(&mut self, block: u64) {
        self.min_block = Some(self.min_block.map_or(block, |min| min.min(block)));
        self.max_block = Some(self.max_block.map_or(block, |max| max.max(block)));
    }

    /// Returns the stored entry of `id`.
    pub fn entry(&self, id: U256) -> Option<&RequestEntry> {
        self.entries.get(&id)
    }

    /// Returns the request event of `id`.
    pub fn request(&self, id: U256) -> Option<&DecryptionRequestEvent> {
        self.entries.get(&id).and_then(|entry| entry.request.as_ref())
    }

    /// Returns true if `id` has a request and a successful result.
    pub fn is_request_id_decrypted(&self, id: U256) -> bool {
        self.entries.get(&id).is_some_and(|entry| {
            entry.request.is_some() && entry.result.as_ref().is_some_and(|result| result.success)
        })
    }

    /// Returns true if any request referencing `handle` has been decrypted.
    ///
    /// With a `filter`, only the listed request ids are considered.
    pub fn is_handle_decrypted(&self, handle: &Handle, filter: Option<&[U256]>) -> bool {
        let Some(ids) = self.handle_index.get(handle) else {
            return false;
        };
        ids.iter()
            .filter(|id| filter.is_none_or(|allowed| allowed.contains(*id)))
            .any(|id| self.is_request_id_decrypted(*id))
    }

    fn counts_as_pending(&self, id: &U256) -> bool {
        !(self.skip_request_id_zero && id.is_zero())
    }

    /// Returns the pending request ids, in ascending order.
    ///
    /// Without a subset these are the requests waiting for a result. With a subset,
    /// every listed id that is not complete yet is pending, including ids the store
    /// has not seen at all.
    pub fn get_pending_request_ids(&self, subset: Option<&[U256]>) -> Vec<U256> {
        match subset {
            None => self
                .waiting_for_result
                .iter()
                .filter(|id| self.counts_as_pending(id))
                .copied()
                .collect(),
            Some(ids) => ids
                .iter()
                .filter(|id| self.counts_as_pending(id))
                .filter(|id| {
                    self.entries.get(*id).and_then(RequestEntry::state) != Some(EntryState::Complete)
                })
                .copied()
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect(),
        }
    }

    /// Returns the number of pending request ids.
    pub fn count_pending(&self, subset: Option<&[U256]>) -> usize {
        self.get_pending_request_ids(subset).len()
    }

    /// Returns the number of results waiting for their request.
    pub fn count_waiting_for_request(&self) -> usize {
        self.waiting_for_request.len()
    }

    /// Returns the ids with a request or result at or above `block`.
    pub fn find_with_greater_or_equal_block_number(&self, block: u64) -> Vec<U256> {
        if self.max_block.is_none_or(|max| max < block) {
            return Vec::new();
        }
        self.entries
            .iter()
            .filter(|(_, entry)| entry.blocks().any(|b| b >= block))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Drops every event at or above `block`.
    ///
    /// An entry whose request is dropped but whose result survives (or the other way
    /// round) goes back to the matching pending set; an entry with neither half left
    /// is deleted. Returns the ids that were touched.
    pub fn clear_greater_or_equal_to_block(&mut self, block: u64) -> Vec<U256> {
        let ids = self.find_with_greater_or_equal_block_number(block);
        for id in &ids {
            let Some(entry) = self.entries.get_mut(id) else {
                continue;
            };

            if entry.request.as_ref().is_some_and(|r| r.block_number >= block) {
                if let Some(request) = entry.request.take() {
                    for handle in &request.handles {
                        if let Some(set) = self.handle_index.get_mut(handle) {
                            set.remove(id);
                            if set.is_empty() {
                                self.handle_index.remove(handle);
                            }
                        }
                    }
                }
            }
            if entry.result.as_ref().is_some_and(|r| r.block_number >= block) {
                entry.result = None;
            }

            self.waiting_for_result.remove(id);
            self.waiting_for_request.remove(id);
            match entry.state() {
                Some(EntryState::RequestOnly) => {
                    self.waiting_for_result.insert(*id);
                }
                Some(EntryState::ResultOnly) => {
                    self.waiting_for_request.insert(*id);
                }
                Some(EntryState::Complete) => {}
                None => {
                    self.entries.remove(id);
                }
            }
        }

        self.min_block = self.entries.values().flat_map(RequestEntry::blocks).min();
        self.max_block = self.entries.values().flat_map(RequestEntry::blocks).max();

        if !ids.is_empty() {
            debug!(target: "fhevm::decryption", block, cleared = ids.len(), "cleared reverted events");
        }
        ids
    }

    /// Returns the completed records of `ids`.
    ///
    /// Ids that are unknown or still missing a half are skipped.
    pub fn get_completed_decryptions(&self, ids: &[U256]) -> Vec<CompletedDecryption> {
        ids.iter()
            .filter_map(|id| self.entries.get(id))
            .filter_map(|entry| match (&entry.request, &entry.result) {
                (Some(request), Some(result)) => {
                    Some(CompletedDecryption::new(request.clone(), result.clone()))
                }
                _ => None,
            })
            .collect()
    }

    /// Returns the lowest block covered by stored events.
    pub const fn min_block(&self) -> Option<u64> {
        self.min_block
    }

    /// Returns the highest block covered by stored events.
    pub const fn max_block(&self) -> Option<u64> {
        self.max_block
    }

    /// Returns the number of stored request ids.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        fulfill::encode_values,
        handle::{FheType, with_metadata},
    };
    use alloy_primitives::{Address, B256, Bytes, FixedBytes};

    fn handle(n: u8) -> Handle {
        with_metadata(B256::repeat_byte(n), 0xff, FheType::Uint8)
    }

    fn request(id: u64, block: u64, handles: Vec<Handle>) -> DecryptionRequestEvent {
        DecryptionRequestEvent {
            request_id: U256::from(id),
            address: Address::repeat_byte(0x11),
            block_number: block,
            tx_hash: B256::repeat_byte(block as u8),
            handles,
            contract_caller: Address::repeat_byte(0x22),
            callback_selector: FixedBytes([0xde, 0xad, 0xbe, 0xef]),
            msg_value: U256::ZERO,
            max_timestamp: U256::from(1_000),
            pass_signatures_to_caller: false,
        }
    }

    fn result(id: u64, block: u64, success: bool) -> DecryptionResultEvent {
        DecryptionResultEvent {
            request_id: U256::from(id),
            address: Address::repeat_byte(0x11),
            block_number: block,
            tx_hash: B256::repeat_byte(block as u8),
            success,
            result: Bytes::new(),
        }
    }

    fn id(n: u64) -> U256 {
        U256::from(n)
    }

    /// Checks the derived indices against the stored entries.
    fn assert_consistent(store: &DecryptionStore) {
        for (id, entry) in &store.entries {
            let state = entry.state().expect("stored entries are never empty");
            assert_eq!(store.waiting_for_result.contains(id), state == EntryState::RequestOnly);
            assert_eq!(store.waiting_for_request.contains(id), state == EntryState::ResultOnly);
            if let Some(request) = &entry.request {
                for h in &request.handles {
                    assert!(store.handle_index[h].contains(id));
                }
            }
        }
        for ids in store.handle_index.values() {
            for id in ids {
                assert!(store.request(*id).is_some());
            }
        }
        assert!(store.waiting_for_result.is_disjoint(&store.waiting_for_request));
        assert_eq!(store.min_block, store.entries.values().flat_map(RequestEntry::blocks).min());
        assert_eq!(store.max_block, store.entries.values().flat_map(RequestEntry::blocks).max());
    }

    #[test]
    fn test_request_then_result() {
        let mut store = DecryptionStore::new(false);
        assert!(store.push_request(request(1, 10, vec![handle(1)])).unwrap());
        assert_eq!(store.get_pending_request_ids(None), vec![id(1)]);
        assert!(!store.is_request_id_decrypted(id(1)));

        assert!(store.push_result(result(1, 11, true)).unwrap());
        assert_eq!(store.count_pending(None), 0);
        assert!(store.is_request_id_decrypted(id(1)));
        assert!(store.is_handle_decrypted(&handle(1), None));
        assert!(!store.is_handle_decrypted(&handle(1), Some(&[id(2)])));
        assert_consistent(&store);
    }

    #[test]
    fn test_ingestion_is_idempotent() {
        let mut store = DecryptionStore::new(false);
        store.push_request(request(1, 10, vec![handle(1)])).unwrap();
        store.push_result(result(1, 12, true)).unwrap();

        assert!(!store.push_request(request(1, 10, vec![handle(1)])).unwrap());
        assert!(!store.push_result(result(1, 12, true)).unwrap());
        assert_eq!(store.len(), 1);
        assert_eq!(store.max_block(), Some(12));
        assert_consistent(&store);
    }

    #[test]
    fn test_divergent_duplicates_are_fatal() {
        let mut store = DecryptionStore::new(false);
        store.push_request(request(1, 10, vec![handle(1)])).unwrap();
        assert!(matches!(
            store.push_request(request(1, 10, vec![handle(2)])),
            Err(DecryptionError::Consistency { .. })
        ));

        store.push_result(result(1, 11, true)).unwrap();
        assert!(matches!(
            store.push_result(result(1, 11, false)),
            Err(DecryptionError::Consistency { .. })
        ));
    }

    #[test]
    fn test_inconsistent_pairing_is_fatal() {
        let mut store = DecryptionStore::new(false);
        store.push_result(result(4, 5, true)).unwrap();
        assert!(store.push_request(request(4, 9, vec![])).is_err());

        let mut other_gateway = request(5, 1, vec![]);
        other_gateway.address = Address::repeat_byte(0x99);
        store.push_result(result(5, 2, true)).unwrap();
        assert!(store.push_request(other_gateway).is_err());
    }

    #[test]
    fn test_out_of_order_arrival() {
        let mut store = DecryptionStore::new(false);
        store.push_result(result(7, 20, true)).unwrap();
        assert_eq!(store.entry(id(7)).and_then(RequestEntry::state), Some(EntryState::ResultOnly));
        assert_eq!(store.count_waiting_for_request(), 1);
        assert_eq!(store.count_pending(None), 0);
        assert!(!store.is_request_id_decrypted(id(7)));

        store.push_request(request(7, 19, vec![handle(7)])).unwrap();
        assert_eq!(store.count_waiting_for_request(), 0);
        assert_eq!(store.count_pending(None), 0);
        assert!(store.is_request_id_decrypted(id(7)));
        assert_consistent(&store);
    }

    #[test]
    fn test_failed_result_is_not_decrypted() {
        let mut store = DecryptionStore::new(false);
        store.push_request(request(1, 1, vec![handle(1)])).unwrap();
        store.push_result(result(1, 2, false)).unwrap();
        assert!(!store.is_request_id_decrypted(id(1)));
        assert!(!store.is_handle_decrypted(&handle(1), None));
        assert_eq!(store.count_pending(None), 0);
    }

    #[test]
    fn test_subset_pending_includes_unknown_ids() {
        let mut store = DecryptionStore::new(false);
        store.push_request(request(1, 1, vec![])).unwrap();
        store.push_request(request(2, 1, vec![])).unwrap();
        store.push_result(result(2, 2, true)).unwrap();

        let subset = [id(2), id(3), id(1), id(3)];
        assert_eq!(store.get_pending_request_ids(Some(&subset)), vec![id(1), id(3)]);
        assert_eq!(store.get_pending_request_ids(None), vec![id(1)]);
    }

    #[test]
    fn test_request_id_zero_skip() {
        let mut skipping = DecryptionStore::new(true);
        skipping.push_request(request(0, 1, vec![])).unwrap();
        assert_eq!(skipping.count_pending(None), 0);
        assert_eq!(skipping.count_pending(Some(&[id(0)])), 0);

        let mut counting = DecryptionStore::new(false);
        counting.push_request(request(0, 1, vec![])).unwrap();
        assert_eq!(counting.count_pending(None), 1);
    }

    #[test]
    fn test_clear_greater_or_equal_to_block() {
        let mut store = DecryptionStore::new(false);
        store.push_request(request(1, 10, vec![handle(1)])).unwrap();
        store.push_result(result(1, 11, true)).unwrap();
        store.push_request(request(2, 12, vec![handle(1), handle(2)])).unwrap();
        store.push_result(result(2, 13, true)).unwrap();
        store.push_request(request(3, 14, vec![handle(3)])).unwrap();
        store.push_result(result(9, 15, true)).unwrap();

        assert_eq!(store.find_with_greater_or_equal_block_number(11), vec![id(1), id(2), id(3), id(9)]);
        assert!(store.find_with_greater_or_equal_block_number(16).is_empty());

        store.clear_greater_or_equal_to_block(11);

        assert_eq!(store.len(), 1);
        assert_eq!(store.entry(id(1)).and_then(RequestEntry::state), Some(EntryState::RequestOnly));
        assert_eq!(store.get_pending_request_ids(None), vec![id(1)]);
        assert!(store.find_with_greater_or_equal_block_number(11).is_empty());
        assert!(!store.handle_index.contains_key(&handle(2)));
        assert!(!store.handle_index.contains_key(&handle(3)));
        assert_eq!(store.handle_index[&handle(1)], BTreeSet::from([id(1)]));
        assert_eq!(store.min_block(), Some(10));
        assert_eq!(store.max_block(), Some(10));
        assert_consistent(&store);

        store.clear_greater_or_equal_to_block(0);
        assert!(store.is_empty());
        assert_eq!(store.min_block(), None);
        assert_consistent(&store);
    }

    #[test]
    fn test_completed_decryptions_decode_values() {
        let mut store = DecryptionStore::new(false);
        store.push_request(request(1, 1, vec![handle(1), handle(2)])).unwrap();
        let mut res = result(1, 2, true);
        res.result =
            encode_values(&[DecryptedValue::Uint(U256::from(4)), DecryptedValue::Uint(U256::from(250))]);
        store.push_result(res).unwrap();
        store.push_request(request(2, 3, vec![handle(3)])).unwrap();

        let completed = store.get_completed_decryptions(&[id(1), id(2), id(5)]);
        assert_eq!(completed.len(), 1);
        assert_eq!(
            completed[0].values,
            Some(vec![DecryptedValue::Uint(U256::from(4)), DecryptedValue::Uint(U256::from(250))])
        );
    }
}
