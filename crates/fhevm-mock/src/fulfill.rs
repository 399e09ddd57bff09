//! Mock fulfillment
//!
//! Builds the `fulfillRequest` call the relayer submits to the gateway, and decodes
//! delivered results back into typed values. Decrypted values are ABI parameter
//! encoded per handle type: booleans as `bool`, integers as `uint256`, addresses as
//! `address` and byte blobs as dynamic `bytes`.

use alloy_primitives::{Address, Bytes, U256};
use alloy_sol_types::{SolCall, sol};

use crate::{
    cleartext::{ClearTextEntry, ClearTextStore, StoreError},
    handle::{FheType, Handle, HandleError, value_type},
};

sol! {
    /// Gateway entry point used by the relayer to deliver decryptions.
    function fulfillRequest(uint256 requestID, bytes decryptedCts, bytes[] signatures);
}

const WORD: usize = 32;

/// Errors raised while building or decoding fulfillments.
#[derive(Debug, thiserror::Error)]
pub enum FulfillError {
    /// The encoded values are shorter than their layout requires.
    #[error("decrypted values too short: expected at least {expected} bytes, got {actual}")]
    InputTooShort {
        /// Minimum length required.
        expected: usize,
        /// Actual length.
        actual: usize,
    },

    /// A dynamic offset or length does not fit in memory addressing.
    #[error("decrypted values offset out of range: {0}")]
    OffsetOutOfRange(U256),

    /// A requested handle has no cleartext.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A requested handle has an unknown type tag.
    #[error(transparent)]
    Handle(#[from] HandleError),
}

// ============================================================================
// Values
// ============================================================================

/// A decrypted value as delivered to the requesting contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecryptedValue {
    Bool(bool),
    Uint(U256),
    Address(Address),
    Bytes(Bytes),
}

impl DecryptedValue {
    /// Converts a cleartext entry into the value delivered for its type.
    pub fn from_clear_text(entry: &ClearTextEntry) -> Self {
        match entry.value_type {
            FheType::Bool => Self::Bool(entry.as_bool()),
            FheType::Address => Self::Address(entry.as_address()),
            ty if ty.is_bytes() => Self::Bytes(entry.as_bytes().into()),
            _ => Self::Uint(entry.as_u256()),
        }
    }
}

/// Resolves the cleartexts of `handles` into decrypted values.
pub fn resolve_values(
    handles: &[Handle],
    store: &ClearTextStore,
) -> Result<Vec<DecryptedValue>, FulfillError> {
    handles.iter().map(|handle| Ok(DecryptedValue::from_clear_text(store.get(handle)?))).collect()
}

// ============================================================================
// Encoding
// ============================================================================

fn word_from_u256(value: U256) -> [u8; WORD] {
    value.to_be_bytes::<WORD>()
}

/// ABI-encodes `values` as a parameter list.
pub fn encode_values(values: &[DecryptedValue]) -> Bytes {
    let head_len = values.len() * WORD;
    let mut head = Vec::with_capacity(head_len);
    let mut tail = Vec::new();

    for value in values {
        match value {
            DecryptedValue::Bool(b) => head.extend_from_slice(&word_from_u256(U256::from(u8::from(*b)))),
            DecryptedValue::Uint(n) => head.extend_from_slice(&word_from_u256(*n)),
            DecryptedValue::Address(a) => head.extend_from_slice(a.into_word().as_slice()),
            DecryptedValue::Bytes(data) => {
                head.extend_from_slice(&word_from_u256(U256::from(head_len + tail.len())));
                tail.extend_from_slice(&word_from_u256(U256::from(data.len())));
                tail.extend_from_slice(data);
                tail.resize(tail.len().next_multiple_of(WORD), 0);
            }
        }
    }

    head.extend_from_slice(&tail);
    head.into()
}

/// Builds the `fulfillRequest` calldata for `request_id`.
///
/// The mock gateway does not check KMS signatures, so none are attached.
pub fn fulfill_calldata(request_id: U256, values: &[DecryptedValue]) -> Bytes {
    fulfillRequestCall { requestID: request_id, decryptedCts: encode_values(values), signatures: vec![] }
        .abi_encode()
        .into()
}

// ============================================================================
// Decoding Helpers
// ============================================================================

/// Read a 32-byte word as U256.
fn read_u256(data: &[u8], offset: usize) -> Result<U256, FulfillError> {
    let end = offset.checked_add(WORD).ok_or(FulfillError::OffsetOutOfRange(U256::from(offset)))?;
    if data.len() < end {
        return Err(FulfillError::InputTooShort { expected: end, actual: data.len() });
    }
    Ok(U256::from_be_slice(&data[offset..end]))
}

/// Read a 32-byte word as a memory offset or length.
fn read_usize(data: &[u8], offset: usize) -> Result<usize, FulfillError> {
    let word = read_u256(data, offset)?;
    usize::try_from(word).map_err(|_| FulfillError::OffsetOutOfRange(word))
}

/// Read dynamic `bytes` whose head word sits at `offset`.
fn read_bytes(data: &[u8], offset: usize) -> Result<Bytes, FulfillError> {
    let start = read_usize(data, offset)?;
    let len = read_usize(data, start)?;
    let begin = start + WORD;
    let end = begin.checked_add(len).ok_or(FulfillError::OffsetOutOfRange(U256::from(len)))?;
    if data.len() < end {
        return Err(FulfillError::InputTooShort { expected: end, actual: data.len() });
    }
    Ok(Bytes::copy_from_slice(&data[begin..end]))
}

/// Decodes values encoded by [`encode_values`] for handles of the given types.
pub fn decode_values(types: &[FheType], data: &[u8]) -> Result<Vec<DecryptedValue>, FulfillError> {
    types
        .iter()
        .enumerate()
        .map(|(i, ty)| {
            let offset = i * WORD;
            Ok(match ty {
                FheType::Bool => DecryptedValue::Bool(!read_u256(data, offset)?.is_zero()),
                FheType::Address => {
                    read_u256(data, offset)?;
                    DecryptedValue::Address(Address::from_slice(&data[offset + 12..offset + WORD]))
                }
                ty if ty.is_bytes() => DecryptedValue::Bytes(read_bytes(data, offset)?),
                _ => DecryptedValue::Uint(read_u256(data, offset)?),
            })
        })
        .collect()
}

/// Decodes the values of a result for the given request handles.
pub fn decode_for_handles(
    handles: &[Handle],
    data: &[u8],
) -> Result<Vec<DecryptedValue>, FulfillError> {
    let types = handles.iter().map(value_type).collect::<Result<Vec<_>, _>>()?;
    decode_values(&types, data)
}
