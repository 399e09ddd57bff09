//! Gateway event parsing
//!
//! Parses the `DecryptionRequested` and `DecryptionFulfilled` logs emitted by the
//! gateway contract into owned event records carrying their block position.

use alloy_primitives::{Address, B256, Bytes, FixedBytes, U256};
use alloy_rpc_types_eth::Log;
use alloy_sol_types::{SolEvent, sol};

use crate::handle::Handle;

sol! {
    /// Emitted by the gateway when a contract asks for a decryption.
    #[derive(Debug)]
    event DecryptionRequested(
        uint256 indexed requestID,
        uint256[] handles,
        address contractCaller,
        bytes4 callbackSelector,
        uint256 msgValue,
        uint256 maxTimestamp,
        bool passSignaturesToCaller
    );

    /// Emitted by the gateway once the relayer has delivered a result.
    #[derive(Debug)]
    event DecryptionFulfilled(uint256 indexed requestID, bool success, bytes result);
}

/// Errors raised while parsing gateway logs.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    /// A log with a gateway event signature did not decode.
    #[error("malformed gateway log in tx {tx_hash:?}: {source}")]
    Malformed {
        /// Transaction that emitted the log.
        tx_hash: Option<B256>,
        /// Decoding error.
        #[source]
        source: alloy_sol_types::Error,
    },

    /// The log was returned without its block position.
    #[error("gateway log is missing its {0}")]
    MissingPosition(&'static str),
}

/// A decryption request observed on chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptionRequestEvent {
    /// Request identifier.
    pub request_id: U256,
    /// Gateway that emitted the event.
    pub address: Address,
    /// Block that included the request.
    pub block_number: u64,
    /// Transaction that emitted the request.
    pub tx_hash: B256,
    /// Handles to decrypt.
    pub handles: Vec<Handle>,
    /// Contract that asked for the decryption.
    pub contract_caller: Address,
    /// Callback invoked with the result.
    pub callback_selector: FixedBytes<4>,
    /// Value forwarded to the callback.
    pub msg_value: U256,
    /// Deadline for fulfillment.
    pub max_timestamp: U256,
    /// Whether signatures are passed to the callback.
    pub pass_signatures_to_caller: bool,
}

/// A decryption result observed on chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptionResultEvent {
    /// Request identifier.
    pub request_id: U256,
    /// Gateway that emitted the event.
    pub address: Address,
    /// Block that included the result.
    pub block_number: u64,
    /// Transaction that emitted the result.
    pub tx_hash: B256,
    /// Whether the callback succeeded.
    pub success: bool,
    /// Callback return data.
    pub result: Bytes,
}

/// A parsed gateway event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEvent {
    Request(DecryptionRequestEvent),
    Result(DecryptionResultEvent),
}

impl GatewayEvent {
    /// Returns the request id the event refers to.
    pub const fn request_id(&self) -> U256 {
        match self {
            Self::Request(event) => event.request_id,
            Self::Result(event) => event.request_id,
        }
    }

    /// Returns the block that included the event.
    pub const fn block_number(&self) -> u64 {
        match self {
            Self::Request(event) => event.block_number,
            Self::Result(event) => event.block_number,
        }
    }
}

/// Returns the topic0 values of the gateway events, for log filters.
pub fn gateway_topics() -> [B256; 2] {
    [DecryptionRequested::SIGNATURE_HASH, DecryptionFulfilled::SIGNATURE_HASH]
}

/// Parses a gateway log.
///
/// Returns `Ok(None)` for logs that are not gateway decryption events.
pub fn parse_gateway_log(log: &Log) -> Result<Option<GatewayEvent>, EventError> {
    let Some(topic0) = log.topics().first().copied() else {
        return Ok(None);
    };
    if topic0 != DecryptionRequested::SIGNATURE_HASH && topic0 != DecryptionFulfilled::SIGNATURE_HASH
    {
        return Ok(None);
    }

    let block_number = log.block_number.ok_or(EventError::MissingPosition("block number"))?;
    let tx_hash = log.transaction_hash.ok_or(EventError::MissingPosition("transaction hash"))?;
    let malformed = |source| EventError::Malformed { tx_hash: Some(tx_hash), source };

    let event = if topic0 == DecryptionRequested::SIGNATURE_HASH {
        let decoded = DecryptionRequested::decode_log(&log.inner).map_err(malformed)?;
        let data = decoded.data;
        GatewayEvent::Request(DecryptionRequestEvent {
            request_id: data.requestID,
            address: decoded.address,
            block_number,
            tx_hash,
            handles: data.handles.iter().map(|h| B256::from(h.to_be_bytes::<32>())).collect(),
            contract_caller: data.contractCaller,
            callback_selector: data.callbackSelector,
            msg_value: data.msgValue,
            max_timestamp: data.maxTimestamp,
            pass_signatures_to_caller: data.passSignaturesToCaller,
        })
    } else {
        let decoded = DecryptionFulfilled::decode_log(&log.inner).map_err(malformed)?;
        let data = decoded.data;
        GatewayEvent::Result(DecryptionResultEvent {
            request_id: data.requestID,
            address: decoded.address,
            block_number,
            tx_hash,
            success: data.success,
            result: data.result,
        })
    };
    Ok(Some(event))
}
