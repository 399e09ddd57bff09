//! Chain access
//!
//! [`ChainClient`] is the narrow view of a node the mock needs: block numbers, logs,
//! block transactions, step traces, transaction submission and block production.
//! [`AlloyChainClient`] implements it on top of an alloy [`Provider`].

use alloy_primitives::{Address, B256, Bytes};
use alloy_provider::{Provider, ext::DebugApi};
use alloy_rpc_types_eth::{BlockNumberOrTag, Filter, Log, TransactionRequest};
use alloy_rpc_types_trace::geth::{GethDebugTracingOptions, GethDefaultTracingOptions, GethTrace};
use async_trait::async_trait;
use futures::StreamExt;
use tracing::{debug, warn};

use crate::coprocessor::trace::{ExecutionTrace, TraceError};

/// Errors returned by a [`ChainClient`].
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The node could not be reached or returned a transport-level error.
    #[error("transport error: {0}")]
    Transport(String),

    /// A block or transaction the node should know about is missing.
    #[error("not found: {0}")]
    NotFound(String),

    /// A submitted transaction was included but reverted.
    #[error("transaction {0} reverted")]
    Reverted(B256),

    /// The node returned a trace in an unexpected shape.
    #[error("unexpected trace format for transaction {0}")]
    UnexpectedTrace(B256),

    /// The trace could not be parsed.
    #[error(transparent)]
    Trace(#[from] TraceError),
}

impl ClientError {
    /// Returns true if retrying the same request later may succeed.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::NotFound(_))
    }
}

/// Node access used by the coprocessor and the poller.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Returns the node's `web3_clientVersion` string.
    async fn client_version(&self) -> Result<String, ClientError>;

    /// Returns the latest block number.
    async fn block_number(&self) -> Result<u64, ClientError>;

    /// Returns the hashes of the transactions in `block`, in block order.
    async fn transaction_hashes(&self, block: u64) -> Result<Vec<B256>, ClientError>;

    /// Returns the calls a transaction made to `target`, from its step-level trace.
    async fn trace_transaction(
        &self,
        hash: B256,
        target: Address,
    ) -> Result<ExecutionTrace, ClientError>;

    /// Returns the logs matching `filter`.
    async fn get_logs(&self, filter: &Filter) -> Result<Vec<Log>, ClientError>;

    /// Sends a transaction and waits for its inclusion.
    async fn send_transaction(&self, to: Address, input: Bytes) -> Result<B256, ClientError>;

    /// Forces the node to produce a block.
    async fn mine_block(&self) -> Result<(), ClientError>;

    /// Waits until a block above `after` exists and returns its number.
    async fn wait_for_block(&self, after: u64) -> Result<u64, ClientError>;
}

fn transport<E: std::fmt::Display>(err: E) -> ClientError {
    ClientError::Transport(err.to_string())
}

/// [`ChainClient`] backed by an alloy provider.
///
/// Transactions are sent unsigned with `from` set to the relayer, which local
/// development nodes sign with their unlocked accounts.
#[derive(Debug, Clone)]
pub struct AlloyChainClient<P> {
    provider: P,
    relayer: Address,
}

impl<P: Provider> AlloyChainClient<P> {
    /// Creates a client sending transactions from `relayer`.
    pub const fn new(provider: P, relayer: Address) -> Self {
        Self { provider, relayer }
    }

    /// Returns the underlying provider.
    pub const fn provider(&self) -> &P {
        &self.provider
    }
}

#[async_trait]
impl<P: Provider + Send + Sync> ChainClient for AlloyChainClient<P> {
    async fn client_version(&self) -> Result<String, ClientError> {
        self.provider.get_client_version().await.map_err(transport)
    }

    async fn block_number(&self) -> Result<u64, ClientError> {
        self.provider.get_block_number().await.map_err(transport)
    }

    async fn transaction_hashes(&self, block: u64) -> Result<Vec<B256>, ClientError> {
        let block = self
            .provider
            .get_block_by_number(BlockNumberOrTag::Number(block))
            .await
            .map_err(transport)?
            .ok_or_else(|| ClientError::NotFound(format!("block {block}")))?;
        Ok(block.transactions.hashes().collect())
    }

    async fn trace_transaction(
        &self,
        hash: B256,
        target: Address,
    ) -> Result<ExecutionTrace, ClientError> {
        let options = GethDebugTracingOptions {
            config: GethDefaultTracingOptions { enable_memory: Some(true), ..Default::default() },
            ..Default::default()
        };
        match self.provider.debug_trace_transaction(hash, options).await.map_err(transport)? {
            GethTrace::Default(frame) => Ok(ExecutionTrace::from_frame(&frame, target)?),
            _ => Err(ClientError::UnexpectedTrace(hash)),
        }
    }

    async fn get_logs(&self, filter: &Filter) -> Result<Vec<Log>, ClientError> {
        self.provider.get_logs(filter).await.map_err(transport)
    }

    async fn send_transaction(&self, to: Address, input: Bytes) -> Result<B256, ClientError> {
        let tx = TransactionRequest::default().from(self.relayer).to(to).input(input.into());
        let receipt = self
            .provider
            .send_transaction(tx)
            .await
            .map_err(transport)?
            .get_receipt()
            .await
            .map_err(transport)?;

        debug!(
            target: "fhevm::client",
            tx_hash = %receipt.transaction_hash,
            block = ?receipt.block_number,
            "transaction included"
        );
        if !receipt.status() {
            return Err(ClientError::Reverted(receipt.transaction_hash));
        }
        Ok(receipt.transaction_hash)
    }

    async fn mine_block(&self) -> Result<(), ClientError> {
        self.provider
            .raw_request::<(), serde_json::Value>("evm_mine".into(), ())
            .await
            .map_err(transport)?;
        Ok(())
    }

    async fn wait_for_block(&self, after: u64) -> Result<u64, ClientError> {
        let current = self.block_number().await?;
        if current > after {
            return Ok(current);
        }

        let mut blocks = self.provider.watch_blocks().await.map_err(transport)?.into_stream();
        while blocks.next().await.is_some() {
            let current = self.block_number().await?;
            if current > after {
                return Ok(current);
            }
        }

        warn!(target: "fhevm::client", after, "block stream ended");
        Err(ClientError::Transport("block stream ended".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors() {
        assert!(ClientError::Transport("connection refused".into()).is_transient());
        assert!(ClientError::NotFound("block 3".into()).is_transient());
        assert!(!ClientError::Reverted(B256::ZERO).is_transient());
        assert!(!ClientError::UnexpectedTrace(B256::ZERO).is_transient());
    }
}
