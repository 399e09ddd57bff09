//! Async Decryption Poller
//!
//! Drives the correlation store from gateway logs, block range by block range, until
//! the requests a caller waits for are complete. On mock backends it also replays
//! executor calls through the [`MockCoprocessor`] and fulfills pending requests
//! itself, acting as the relayer.
//!
//! ```text
//! Idle → Polling → (WaitingForBlock | RevertRecovery) → Polling → … → Done
//! ```

use alloy_primitives::{Address, U256};
use alloy_rpc_types_eth::Filter;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

use crate::{
    backend::Capabilities,
    client::{ChainClient, ClientError},
    coprocessor::{CoprocessorError, MockCoprocessor},
    decryption::{
        CompletedDecryption, DecryptionError, DecryptionStore, EventError, GatewayEvent,
        gateway_topics, parse_gateway_log,
    },
    fulfill::{FulfillError, fulfill_calldata, resolve_values},
    metrics::Metrics,
};

/// Where the poller is in its loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PollState {
    /// No poll in progress.
    #[default]
    Idle,
    /// Reading logs.
    Polling,
    /// Waiting for the chain to produce a block.
    WaitingForBlock,
    /// Dropping events from reverted blocks.
    RevertRecovery,
    /// The last poll settled.
    Done,
}

/// Errors that end a poll.
#[derive(Debug, thiserror::Error)]
pub enum PollError {
    /// The loop bound was reached with requests still pending.
    #[error("decryptions did not settle after {iterations} iterations, {pending} still pending")]
    Timeout {
        /// Iterations run.
        iterations: usize,
        /// Requests still pending.
        pending: usize,
    },

    /// The node failed in a way retrying will not fix.
    #[error(transparent)]
    Client(#[from] ClientError),

    /// A gateway log could not be parsed.
    #[error(transparent)]
    Event(#[from] EventError),

    /// The correlation store rejected an event.
    #[error(transparent)]
    Decryption(#[from] DecryptionError),

    /// The coprocessor failed to replay a transaction.
    #[error(transparent)]
    Coprocessor(#[from] CoprocessorError),

    /// A fulfillment could not be built.
    #[error(transparent)]
    Fulfill(#[from] FulfillError),
}

/// Static poller settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollerConfig {
    /// Gateway emitting the decryption events.
    pub gateway: Address,
    /// First block polled.
    pub start_block: u64,
    /// Bound on loop iterations per call.
    pub max_iterations: usize,
}

/// Block-range poller over gateway decryption events.
#[derive(Debug)]
pub struct DecryptionPoller {
    config: PollerConfig,
    capabilities: Capabilities,
    store: DecryptionStore,
    triggered: BTreeSet<U256>,
    next_block: u64,
    last_polled: Option<u64>,
    state: PollState,
}

impl DecryptionPoller {
    /// Creates a poller feeding `store`.
    pub fn new(config: PollerConfig, capabilities: Capabilities, store: DecryptionStore) -> Self {
        Self {
            next_block: config.start_block,
            config,
            capabilities,
            store,
            triggered: BTreeSet::new(),
            last_polled: None,
            state: PollState::Idle,
        }
    }

    /// Returns the correlation store.
    pub const fn store(&self) -> &DecryptionStore {
        &self.store
    }

    /// Returns the current loop state.
    pub const fn state(&self) -> PollState {
        self.state
    }

    /// Returns the first block not polled yet.
    pub const fn next_block(&self) -> u64 {
        self.next_block
    }

    /// Returns true if a fulfillment was already sent for `id`.
    pub fn is_triggered(&self, id: U256) -> bool {
        self.triggered.contains(&id)
    }

    /// Polls until no request is pending and returns the completed records.
    ///
    /// With a `subset`, only the listed ids are waited for and returned. Without
    /// one, every request waiting for a result is waited for, and the records of
    /// the ids seen during this call are returned.
    ///
    /// The coprocessor is synced up to each polled block before fulfilling; pass
    /// `None` on native backends.
    pub async fn wait_for_decryptions<C: ChainClient + ?Sized>(
        &mut self,
        client: &C,
        mut coprocessor: Option<&mut MockCoprocessor>,
        subset: Option<&[U256]>,
    ) -> Result<Vec<CompletedDecryption>, PollError> {
        self.state = PollState::Polling;
        let mut seen = BTreeSet::new();
        let mut iterations = 0;

        loop {
            if iterations >= self.config.max_iterations {
                let pending = self.store.count_pending(subset);
                self.state = PollState::Idle;
                warn!(target: "fhevm::poller", iterations, pending, "poll timed out");
                return Err(PollError::Timeout { iterations, pending });
            }
            iterations += 1;
            metrics::counter!(Metrics::POLL_ITERATIONS).increment(1);

            let mut current = match client.block_number().await {
                Ok(block) => block,
                Err(err) => {
                    self.retry_or_fail(err)?;
                    continue;
                }
            };

            if self.last_polled.is_some_and(|last| current < last) {
                self.recover_from_revert(current, coprocessor.as_deref_mut());
            }

            if self.last_polled == Some(current) {
                if self.store.count_pending(subset) == 0 {
                    self.state = PollState::Done;
                    return Ok(Vec::new());
                }
                current = match self.advance_chain(client, current).await {
                    Ok(block) => block,
                    Err(err) => {
                        self.retry_or_fail(err)?;
                        continue;
                    }
                };
                self.state = PollState::Polling;
            }

            if let Some(coprocessor) = coprocessor.as_deref_mut() {
                if let Err(err) = coprocessor.sync(client, current).await {
                    if err.is_transient() {
                        warn!(target: "fhevm::poller", error = %err, "coprocessor sync failed, retrying");
                        metrics::counter!(Metrics::TRANSIENT_ERRORS).increment(1);
                        continue;
                    }
                    self.state = PollState::Idle;
                    return Err(err.into());
                }
            }

            match self.ingest(client, current, &mut seen).await {
                Ok(()) => {}
                Err(PollError::Client(err)) => {
                    self.retry_or_fail(err)?;
                    continue;
                }
                Err(err) => {
                    self.state = PollState::Idle;
                    return Err(err);
                }
            }

            let pending = self.store.get_pending_request_ids(subset);
            metrics::gauge!(Metrics::PENDING).set(self.store.count_pending(None) as f64);
            if pending.is_empty() {
                let ids: Vec<U256> = match subset {
                    Some(ids) => ids.to_vec(),
                    None => seen.into_iter().collect(),
                };
                let completed = self.store.get_completed_decryptions(&ids);
                info!(
                    target: "fhevm::poller",
                    iterations,
                    completed = completed.len(),
                    next_block = self.next_block,
                    "decryptions settled"
                );
                self.state = PollState::Done;
                return Ok(completed);
            }

            if self.capabilities.supports_mock_fulfillment {
                if let Some(coprocessor) = coprocessor.as_deref() {
                    self.fulfill(client, coprocessor, &pending).await?;
                }
            }

            self.state = PollState::WaitingForBlock;
            if let Err(err) = self.advance_chain(client, current).await {
                self.retry_or_fail(err)?;
            }
            self.state = PollState::Polling;
        }
    }

    /// Reads the gateway logs of `[next_block, to_block]` into the store.
    async fn ingest<C: ChainClient + ?Sized>(
        &mut self,
        client: &C,
        to_block: u64,
        seen: &mut BTreeSet<U256>,
    ) -> Result<(), PollError> {
        let from_block = self.next_block;
        if from_block <= to_block {
            let filter = Filter::new()
                .address(self.config.gateway)
                .event_signature(gateway_topics().to_vec())
                .from_block(from_block)
                .to_block(to_block);
            let logs = client.get_logs(&filter).await?;

            for log in &logs {
                let Some(event) = parse_gateway_log(log)? else {
                    continue;
                };
                let metric = match &event {
                    GatewayEvent::Request(_) => Metrics::REQUESTS,
                    GatewayEvent::Result(_) => Metrics::RESULTS,
                };
                let id = event.request_id();
                if self.store.push(event)? {
                    metrics::counter!(metric).increment(1);
                }
                seen.insert(id);
            }
            debug!(target: "fhevm::poller", from_block, to_block, logs = logs.len(), "polled");
        }

        self.last_polled = Some(to_block);
        self.next_block = to_block + 1;
        Ok(())
    }

    /// Drops everything at or above `block` after the chain went backwards.
    pub fn recover_from_revert(&mut self, block: u64, coprocessor: Option<&mut MockCoprocessor>) {
        self.state = PollState::RevertRecovery;
        warn!(
            target: "fhevm::poller",
            last_polled = ?self.last_polled,
            current = block,
            "chain revert detected"
        );
        metrics::counter!(Metrics::REVERTS).increment(1);

        let cleared = self.store.clear_greater_or_equal_to_block(block);
        for id in &cleared {
            self.triggered.remove(id);
        }
        self.next_block = block.max(self.config.start_block).min(self.next_block);
        self.last_polled = None;
        if let Some(coprocessor) = coprocessor {
            coprocessor.rewind(block);
        }
        self.state = PollState::Polling;
    }

    /// Sends a fulfillment for every pending request not fulfilled yet.
    async fn fulfill<C: ChainClient + ?Sized>(
        &mut self,
        client: &C,
        coprocessor: &MockCoprocessor,
        pending: &[U256],
    ) -> Result<(), PollError> {
        for id in pending {
            if self.triggered.contains(id) {
                continue;
            }
            let Some(request) = self.store.request(*id) else {
                continue;
            };

            let values = resolve_values(&request.handles, coprocessor.store())?;
            let calldata = fulfill_calldata(*id, &values);
            match client.send_transaction(self.config.gateway, calldata).await {
                Ok(tx_hash) => {
                    debug!(target: "fhevm::poller", request_id = %id, %tx_hash, "fulfillment sent");
                    metrics::counter!(Metrics::FULFILLMENTS).increment(1);
                    self.triggered.insert(*id);
                }
                Err(err) if err.is_transient() => {
                    warn!(target: "fhevm::poller", request_id = %id, error = %err, "fulfillment failed, retrying");
                    metrics::counter!(Metrics::TRANSIENT_ERRORS).increment(1);
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Waits for a block after `current`, mining one where the backend allows it.
    async fn advance_chain<C: ChainClient + ?Sized>(
        &self,
        client: &C,
        current: u64,
    ) -> Result<u64, ClientError> {
        if self.capabilities.supports_mining {
            client.mine_block().await?;
            client.block_number().await
        } else {
            client.wait_for_block(current).await
        }
    }

    fn retry_or_fail(&mut self, err: ClientError) -> Result<(), PollError> {
        if err.is_transient() {
            warn!(target: "fhevm::poller", error = %err, "node request failed, retrying");
            metrics::counter!(Metrics::TRANSIENT_ERRORS).increment(1);
            Ok(())
        } else {
            self.state = PollState::Idle;
            Err(err.into())
        }
    }
}
