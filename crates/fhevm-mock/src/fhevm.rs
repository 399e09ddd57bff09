//! The mock FHEVM environment.

use alloy_primitives::{Address, U256};
use tracing::info;

use crate::{
    backend::{Backend, Capabilities, detect},
    cleartext::{ClearTextEntry, ClearTextStore, StoreError},
    client::{ChainClient, ClientError},
    config::{ConfigError, MockFhevmConfig},
    coprocessor::{CoprocessorError, MockCoprocessor, ScanSummary},
    decryption::{CompletedDecryption, DecryptionStore},
    handle::{FheType, Handle, HandleCodec},
    poller::{DecryptionPoller, PollError, PollerConfig},
};

/// Errors returned by [`MockFhevm`].
#[derive(Debug, thiserror::Error)]
pub enum FhevmError {
    /// The configuration was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The node could not be queried.
    #[error(transparent)]
    Client(#[from] ClientError),

    /// The clear-text store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The coprocessor failed.
    #[error(transparent)]
    Coprocessor(#[from] CoprocessorError),

    /// Polling for decryptions failed.
    #[error(transparent)]
    Poll(#[from] PollError),

    /// The operation needs the in-process coprocessor.
    #[error("{operation} is only available on mock backends, connected to {backend:?}")]
    NotMock {
        /// The operation attempted.
        operation: &'static str,
        /// The connected backend.
        backend: Backend,
    },

    /// A typed accessor was used on a handle of another type.
    #[error("handle {handle} holds {actual:?}, not {expected}")]
    WrongType {
        /// The handle read.
        handle: Handle,
        /// The accessor's type.
        expected: &'static str,
        /// The handle's type.
        actual: FheType,
    },
}

/// A connected mock FHEVM: backend, coprocessor and decryption poller.
///
/// Built with [`MockFhevm::connect`]. On native backends there is no coprocessor,
/// so clear-text reads fail with [`FhevmError::NotMock`] and the poller only
/// observes results delivered by the real oracle.
#[derive(Debug)]
pub struct MockFhevm<C> {
    client: C,
    config: MockFhevmConfig,
    backend: Backend,
    coprocessor: Option<MockCoprocessor>,
    poller: DecryptionPoller,
}

impl<C: ChainClient> MockFhevm<C> {
    /// Detects the backend behind `client` and wires the environment for it.
    pub async fn connect(client: C, config: MockFhevmConfig) -> Result<Self, FhevmError> {
        config.validate()?;

        let version = client.client_version().await?;
        let backend = detect(&version, config.backend);
        let capabilities = backend.capabilities();

        // Executor calls are only recoverable from step-level traces.
        let coprocessor = if capabilities.supports_step_traces {
            let store = match &config.cleartext_path {
                Some(path) => ClearTextStore::open(path)?,
                None => ClearTextStore::new(),
            };
            Some(MockCoprocessor::new(
                HandleCodec::new(config.acl, config.chain_id),
                config.executor,
                store,
                config.start_block,
                config.seed,
            ))
        } else {
            None
        };

        let poller = DecryptionPoller::new(
            PollerConfig {
                gateway: config.gateway,
                start_block: config.start_block,
                max_iterations: config.max_poll_iterations,
            },
            capabilities,
            DecryptionStore::new(config.skips_request_id_zero(backend)),
        );

        info!(
            target: "fhevm::client",
            %version,
            ?backend,
            chain_id = config.chain_id,
            start_block = config.start_block,
            "connected"
        );
        Ok(Self { client, config, backend, coprocessor, poller })
    }

    /// Returns the detected backend.
    pub const fn backend(&self) -> Backend {
        self.backend
    }

    /// Returns what the backend supports.
    pub const fn capabilities(&self) -> Capabilities {
        self.backend.capabilities()
    }

    /// Returns the configuration in use.
    pub const fn config(&self) -> &MockFhevmConfig {
        &self.config
    }

    /// Returns the chain client.
    pub const fn client(&self) -> &C {
        &self.client
    }

    /// Returns the correlation store.
    pub const fn decryptions(&self) -> &DecryptionStore {
        self.poller.store()
    }

    /// Returns the poller.
    pub const fn poller(&self) -> &DecryptionPoller {
        &self.poller
    }

    /// Returns the mock coprocessor, if the backend runs one.
    pub const fn coprocessor(&self) -> Option<&MockCoprocessor> {
        self.coprocessor.as_ref()
    }

    /// Replays executor calls up to the latest block.
    pub async fn sync(&mut self) -> Result<ScanSummary, FhevmError> {
        let backend = self.backend;
        let coprocessor = self
            .coprocessor
            .as_mut()
            .ok_or(FhevmError::NotMock { operation: "sync", backend })?;
        let latest = self.client.block_number().await?;
        Ok(coprocessor.sync(&self.client, latest).await?)
    }

    /// Waits until the given requests, or all requests waiting for a result, are
    /// decrypted.
    pub async fn wait_for_decryptions(
        &mut self,
        subset: Option<&[U256]>,
    ) -> Result<Vec<CompletedDecryption>, FhevmError> {
        Ok(self.poller.wait_for_decryptions(&self.client, self.coprocessor.as_mut(), subset).await?)
    }

    /// Returns true if a request naming `handle` has a successful result.
    pub fn is_handle_decrypted(&self, handle: &Handle, filter: Option<&[U256]>) -> bool {
        self.poller.store().is_handle_decrypted(handle, filter)
    }

    /// Returns the stored cleartext of `handle`.
    pub fn clear_text(&self, handle: &Handle) -> Result<&ClearTextEntry, FhevmError> {
        let coprocessor = self
            .coprocessor
            .as_ref()
            .ok_or(FhevmError::NotMock { operation: "clear_text", backend: self.backend })?;
        Ok(coprocessor.clear_text(handle)?)
    }

    /// Reads an encrypted boolean.
    pub fn decrypt_bool(&self, handle: &Handle) -> Result<bool, FhevmError> {
        let entry = self.typed(handle, "bool", |ty| ty == FheType::Bool)?;
        Ok(entry.as_bool())
    }

    /// Reads an encrypted unsigned integer of up to 256 bits.
    pub fn decrypt_uint(&self, handle: &Handle) -> Result<U256, FhevmError> {
        let entry = self.typed(handle, "uint", |ty| {
            !matches!(ty, FheType::Bool | FheType::Address) && !ty.is_bytes()
        })?;
        Ok(entry.as_u256())
    }

    /// Reads an encrypted address.
    pub fn decrypt_address(&self, handle: &Handle) -> Result<Address, FhevmError> {
        let entry = self.typed(handle, "address", |ty| ty == FheType::Address)?;
        Ok(entry.as_address())
    }

    /// Reads an encrypted byte blob.
    pub fn decrypt_bytes(&self, handle: &Handle) -> Result<Vec<u8>, FhevmError> {
        let entry = self.typed(handle, "bytes", FheType::is_bytes)?;
        Ok(entry.as_bytes())
    }

    fn typed(
        &self,
        handle: &Handle,
        expected: &'static str,
        accepts: impl Fn(FheType) -> bool,
    ) -> Result<&ClearTextEntry, FhevmError> {
        let entry = self.clear_text(handle)?;
        if !accepts(entry.value_type) {
            return Err(FhevmError::WrongType { handle: *handle, expected, actual: entry.value_type });
        }
        Ok(entry)
    }
}
