//! Configuration for [`MockFhevm`](crate::MockFhevm).

use alloy_primitives::{Address, address};
use eyre::WrapErr;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::backend::{Backend, BackendPreference};

/// Default ACL contract address of a local FHEVM deployment.
pub const DEFAULT_ACL: Address = address!("339ece85b9e11a3a3aa557582784a15d7f82aaf2");

/// Default FHE executor address of a local FHEVM deployment.
pub const DEFAULT_EXECUTOR: Address = address!("596e6682c72946af006b27c131793f2b62527a4b");

/// Default gateway address of a local FHEVM deployment.
pub const DEFAULT_GATEWAY: Address = address!("096b4679d45fb675d4e2c1e4565009cec99a12b1");

/// Default chain id of local development chains.
pub const DEFAULT_CHAIN_ID: u64 = 31337;

/// Default bound on poll loop iterations.
pub const DEFAULT_MAX_POLL_ITERATIONS: usize = 100;

/// Rejected configuration values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A contract address was left at zero.
    #[error("{0} address must not be zero")]
    ZeroAddress(&'static str),

    /// The poll loop would never run.
    #[error("max_poll_iterations must be at least 1")]
    ZeroIterations,
}

/// Configuration of the mock coprocessor and decryption poller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MockFhevmConfig {
    /// ACL contract, hashed into every computed handle.
    pub acl: Address,
    /// FHE executor contract whose calls are replayed.
    pub executor: Address,
    /// Gateway contract emitting decryption events.
    pub gateway: Address,
    /// Chain id, hashed into every computed handle.
    pub chain_id: u64,
    /// Backend selection.
    pub backend: BackendPreference,
    /// First block scanned by the coprocessor and the poller.
    pub start_block: u64,
    /// Bound on poll loop iterations.
    pub max_poll_iterations: usize,
    /// Overrides the backend's request id 0 behavior when set.
    pub skip_request_id_zero: Option<bool>,
    /// JSON snapshot of the clear-text store.
    pub cleartext_path: Option<PathBuf>,
    /// Seed for randomized operators.
    pub seed: Option<u64>,
}

impl Default for MockFhevmConfig {
    fn default() -> Self {
        Self {
            acl: DEFAULT_ACL,
            executor: DEFAULT_EXECUTOR,
            gateway: DEFAULT_GATEWAY,
            chain_id: DEFAULT_CHAIN_ID,
            backend: BackendPreference::Auto,
            start_block: 0,
            max_poll_iterations: DEFAULT_MAX_POLL_ITERATIONS,
            skip_request_id_zero: None,
            cleartext_path: None,
            seed: None,
        }
    }
}

impl MockFhevmConfig {
    /// Checks the configuration for values that cannot work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, address) in
            [("acl", self.acl), ("executor", self.executor), ("gateway", self.gateway)]
        {
            if address.is_zero() {
                return Err(ConfigError::ZeroAddress(name));
            }
        }
        if self.max_poll_iterations == 0 {
            return Err(ConfigError::ZeroIterations);
        }
        Ok(())
    }

    /// Resolves the request id 0 skip for `backend`.
    pub fn skips_request_id_zero(&self, backend: Backend) -> bool {
        self.skip_request_id_zero.unwrap_or(backend.capabilities().skips_request_id_zero)
    }

    /// Parses and validates a JSON configuration.
    pub fn from_json_str(s: &str) -> eyre::Result<Self> {
        let config: Self = serde_json::from_str(s).wrap_err("invalid JSON configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Parses and validates a TOML configuration.
    pub fn from_toml_str(s: &str) -> eyre::Result<Self> {
        let config: Self = toml::from_str(s).wrap_err("invalid TOML configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a configuration file, choosing the format from its extension.
    pub fn load(path: impl AsRef<Path>) -> eyre::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read {}", path.display()))?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Self::from_toml_str(&contents),
            Some("json") => Self::from_json_str(&contents),
            other => Err(eyre::eyre!("unsupported configuration format: {other:?}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MockKind, NativeKind};

    #[test]
    fn test_default_is_valid() {
        let config = MockFhevmConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_poll_iterations, 100);
        assert_eq!(config.chain_id, 31337);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = MockFhevmConfig::from_json_str(
            r#"{"chain_id": 9000, "backend": "mock", "seed": 7}"#,
        )
        .unwrap();
        assert_eq!(config.chain_id, 9000);
        assert_eq!(config.backend, BackendPreference::Mock);
        assert_eq!(config.seed, Some(7));
        assert_eq!(config.gateway, DEFAULT_GATEWAY);
    }

    #[test]
    fn test_toml() {
        let config = MockFhevmConfig::from_toml_str(
            r#"
            executor = "0x0000000000000000000000000000000000000042"
            max_poll_iterations = 5
            skip_request_id_zero = true
            cleartext_path = "cleartexts.json"
            "#,
        )
        .unwrap();
        assert_eq!(config.executor, Address::with_last_byte(0x42));
        assert_eq!(config.max_poll_iterations, 5);
        assert_eq!(config.skip_request_id_zero, Some(true));
        assert_eq!(config.cleartext_path, Some(PathBuf::from("cleartexts.json")));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = MockFhevmConfig { gateway: Address::ZERO, ..Default::default() };
        assert_eq!(config.validate(), Err(ConfigError::ZeroAddress("gateway")));

        let config = MockFhevmConfig { max_poll_iterations: 0, ..Default::default() };
        assert_eq!(config.validate(), Err(ConfigError::ZeroIterations));
        assert!(MockFhevmConfig::from_json_str(r#"{"max_poll_iterations": 0}"#).is_err());
    }

    #[test]
    fn test_request_id_zero_resolution() {
        let config = MockFhevmConfig::default();
        assert!(config.skips_request_id_zero(Backend::Native(NativeKind::Geth)));
        assert!(!config.skips_request_id_zero(Backend::Mock(MockKind::Anvil)));

        let forced = MockFhevmConfig { skip_request_id_zero: Some(true), ..Default::default() };
        assert!(forced.skips_request_id_zero(Backend::Mock(MockKind::Anvil)));
    }

    #[test]
    fn test_load_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fhevm.toml");
        std::fs::write(&path, "chain_id = 1\n").unwrap();
        assert_eq!(MockFhevmConfig::load(&path).unwrap().chain_id, 1);

        let path = dir.path().join("fhevm.yaml");
        std::fs::write(&path, "chain_id: 1\n").unwrap();
        assert!(MockFhevmConfig::load(&path).is_err());
    }
}
