//! Backend detection
//!
//! The node behind the client is either a local development chain, where the mock
//! coprocessor and relayer run in-process, or a native FHEVM node with a real
//! coprocessor and decryption oracle. What the poller may do depends on which one
//! it is talking to, captured in [`Capabilities`].

use serde::{Deserialize, Serialize};

/// Local development chains that run the mock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockKind {
    Hardhat,
    Anvil,
    /// Forced through configuration on an unrecognized node.
    Generic,
}

/// Nodes with a real coprocessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeKind {
    Geth,
    Reth,
    /// Forced through configuration on an unrecognized node.
    Generic,
}

/// The kind of node behind the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Unknown,
    Native(NativeKind),
    Mock(MockKind),
}

/// What the poller may rely on for a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Blocks can be produced on demand with `evm_mine`.
    pub supports_mining: bool,
    /// `debug_traceTransaction` returns struct logs with memory.
    pub supports_step_traces: bool,
    /// The in-process relayer fulfills decryption requests.
    pub supports_mock_fulfillment: bool,
    /// Request id 0 is never fulfilled and must not be waited for.
    pub skips_request_id_zero: bool,
}

impl Backend {
    /// Returns the capabilities of this backend.
    pub const fn capabilities(&self) -> Capabilities {
        match self {
            Self::Mock(_) => Capabilities {
                supports_mining: true,
                supports_step_traces: true,
                supports_mock_fulfillment: true,
                skips_request_id_zero: false,
            },
            Self::Native(_) => Capabilities {
                supports_mining: false,
                supports_step_traces: false,
                supports_mock_fulfillment: false,
                skips_request_id_zero: true,
            },
            Self::Unknown => Capabilities {
                supports_mining: false,
                supports_step_traces: false,
                supports_mock_fulfillment: false,
                skips_request_id_zero: false,
            },
        }
    }
}

/// Backend selection in configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendPreference {
    /// Detect from the client version.
    #[default]
    Auto,
    /// Always run the mock.
    Mock,
    /// Never run the mock.
    Native,
}

/// Classifies a node from its `web3_clientVersion` string.
pub fn detect(client_version: &str, preference: BackendPreference) -> Backend {
    let version = client_version.to_ascii_lowercase();
    let detected = if version.contains("hardhat") {
        Backend::Mock(MockKind::Hardhat)
    } else if version.contains("anvil") {
        Backend::Mock(MockKind::Anvil)
    } else if version.contains("reth") {
        Backend::Native(NativeKind::Reth)
    } else if version.contains("geth") {
        Backend::Native(NativeKind::Geth)
    } else {
        Backend::Unknown
    };

    match (preference, detected) {
        (BackendPreference::Auto, detected) => detected,
        (BackendPreference::Mock, mock @ Backend::Mock(_)) => mock,
        (BackendPreference::Mock, _) => Backend::Mock(MockKind::Generic),
        (BackendPreference::Native, native @ Backend::Native(_)) => native,
        (BackendPreference::Native, _) => Backend::Native(NativeKind::Generic),
    }
}
