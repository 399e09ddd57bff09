#![doc = include_str!("../README.md")]
#![doc(issue_tracker_base_url = "https://github.com/base/node-reth/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]

pub mod backend;
pub use backend::{Backend, BackendPreference, Capabilities, MockKind, NativeKind, detect};

mod cleartext;
pub use cleartext::{
    ClearTextEntry, ClearTextFlags, ClearTextStore, ClearValue, StoreError, narrow, widen,
};

mod client;
pub use client::{AlloyChainClient, ChainClient, ClientError};

mod config;
pub use config::{
    ConfigError, DEFAULT_ACL, DEFAULT_CHAIN_ID, DEFAULT_EXECUTOR, DEFAULT_GATEWAY,
    DEFAULT_MAX_POLL_ITERATIONS, MockFhevmConfig,
};

pub mod coprocessor;
pub use coprocessor::{CoprocessorError, MockCoprocessor, ScanSummary};

pub mod decryption;
pub use decryption::{
    CompletedDecryption, DecryptionError, DecryptionRequestEvent, DecryptionResultEvent,
    DecryptionStore, EntryState, GatewayEvent,
};

mod fhevm;
pub use fhevm::{FhevmError, MockFhevm};

pub mod fulfill;
pub use fulfill::{DecryptedValue, FulfillError};

pub mod handle;
pub use handle::{FheType, Handle, HandleCodec, HandleError, Operand, Operator};

mod metrics;
pub use metrics::Metrics;

mod poller;
pub use poller::{DecryptionPoller, PollError, PollState, PollerConfig};
