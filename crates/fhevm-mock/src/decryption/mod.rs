//! Decryption events and their correlation store.

pub mod events;
pub mod store;

pub use events::{
    DecryptionFulfilled, DecryptionRequestEvent, DecryptionRequested, DecryptionResultEvent,
    EventError, GatewayEvent, gateway_topics, parse_gateway_log,
};
pub use store::{CompletedDecryption, DecryptionError, DecryptionStore, EntryState, RequestEntry};
