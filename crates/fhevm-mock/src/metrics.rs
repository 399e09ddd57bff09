//! Metrics for the mock coprocessor and decryption poller.

/// Container for metrics.
#[derive(Debug, Clone)]
pub struct Metrics;

impl Metrics {
    /// Identifier for the counter of executor calls evaluated in cleartext.
    pub const OPERATIONS: &str = "fhevm_mock_coprocessor_operations";

    /// Identifier for the counter of executor calls skipped as unsupported.
    pub const UNSUPPORTED_OPERATIONS: &str = "fhevm_mock_coprocessor_unsupported_operations";

    /// Identifier for the counter of executor calls and traces that failed to replay.
    pub const FAILED_OPERATIONS: &str = "fhevm_mock_coprocessor_failed_operations";

    /// Identifier for the gauge of stored cleartexts.
    pub const CLEARTEXT_ENTRIES: &str = "fhevm_mock_cleartext_entries";

    /// Identifier for the counter of ingested decryption requests.
    pub const REQUESTS: &str = "fhevm_mock_decryption_requests";

    /// Identifier for the counter of ingested decryption results.
    pub const RESULTS: &str = "fhevm_mock_decryption_results";

    /// Identifier for the gauge of requests still waiting for a result.
    pub const PENDING: &str = "fhevm_mock_decryption_pending";

    /// Identifier for the counter of fulfillment transactions sent.
    pub const FULFILLMENTS: &str = "fhevm_mock_poller_fulfillments";

    /// Identifier for the counter of detected chain reverts.
    pub const REVERTS: &str = "fhevm_mock_poller_reverts";

    /// Identifier for the counter of poll loop iterations.
    pub const POLL_ITERATIONS: &str = "fhevm_mock_poller_iterations";

    /// Identifier for the counter of transient errors retried by the poller.
    pub const TRANSIENT_ERRORS: &str = "fhevm_mock_poller_transient_errors";

    /// Initializes metrics.
    ///
    /// This does two things:
    /// * Describes the metrics.
    /// * Initializes gauges to 0 so they can be queried immediately.
    pub fn init() {
        Self::describe();
        Self::zero();
    }

    /// Describes metrics used in [`base_fhevm_mock`][crate].
    pub fn describe() {
        metrics::describe_counter!(Self::OPERATIONS, "Executor calls evaluated in cleartext");
        metrics::describe_counter!(
            Self::UNSUPPORTED_OPERATIONS,
            "Executor calls skipped because their selector is not modelled"
        );
        metrics::describe_counter!(
            Self::FAILED_OPERATIONS,
            "Executor calls or transaction traces skipped because they failed to replay"
        );
        metrics::describe_gauge!(Self::CLEARTEXT_ENTRIES, "Number of stored cleartexts");
        metrics::describe_counter!(Self::REQUESTS, "Decryption requests ingested");
        metrics::describe_counter!(Self::RESULTS, "Decryption results ingested");
        metrics::describe_gauge!(Self::PENDING, "Decryption requests waiting for a result");
        metrics::describe_counter!(Self::FULFILLMENTS, "Mock fulfillment transactions sent");
        metrics::describe_counter!(Self::REVERTS, "Chain reverts detected while polling");
        metrics::describe_counter!(Self::POLL_ITERATIONS, "Poll loop iterations");
        metrics::describe_counter!(Self::TRANSIENT_ERRORS, "Transient node errors retried");
    }

    fn zero() {
        metrics::gauge!(Self::CLEARTEXT_ENTRIES).set(0.0);
        metrics::gauge!(Self::PENDING).set(0.0);
    }
}
