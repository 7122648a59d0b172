use std::time::Duration;

/// Runtime configuration for plan execution.
#[derive(Debug, Clone)]
pub struct QuillConfig {
    /// Global ceiling on documents produced by scans but not yet consumed by
    /// the terminal sink, per execution.
    pub flow_control_permits: usize,
    /// Soft timeout for one non-isolated inner segment, armed after the
    /// segment's first output document.
    pub nonisolated_internal_timeout: Duration,
    /// A read-write non-isolated segment checkpoints early once this many
    /// documents are buffered or committing.
    pub nonisolated_rw_buffer_max: usize,
    /// Per-segment timeout while findAndModify searches for its first match.
    pub find_first_timeout: Duration,
    /// Timeout applied to each underlying transaction, in milliseconds.
    pub txn_timeout_ms: u64,
    /// How many times `on_error` will reset a transaction before giving up.
    pub txn_retry_limit: u64,
    /// Treat creation of an index whose key spec already exists as success.
    /// Matches the wire behavior legacy clients expect.
    pub index_exists_ok: bool,
}

impl Default for QuillConfig {
    fn default() -> Self {
        Self {
            flow_control_permits: 64,
            nonisolated_internal_timeout: Duration::from_secs(3),
            nonisolated_rw_buffer_max: 100,
            find_first_timeout: Duration::from_secs(1),
            txn_timeout_ms: 5_000,
            txn_retry_limit: 10,
            index_exists_ok: true,
        }
    }
}

impl QuillConfig {
    /// Profile with short timeouts, suitable for tests and local development.
    pub fn development() -> Self {
        Self {
            nonisolated_internal_timeout: Duration::from_millis(50),
            find_first_timeout: Duration::from_millis(50),
            txn_timeout_ms: 1_000,
            ..Self::default()
        }
    }

    pub fn with_flow_control_permits(mut self, permits: usize) -> Self {
        self.flow_control_permits = permits;
        self
    }

    pub fn with_nonisolated_internal_timeout(mut self, timeout: Duration) -> Self {
        self.nonisolated_internal_timeout = timeout;
        self
    }
}
