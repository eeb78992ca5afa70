//! Error types for the metrics engine

use thiserror::Error;

/// Main error type for the metrics engine
#[derive(Error, Debug)]
pub enum Error {
    /// Record validation error
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Ingestion queue error
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Storage backend error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Validation errors
///
/// Raised at the ingestion boundary when a record draft cannot be promoted
/// to a valid metric record. A rejected draft never reaches the queue.
#[derive(Error, Debug)]
pub enum ValidationError {
    /// Required field is missing
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    /// Metric name is present but empty
    #[error("Metric name must not be empty")]
    EmptyName,

    /// Metric value is NaN or infinite
    #[error("Metric value must be finite, got {value}")]
    NonFiniteValue {
        /// The rejected value
        value: f64,
    },

    /// Tag key collides with a record field name
    #[error("Tag key '{0}' is reserved")]
    ReservedTagKey(String),

    /// Timestamp string could not be parsed
    #[error("Invalid timestamp '{input}': {message}")]
    InvalidTimestamp {
        /// The raw timestamp input
        input: String,
        /// Description of the parse failure
        message: String,
    },
}

/// Ingestion queue errors
#[derive(Error, Debug)]
pub enum QueueError {
    /// Connection to the queue backend failed
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Enqueue did not reach the queue (retryable by the producer)
    #[error("Enqueue failed: {0}")]
    EnqueueFailed(String),

    /// Reading deliveries from the queue failed
    #[error("Delivery failed: {0}")]
    DeliveryFailed(String),

    /// Acknowledgement did not reach the queue
    #[error("Ack failed for {id}: {reason}")]
    AckFailed {
        /// Delivery id that could not be acknowledged
        id: String,
        /// Description of the failure
        reason: String,
    },

    /// Queued payload could not be decoded (poison entry)
    #[error("Undecodable payload in {id}: {reason}")]
    DecodeFailed {
        /// Delivery id carrying the payload
        id: String,
        /// Description of the decode failure
        reason: String,
    },
}

/// Storage backend errors
///
/// Backend transport errors are mapped into these variants at the store
/// boundary; callers never see a raw driver error type.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Write did not persist
    #[error("Write failed on {backend}: {reason}")]
    WriteFailed {
        /// Backend identifier
        backend: String,
        /// Description of the failure
        reason: String,
    },

    /// Query did not complete
    #[error("Query failed on {backend}: {reason}")]
    QueryFailed {
        /// Backend identifier
        backend: String,
        /// Description of the failure
        reason: String,
    },

    /// Backend is unreachable
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// Persisted record could not be reconstructed
    #[error("Corrupt record: {0}")]
    CorruptRecord(String),

    /// Time range validation failed
    #[error("Invalid time range: start {start} > end {end}")]
    InvalidTimeRange {
        /// Start timestamp in milliseconds
        start: i64,
        /// End timestamp in milliseconds
        end: i64,
    },
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
