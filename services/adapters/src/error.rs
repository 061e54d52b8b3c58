//! Error types for the adapters module
//!
//! Startup-phase errors (`ConfigError`, `ConnectionError`, `SubscriptionError`,
//! `SecretError`) end an adapter run and are returned to its owner. Per-message
//! errors (`MessageProcessingError`) and `UnsubscribeError` are logged and
//! counted, never returned from `start_listening`.

use thiserror::Error;

pub use types::ConfigError;

/// Result type alias for adapter operations
pub type Result<T> = std::result::Result<T, AdapterError>;

/// Failure of a single transport operation
#[derive(Debug, Error)]
pub enum TransportError {
    /// WebSocket protocol or connection failure
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// I/O error during network or filesystem operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Address could not be used to build a connection
    #[error("invalid address {address}: {reason}")]
    InvalidAddress {
        /// The rejected address
        address: String,
        /// Why it was rejected
        reason: String,
    },

    /// Operation needs a live connection
    #[error("not connected")]
    NotConnected,

    /// Remote end refused the operation
    #[error("rejected by remote: {0}")]
    Rejected(String),

    /// Operation did not finish in time
    #[error("timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout in milliseconds
        timeout_ms: u64,
    },
}

/// Terminal connection failure after the backoff policy was exhausted
#[derive(Debug, Error)]
#[error("failed to connect to {address} after {attempts} attempt(s): {source}")]
pub struct ConnectionError {
    /// Target address
    pub address: String,
    /// Attempts made before giving up
    pub attempts: u32,
    /// Last attempt's failure
    #[source]
    pub source: TransportError,
}

/// Channel registration failed on an established connection
#[derive(Debug, Error)]
#[error("failed to subscribe to channel {channel}: {source}")]
pub struct SubscriptionError {
    /// Channel that could not be registered
    pub channel: String,
    /// Transport failure
    #[source]
    pub source: TransportError,
}

/// Best-effort unsubscribe failed
#[derive(Debug, Error)]
#[error("failed to unsubscribe from channel {channel}: {source}")]
pub struct UnsubscribeError {
    /// Channel that was being released
    pub channel: String,
    /// Transport failure
    #[source]
    pub source: TransportError,
}

/// Secret or TLS material could not be resolved
#[derive(Debug, Error)]
pub enum SecretError {
    /// Secret file could not be read
    #[error("failed to retrieve secret {secret} from {path:?}: {source}")]
    Read {
        /// Secret reference in `name/key` form
        secret: String,
        /// File that was read
        path: std::path::PathBuf,
        /// Underlying I/O failure
        #[source]
        source: std::io::Error,
    },

    /// Secret exists but holds nothing
    #[error("secret {secret} is empty")]
    Empty {
        /// Secret reference in `name/key` form
        secret: String,
    },

    /// Secret bytes are not valid UTF-8 where text is required
    #[error("secret {secret} is not valid UTF-8")]
    NotUtf8 {
        /// Secret reference in `name/key` form
        secret: String,
    },

    /// TLS material could not be assembled
    #[error("failed to get the tls configuration: {0}")]
    Tls(String),
}

/// Failure of the dispatch pipeline for one event
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Pipeline no longer accepts events
    #[error("dispatch pipeline closed")]
    Closed,

    /// I/O error writing to the pipeline
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Pipeline refused the event
    #[error("dispatch rejected: {0}")]
    Rejected(String),
}

/// Per-message failure; counted and logged, never fatal to the subscription
#[derive(Debug, Error)]
pub enum MessageProcessingError {
    /// Envelope could not be serialized
    #[error("failed to marshal the event data: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Body was declared JSON but is not valid UTF-8
    #[error("event body declared as JSON is not valid UTF-8")]
    BodyNotUtf8,

    /// Pipeline returned an error
    #[error("failed to dispatch event: {0}")]
    Dispatch(#[from] DispatchError),

    /// Pipeline did not return within the configured dispatch timeout
    #[error("dispatch timed out after {timeout_ms}ms")]
    DispatchTimeout {
        /// Timeout in milliseconds
        timeout_ms: u64,
    },
}

/// Error returned to the owner of an adapter run
#[derive(Debug, Error)]
pub enum AdapterError {
    /// Descriptor was malformed or incomplete
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Connection could not be established
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Channel registration failed
    #[error(transparent)]
    Subscription(#[from] SubscriptionError),

    /// Credential or TLS material could not be resolved
    #[error(transparent)]
    Secret(#[from] SecretError),

    /// Cancellation arrived before the subscription was established
    #[error("event source {event_name} was cancelled before it subscribed")]
    Cancelled {
        /// Event name of the adapter
        event_name: String,
    },

    /// The instance already ran once; adapters are not restartable
    #[error("event source {event_name} was already started, create a new instance to listen again")]
    AlreadyStarted {
        /// Event name of the adapter
        event_name: String,
    },
}

impl AdapterError {
    /// Whether restarting with the same descriptor cannot help
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            AdapterError::Config(_) | AdapterError::Secret(_) | AdapterError::AlreadyStarted { .. }
        )
    }

    /// Whether an owner may reasonably restart a fresh instance
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AdapterError::Connection(_) | AdapterError::Subscription(_)
        )
    }
}
