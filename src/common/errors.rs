//! Error types for the engine

use thiserror::Error;

/// Result type alias using our EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// Main error type for engine operations
#[derive(Error, Debug)]
pub enum EngineError {
    /// WebSocket connection errors
    #[error("WebSocket connection error: {0}")]
    WebSocketConnection(String),

    /// WebSocket send/receive errors
    #[error("WebSocket communication error: {0}")]
    WebSocketCommunication(String),

    /// The stream client has no live connection
    #[error("Not connected: {0}")]
    NotConnected(String),

    /// A stream message could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// JSON serialization/deserialization errors
    #[error("JSON parsing error: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// Transient venue failure (network, overload, timeouts); retried
    #[error("Venue {venue} error: {message}")]
    VenueTransient { venue: String, message: String },

    /// Business rejection from a venue (e.g. insufficient balance); never retried
    #[error("Venue {venue} rejected order: {reason}")]
    VenueRejected { venue: String, reason: String },

    /// Risk gate refused the operation
    #[error("Risk limit: {0}")]
    RiskLimit(String),

    /// Position id is not in the open set
    #[error("Position not found: {0}")]
    PositionNotFound(String),

    /// Another close of the same position is already running
    #[error("Close already in flight for position {0}")]
    CloseInFlight(String),

    /// Illegal position state transition
    #[error("Position {id}: illegal transition {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: String,
        to: String,
    },

    /// Persistence failures (position store)
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Filesystem errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Timeout errors
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Channel send errors
    #[error("Channel send error: {0}")]
    ChannelSend(String),

    /// Generic internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Shorthand for a transient venue error
    pub fn transient(venue: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::VenueTransient {
            venue: venue.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a non-retryable venue rejection
    pub fn rejected(venue: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::VenueRejected {
            venue: venue.into(),
            reason: reason.into(),
        }
    }

    /// Whether a retry loop may try the operation again.
    ///
    /// Business rejections and local invariant violations are final; everything
    /// that smells like I/O is assumed transient.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            EngineError::VenueRejected { .. }
                | EngineError::RiskLimit(_)
                | EngineError::PositionNotFound(_)
                | EngineError::CloseInFlight(_)
                | EngineError::InvalidTransition { .. }
                | EngineError::Configuration(_)
        )
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for EngineError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        EngineError::WebSocketCommunication(err.to_string())
    }
}
