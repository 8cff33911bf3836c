//! Gateway error types.

use thiserror::Error;

/// Gateway error type.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Record store error.
    #[error("Store error: {0}")]
    Store(#[from] record_store::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Upstream pub/sub connection is down.
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Client control message could not be parsed.
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// Client not found.
    #[error("Client not found: {0}")]
    ClientNotFound(String),

    /// Invalid channel name.
    #[error("Invalid channel: {0}")]
    InvalidChannel(String),

    /// Channel send error.
    #[error("Channel send error")]
    ChannelSend,

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl GatewayError {
    /// Short machine-readable code sent to clients alongside the message.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Store(_) | GatewayError::UpstreamUnavailable(_) => "UPSTREAM_UNAVAILABLE",
            GatewayError::Json(_) | GatewayError::MalformedPayload(_) => "MALFORMED_PAYLOAD",
            GatewayError::ClientNotFound(_) => "CLIENT_NOT_FOUND",
            GatewayError::InvalidChannel(_) => "INVALID_CHANNEL",
            GatewayError::ChannelSend => "TRANSPORT_BROKEN",
            GatewayError::Config(_) => "CONFIG",
        }
    }
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
