use thiserror::Error;

#[derive(Error, Debug)]
pub enum FitlinkError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Failures of the live pub/sub connection.  These are retried with backoff
/// and surfaced as connection-state values, never returned to UI callers.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("Failed to connect to broadcaster: {0}")]
    Connect(String),

    #[error("Channel auth exchange failed (status {status:?}): {message}")]
    AuthExchange {
        status: Option<u16>,
        message: String,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection closed by remote")]
    Closed,

    #[error("Not connected")]
    NotConnected,

    #[error("Transient backend condition: {0}")]
    Transient(String),
}

impl TransportError {
    /// Whether a subscription attempt hitting this error is worth retrying
    /// (shared-state contention, broadcaster restart, 5xx from the auth
    /// endpoint).  Permanent failures such as a 403 are not.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Transient(_) => true,
            TransportError::AuthExchange { status, .. } => {
                matches!(status, Some(s) if *s >= 500 || *s == 423)
            }
            _ => false,
        }
    }
}

/// Failures of the consumed REST endpoints (accept/decline, lobby fetch,
/// pending-invitation fetch).  Reported to the caller, never retried
/// automatically.
#[derive(Error, Debug, Clone)]
pub enum ApiError {
    #[error("HTTP {code}: {message}")]
    Status { code: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Response decode error: {0}")]
    Decode(String),
}
