//! Error taxonomy surfaced by the bus to every external surface.
//!
//! These are kinds, not transport errors: the HTTP layer maps each kind to a
//! status code and the MQTT/MCP adapters map them to their own envelopes.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    /// A prefix with no registered backend.
    #[error("no backend registered for prefix '{0}'")]
    NoAdapter(String),

    /// A zone that is neither cached nor resolvable by prefix.
    #[error("zone not found: {0}")]
    ZoneNotFound(String),

    /// The backend exists but does not implement the requested capability.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Malformed or out-of-range input from the caller.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Backend network failure.
    #[error("backend unreachable: {0}")]
    Unreachable(String),

    /// Backend authentication failure (after any retry).
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Anything a backend raised that fits no other kind.
    #[error("internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    /// Stable kind label used in activity entries and JSON error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoAdapter(_) => "NoAdapter",
            Self::ZoneNotFound(_) => "ZoneNotFound",
            Self::Unsupported(_) => "Unsupported",
            Self::BadRequest(_) => "BadRequest",
            Self::Unreachable(_) => "Unreachable",
            Self::Unauthorized(_) => "Unauthorized",
            Self::Internal(_) => "Internal",
        }
    }

    /// HTTP status the web layer maps this kind to.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::BadRequest(_) => 400,
            Self::Unauthorized(_) => 401,
            Self::NoAdapter(_) | Self::ZoneNotFound(_) => 404,
            Self::Unsupported(_) => 501,
            Self::Unreachable(_) => 502,
            Self::Internal(_) => 500,
        }
    }
}

impl From<anyhow::Error> for BridgeError {
    fn from(e: anyhow::Error) -> Self {
        match e.downcast::<BridgeError>() {
            Ok(bridge) => bridge,
            Err(other) => Self::Internal(other.to_string()),
        }
    }
}
