//! Error types for the resmux client library.

use resmux_proto::ErrorObject;
use serde_json::Value;
use thiserror::Error;

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during client operations.
///
/// All variants are cloneable so a single failure can complete several
/// parked futures (connect waiters, shared fetches).
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Malformed frame, unmatched response, malformed event name, or an
    /// unsupported nested value in a change event.
    #[error("protocol error: {reason}")]
    Protocol { reason: String },

    /// Error response from the server, annotated with the originating
    /// request.
    #[error("server error (code {code}): {message}")]
    Resource {
        code: String,
        message: String,
        data: Option<Value>,
        method: String,
        params: Option<Value>,
    },

    /// Internal invariant violation, e.g. a removed model missing from the
    /// cache. Fatal for the affected resource; surfaced on the `error`
    /// channel.
    #[error("cache integrity violation: {reason}")]
    CacheIntegrity { reason: String },

    /// Transport failure: connect error, dropped connection, or an
    /// operation attempted against a closed connection.
    #[error("transport error: {reason}")]
    Transport { reason: String },

    /// Invalid configuration: malformed or duplicate model type id, bad
    /// URL.
    #[error("configuration error: {reason}")]
    Config { reason: String },
}

impl Error {
    pub(crate) fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol {
            reason: reason.into(),
        }
    }

    pub(crate) fn cache(reason: impl Into<String>) -> Self {
        Self::CacheIntegrity {
            reason: reason.into(),
        }
    }

    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport {
            reason: reason.into(),
        }
    }

    pub(crate) fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Builds a [`Error::Resource`] from a wire error object and the
    /// request it answers.
    pub(crate) fn server(error: ErrorObject, method: String, params: Option<Value>) -> Self {
        Self::Resource {
            code: error.code,
            message: error.message,
            data: error.data,
            method,
            params,
        }
    }

    /// Server error code, when this is a [`Error::Resource`].
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Resource { code, .. } => Some(code),
            _ => None,
        }
    }
}
