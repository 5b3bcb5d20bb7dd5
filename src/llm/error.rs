//! Provider error types

use thiserror::Error;

/// Provider error with classification
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Auth, message)
    }

    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::RateLimit, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Network, message)
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::ServerError, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::InvalidRequest, message)
    }

    /// The stream ended before the provider signalled the end of the turn.
    /// The tool-call loop treats this exactly like an explicit error event.
    pub fn truncated(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Truncated, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Unknown, message)
    }
}

/// Error classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// Authentication failed (401, 403)
    Auth,
    /// Rate limited (429)
    RateLimit,
    /// Network issues, request timeouts
    Network,
    /// Server error (5xx) or mid-stream provider error event
    ServerError,
    /// Bad request (400)
    InvalidRequest,
    /// Stream dropped before the turn completed
    Truncated,
    /// Unknown error
    Unknown,
}
