//! Top-level error types for Formbridge.

use thiserror::Error;

use crate::api::ApiError;
use crate::certificate::ResolutionAttempt;
use crate::config::ConfigError;
use crate::token::TokenError;

/// Top-level error type for the resolution, acquisition and API chain.
#[derive(Debug, Error)]
pub enum Error {
    /// Every certificate source came up empty or failed.
    #[error("certificate {name} unavailable ({})", format_attempts(.attempts))]
    CertificateUnavailable {
        name: String,
        attempts: Vec<ResolutionAttempt>,
    },

    /// Token acquisition failed.
    #[error("token error: {0}")]
    Token(#[from] TokenError),

    /// A remote API call failed after a token was obtained.
    #[error("remote API error: {0}")]
    RemoteApi(#[from] ApiError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The remote record store could not be set up.
    #[error("record store unavailable: {0}")]
    SinkUnavailable(String),
}

fn format_attempts(attempts: &[ResolutionAttempt]) -> String {
    if attempts.is_empty() {
        return "no sources configured".to_string();
    }
    attempts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
