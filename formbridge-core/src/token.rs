//! Access tokens and token acquisition errors.
//!
//! This module provides:
//! - [`AccessToken`] - A bearer token bound to one audience host
//! - [`TokenError`] - Server-side versus client-side acquisition failures

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::secret::Secret;

/// Error type for certificate-bound token acquisition.
#[derive(Debug, Error)]
pub enum TokenError {
    /// The identity provider refused the assertion.
    ///
    /// Invalid client, unknown certificate or tenant misconfiguration. Retrying
    /// with the same certificate will not help.
    #[error("identity provider rejected the request ({code}): {description}")]
    IdentityProviderRejected { code: String, description: String },

    /// The request could not be completed locally.
    ///
    /// Network unreachable, malformed certificate or signing failure.
    #[error("token acquisition failed: {message}")]
    ClientSideAcquisitionFailed { message: String },
}

impl TokenError {
    pub(crate) fn client_side(message: impl Into<String>) -> Self {
        Self::ClientSideAcquisitionFailed {
            message: message.into(),
        }
    }

    /// Provider error code for server-side rejections.
    pub fn provider_code(&self) -> Option<&str> {
        match self {
            Self::IdentityProviderRejected { code, .. } => Some(code),
            Self::ClientSideAcquisitionFailed { .. } => None,
        }
    }
}

/// A bearer token scoped to a single resource host.
///
/// Never persisted. The raw value is only reachable through
/// [`secret()`](AccessToken::secret) and is redacted in Debug output.
#[derive(Debug, Clone)]
pub struct AccessToken {
    value: Secret,

    /// When the token stops being valid.
    pub expires_at: DateTime<Utc>,

    /// Host of the resource the token was issued for.
    pub audience: String,

    /// Scopes requested for the token.
    pub scopes: Vec<String>,
}

impl AccessToken {
    pub fn new(
        value: impl Into<String>,
        expires_at: DateTime<Utc>,
        audience: impl Into<String>,
        scopes: Vec<String>,
    ) -> Self {
        Self {
            value: Secret::new(value),
            expires_at,
            audience: audience.into(),
            scopes,
        }
    }

    /// The raw bearer value.
    pub fn secret(&self) -> &Secret {
        &self.value
    }

    /// Check if this token has expired.
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }

    /// Check if this token will expire within the given duration.
    pub fn expires_within(&self, duration: chrono::Duration) -> bool {
        self.expires_at < Utc::now() + duration
    }

    /// Whether this token may be presented to `host`.
    pub fn is_valid_for(&self, host: &str) -> bool {
        self.audience.eq_ignore_ascii_case(host)
    }
}

/// `.default` scope for a resource host.
pub fn default_scope_for(host: &str) -> String {
    format!("https://{}/.default", host)
}

/// Host part of a `https://host/.default` style scope.
pub fn audience_of_scope(scope: &str) -> String {
    url::Url::parse(scope)
        .ok()
        .and_then(|url| url.host_str().map(str::to_string))
        .unwrap_or_else(|| scope.to_string())
}
