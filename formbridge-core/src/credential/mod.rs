//! Vault-access credential selection.
//!
//! This module provides:
//! - [`CredentialStrategy`] - How to prove identity to the secret vault
//! - [`SecretStoreCredentialResolver`] - Pure selection of a strategy from
//!   configuration and the process environment
//! - [`CredentialAuthenticator`] - Turns a strategy into a vault access token
//!
//! Selection never touches the network. An unusable ambient chain only fails
//! once [`CredentialAuthenticator::token`] actually exercises it.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use chrono::Utc;
use oauth2::basic::BasicClient;
use oauth2::reqwest::async_http_client;
use oauth2::{AuthType, AuthUrl, ClientId, ClientSecret, Scope, TokenResponse, TokenUrl};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::AzureAdConfig;
use crate::deadline::{Deadline, DeadlineExceeded};
use crate::secret::Secret;
use crate::token::{AccessToken, audience_of_scope};

pub mod ambient;

pub use ambient::{AmbientChain, AmbientProvider, CliTokenProvider};

/// Environment variable holding the tenant id for explicit credentials.
pub const ENV_TENANT_ID: &str = "AZURE_TENANT_ID";
/// Environment variable holding the client id for explicit credentials.
pub const ENV_CLIENT_ID: &str = "AZURE_CLIENT_ID";
/// Environment variable holding the client secret for explicit credentials.
pub const ENV_CLIENT_SECRET: &str = "AZURE_CLIENT_SECRET";

/// Error type for vault credential acquisition.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// The provider cannot run in this process; the chain moves on.
    #[error("{provider} unavailable: {reason}")]
    Unavailable {
        provider: AmbientProviderKind,
        reason: String,
    },

    /// Every enabled provider was unavailable.
    #[error("no ambient credential available (tried: {})", format_tried(.tried))]
    ChainExhausted { tried: Vec<String> },

    /// A provider ran and the identity provider refused it.
    #[error("{source_name} authentication failed: {message}")]
    AuthenticationFailed {
        source_name: String,
        message: String,
    },

    /// The caller's deadline passed.
    #[error(transparent)]
    Deadline(#[from] DeadlineExceeded),
}

fn format_tried(tried: &[String]) -> String {
    if tried.is_empty() {
        "none".to_string()
    } else {
        tried.join("; ")
    }
}

/// Identifiers of the ambient credential providers, in chain order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmbientProviderKind {
    Environment,
    WorkloadIdentity,
    ManagedIdentity,
    SharedTokenCache,
    VisualStudio,
    VisualStudioCode,
    AzureCli,
    AzurePowerShell,
    AzureDeveloperCli,
    InteractiveBrowser,
}

impl AmbientProviderKind {
    /// Fixed evaluation order of the ambient chain.
    pub const CHAIN_ORDER: [AmbientProviderKind; 10] = [
        Self::Environment,
        Self::WorkloadIdentity,
        Self::ManagedIdentity,
        Self::SharedTokenCache,
        Self::VisualStudio,
        Self::VisualStudioCode,
        Self::AzureCli,
        Self::AzurePowerShell,
        Self::AzureDeveloperCli,
        Self::InteractiveBrowser,
    ];

    /// Providers that are always excluded.
    ///
    /// Managed-identity probing stalls or errors outside supported hosting,
    /// and the shared token cache collides with other processes.
    pub const MANDATORY_EXCLUSIONS: [AmbientProviderKind; 2] =
        [Self::ManagedIdentity, Self::SharedTokenCache];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Environment => "environment",
            Self::WorkloadIdentity => "workload_identity",
            Self::ManagedIdentity => "managed_identity",
            Self::SharedTokenCache => "shared_token_cache",
            Self::VisualStudio => "visual_studio",
            Self::VisualStudioCode => "visual_studio_code",
            Self::AzureCli => "azure_cli",
            Self::AzurePowerShell => "azure_powershell",
            Self::AzureDeveloperCli => "azure_developer_cli",
            Self::InteractiveBrowser => "interactive_browser",
        }
    }
}

impl fmt::Display for AmbientProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// App-registration credential with a client secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExplicitSecret {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: Secret,
}

/// How the vault session proves its identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialStrategy {
    /// Client-credentials grant with a client secret.
    ExplicitSecret(ExplicitSecret),

    /// Ambient providers in chain order, minus the excluded ones.
    ChainedAmbient {
        excluded: BTreeSet<AmbientProviderKind>,
    },
}

impl CredentialStrategy {
    /// Providers the chain will evaluate, in order.
    ///
    /// Empty for [`CredentialStrategy::ExplicitSecret`].
    pub fn enabled_providers(&self) -> Vec<AmbientProviderKind> {
        match self {
            Self::ExplicitSecret(_) => Vec::new(),
            Self::ChainedAmbient { excluded } => AmbientProviderKind::CHAIN_ORDER
                .into_iter()
                .filter(|kind| !excluded.contains(kind))
                .collect(),
        }
    }

    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::ExplicitSecret(_) => "explicit client secret",
            Self::ChainedAmbient { .. } => "chained ambient credential",
        }
    }
}

/// Snapshot of the credential-related environment variables.
///
/// Captured once so strategy selection stays a pure function.
#[derive(Debug, Clone, Default)]
pub struct EnvSnapshot {
    pub tenant_id: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<Secret>,
}

impl EnvSnapshot {
    /// Read `AZURE_TENANT_ID`, `AZURE_CLIENT_ID` and `AZURE_CLIENT_SECRET`.
    pub fn capture() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a snapshot from an arbitrary lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            tenant_id: lookup(ENV_TENANT_ID),
            client_id: lookup(ENV_CLIENT_ID),
            client_secret: lookup(ENV_CLIENT_SECRET).map(Secret::new),
        }
    }
}

/// Chooses the vault-access [`CredentialStrategy`].
#[derive(Debug, Clone, Default)]
pub struct SecretStoreCredentialResolver {
    env: EnvSnapshot,
    extra_exclusions: BTreeSet<AmbientProviderKind>,
}

impl SecretStoreCredentialResolver {
    pub fn new(env: EnvSnapshot) -> Self {
        Self {
            env,
            extra_exclusions: BTreeSet::new(),
        }
    }

    /// Exclude more ambient providers on top of the mandatory ones.
    pub fn with_exclusions(mut self, kinds: impl IntoIterator<Item = AmbientProviderKind>) -> Self {
        self.extra_exclusions.extend(kinds);
        self
    }

    /// Select a strategy.
    ///
    /// Each of tenant id, client id and client secret is taken from the
    /// environment when set there, otherwise from `config`. All three present
    /// gives [`CredentialStrategy::ExplicitSecret`]; anything less falls back
    /// to the ambient chain with the mandatory exclusions.
    pub fn resolve(&self, config: &AzureAdConfig) -> CredentialStrategy {
        let tenant_id = pick(self.env.tenant_id.as_deref(), config.tenant_id.as_deref());
        let client_id = pick(self.env.client_id.as_deref(), config.client_id.as_deref());
        let client_secret = pick_secret(
            self.env.client_secret.as_ref(),
            config.client_secret.as_ref(),
        );

        match (tenant_id, client_id, client_secret) {
            (Some(tenant_id), Some(client_id), Some(client_secret)) => {
                debug!("Explicit client secret credential selected for vault access");
                CredentialStrategy::ExplicitSecret(ExplicitSecret {
                    tenant_id: tenant_id.to_string(),
                    client_id: client_id.to_string(),
                    client_secret: client_secret.clone(),
                })
            }
            _ => {
                let mut excluded: BTreeSet<AmbientProviderKind> =
                    AmbientProviderKind::MANDATORY_EXCLUSIONS.into_iter().collect();
                excluded.extend(self.extra_exclusions.iter().copied());
                debug!(
                    "Chained ambient credential selected for vault access, excluding {:?}",
                    excluded
                );
                CredentialStrategy::ChainedAmbient { excluded }
            }
        }
    }

    /// Strategy for the single retry after the vault answered 401.
    ///
    /// Built from the configured explicit values alone. Returns `None` when
    /// they are incomplete or identical to `original`.
    pub fn retry_strategy(
        &self,
        config: &AzureAdConfig,
        original: &CredentialStrategy,
    ) -> Option<CredentialStrategy> {
        let tenant_id = pick(None, config.tenant_id.as_deref())?;
        let client_id = pick(None, config.client_id.as_deref())?;
        let client_secret = pick_secret(None, config.client_secret.as_ref())?;

        let retry = CredentialStrategy::ExplicitSecret(ExplicitSecret {
            tenant_id: tenant_id.to_string(),
            client_id: client_id.to_string(),
            client_secret: client_secret.clone(),
        });

        (retry != *original).then_some(retry)
    }
}

fn pick<'a>(env: Option<&'a str>, config: Option<&'a str>) -> Option<&'a str> {
    env.map(str::trim)
        .filter(|v| !v.is_empty())
        .or_else(|| config.map(str::trim).filter(|v| !v.is_empty()))
}

fn pick_secret<'a>(env: Option<&'a Secret>, config: Option<&'a Secret>) -> Option<&'a Secret> {
    env.filter(|s| !s.is_blank())
        .or_else(|| config.filter(|s| !s.is_blank()))
}

/// Obtains vault access tokens for a [`CredentialStrategy`].
pub struct CredentialAuthenticator {
    authority_host: String,
    chain: AmbientChain,
}

impl CredentialAuthenticator {
    pub fn new(authority_host: impl Into<String>, chain: AmbientChain) -> Self {
        Self {
            authority_host: authority_host.into(),
            chain,
        }
    }

    /// Acquire a token for `scope` using `strategy`.
    pub async fn token(
        &self,
        strategy: &CredentialStrategy,
        scope: &str,
        deadline: &Deadline,
    ) -> Result<AccessToken, CredentialError> {
        match strategy {
            CredentialStrategy::ExplicitSecret(explicit) => {
                info!(
                    "Requesting vault token with client secret credential for client {}",
                    explicit.client_id
                );
                self.client_secret_token(explicit, scope, deadline).await
            }
            CredentialStrategy::ChainedAmbient { .. } => {
                let enabled = strategy.enabled_providers();
                info!("Requesting vault token through ambient chain {:?}", enabled);
                self.chain.token(&enabled, scope, deadline).await
            }
        }
    }

    async fn client_secret_token(
        &self,
        explicit: &ExplicitSecret,
        scope: &str,
        deadline: &Deadline,
    ) -> Result<AccessToken, CredentialError> {
        let failed = |message: String| CredentialError::AuthenticationFailed {
            source_name: "client secret credential".to_string(),
            message,
        };

        let base = format!(
            "{}/{}/oauth2/v2.0",
            self.authority_host.trim_end_matches('/'),
            explicit.tenant_id
        );
        let auth_url = AuthUrl::new(format!("{}/authorize", base))
            .map_err(|e| failed(format!("invalid authority URL: {}", e)))?;
        let token_url = TokenUrl::new(format!("{}/token", base))
            .map_err(|e| failed(format!("invalid token URL: {}", e)))?;

        let client = BasicClient::new(
            ClientId::new(explicit.client_id.clone()),
            Some(ClientSecret::new(explicit.client_secret.expose().to_string())),
            auth_url,
            Some(token_url),
        )
        .set_auth_type(AuthType::RequestBody);

        let response = deadline
            .bound(
                "vault credential exchange",
                client
                    .exchange_client_credentials()
                    .add_scope(Scope::new(scope.to_string()))
                    .request_async(async_http_client),
            )
            .await?
            .map_err(|e| failed(e.to_string()))?;

        let expires_in = response.expires_in().unwrap_or(Duration::from_secs(3600));
        let expires_at = Utc::now()
            + chrono::Duration::from_std(expires_in)
                .map_err(|e| failed(format!("invalid expiration duration: {}", e)))?;

        Ok(AccessToken::new(
            response.access_token().secret().to_string(),
            expires_at,
            audience_of_scope(scope),
            vec![scope.to_string()],
        ))
    }
}
