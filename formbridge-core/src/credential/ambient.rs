//! Ambient credential providers and the chain that evaluates them.
//!
//! Providers are identified by [`AmbientProviderKind`]. The chain walks the
//! enabled kinds in order, skips kinds with no registered provider and
//! providers that report [`CredentialError::Unavailable`], and stops at the
//! first token. A hard authentication failure ends the walk.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{AmbientProviderKind, CredentialError};
use crate::deadline::Deadline;
use crate::token::{AccessToken, audience_of_scope};

/// A locally available source of identity.
#[async_trait]
pub trait AmbientProvider: Send + Sync {
    /// Which chain slot this provider fills.
    fn kind(&self) -> AmbientProviderKind;

    /// Obtain a token for `scope`.
    ///
    /// Return [`CredentialError::Unavailable`] when the provider cannot run
    /// here (tool missing, not signed in) so the chain can move on.
    async fn token(&self, scope: &str, deadline: &Deadline) -> Result<AccessToken, CredentialError>;
}

/// Ordered set of registered ambient providers.
#[derive(Clone, Default)]
pub struct AmbientChain {
    providers: Vec<Arc<dyn AmbientProvider>>,
}

impl std::fmt::Debug for AmbientChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kinds: Vec<_> = self.providers.iter().map(|p| p.kind()).collect();
        f.debug_struct("AmbientChain").field("providers", &kinds).finish()
    }
}

impl AmbientChain {
    /// Create an empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Chain with every provider this build can run.
    pub fn with_defaults(tenant_id: Option<String>) -> Self {
        let mut chain = Self::new();
        chain.register(CliTokenProvider::azure_cli(tenant_id.clone()));
        chain.register(CliTokenProvider::azure_developer_cli(tenant_id));
        chain
    }

    /// Register a provider. A later registration for the same kind wins.
    pub fn register(&mut self, provider: impl AmbientProvider + 'static) {
        let kind = provider.kind();
        self.providers.retain(|p| p.kind() != kind);
        self.providers.push(Arc::new(provider));
    }

    fn provider(&self, kind: AmbientProviderKind) -> Option<&Arc<dyn AmbientProvider>> {
        self.providers.iter().find(|p| p.kind() == kind)
    }

    /// Walk `enabled` in order and return the first token obtained.
    pub async fn token(
        &self,
        enabled: &[AmbientProviderKind],
        scope: &str,
        deadline: &Deadline,
    ) -> Result<AccessToken, CredentialError> {
        let mut tried = Vec::new();

        for kind in enabled {
            let Some(provider) = self.provider(*kind) else {
                debug!("No {} provider in this process, skipping", kind);
                continue;
            };

            match provider.token(scope, deadline).await {
                Ok(token) => {
                    info!("Ambient credential obtained from {}", kind);
                    return Ok(token);
                }
                Err(CredentialError::Unavailable { provider, reason }) => {
                    debug!("{} unavailable: {}", provider, reason);
                    tried.push(format!("{}: {}", provider, reason));
                }
                Err(e) => {
                    warn!("{} failed: {}", kind, e);
                    return Err(e);
                }
            }
        }

        Err(CredentialError::ChainExhausted { tried })
    }
}

/// Token provider backed by a developer CLI session.
#[derive(Debug, Clone)]
pub struct CliTokenProvider {
    kind: AmbientProviderKind,
    program: String,
    tenant_id: Option<String>,
}

impl CliTokenProvider {
    /// Azure CLI (`az account get-access-token`).
    pub fn azure_cli(tenant_id: Option<String>) -> Self {
        Self {
            kind: AmbientProviderKind::AzureCli,
            program: "az".to_string(),
            tenant_id,
        }
    }

    /// Azure Developer CLI (`azd auth token`).
    pub fn azure_developer_cli(tenant_id: Option<String>) -> Self {
        Self {
            kind: AmbientProviderKind::AzureDeveloperCli,
            program: "azd".to_string(),
            tenant_id,
        }
    }

    /// Use a different executable (tests, non-standard installs).
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn args(&self, scope: &str) -> Vec<String> {
        let mut args: Vec<String> = match self.kind {
            AmbientProviderKind::AzureDeveloperCli => {
                vec!["auth".into(), "token".into(), "--scope".into(), scope.into()]
            }
            _ => vec![
                "account".into(),
                "get-access-token".into(),
                "--scope".into(),
                scope.into(),
            ],
        };

        if let Some(tenant) = self.tenant_id.as_deref().filter(|t| !t.is_empty()) {
            let flag = match self.kind {
                AmbientProviderKind::AzureDeveloperCli => "--tenant-id",
                _ => "--tenant",
            };
            args.push(flag.into());
            args.push(tenant.into());
        }

        args.push("--output".into());
        args.push("json".into());
        args
    }

    fn unavailable(&self, reason: impl Into<String>) -> CredentialError {
        CredentialError::Unavailable {
            provider: self.kind,
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl AmbientProvider for CliTokenProvider {
    fn kind(&self) -> AmbientProviderKind {
        self.kind
    }

    async fn token(&self, scope: &str, deadline: &Deadline) -> Result<AccessToken, CredentialError> {
        debug!("Running {} for scope {}", self.program, scope);

        let output = deadline
            .bound(
                "ambient CLI credential",
                Command::new(&self.program)
                    .args(self.args(scope))
                    .stdin(Stdio::null())
                    .kill_on_drop(true)
                    .output(),
            )
            .await?;

        let output = match output {
            Ok(output) => output,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(self.unavailable(format!("{} not installed", self.program)));
            }
            Err(e) => return Err(self.unavailable(format!("failed to run {}: {}", self.program, e))),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let first_line = stderr.lines().next().unwrap_or("no output").trim().to_string();
            return Err(self.unavailable(format!(
                "{} exited with {}: {}",
                self.program, output.status, first_line
            )));
        }

        let (token, expires_at) = parse_cli_token(&output.stdout).map_err(|message| {
            CredentialError::AuthenticationFailed {
                source_name: self.kind.to_string(),
                message,
            }
        })?;

        Ok(AccessToken::new(
            token,
            expires_at,
            audience_of_scope(scope),
            vec![scope.to_string()],
        ))
    }
}

/// JSON printed by `az account get-access-token` and `azd auth token`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CliTokenOutput {
    #[serde(alias = "token")]
    access_token: String,

    /// Unix timestamp (newer `az` releases).
    #[serde(rename = "expires_on")]
    expires_on_unix: Option<i64>,

    /// `az`: local time `2024-01-01 10:00:00.000000`; `azd`: RFC 3339.
    expires_on: Option<String>,
}

fn parse_cli_token(stdout: &[u8]) -> Result<(String, DateTime<Utc>), String> {
    let parsed: CliTokenOutput = serde_json::from_slice(stdout)
        .map_err(|e| format!("unexpected CLI output: {}", e))?;

    let expires_at = parsed
        .expires_on_unix
        .and_then(|ts| DateTime::from_timestamp(ts, 0))
        .or_else(|| parsed.expires_on.as_deref().and_then(parse_cli_expiry))
        .ok_or_else(|| "CLI output carries no usable expiry".to_string())?;

    Ok((parsed.access_token, expires_at))
}

fn parse_cli_expiry(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }

    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .and_then(|naive| Local.from_local_datetime(&naive).earliest())
        .map(|local| local.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeProvider {
        kind: AmbientProviderKind,
        outcome: fn(AmbientProviderKind) -> Result<AccessToken, CredentialError>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl AmbientProvider for FakeProvider {
        fn kind(&self) -> AmbientProviderKind {
            self.kind
        }

        async fn token(&self, _scope: &str, _deadline: &Deadline) -> Result<AccessToken, CredentialError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.outcome)(self.kind)
        }
    }

    fn ok(kind: AmbientProviderKind) -> Result<AccessToken, CredentialError> {
        Ok(AccessToken::new(
            format!("{}-token", kind),
            Utc::now() + Duration::hours(1),
            "vault.azure.net",
            vec![],
        ))
    }

    fn unavailable(kind: AmbientProviderKind) -> Result<AccessToken, CredentialError> {
        Err(CredentialError::Unavailable {
            provider: kind,
            reason: "not signed in".into(),
        })
    }

    fn rejected(kind: AmbientProviderKind) -> Result<AccessToken, CredentialError> {
        Err(CredentialError::AuthenticationFailed {
            source_name: kind.to_string(),
            message: "AADSTS70002".into(),
        })
    }

    fn fake(
        kind: AmbientProviderKind,
        outcome: fn(AmbientProviderKind) -> Result<AccessToken, CredentialError>,
    ) -> (FakeProvider, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            FakeProvider {
                kind,
                outcome,
                calls: calls.clone(),
            },
            calls,
        )
    }

    #[tokio::test]
    async fn test_chain_skips_unavailable_and_stops_at_first_token() {
        let (cli, cli_calls) = fake(AmbientProviderKind::AzureCli, unavailable);
        let (azd, azd_calls) = fake(AmbientProviderKind::AzureDeveloperCli, ok);
        let (browser, browser_calls) = fake(AmbientProviderKind::InteractiveBrowser, ok);

        let mut chain = AmbientChain::new();
        chain.register(browser);
        chain.register(azd);
        chain.register(cli);

        let enabled = AmbientProviderKind::CHAIN_ORDER;
        let token = chain
            .token(&enabled, "https://vault.azure.net/.default", &Deadline::none())
            .await
            .unwrap();

        assert_eq!(token.secret().expose(), "azure_developer_cli-token");
        assert_eq!(cli_calls.load(Ordering::SeqCst), 1);
        assert_eq!(azd_calls.load(Ordering::SeqCst), 1);
        assert_eq!(browser_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_chain_never_calls_excluded_provider() {
        let (managed, managed_calls) = fake(AmbientProviderKind::ManagedIdentity, ok);
        let mut chain = AmbientChain::new();
        chain.register(managed);

        let enabled = [AmbientProviderKind::AzureCli];
        let err = chain
            .token(&enabled, "scope", &Deadline::none())
            .await
            .unwrap_err();

        assert!(matches!(err, CredentialError::ChainExhausted { .. }));
        assert_eq!(managed_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_chain_stops_on_authentication_failure() {
        let (cli, _) = fake(AmbientProviderKind::AzureCli, rejected);
        let (azd, azd_calls) = fake(AmbientProviderKind::AzureDeveloperCli, ok);
        let mut chain = AmbientChain::new();
        chain.register(cli);
        chain.register(azd);

        let err = chain
            .token(&AmbientProviderKind::CHAIN_ORDER, "scope", &Deadline::none())
            .await
            .unwrap_err();

        assert!(matches!(err, CredentialError::AuthenticationFailed { .. }));
        assert_eq!(azd_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_cli_is_unavailable() {
        let provider = CliTokenProvider::azure_cli(None)
            .with_program("formbridge-definitely-not-installed");

        let err = provider
            .token("https://vault.azure.net/.default", &Deadline::none())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            CredentialError::Unavailable {
                provider: AmbientProviderKind::AzureCli,
                ..
            }
        ));
    }

    #[test]
    fn test_cli_args_include_tenant() {
        let az = CliTokenProvider::azure_cli(Some("tenant-1".into()));
        let args = az.args("https://vault.azure.net/.default");
        assert_eq!(&args[..2], ["account", "get-access-token"]);
        assert!(args.windows(2).any(|w| w == ["--tenant", "tenant-1"]));

        let azd = CliTokenProvider::azure_developer_cli(Some("tenant-1".into()));
        let args = azd.args("scope");
        assert!(args.windows(2).any(|w| w == ["--tenant-id", "tenant-1"]));
        assert!(args.ends_with(&["--output".to_string(), "json".to_string()]));
    }

    #[test]
    fn test_parse_az_output_with_unix_expiry() {
        let stdout = br#"{"accessToken":"abc","expiresOn":"2030-01-01 10:00:00.000000","expires_on":1893492000,"tokenType":"Bearer"}"#;
        let (token, expires_at) = parse_cli_token(stdout).unwrap();
        assert_eq!(token, "abc");
        assert_eq!(expires_at.timestamp(), 1_893_492_000);
    }

    #[test]
    fn test_parse_azd_output() {
        let stdout = br#"{"token":"xyz","expiresOn":"2030-01-01T10:00:00Z"}"#;
        let (token, expires_at) = parse_cli_token(stdout).unwrap();
        assert_eq!(token, "xyz");
        assert_eq!(expires_at.to_rfc3339(), "2030-01-01T10:00:00+00:00");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_cli_token(b"Please run 'az login'").is_err());
    }
}
