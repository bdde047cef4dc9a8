//! Certificate source strategies.
//!
//! Each source answers one question: can it produce the named certificate?
//! "Nothing here" ([`SourceOutcome::NotFound`]) is kept apart from "found
//! something but it is broken" ([`SourceOutcome::Failed`]) so the resolver
//! can report both.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tracing::{debug, info, warn};

use super::{CertificateError, CertificateOrigin, SigningCertificate};
use crate::config::{AppConfig, AzureAdConfig, ConfigError};
use crate::credential::{CredentialAuthenticator, CredentialStrategy, SecretStoreCredentialResolver};
use crate::deadline::Deadline;
use crate::secret::Secret;
use crate::vault::{VaultClient, VaultError, VaultSecret};

const PEM_CONTENT_TYPE: &str = "application/x-pem-file";
const PEM_MARKER: &str = "-----BEGIN";

/// Result of asking one source for a certificate.
#[derive(Debug)]
pub enum SourceOutcome {
    /// The source produced a usable certificate.
    Loaded(SigningCertificate),

    /// The source has nothing under this name.
    NotFound(String),

    /// The source found material but could not use it.
    Failed(CertificateError),
}

/// A place a signing certificate can be loaded from.
#[async_trait]
pub trait CertificateSource: Send + Sync {
    /// Origin tag stamped on certificates from this source.
    fn origin(&self) -> CertificateOrigin;

    /// Try to load the certificate called `name`.
    async fn try_load(&self, name: &str, deadline: &Deadline) -> SourceOutcome;
}

/// Loads a PEM bundle from an explicitly configured path.
#[derive(Debug, Clone)]
pub struct FilePathSource {
    path: PathBuf,
    password: Option<Secret>,
}

impl FilePathSource {
    pub fn new(path: impl Into<PathBuf>, password: Option<Secret>) -> Self {
        Self {
            path: path.into(),
            password,
        }
    }
}

#[async_trait]
impl CertificateSource for FilePathSource {
    fn origin(&self) -> CertificateOrigin {
        CertificateOrigin::FilePath
    }

    async fn try_load(&self, _name: &str, _deadline: &Deadline) -> SourceOutcome {
        load_file(&self.path, self.password.as_ref(), self.origin()).await
    }
}

/// Loads `<dir>/<name>.pem` from the developer certificate directory.
#[derive(Debug, Clone)]
pub struct LocalStoreSource {
    dir: PathBuf,
    password: Option<Secret>,
}

impl LocalStoreSource {
    pub fn new(dir: impl Into<PathBuf>, password: Option<Secret>) -> Self {
        Self {
            dir: dir.into(),
            password,
        }
    }

    /// Path the certificate called `name` would live at.
    pub fn path_for(&self, name: &str) -> Result<PathBuf, CertificateError> {
        let invalid = name.is_empty()
            || name == "."
            || name == ".."
            || name.contains(['/', '\\'])
            || name.contains('\0');
        if invalid {
            return Err(CertificateError::InvalidName {
                name: name.to_string(),
            });
        }
        Ok(self.dir.join(format!("{}.pem", name)))
    }
}

#[async_trait]
impl CertificateSource for LocalStoreSource {
    fn origin(&self) -> CertificateOrigin {
        CertificateOrigin::LocalStore
    }

    async fn try_load(&self, name: &str, _deadline: &Deadline) -> SourceOutcome {
        match self.path_for(name) {
            Ok(path) => load_file(&path, self.password.as_ref(), self.origin()).await,
            Err(e) => SourceOutcome::Failed(e),
        }
    }
}

async fn load_file(
    path: &Path,
    password: Option<&Secret>,
    origin: CertificateOrigin,
) -> SourceOutcome {
    debug!("Reading certificate bundle from {}", path.display());

    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return SourceOutcome::NotFound(format!("no file at {}", path.display()));
        }
        Err(source) => {
            return SourceOutcome::Failed(CertificateError::Io {
                path: path.display().to_string(),
                source,
            });
        }
    };

    match SigningCertificate::from_pem_bundle(&bytes, password, origin) {
        Ok(cert) => SourceOutcome::Loaded(cert),
        Err(e) => SourceOutcome::Failed(e),
    }
}

/// Reads the certificate from the remote secret vault.
///
/// The vault access credential comes from [`SecretStoreCredentialResolver`].
/// When the vault answers 401 the read is retried once with the configured
/// explicit secret, provided it differs from the strategy that just failed.
pub struct RemoteVaultSource {
    vault: Option<VaultClient>,
    resolver: SecretStoreCredentialResolver,
    azure_ad: AzureAdConfig,
    authenticator: Arc<CredentialAuthenticator>,
    scope: String,
    password: Option<Secret>,
}

impl RemoteVaultSource {
    pub fn new(
        vault: Option<VaultClient>,
        resolver: SecretStoreCredentialResolver,
        azure_ad: AzureAdConfig,
        authenticator: Arc<CredentialAuthenticator>,
        scope: impl Into<String>,
    ) -> Self {
        Self {
            vault,
            resolver,
            azure_ad,
            authenticator,
            scope: scope.into(),
            password: None,
        }
    }

    /// Password for an encrypted private key inside the vault secret.
    pub fn with_password(mut self, password: Option<Secret>) -> Self {
        self.password = password;
        self
    }

    /// Build the source from the application configuration.
    pub fn from_config(
        config: &AppConfig,
        resolver: SecretStoreCredentialResolver,
        authenticator: Arc<CredentialAuthenticator>,
    ) -> Result<Self, ConfigError> {
        let vault = match config
            .key_vault
            .vault_uri
            .as_deref()
            .map(str::trim)
            .filter(|uri| !uri.is_empty())
        {
            Some(uri) => Some(
                VaultClient::new(
                    uri,
                    config.key_vault.api_version.clone(),
                    config.request_timeout(),
                )
                .map_err(|e| ConfigError::Invalid {
                    key: "key_vault.vault_uri",
                    message: e.to_string(),
                })?,
            ),
            None => None,
        };

        let resolver = resolver.with_exclusions(config.key_vault.exclude_providers.iter().copied());

        Ok(Self::new(
            vault,
            resolver,
            config.azure_ad.clone(),
            authenticator,
            config.key_vault.scope.clone(),
        )
        .with_password(config.certificate.password.clone()))
    }

    async fn read_with(
        &self,
        vault: &VaultClient,
        strategy: &CredentialStrategy,
        name: &str,
        deadline: &Deadline,
    ) -> Result<VaultSecret, VaultError> {
        let token = self
            .authenticator
            .token(strategy, &self.scope, deadline)
            .await?;
        vault.get_secret(&token, name, deadline).await
    }

    async fn fetch(
        &self,
        vault: &VaultClient,
        name: &str,
        deadline: &Deadline,
    ) -> Result<VaultSecret, VaultError> {
        let strategy = self.resolver.resolve(&self.azure_ad);
        info!(
            "Reading certificate '{}' from vault {} using {}",
            name,
            vault.uri(),
            strategy.label()
        );

        match self.read_with(vault, &strategy, name, deadline).await {
            Err(VaultError::Unauthorized) => {
                let Some(retry) = self.resolver.retry_strategy(&self.azure_ad, &strategy) else {
                    warn!(
                        "Vault rejected {} and no different explicit credential is configured",
                        strategy.label()
                    );
                    return Err(VaultError::Unauthorized);
                };
                warn!(
                    "Vault rejected {}, retrying once with configured client secret",
                    strategy.label()
                );
                self.read_with(vault, &retry, name, deadline).await
            }
            other => other,
        }
    }
}

#[async_trait]
impl CertificateSource for RemoteVaultSource {
    fn origin(&self) -> CertificateOrigin {
        CertificateOrigin::RemoteVault
    }

    async fn try_load(&self, name: &str, deadline: &Deadline) -> SourceOutcome {
        let Some(vault) = &self.vault else {
            return SourceOutcome::NotFound("vault URI is not configured".to_string());
        };

        let secret = match self.fetch(vault, name, deadline).await {
            Ok(secret) => secret,
            Err(e) => return SourceOutcome::Failed(e.into()),
        };

        let bundle = match decode_secret(&secret) {
            Ok(bundle) => bundle,
            Err(e) => return SourceOutcome::Failed(e),
        };

        match SigningCertificate::from_pem_bundle(&bundle, self.password.as_ref(), self.origin()) {
            Ok(cert) => SourceOutcome::Loaded(cert),
            Err(e) => SourceOutcome::Failed(e),
        }
    }
}

/// Turn a vault secret value into PEM bundle bytes.
fn decode_secret(secret: &VaultSecret) -> Result<Vec<u8>, CertificateError> {
    let value = secret.value.expose().trim();
    let is_pem = value.starts_with(PEM_MARKER)
        || secret
            .content_type
            .as_deref()
            .is_some_and(|ct| ct.eq_ignore_ascii_case(PEM_CONTENT_TYPE));
    if is_pem {
        return Ok(value.as_bytes().to_vec());
    }

    let compact: String = value.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let decoded = STANDARD
        .decode(compact)
        .map_err(|e| CertificateError::Decode {
            message: format!("not base64: {}", e),
        })?;

    if !decoded
        .windows(PEM_MARKER.len())
        .any(|w| w == PEM_MARKER.as_bytes())
    {
        return Err(CertificateError::Decode {
            message: "decoded secret is not a PEM bundle".to_string(),
        });
    }
    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIGNING: &[u8] = include_bytes!("../../tests/fixtures/signing.pem");

    fn secret(value: &str, content_type: Option<&str>) -> VaultSecret {
        VaultSecret {
            value: Secret::new(value),
            content_type: content_type.map(String::from),
        }
    }

    #[test]
    fn test_decode_base64_bundle() {
        let encoded = STANDARD.encode(SIGNING);
        let decoded = decode_secret(&secret(&encoded, None)).unwrap();
        assert_eq!(decoded, SIGNING);
    }

    #[test]
    fn test_decode_raw_pem() {
        let pem = String::from_utf8(SIGNING.to_vec()).unwrap();
        let decoded = decode_secret(&secret(&pem, Some("application/x-pem-file"))).unwrap();
        assert!(decoded.starts_with(b"-----BEGIN"));
    }

    #[test]
    fn test_decode_rejects_non_pem() {
        let binary = STANDARD.encode([0x30u8, 0x82, 0x01, 0x02, 0x03]);
        assert!(matches!(
            decode_secret(&secret(&binary, Some("application/x-pkcs12"))),
            Err(CertificateError::Decode { .. })
        ));
        assert!(matches!(
            decode_secret(&secret("%%%", None)),
            Err(CertificateError::Decode { .. })
        ));
    }

    #[test]
    fn test_local_store_rejects_path_names() {
        let store = LocalStoreSource::new("certificates", None);
        assert_eq!(
            store.path_for("form-signing").unwrap(),
            PathBuf::from("certificates/form-signing.pem")
        );
        for bad in ["", "..", "../etc/passwd", "a\\b"] {
            assert!(matches!(
                store.path_for(bad),
                Err(CertificateError::InvalidName { .. })
            ));
        }
    }

    #[tokio::test]
    async fn test_file_path_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let source = FilePathSource::new(dir.path().join("absent.pem"), None);

        let outcome = source.try_load("ignored", &Deadline::none()).await;
        assert!(matches!(outcome, SourceOutcome::NotFound(_)));
    }

    #[tokio::test]
    async fn test_file_path_garbage_is_failed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.pem");
        std::fs::write(&path, "not a certificate").unwrap();

        let outcome = FilePathSource::new(&path, None)
            .try_load("ignored", &Deadline::none())
            .await;
        assert!(matches!(outcome, SourceOutcome::Failed(CertificateError::Parse { .. })));
    }

    #[tokio::test]
    async fn test_local_store_loads_named_bundle() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("form-signing.pem"), SIGNING).unwrap();

        let source = LocalStoreSource::new(dir.path(), None);
        match source.try_load("form-signing", &Deadline::none()).await {
            SourceOutcome::Loaded(cert) => {
                assert_eq!(cert.origin(), CertificateOrigin::LocalStore);
            }
            other => panic!("expected certificate, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unconfigured_vault_is_not_found() {
        let authenticator = Arc::new(CredentialAuthenticator::new(
            "https://login.example.invalid",
            crate::credential::AmbientChain::new(),
        ));
        let source = RemoteVaultSource::new(
            None,
            SecretStoreCredentialResolver::default(),
            AzureAdConfig::default(),
            authenticator,
            "https://vault.azure.net/.default",
        );

        let outcome = source.try_load("form-signing", &Deadline::none()).await;
        assert!(matches!(outcome, SourceOutcome::NotFound(_)));
    }
}
