//! Application configuration.
//!
//! Settings come from a TOML file (default location under the platform config
//! directory) with a small set of environment overrides layered on top. The
//! vault credential values in `[azure_ad]` are additionally subject to the
//! `AZURE_*` environment precedence applied by
//! [`SecretStoreCredentialResolver`](crate::credential::SecretStoreCredentialResolver).

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::Deserialize;
use thiserror::Error;

use crate::credential::AmbientProviderKind;
use crate::secret::Secret;

/// Default authority host for the identity provider.
pub const DEFAULT_AUTHORITY_HOST: &str = "https://login.microsoftonline.com";

/// Default scope for vault access tokens.
pub const DEFAULT_VAULT_SCOPE: &str = "https://vault.azure.net/.default";

/// Default vault REST API version.
pub const DEFAULT_VAULT_API_VERSION: &str = "7.4";

/// Default number of seconds before expiry at which a cached token is stale.
const DEFAULT_EXPIRY_BUFFER_SECS: u64 = 300;

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Error type for configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config from {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML for [`AppConfig`].
    #[error("failed to parse config from {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// A required setting is absent or empty.
    #[error("{key} configuration is missing")]
    Missing { key: &'static str },

    /// A setting is present but unusable.
    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

/// Vault location and access settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KeyVaultConfig {
    /// Base URI of the secret vault.
    pub vault_uri: Option<String>,

    /// Developer-mode switch: enables the local certificate store.
    pub use_local_secrets: bool,

    /// Scope requested for vault access tokens.
    pub scope: String,

    /// Vault REST API version.
    pub api_version: String,

    /// Ambient providers to exclude in addition to the mandatory exclusions.
    pub exclude_providers: Vec<AmbientProviderKind>,
}

impl Default for KeyVaultConfig {
    fn default() -> Self {
        Self {
            vault_uri: None,
            use_local_secrets: false,
            scope: DEFAULT_VAULT_SCOPE.to_string(),
            api_version: DEFAULT_VAULT_API_VERSION.to_string(),
            exclude_providers: Vec::new(),
        }
    }
}

/// Explicit app-registration credential used for vault access.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AzureAdConfig {
    pub tenant_id: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<Secret>,
}

/// Where to find the signing certificate.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CertificateConfig {
    /// Certificate name; also the vault secret name and local file stem.
    pub name: Option<String>,

    /// Explicit path to a PEM bundle.
    pub path: Option<PathBuf>,

    /// Password for an encrypted private key.
    pub password: Option<Secret>,

    /// Directory searched in developer mode.
    pub local_dir: PathBuf,
}

impl Default for CertificateConfig {
    fn default() -> Self {
        Self {
            name: None,
            path: None,
            password: None,
            local_dir: PathBuf::from("certificates"),
        }
    }
}

/// Remote site and the app registration bound to the certificate.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    pub url: Option<String>,
    pub list_name: Option<String>,
    pub tenant_id: Option<String>,
    pub client_id: Option<String>,
}

/// Identity provider settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub authority_host: String,
    pub cache_tokens: bool,
    pub expiry_buffer_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            authority_host: DEFAULT_AUTHORITY_HOST.to_string(),
            cache_tokens: false,
            expiry_buffer_secs: DEFAULT_EXPIRY_BUFFER_SECS,
            request_timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

/// Form submission settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SubmissionConfig {
    /// Budget for the best-effort record write. Zero disables the deadline.
    pub write_timeout_secs: u64,
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self {
            write_timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

/// Complete application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub key_vault: KeyVaultConfig,
    pub azure_ad: AzureAdConfig,
    pub certificate: CertificateConfig,
    pub site: SiteConfig,
    pub identity: IdentityConfig,
    pub submission: SubmissionConfig,

    /// Path of the file this configuration was loaded from.
    #[serde(skip)]
    pub config_path: Option<PathBuf>,
}

/// Tenant and client id of the certificate-bound app registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppIdentity {
    pub tenant_id: String,
    pub client_id: String,
}

impl AppConfig {
    /// Parse configuration from a TOML string.
    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Load configuration from `path`, or from the default location.
    ///
    /// A missing file yields defaults. Environment overrides are applied
    /// after parsing.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with_env(path, |key| std::env::var(key).ok())
    }

    /// [`load`](Self::load) with environment lookups served by `lookup`.
    pub fn load_with_env(
        path: Option<&Path>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let config_path = path.map(Path::to_path_buf).or_else(default_config_path);

        let mut config = match &config_path {
            Some(path) if path.exists() => {
                let contents =
                    std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                        path: path.clone(),
                        source,
                    })?;
                Self::from_toml(&contents).map_err(|source| ConfigError::Parse {
                    path: path.clone(),
                    source,
                })?
            }
            _ => {
                tracing::debug!("No config file at {:?}, using defaults", config_path);
                Self::default()
            }
        };

        config.config_path = config_path;
        config.apply_env_overrides(lookup);
        Ok(config)
    }

    /// Layer environment overrides on top of the file settings.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |keys: &[&str]| {
            keys.iter()
                .filter_map(|key| lookup(*key))
                .find(|value| !value.trim().is_empty())
        };

        if let Some(uri) = get(&["FORMBRIDGE_VAULT_URI", "VaultUri"]) {
            self.key_vault.vault_uri = Some(uri);
        }
        if let Some(flag) = get(&["FORMBRIDGE_USE_LOCAL_SECRETS"]) {
            self.key_vault.use_local_secrets = matches!(
                flag.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }
        if let Some(name) = get(&["FORMBRIDGE_CERTIFICATE_NAME"]) {
            self.certificate.name = Some(name);
        }
        if let Some(path) = get(&["FORMBRIDGE_CERTIFICATE_PATH"]) {
            self.certificate.path = Some(PathBuf::from(path));
        }
        if let Some(password) = get(&["FORMBRIDGE_CERTIFICATE_PASSWORD"]) {
            self.certificate.password = Some(Secret::new(password));
        }
        if let Some(url) = get(&["FORMBRIDGE_SITE_URL"]) {
            self.site.url = Some(url);
        }
        if let Some(list) = get(&["FORMBRIDGE_LIST_NAME"]) {
            self.site.list_name = Some(list);
        }
    }

    /// Check that everything the submission path needs is present.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.certificate_name()?;
        self.site_url()?;
        self.list_name()?;
        self.app_identity()?;
        if self.identity.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "identity.request_timeout_secs",
                message: "must be at least 1 second".to_string(),
            });
        }
        if let Some(uri) = non_empty(&self.key_vault.vault_uri) {
            url::Url::parse(uri).map_err(|e| ConfigError::Invalid {
                key: "key_vault.vault_uri",
                message: e.to_string(),
            })?;
        }
        Ok(())
    }

    /// Developer mode enables the local certificate store.
    pub fn developer_mode(&self) -> bool {
        self.key_vault.use_local_secrets
    }

    pub fn certificate_name(&self) -> Result<&str, ConfigError> {
        non_empty(&self.certificate.name).ok_or(ConfigError::Missing {
            key: "certificate.name",
        })
    }

    pub fn site_url(&self) -> Result<&str, ConfigError> {
        non_empty(&self.site.url).ok_or(ConfigError::Missing { key: "site.url" })
    }

    pub fn list_name(&self) -> Result<&str, ConfigError> {
        non_empty(&self.site.list_name).ok_or(ConfigError::Missing {
            key: "site.list_name",
        })
    }

    /// Identity used for the certificate assertion.
    ///
    /// `[site]` ids win; `[azure_ad]` ids are the fallback.
    pub fn app_identity(&self) -> Result<AppIdentity, ConfigError> {
        let tenant_id = non_empty(&self.site.tenant_id)
            .or_else(|| non_empty(&self.azure_ad.tenant_id))
            .ok_or(ConfigError::Missing {
                key: "site.tenant_id",
            })?;
        let client_id = non_empty(&self.site.client_id)
            .or_else(|| non_empty(&self.azure_ad.client_id))
            .ok_or(ConfigError::Missing {
                key: "site.client_id",
            })?;

        Ok(AppIdentity {
            tenant_id: tenant_id.to_string(),
            client_id: client_id.to_string(),
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.identity.request_timeout_secs)
    }

    /// Write budget for the best-effort record creation.
    pub fn write_timeout(&self) -> Option<Duration> {
        match self.submission.write_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Effective non-empty settings, without secrets or passwords.
    pub fn redacted_entries(&self) -> Vec<(String, String)> {
        let mut entries: Vec<(String, String)> = vec![
            ("key_vault.vault_uri".into(), opt(&self.key_vault.vault_uri)),
            (
                "key_vault.use_local_secrets".into(),
                self.key_vault.use_local_secrets.to_string(),
            ),
            ("key_vault.scope".into(), self.key_vault.scope.clone()),
            ("key_vault.api_version".into(), self.key_vault.api_version.clone()),
            (
                "key_vault.exclude_providers".into(),
                self.key_vault
                    .exclude_providers
                    .iter()
                    .map(|kind| kind.as_str())
                    .collect::<Vec<_>>()
                    .join(","),
            ),
            ("azure_ad.tenant_id".into(), opt(&self.azure_ad.tenant_id)),
            ("azure_ad.client_id".into(), opt(&self.azure_ad.client_id)),
            (
                "azure_ad.client_secret".into(),
                self.azure_ad
                    .client_secret
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_default(),
            ),
            ("certificate.name".into(), opt(&self.certificate.name)),
            (
                "certificate.path".into(),
                self.certificate
                    .path
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default(),
            ),
            (
                "certificate.password".into(),
                self.certificate
                    .password
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_default(),
            ),
            (
                "certificate.local_dir".into(),
                self.certificate.local_dir.display().to_string(),
            ),
            ("site.url".into(), opt(&self.site.url)),
            ("site.list_name".into(), opt(&self.site.list_name)),
            ("site.tenant_id".into(), opt(&self.site.tenant_id)),
            ("site.client_id".into(), opt(&self.site.client_id)),
            ("identity.authority_host".into(), self.identity.authority_host.clone()),
            (
                "identity.cache_tokens".into(),
                self.identity.cache_tokens.to_string(),
            ),
            (
                "submission.write_timeout_secs".into(),
                self.submission.write_timeout_secs.to_string(),
            ),
        ];

        entries.retain(|(key, value)| {
            let key = key.to_ascii_lowercase();
            !key.contains("secret") && !key.contains("password") && !value.is_empty()
        });
        entries.sort();
        entries
    }
}

/// Default configuration file location.
pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("com", "raibid-labs", "formbridge")
        .map(|dirs| dirs.config_dir().join("formbridge.toml"))
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn opt(value: &Option<String>) -> String {
    value.clone().unwrap_or_default()
}
