//! Remote secret vault client.
//!
//! Speaks the vault REST protocol: read a named secret and list secret names.
//! Every call carries a vault access token obtained by
//! [`CredentialAuthenticator`](crate::credential::CredentialAuthenticator).

use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::credential::CredentialError;
use crate::deadline::{Deadline, DeadlineExceeded};
use crate::secret::Secret;
use crate::token::AccessToken;

/// Upper bound on list pages followed by [`VaultClient::list_secrets`].
const MAX_LIST_PAGES: usize = 20;

/// Error type for vault operations.
#[derive(Debug, Error)]
pub enum VaultError {
    /// The secret name is not a valid vault secret name.
    #[error("invalid vault secret name '{name}'")]
    InvalidSecretName { name: String },

    /// The vault URI could not be parsed.
    #[error("invalid vault URI {uri}: {message}")]
    InvalidUri { uri: String, message: String },

    /// The vault rejected the token (HTTP 401).
    #[error("vault rejected the credential (401 unauthorized)")]
    Unauthorized,

    /// The credential is valid but lacks permission (HTTP 403).
    #[error("vault denied access to {name} (403 forbidden)")]
    Forbidden { name: String },

    /// The secret does not exist.
    #[error("secret {name} not found in vault")]
    SecretNotFound { name: String },

    /// Any other non-success status.
    #[error("vault returned {status}: {message}")]
    Status { status: u16, message: String },

    /// The request never completed.
    #[error("vault request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The response body was not what the protocol promises.
    #[error("unexpected vault response: {message}")]
    InvalidResponse { message: String },

    /// A vault access token could not be obtained.
    #[error("vault credential error: {0}")]
    Credential(#[from] CredentialError),

    /// The caller's deadline passed.
    #[error(transparent)]
    Deadline(#[from] DeadlineExceeded),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SecretBundle {
    value: Option<String>,
    content_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SecretListPage {
    #[serde(default)]
    value: Vec<SecretItem>,
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SecretItem {
    id: String,
}

/// A secret value as stored in the vault.
#[derive(Debug, Clone)]
pub struct VaultSecret {
    pub value: Secret,
    pub content_type: Option<String>,
}

/// HTTP client for one vault.
#[derive(Debug, Clone)]
pub struct VaultClient {
    base: Url,
    api_version: String,
    http: reqwest::Client,
}

impl VaultClient {
    /// Create a client for the vault at `vault_uri`.
    pub fn new(
        vault_uri: &str,
        api_version: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, VaultError> {
        let mut base = Url::parse(vault_uri).map_err(|e| VaultError::InvalidUri {
            uri: vault_uri.to_string(),
            message: e.to_string(),
        })?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(VaultError::Transport)?;

        Ok(Self {
            base,
            api_version: api_version.into(),
            http,
        })
    }

    /// Base URI of the vault.
    pub fn uri(&self) -> &Url {
        &self.base
    }

    /// Read the current version of secret `name`.
    pub async fn get_secret(
        &self,
        token: &AccessToken,
        name: &str,
        deadline: &Deadline,
    ) -> Result<VaultSecret, VaultError> {
        if !is_valid_secret_name(name) {
            return Err(VaultError::InvalidSecretName {
                name: name.to_string(),
            });
        }
        let url = self
            .base
            .join(&format!("secrets/{}", name))
            .map_err(|e| VaultError::InvalidUri {
                uri: self.base.to_string(),
                message: e.to_string(),
            })?;

        info!("Requesting secret '{}' from vault {}", name, self.base);

        let response = deadline
            .bound(
                "vault secret read",
                self.http
                    .get(url)
                    .query(&[("api-version", self.api_version.as_str())])
                    .bearer_auth(token.secret().expose())
                    .send(),
            )
            .await??;

        let response = check_status(response, name).await?;
        let bundle: SecretBundle = deadline
            .bound("vault secret read", response.json())
            .await??;

        let value = bundle
            .value
            .filter(|v| !v.is_empty())
            .ok_or_else(|| VaultError::SecretNotFound {
                name: name.to_string(),
            })?;

        debug!("Secret '{}' retrieved", name);
        Ok(VaultSecret {
            value: Secret::new(value),
            content_type: bundle.content_type,
        })
    }

    /// List secret names, following continuation links.
    pub async fn list_secrets(
        &self,
        token: &AccessToken,
        deadline: &Deadline,
    ) -> Result<Vec<String>, VaultError> {
        let mut next = Some(
            self.base
                .join(&format!("secrets?api-version={}", self.api_version))
                .map_err(|e| VaultError::InvalidUri {
                    uri: self.base.to_string(),
                    message: e.to_string(),
                })?,
        );
        let mut names = Vec::new();
        let mut pages = 0;

        while let Some(url) = next.take() {
            pages += 1;
            if pages > MAX_LIST_PAGES {
                break;
            }

            let response = deadline
                .bound(
                    "vault secret list",
                    self.http
                        .get(url)
                        .bearer_auth(token.secret().expose())
                        .send(),
                )
                .await??;
            let response = check_status(response, "secret list").await?;
            let page: SecretListPage = deadline
                .bound("vault secret list", response.json())
                .await??;

            names.extend(page.value.iter().filter_map(|item| secret_name(&item.id)));
            next = page
                .next_link
                .filter(|link| !link.is_empty())
                .map(|link| {
                    Url::parse(&link).map_err(|e| VaultError::InvalidResponse {
                        message: format!("bad nextLink: {}", e),
                    })
                })
                .transpose()?;
        }

        Ok(names)
    }

    /// Check that `token` can enumerate the vault; returns the secret count.
    pub async fn verify_access(
        &self,
        token: &AccessToken,
        deadline: &Deadline,
    ) -> Result<usize, VaultError> {
        let names = self.list_secrets(token, deadline).await?;
        info!(
            "Vault access verified for {}: {} secrets visible",
            self.base,
            names.len()
        );
        Ok(names.len())
    }
}

async fn check_status(
    response: reqwest::Response,
    name: &str,
) -> Result<reqwest::Response, VaultError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    match status {
        StatusCode::UNAUTHORIZED => Err(VaultError::Unauthorized),
        StatusCode::FORBIDDEN => Err(VaultError::Forbidden {
            name: name.to_string(),
        }),
        StatusCode::NOT_FOUND => Err(VaultError::SecretNotFound {
            name: name.to_string(),
        }),
        _ => {
            let body = response.text().await.unwrap_or_default();
            Err(VaultError::Status {
                status: status.as_u16(),
                message: body.chars().take(200).collect(),
            })
        }
    }
}

/// Vault secret names are 1-127 ASCII letters, digits and dashes.
fn is_valid_secret_name(name: &str) -> bool {
    (1..=127).contains(&name.len())
        && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
}

/// Last path segment of a secret id such as `https://v.vault.azure.net/secrets/name`.
fn secret_name(id: &str) -> Option<String> {
    id.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn token() -> AccessToken {
        AccessToken::new(
            "vault-token",
            Utc::now() + ChronoDuration::hours(1),
            "vault.azure.net",
            vec![],
        )
    }

    fn client(server: &MockServer) -> VaultClient {
        VaultClient::new(&server.uri(), "7.4", Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_get_secret() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/secrets/form-signing"))
            .and(query_param("api-version", "7.4"))
            .and(header("authorization", "Bearer vault-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "value": "c2VjcmV0",
                "contentType": "application/x-pem-file",
                "id": "https://demo.vault.azure.net/secrets/form-signing/abc"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let secret = client(&server)
            .get_secret(&token(), "form-signing", &Deadline::none())
            .await
            .unwrap();

        assert_eq!(secret.value.expose(), "c2VjcmV0");
        assert_eq!(secret.content_type.as_deref(), Some("application/x-pem-file"));
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let server = MockServer::start().await;
        Mock::given(path("/secrets/unauthorized"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(path("/secrets/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(path("/secrets/broken"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let client = client(&server);
        let deadline = Deadline::none();

        assert!(matches!(
            client.get_secret(&token(), "unauthorized", &deadline).await,
            Err(VaultError::Unauthorized)
        ));
        assert!(matches!(
            client.get_secret(&token(), "missing", &deadline).await,
            Err(VaultError::SecretNotFound { .. })
        ));
        match client.get_secret(&token(), "broken", &deadline).await {
            Err(VaultError::Status { status, message }) => {
                assert_eq!(status, 500);
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_list_secrets_follows_next_link() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/secrets"))
            .and(query_param("api-version", "7.4"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "value": [{"id": "https://demo.vault.azure.net/secrets/alpha"}],
                "nextLink": format!("{}/secrets/page2", server.uri())
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/secrets/page2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "value": [{"id": "https://demo.vault.azure.net/secrets/beta"}],
                "nextLink": null
            })))
            .mount(&server)
            .await;

        let client = client(&server);
        let names = client.list_secrets(&token(), &Deadline::none()).await.unwrap();
        assert_eq!(names, vec!["alpha", "beta"]);

        let count = client.verify_access(&token(), &Deadline::none()).await.unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_secret_name() {
        assert_eq!(
            secret_name("https://demo.vault.azure.net/secrets/form-signing"),
            Some("form-signing".to_string())
        );
        assert_eq!(secret_name(""), None);
    }

    #[test]
    fn test_invalid_uri() {
        assert!(matches!(
            VaultClient::new("not a uri", "7.4", Duration::from_secs(1)),
            Err(VaultError::InvalidUri { .. })
        ));
    }

    #[tokio::test]
    async fn test_get_secret_rejects_path_like_names() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let client = client(&server);
        for bad in ["", "../keys/other", "name?api-version=1", "name#frag", "a/b", "a b"] {
            assert!(matches!(
                client.get_secret(&token(), bad, &Deadline::none()).await,
                Err(VaultError::InvalidSecretName { .. })
            ));
        }
    }

    #[test]
    fn test_secret_name_rules() {
        assert!(is_valid_secret_name("form-signing"));
        assert!(is_valid_secret_name("Cert2024"));
        assert!(!is_valid_secret_name(&"a".repeat(128)));
        assert!(!is_valid_secret_name("form_signing"));
    }
}
