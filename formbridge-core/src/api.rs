//! Authenticated remote list API.
//!
//! [`ApiSession`] is one bearer-authenticated session against a site; it is
//! opened per operation with a token bound to the site's host.
//! [`AuthenticatedApiClient`] resolves the certificate, acquires the token and
//! opens the session for each call.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::acquirer::TokenAcquirer;
use crate::certificate::{CertificateResolver, ResolutionAttempt, SigningCertificate};
use crate::config::{AppConfig, AppIdentity};
use crate::credential::{
    AmbientChain, CredentialAuthenticator, EnvSnapshot, SecretStoreCredentialResolver,
};
use crate::deadline::{Deadline, DeadlineExceeded};
use crate::error::Error;
use crate::model::{RecordFields, RecordTarget};
use crate::token::AccessToken;
use crate::token_cache::TokenCache;

const ODATA_JSON: &str = "application/json;odata=nometadata";

/// Base template id of document libraries.
const DOCUMENT_LIBRARY_TEMPLATE: u32 = 101;

/// Error type for remote API calls.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The configured site URL is unusable.
    #[error("invalid site URL {url}: {message}")]
    InvalidSiteUrl { url: String, message: String },

    /// The token was issued for another host.
    #[error("token audience {actual} does not match site host {expected}")]
    AudienceMismatch { expected: String, actual: String },

    /// The API answered with a non-success status.
    #[error("remote API returned {status}: {message}")]
    Status { status: u16, message: String },

    /// The request never completed.
    #[error("remote API request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The response body was not what the API promises.
    #[error("unexpected remote API response: {message}")]
    InvalidResponse { message: String },

    /// The caller's deadline passed.
    #[error(transparent)]
    Deadline(#[from] DeadlineExceeded),
}

impl ApiError {
    /// Whether the API rejected the bearer token.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Status { status: 401, .. })
    }
}

#[derive(Debug, Deserialize)]
struct Collection<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListSummary {
    title: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct UploadedFile {
    server_relative_url: Option<String>,
    name: Option<String>,
}

/// Double single quotes for use inside an OData string literal.
pub fn odata_escape(value: &str) -> String {
    value.replace('\'', "''")
}

/// A bearer-authenticated session against one site.
#[derive(Debug, Clone)]
pub struct ApiSession {
    site: String,
    http: reqwest::Client,
}

impl ApiSession {
    /// Open a session for `site_url` with `token`.
    ///
    /// Fails when the token's audience is not the site's host.
    pub fn open(site_url: &str, token: &AccessToken, timeout: Duration) -> Result<Self, ApiError> {
        let host = site_host(site_url)?;
        if !token.is_valid_for(&host) {
            return Err(ApiError::AudienceMismatch {
                expected: host,
                actual: token.audience.clone(),
            });
        }

        let mut auth = HeaderValue::from_str(&format!("Bearer {}", token.secret().expose()))
            .map_err(|e| ApiError::InvalidResponse {
                message: format!("token is not a valid header value: {}", e),
            })?;
        auth.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);
        headers.insert(ACCEPT, HeaderValue::from_static(ODATA_JSON));

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            site: site_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn list_url(&self, list: &str) -> String {
        format!(
            "{}/_api/web/lists/GetByTitle('{}')",
            self.site,
            odata_escape(list)
        )
    }

    async fn send<T: DeserializeOwned>(
        &self,
        stage: &'static str,
        request: reqwest::RequestBuilder,
        deadline: &Deadline,
    ) -> Result<T, ApiError> {
        let response = deadline.bound(stage, request.send()).await??;
        let status = response.status();
        let body = deadline.bound(stage, response.bytes()).await??;

        if !status.is_success() {
            let message = String::from_utf8_lossy(&body).chars().take(200).collect();
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                warn!("Remote API refused {} with {}", stage, status);
            }
            return Err(ApiError::Status {
                status: status.as_u16(),
                message,
            });
        }

        serde_json::from_slice(&body).map_err(|e| ApiError::InvalidResponse {
            message: format!("{}: {}", stage, e),
        })
    }

    /// Titles of the site's document libraries.
    pub async fn list_document_libraries(&self, deadline: &Deadline) -> Result<Vec<String>, ApiError> {
        let filter = format!("BaseTemplate eq {}", DOCUMENT_LIBRARY_TEMPLATE);
        let request = self
            .http
            .get(format!("{}/_api/web/lists", self.site))
            .query(&[("$filter", filter.as_str()), ("$select", "Title")]);

        let lists: Collection<ListSummary> = self.send("list libraries", request, deadline).await?;
        Ok(lists.value.into_iter().map(|list| list.title).collect())
    }

    /// Create one item in `target`; true once the server confirms the commit.
    pub async fn create_record(
        &self,
        target: &RecordTarget,
        fields: &RecordFields,
        deadline: &Deadline,
    ) -> Result<bool, ApiError> {
        let request = self
            .http
            .post(format!("{}/items", self.list_url(target.as_str())))
            .header(CONTENT_TYPE, ODATA_JSON)
            .json(fields);

        let created: RecordFields = self.send("create record", request, deadline).await?;
        let id = created.get("Id").or_else(|| created.get("ID"));
        match id {
            Some(id) if !id.is_null() => {
                debug!("Created item {} in {}", id, target);
                Ok(true)
            }
            _ => {
                warn!("Create in {} returned no item id", target);
                Ok(false)
            }
        }
    }

    /// Up to `max_items` items of `target`.
    pub async fn list_records(
        &self,
        target: &RecordTarget,
        max_items: usize,
        deadline: &Deadline,
    ) -> Result<Vec<RecordFields>, ApiError> {
        let request = self
            .http
            .get(format!("{}/items", self.list_url(target.as_str())))
            .query(&[("$top", max_items.to_string())]);

        let items: Collection<RecordFields> = self.send("list records", request, deadline).await?;
        Ok(items.value.into_iter().take(max_items).collect())
    }

    /// Upload `content` as `file_name` into `library`, replacing any existing
    /// file. Returns the server-relative URL of the stored file.
    pub async fn upload_document(
        &self,
        library: &str,
        file_name: &str,
        content: Vec<u8>,
        deadline: &Deadline,
    ) -> Result<String, ApiError> {
        let request = self
            .http
            .post(format!(
                "{}/RootFolder/Files/add(url='{}',overwrite=true)",
                self.list_url(library),
                odata_escape(file_name)
            ))
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(content);

        let file: UploadedFile = self.send("upload document", request, deadline).await?;
        file.server_relative_url
            .or(file.name)
            .ok_or_else(|| ApiError::InvalidResponse {
                message: "upload response carries no file location".to_string(),
            })
    }
}

/// Host of `site_url`, without port.
pub fn site_host(site_url: &str) -> Result<String, ApiError> {
    let url = Url::parse(site_url).map_err(|e| ApiError::InvalidSiteUrl {
        url: site_url.to_string(),
        message: e.to_string(),
    })?;
    url.host_str()
        .map(str::to_ascii_lowercase)
        .ok_or_else(|| ApiError::InvalidSiteUrl {
            url: site_url.to_string(),
            message: "URL has no host".to_string(),
        })
}

/// Destination for best-effort record writes.
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Create a record; `Ok(false)` means the server did not confirm it.
    async fn create_record(
        &self,
        target: &RecordTarget,
        fields: RecordFields,
        deadline: &Deadline,
    ) -> Result<bool, Error>;
}

/// Remote API client that authenticates every call with a fresh
/// certificate-bound token (or a cached one when caching is enabled).
pub struct AuthenticatedApiClient {
    site_url: String,
    site_host: String,
    identity: AppIdentity,
    certificate_name: String,
    resolver: Arc<CertificateResolver>,
    acquirer: TokenAcquirer,
    cache: Option<Arc<TokenCache>>,
    request_timeout: Duration,
}

impl AuthenticatedApiClient {
    pub fn new(
        site_url: impl Into<String>,
        identity: AppIdentity,
        certificate_name: impl Into<String>,
        resolver: Arc<CertificateResolver>,
        acquirer: TokenAcquirer,
    ) -> Result<Self, ApiError> {
        let site_url = site_url.into();
        let site_host = site_host(&site_url)?;
        Ok(Self {
            site_url,
            site_host,
            identity,
            certificate_name: certificate_name.into(),
            resolver,
            acquirer,
            cache: None,
            request_timeout: Duration::from_secs(30),
        })
    }

    /// Serve tokens from `cache` while they are fresh.
    pub fn with_cache(mut self, cache: Arc<TokenCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Build a client from configuration and the process environment.
    pub fn from_config(config: &AppConfig) -> Result<Self, Error> {
        Self::from_config_with_env(config, EnvSnapshot::capture())
    }

    /// Build a client from configuration and an explicit environment snapshot.
    pub fn from_config_with_env(config: &AppConfig, env: EnvSnapshot) -> Result<Self, Error> {
        config.validate()?;

        let chain = AmbientChain::with_defaults(
            env.tenant_id
                .clone()
                .or_else(|| config.azure_ad.tenant_id.clone()),
        );
        let authenticator = Arc::new(CredentialAuthenticator::new(
            config.identity.authority_host.clone(),
            chain,
        ));
        let resolver = CertificateResolver::from_config(
            config,
            SecretStoreCredentialResolver::new(env),
            authenticator,
        )?;

        let mut client = Self::new(
            config.site_url()?,
            config.app_identity()?,
            config.certificate_name()?,
            Arc::new(resolver),
            TokenAcquirer::new(config.identity.authority_host.clone()),
        )?
        .with_request_timeout(config.request_timeout());

        if config.identity.cache_tokens {
            client = client.with_cache(Arc::new(TokenCache::new(Duration::from_secs(
                config.identity.expiry_buffer_secs,
            ))));
        }
        Ok(client)
    }

    pub fn site_host(&self) -> &str {
        &self.site_host
    }

    /// Resolve the signing certificate, returning the attempts made.
    pub async fn resolve_certificate(
        &self,
        deadline: &Deadline,
    ) -> Result<(SigningCertificate, Vec<ResolutionAttempt>), Error> {
        self.resolver
            .resolve_traced(&self.certificate_name, deadline)
            .await
    }

    /// Access token for the site host.
    pub async fn access_token(&self, deadline: &Deadline) -> Result<AccessToken, Error> {
        let acquire = move || async move {
            let certificate = self
                .resolver
                .resolve(&self.certificate_name, deadline)
                .await?;
            self.acquirer
                .acquire(
                    certificate,
                    &self.identity.tenant_id,
                    &self.identity.client_id,
                    &self.site_host,
                    deadline,
                )
                .await
                .map_err(Error::from)
        };

        match &self.cache {
            Some(cache) => cache.get_or_acquire(&self.site_host, acquire).await,
            None => acquire().await,
        }
    }

    async fn session(&self, deadline: &Deadline) -> Result<(ApiSession, AccessToken), Error> {
        let token = self.access_token(deadline).await?;
        let session = ApiSession::open(&self.site_url, &token, self.request_timeout)?;
        Ok((session, token))
    }

    /// Map the API result, dropping `token` from the cache on a 401.
    async fn settle<T>(&self, result: Result<T, ApiError>, token: &AccessToken) -> Result<T, Error> {
        if let (Err(e), Some(cache)) = (&result, &self.cache) {
            if e.is_unauthorized() {
                cache.invalidate(&self.site_host, token).await;
            }
        }
        result.map_err(Error::from)
    }

    /// Create a record in `target`.
    pub async fn create_record(
        &self,
        target: &RecordTarget,
        fields: &RecordFields,
        deadline: &Deadline,
    ) -> Result<bool, Error> {
        let (session, token) = self.session(deadline).await?;
        info!("Creating record in {}", target);
        let result = session.create_record(target, fields, deadline).await;
        self.settle(result, &token).await
    }

    /// Titles of the site's document libraries.
    pub async fn list_document_libraries(&self, deadline: &Deadline) -> Result<Vec<String>, Error> {
        let (session, token) = self.session(deadline).await?;
        let result = session.list_document_libraries(deadline).await;
        self.settle(result, &token).await
    }

    /// Up to `max_items` items of `target`.
    pub async fn list_records(
        &self,
        target: &RecordTarget,
        max_items: usize,
        deadline: &Deadline,
    ) -> Result<Vec<RecordFields>, Error> {
        let (session, token) = self.session(deadline).await?;
        let result = session.list_records(target, max_items, deadline).await;
        self.settle(result, &token).await
    }

    /// Upload a document into `library`.
    pub async fn upload_document(
        &self,
        library: &str,
        file_name: &str,
        content: Vec<u8>,
        deadline: &Deadline,
    ) -> Result<String, Error> {
        let (session, token) = self.session(deadline).await?;
        info!("Uploading {} ({} bytes) to {}", file_name, content.len(), library);
        let result = session
            .upload_document(library, file_name, content, deadline)
            .await;
        self.settle(result, &token).await
    }
}

#[async_trait]
impl RecordSink for AuthenticatedApiClient {
    async fn create_record(
        &self,
        target: &RecordTarget,
        fields: RecordFields,
        deadline: &Deadline,
    ) -> Result<bool, Error> {
        AuthenticatedApiClient::create_record(self, target, &fields, deadline).await
    }
}
