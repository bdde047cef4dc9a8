//! Ordered certificate resolution.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::source::{
    CertificateSource, FilePathSource, LocalStoreSource, RemoteVaultSource, SourceOutcome,
};
use super::{CertificateOrigin, SigningCertificate};
use crate::config::{AppConfig, ConfigError};
use crate::credential::{CredentialAuthenticator, SecretStoreCredentialResolver};
use crate::deadline::Deadline;
use crate::error::Error;

/// What happened when one source was asked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Loaded,
    NotFound,
    Failed,
}

/// One entry of the resolution trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolutionAttempt {
    pub source: CertificateOrigin,
    pub outcome: AttemptOutcome,
    pub detail: Option<String>,
}

impl fmt::Display for ResolutionAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let outcome = match self.outcome {
            AttemptOutcome::Loaded => "loaded",
            AttemptOutcome::NotFound => "not found",
            AttemptOutcome::Failed => "failed",
        };
        match &self.detail {
            Some(detail) => write!(f, "{}: {} ({})", self.source, outcome, detail),
            None => write!(f, "{}: {}", self.source, outcome),
        }
    }
}

/// Walks certificate sources in priority order and returns the first hit.
///
/// Both "not found" and "failed" fall through to the next source. The
/// resolver keeps no state between calls, so every resolution reads the
/// sources afresh.
pub struct CertificateResolver {
    sources: Vec<Arc<dyn CertificateSource>>,
}

impl CertificateResolver {
    /// Create a resolver over `sources`, tried in the given order.
    pub fn new(sources: Vec<Arc<dyn CertificateSource>>) -> Self {
        Self { sources }
    }

    /// Build the standard chain from configuration.
    ///
    /// File path first when one is configured, then the local store in
    /// developer mode, then the remote vault.
    pub fn from_config(
        config: &AppConfig,
        resolver: SecretStoreCredentialResolver,
        authenticator: Arc<CredentialAuthenticator>,
    ) -> Result<Self, ConfigError> {
        let password = config.certificate.password.clone();
        let mut sources: Vec<Arc<dyn CertificateSource>> = Vec::new();

        if let Some(path) = &config.certificate.path {
            sources.push(Arc::new(FilePathSource::new(path, password.clone())));
        }
        if config.developer_mode() {
            sources.push(Arc::new(LocalStoreSource::new(
                &config.certificate.local_dir,
                password,
            )));
        }
        sources.push(Arc::new(RemoteVaultSource::from_config(
            config,
            resolver,
            authenticator,
        )?));

        debug!(
            "Certificate sources: {:?}",
            sources.iter().map(|s| s.origin()).collect::<Vec<_>>()
        );
        Ok(Self::new(sources))
    }

    /// Origins of the configured sources, in order.
    pub fn origins(&self) -> Vec<CertificateOrigin> {
        self.sources.iter().map(|s| s.origin()).collect()
    }

    /// Resolve the certificate called `name`.
    pub async fn resolve(&self, name: &str, deadline: &Deadline) -> Result<SigningCertificate, Error> {
        self.resolve_traced(name, deadline).await.map(|(cert, _)| cert)
    }

    /// Resolve and also return the attempts made on the way.
    pub async fn resolve_traced(
        &self,
        name: &str,
        deadline: &Deadline,
    ) -> Result<(SigningCertificate, Vec<ResolutionAttempt>), Error> {
        let mut attempts = Vec::with_capacity(self.sources.len());

        for source in &self.sources {
            let origin = source.origin();
            debug!("Trying certificate source {} for '{}'", origin, name);

            match source.try_load(name, deadline).await {
                SourceOutcome::Loaded(cert) => {
                    info!(
                        "Resolved certificate '{}' from {} (subject: {}, fingerprint: {})",
                        name,
                        origin,
                        cert.subject().unwrap_or("unknown"),
                        cert.fingerprint()
                    );
                    attempts.push(ResolutionAttempt {
                        source: origin,
                        outcome: AttemptOutcome::Loaded,
                        detail: None,
                    });
                    return Ok((cert, attempts));
                }
                SourceOutcome::NotFound(detail) => {
                    debug!("Certificate source {} has no '{}': {}", origin, name, detail);
                    attempts.push(ResolutionAttempt {
                        source: origin,
                        outcome: AttemptOutcome::NotFound,
                        detail: Some(detail),
                    });
                }
                SourceOutcome::Failed(e) => {
                    warn!("Certificate source {} failed for '{}': {}", origin, name, e);
                    attempts.push(ResolutionAttempt {
                        source: origin,
                        outcome: AttemptOutcome::Failed,
                        detail: Some(e.to_string()),
                    });
                }
            }
        }

        Err(Error::CertificateUnavailable {
            name: name.to_string(),
            attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate::CertificateError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const SIGNING: &[u8] = include_bytes!("../../tests/fixtures/signing.pem");

    enum Behaviour {
        Load,
        Missing,
        Broken,
    }

    struct StubSource {
        origin: CertificateOrigin,
        behaviour: Behaviour,
        calls: AtomicUsize,
    }

    impl StubSource {
        fn new(origin: CertificateOrigin, behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                origin,
                behaviour,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl CertificateSource for StubSource {
        fn origin(&self) -> CertificateOrigin {
            self.origin
        }

        async fn try_load(&self, _name: &str, _deadline: &Deadline) -> SourceOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behaviour {
                Behaviour::Load => SourceOutcome::Loaded(
                    SigningCertificate::from_pem_bundle(SIGNING, None, self.origin).unwrap(),
                ),
                Behaviour::Missing => SourceOutcome::NotFound("nothing here".into()),
                Behaviour::Broken => SourceOutcome::Failed(CertificateError::Parse {
                    message: "bad bundle".into(),
                }),
            }
        }
    }

    #[tokio::test]
    async fn test_failure_falls_through_to_next_source() {
        let file = StubSource::new(CertificateOrigin::FilePath, Behaviour::Broken);
        let vault = StubSource::new(CertificateOrigin::RemoteVault, Behaviour::Load);
        let sources: Vec<Arc<dyn CertificateSource>> = vec![file.clone(), vault.clone()];
        let resolver = CertificateResolver::new(sources);

        let (cert, attempts) = resolver
            .resolve_traced("form-signing", &Deadline::none())
            .await
            .unwrap();

        assert_eq!(cert.origin(), CertificateOrigin::RemoteVault);
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].outcome, AttemptOutcome::Failed);
        assert_eq!(attempts[0].detail.as_deref(), Some("invalid certificate material: bad bundle"));
        assert_eq!(attempts[1].outcome, AttemptOutcome::Loaded);
        assert_eq!(file.calls.load(Ordering::SeqCst), 1);
        assert_eq!(vault.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausted_chain_carries_every_attempt() {
        let sources: Vec<Arc<dyn CertificateSource>> = vec![
            StubSource::new(CertificateOrigin::FilePath, Behaviour::Missing),
            StubSource::new(CertificateOrigin::RemoteVault, Behaviour::Broken),
        ];
        let resolver = CertificateResolver::new(sources);

        match resolver.resolve("form-signing", &Deadline::none()).await {
            Err(Error::CertificateUnavailable { name, attempts }) => {
                assert_eq!(name, "form-signing");
                assert_eq!(attempts.len(), 2);
                assert_eq!(attempts[0].to_string(), "file_path: not found (nothing here)");
            }
            other => panic!("expected CertificateUnavailable, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_chain_is_unavailable() {
        let resolver = CertificateResolver::new(Vec::new());
        let err = resolver
            .resolve("form-signing", &Deadline::none())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CertificateUnavailable { ref attempts, .. } if attempts.is_empty()));
    }

    #[test]
    fn test_from_config_order() {
        let authenticator = Arc::new(CredentialAuthenticator::new(
            "https://login.example.invalid",
            crate::credential::AmbientChain::new(),
        ));
        let mut config = AppConfig::default();

        let production = CertificateResolver::from_config(
            &config,
            SecretStoreCredentialResolver::default(),
            authenticator.clone(),
        )
        .unwrap();
        assert_eq!(production.origins(), vec![CertificateOrigin::RemoteVault]);

        config.certificate.path = Some("signing.pem".into());
        config.key_vault.use_local_secrets = true;
        let developer = CertificateResolver::from_config(
            &config,
            SecretStoreCredentialResolver::default(),
            authenticator,
        )
        .unwrap();
        assert_eq!(
            developer.origins(),
            vec![
                CertificateOrigin::FilePath,
                CertificateOrigin::LocalStore,
                CertificateOrigin::RemoteVault
            ]
        );
    }
}
