//! # Formbridge Core
//!
//! Certificate-bound token acquisition and best-effort remote record writes.
//!
//! This crate provides:
//! - An ordered certificate fallback chain (explicit file, local developer
//!   store, remote secret vault)
//! - Vault credential selection (explicit client secret or a chained ambient
//!   credential)
//! - OAuth2 client-credentials exchange with a signed certificate assertion
//! - An authenticated client for the remote list API
//! - A form submission coordinator whose remote write never blocks the user
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use formbridge_core::{AppConfig, FormSubmissionCoordinator, RecordFields, UserForm};
//!
//! async fn submit() -> Result<(), formbridge_core::Error> {
//!     let config = AppConfig::load(None)?;
//!     let coordinator = FormSubmissionCoordinator::from_config(&config);
//!     let outcome = coordinator
//!         .submit(&UserForm::new("Ann", "a@x.com"), RecordFields::new())
//!         .await;
//!     println!("{}", outcome.message());
//!     Ok(())
//! }
//! ```

pub mod acquirer;
pub mod api;
pub mod certificate;
pub mod config;
pub mod credential;
pub mod deadline;
pub mod error;
pub mod model;
pub mod secret;
pub mod submission;
pub mod token;
pub mod token_cache;
pub mod vault;

// Re-export commonly used types at crate root
pub use acquirer::TokenAcquirer;

pub use api::{
    ApiError,
    ApiSession,
    AuthenticatedApiClient,
    RecordSink,
};

pub use certificate::{
    AttemptOutcome,
    CertificateError,
    CertificateOrigin,
    CertificateResolver,
    CertificateSource,
    FilePathSource,
    LocalStoreSource,
    RemoteVaultSource,
    ResolutionAttempt,
    SigningCertificate,
    SourceOutcome,
};

pub use config::{
    AppConfig,
    AppIdentity,
    ConfigError,
};

pub use credential::{
    AmbientChain,
    AmbientProviderKind,
    CredentialAuthenticator,
    CredentialError,
    CredentialStrategy,
    EnvSnapshot,
    ExplicitSecret,
    SecretStoreCredentialResolver,
};

pub use deadline::{
    Deadline,
    DeadlineExceeded,
};

pub use error::Error;

pub use model::{
    FieldError,
    RecordFields,
    RecordTarget,
    SubmissionOutcome,
    UserForm,
};

pub use secret::Secret;

pub use submission::FormSubmissionCoordinator;

pub use token::{
    AccessToken,
    TokenError,
};

pub use token_cache::TokenCache;

pub use vault::{
    VaultClient,
    VaultError,
};
