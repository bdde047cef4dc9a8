//! Formbridge CLI
//!
//! Command-line front end for the form submission path and its diagnostics.
//!
//! # Usage
//!
//! ```bash
//! # Submit a form; the remote write is best-effort
//! formbridge submit --name Ann --email a@x.com --field Department=Sales
//!
//! # Show where the signing certificate comes from
//! formbridge resolve-certificate
//!
//! # Check that the vault credential can read the vault
//! formbridge diagnose
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use formbridge_core::{
    AmbientChain, AppConfig, AuthenticatedApiClient, CredentialAuthenticator, Deadline,
    EnvSnapshot, FormSubmissionCoordinator, RecordFields, RecordTarget,
    SecretStoreCredentialResolver, UserForm, VaultClient,
};
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser)]
#[command(name = "formbridge")]
#[command(about = "Certificate-authenticated form submission to a remote list")]
#[command(version)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to the configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a form and write it to the remote list
    Submit {
        /// Submitter name
        #[arg(long)]
        name: String,

        /// Submitter email address
        #[arg(long)]
        email: String,

        /// Extra record field (KEY=VALUE, repeatable)
        #[arg(short, long = "field", value_parser = parse_field)]
        fields: Vec<(String, String)>,

        /// Output format
        #[arg(long, value_enum, default_value = "text")]
        format: Format,
    },

    /// List the site's document libraries
    Libraries,

    /// List items of the record list
    Items {
        /// List to read (defaults to the configured list)
        #[arg(short, long)]
        list: Option<String>,

        /// Maximum number of items to return
        #[arg(short, long, default_value_t = 10)]
        max: usize,
    },

    /// Upload a file into a document library
    Upload {
        /// Target document library
        library: String,

        /// File to upload
        file: PathBuf,

        /// Name to store the file under (defaults to the file name)
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Resolve the signing certificate and show every attempt
    ResolveCertificate,

    /// Check vault access with the selected credential strategy
    Diagnose,

    /// Show the effective configuration without secrets
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = AppConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    debug!("Loaded configuration from {:?}", config.config_path);

    match cli.command {
        Commands::Submit {
            name,
            email,
            fields,
            format,
        } => submit(&config, name, email, fields, format).await,
        Commands::Libraries => list_libraries(&config).await,
        Commands::Items { list, max } => list_items(&config, list, max).await,
        Commands::Upload {
            library,
            file,
            name,
        } => upload(&config, &library, &file, name).await,
        Commands::ResolveCertificate => resolve_certificate(&config).await,
        Commands::Diagnose => diagnose(&config).await,
        Commands::Config => show_config(&config),
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn parse_field(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{}'", raw)),
    }
}

fn api_client(config: &AppConfig) -> Result<AuthenticatedApiClient> {
    AuthenticatedApiClient::from_config(config).context("Failed to set up the remote API client")
}

fn request_deadline(config: &AppConfig) -> Deadline {
    Deadline::after(config.request_timeout() * 4)
}

async fn submit(
    config: &AppConfig,
    name: String,
    email: String,
    fields: Vec<(String, String)>,
    format: Format,
) -> Result<()> {
    let coordinator = FormSubmissionCoordinator::from_config(config);

    let extra: RecordFields = fields
        .into_iter()
        .map(|(key, value)| (key, serde_json::Value::String(value)))
        .collect();

    let outcome = coordinator.submit(&UserForm::new(name, email), extra).await;

    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&outcome)?),
        Format::Text => {
            println!("{}", outcome.message());
            for error in &outcome.validation_errors {
                println!("  {}", error);
            }
            if let Some(notice) = outcome.notice() {
                println!("Note: {}", notice);
            }
        }
    }

    if !outcome.primary_accepted {
        bail!("Submission rejected");
    }
    Ok(())
}

async fn list_libraries(config: &AppConfig) -> Result<()> {
    let client = api_client(config)?;
    let libraries = client
        .list_document_libraries(&request_deadline(config))
        .await
        .context("Failed to list document libraries")?;

    if libraries.is_empty() {
        println!("No document libraries found");
    }
    for library in libraries {
        println!("{}", library);
    }
    Ok(())
}

async fn list_items(config: &AppConfig, list: Option<String>, max: usize) -> Result<()> {
    let target = match list {
        Some(list) => RecordTarget::new(list),
        None => RecordTarget::new(config.list_name()?),
    };

    let client = api_client(config)?;
    let items = client
        .list_records(&target, max, &request_deadline(config))
        .await
        .with_context(|| format!("Failed to list items of {}", target))?;

    println!("{}", serde_json::to_string_pretty(&items)?);
    Ok(())
}

async fn upload(
    config: &AppConfig,
    library: &str,
    file: &Path,
    name: Option<String>,
) -> Result<()> {
    let file_name = match name {
        Some(name) => name,
        None => file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .with_context(|| format!("{:?} has no file name", file))?,
    };
    let content = tokio::fs::read(file)
        .await
        .with_context(|| format!("Failed to read {:?}", file))?;

    let client = api_client(config)?;
    let location = client
        .upload_document(library, &file_name, content, &request_deadline(config))
        .await
        .with_context(|| format!("Failed to upload {} to {}", file_name, library))?;

    println!("Uploaded to {}", location);
    Ok(())
}

async fn resolve_certificate(config: &AppConfig) -> Result<()> {
    let client = api_client(config)?;
    let name = config.certificate_name()?;

    match client.resolve_certificate(&request_deadline(config)).await {
        Ok((certificate, attempts)) => {
            for attempt in &attempts {
                println!("  {}", attempt);
            }
            println!("Certificate: {}", name);
            println!("  Origin: {}", certificate.origin());
            println!("  Subject: {}", certificate.subject().unwrap_or("unknown"));
            println!("  Fingerprint (SHA-256): {}", certificate.fingerprint());
            if let Some(not_after) = certificate.not_after() {
                println!("  Expires: {}", not_after);
            }
            Ok(())
        }
        Err(formbridge_core::Error::CertificateUnavailable { attempts, .. }) => {
            for attempt in &attempts {
                println!("  {}", attempt);
            }
            bail!("No source could provide certificate '{}'", name)
        }
        Err(e) => Err(e.into()),
    }
}

async fn diagnose(config: &AppConfig) -> Result<()> {
    let Some(vault_uri) = config.key_vault.vault_uri.as_deref() else {
        bail!("key_vault.vault_uri is not configured");
    };

    let env = EnvSnapshot::capture();
    let chain = AmbientChain::with_defaults(
        env.tenant_id
            .clone()
            .or_else(|| config.azure_ad.tenant_id.clone()),
    );
    let resolver = SecretStoreCredentialResolver::new(env)
        .with_exclusions(config.key_vault.exclude_providers.iter().copied());
    let strategy = resolver.resolve(&config.azure_ad);

    println!("Vault: {}", vault_uri);
    println!("Credential strategy: {}", strategy.label());
    let enabled = strategy.enabled_providers();
    if !enabled.is_empty() {
        let names: Vec<_> = enabled.iter().map(|kind| kind.as_str()).collect();
        println!("  Ambient providers: {}", names.join(", "));
    }

    let authenticator = CredentialAuthenticator::new(config.identity.authority_host.clone(), chain);
    let deadline = Deadline::after(Duration::from_secs(60));
    let token = authenticator
        .token(&strategy, &config.key_vault.scope, &deadline)
        .await
        .context("Failed to obtain a vault access token")?;
    info!("Vault token obtained (expires {})", token.expires_at);

    let vault = VaultClient::new(
        vault_uri,
        config.key_vault.api_version.clone(),
        config.request_timeout(),
    )?;
    let count = vault
        .verify_access(&token, &deadline)
        .await
        .context("Vault access check failed")?;

    println!("Vault access OK: {} secrets visible", count);
    Ok(())
}

fn show_config(config: &AppConfig) -> Result<()> {
    match &config.config_path {
        Some(path) => println!("# {}", path.display()),
        None => println!("# (no configuration file)"),
    }
    for (key, value) in config.redacted_entries() {
        println!("{} = {}", key, value);
    }
    Ok(())
}
