//! grid-proxy - Proxy credential helper for grid storage clients
//!
//! Command line front end over the `grid_proxy` library:
//!
//! - `check <cert>`: validity window of a certificate or combined proxy file
//! - `dn <cert>`: subject DN in OpenSSL one-line form
//! - `acquire`: resolve, refresh, bind and audit credentials; prints `export X509_...` lines or
//!   runs the command given after `--` with the credentials in its environment
//! - `request`: fetch a fresh proxy from the delegating CA
//! - `audit`: check ownership of every `X509*` path in the current environment
//!
//! Logging goes to stderr and is controlled with `RUST_LOG` (default `info`).

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use grid_proxy::ca_exchange::{CaExchange, HttpCaClient};
use grid_proxy::configs::{AppConfig, DEFAULT_CONFIG_PATH};
use grid_proxy::credential_binding::{CredentialRole, ProcessEnvironment};
use grid_proxy::error::ProxyError;
use grid_proxy::myproxy::{MyproxyLogon, SystemCommandRunner};
use grid_proxy::orchestrator::{AcquisitionRequest, MyproxySource, ProxyOrchestrator};
use grid_proxy::permission_audit::PermissionAuditor;
use grid_proxy::proxy_store::ProxyStore;
use grid_proxy::validity::{check_validity, get_dn_from_cert, DEFAULT_TOLERANCE_HOURS};
use std::path::{Path, PathBuf};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// grid-proxy - short-lived X.509 proxies for grid clients
#[derive(Parser, Debug)]
#[command(name = "grid-proxy")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show the validity window of a certificate
    Check {
        cert: PathBuf,
        /// Grace period after notAfter, in hours
        #[arg(long, default_value_t = DEFAULT_TOLERANCE_HOURS)]
        tolerance_hours: i64,
    },
    /// Print the subject DN of a certificate
    Dn { cert: PathBuf },
    /// Acquire, bind and audit credentials for an identity
    Acquire {
        #[arg(short, long)]
        identity: String,
        /// Use this proxy file as both key and certificate
        #[arg(long)]
        proxy_file: Option<PathBuf>,
        /// Command to run with the bound X509_* variables
        #[arg(last = true)]
        command: Vec<String>,
    },
    /// Request a new proxy from the delegating CA
    Request {
        #[arg(short, long)]
        identity: String,
        /// Identity recorded in the `.username` marker
        #[arg(long)]
        owner: Option<String>,
        /// Move the new proxy onto `<identity>/userproxy.crt`
        #[arg(long)]
        install: bool,
    },
    /// Audit ownership of every X509* path in the environment
    Audit,
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Check {
            cert,
            tolerance_hours,
        } => check(&cert, tolerance_hours),
        Commands::Dn { cert } => {
            let dn = get_dn_from_cert(&cert)
                .with_context(|| format!("Failed to read subject of {}", cert.display()))?;
            println!("{}", dn);
            Ok(())
        }
        Commands::Acquire {
            identity,
            proxy_file,
            command,
        } => acquire(&load_config(&cli.config)?, identity, proxy_file, &command),
        Commands::Request {
            identity,
            owner,
            install,
        } => request_from_ca(
            &load_config(&cli.config)?,
            &identity,
            owner.as_deref(),
            install,
        ),
        Commands::Audit => audit(),
    }
}

fn load_config(path: &Path) -> Result<AppConfig> {
    let mut config = AppConfig::from_file(path)?;
    config.apply_env_overrides();
    Ok(config)
}

fn check(cert: &Path, tolerance_hours: i64) -> Result<()> {
    let validity = check_validity(cert, tolerance_hours)
        .with_context(|| format!("Failed to check {}", cert.display()))?;
    println!("notBefore: {}", validity.not_before);
    println!("notAfter:  {}", validity.not_after);
    if validity.valid {
        println!("✓ {} is valid", cert.display());
        Ok(())
    } else {
        println!("✗ {} is not valid", cert.display());
        std::process::exit(1);
    }
}

fn acquire(
    config: &AppConfig,
    identity: String,
    proxy_file: Option<PathBuf>,
    command: &[String],
) -> Result<()> {
    let store = ProxyStore::new(&config.proxy.cert_base_dir);
    let issuer = MyproxyLogon::new(SystemCommandRunner);

    let myproxy = match &config.myproxy {
        Some(settings) => {
            let mut source = MyproxySource::new(
                settings.host.clone(),
                settings.credential_name.clone(),
                settings.passphrase()?,
            );
            source.lifetime_hours = settings.lifetime_hours;
            Some(source)
        }
        None => None,
    };
    let request = AcquisitionRequest {
        identity,
        proxy_file,
        myproxy,
    };

    let outcome = ProxyOrchestrator::new(&store, &issuer, &ProcessEnvironment)
        .ca_dir(config.ca_dir())
        .tolerance_hours(config.proxy.tolerance_hours)
        .sweep_environment(true)
        .run(&request);

    match outcome {
        Ok(outcome) => {
            eprintln!(
                "✓ Credentials for {} bound ({})",
                request.identity,
                outcome.plan.kind()
            );
            if let Some((program, args)) = command.split_first() {
                // The child inherits the X509_* variables bound above
                let status = std::process::Command::new(program)
                    .args(args)
                    .status()
                    .with_context(|| format!("Failed to run {}", program))?;
                std::process::exit(status.code().unwrap_or(1));
            }
            for (role, path) in outcome.binding.entries() {
                println!("export {}={}", role.env_key(), path.display());
            }
            Ok(())
        }
        Err(ProxyError::Ownership(err)) => {
            eprintln!("✗ Refusing to bind credentials");
            for violation in &err.violations {
                eprintln!("  - {}", violation);
            }
            bail!(err)
        }
        Err(e) => Err(e)
            .with_context(|| format!("Failed to acquire credentials for {}", request.identity)),
    }
}

fn request_from_ca(
    config: &AppConfig,
    identity: &str,
    owner: Option<&str>,
    install: bool,
) -> Result<()> {
    let Some(ca) = &config.ca else {
        bail!("No [ca] section in configuration");
    };
    let store = ProxyStore::new(&config.proxy.cert_base_dir);
    let client = HttpCaClient::new(&ca.base_url, ca.token(), ca.timeout())?;

    let Some(path) = CaExchange::new(&store)
        .subject_common_name(config.proxy.subject_common_name.clone())
        .key_size(config.proxy.key_size)
        .proxy_from_ca(&client, identity, owner)
    else {
        println!("✗ No proxy received from {}", ca.base_url);
        std::process::exit(1);
    };

    let path = if install {
        store.install(&path, identity, owner)?
    } else {
        path
    };
    println!("✓ Proxy stored at {}", path.display());
    Ok(())
}

fn audit() -> Result<()> {
    match PermissionAuditor::for_current_process().audit_environment() {
        Ok(()) => {
            println!("✓ Credential paths in the environment pass the audit");
            for role in CredentialRole::ALL {
                if let Some(path) = std::env::var_os(role.env_key()) {
                    println!("  {} = {}", role.env_key(), PathBuf::from(path).display());
                }
            }
            Ok(())
        }
        Err(err) => {
            for violation in &err.violations {
                println!("✗ {}", violation);
            }
            bail!(err)
        }
    }
}
