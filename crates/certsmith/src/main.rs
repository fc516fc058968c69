//! certsmith - Main entry point
//!
//! Issues or renews a single domain certificate over ACME HTTP-01 and exits.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::{error, info};

use certsmith::{RenewalContext, RenewalRun, RunOutcome};
use certsmith_config::RenewalConfig;

/// certsmith - one-shot ACME certificate issuance and renewal
#[derive(Parser, Debug)]
#[command(name = "certsmith")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(flatten)]
    options: ConfigOptions,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose", global = true)]
    verbose: bool,

    /// Log output format
    #[arg(long = "log-format", value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Renew the certificate if needed (default)
    Run,
    /// Report the existing certificate's expiry and the renewal decision
    Check,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Configuration sources and overrides
///
/// Every flag falls back to its `CERTSMITH_*` environment variable, so the
/// environment layers over `--config` the same way flags do. Without
/// `--config`, `--domain` and `--email` (or their variables) are required.
#[derive(Args, Debug, Default)]
struct ConfigOptions {
    /// Configuration file path (.kdl, .json or .toml)
    #[arg(short = 'c', long = "config", env = "CERTSMITH_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Domain to issue the certificate for
    #[arg(long, env = "CERTSMITH_DOMAIN", global = true)]
    domain: Option<String>,

    /// Contact email for the ACME account
    #[arg(long, env = "CERTSMITH_EMAIL", global = true)]
    email: Option<String>,

    /// Use the Let's Encrypt staging directory
    #[arg(long, env = "CERTSMITH_STAGING", global = true)]
    staging: bool,

    /// Always issue a fresh certificate, ignoring the existing one
    #[arg(long = "force-new", env = "CERTSMITH_FORCE_NEW_CERTIFICATE", global = true)]
    force_new: bool,

    /// Renew even if the existing certificate is far from expiry
    #[arg(long = "force-renew", env = "CERTSMITH_FORCE_RENEW", global = true)]
    force_renew: bool,

    /// Directory the certificate files are written to
    #[arg(long = "certs-dir", env = "CERTSMITH_CERTS_DIR", global = true)]
    certs_dir: Option<PathBuf>,

    /// Address for the HTTP-01 responder
    #[arg(long = "listen", env = "CERTSMITH_LISTEN_ADDRESS", global = true)]
    listen: Option<SocketAddr>,

    /// Renew when the certificate expires within this many days
    #[arg(long = "renew-before-days", env = "CERTSMITH_RENEW_BEFORE_DAYS", global = true)]
    renew_before_days: Option<u32>,

    /// File to load and save ACME account credentials
    #[arg(long = "account-credentials", env = "CERTSMITH_ACCOUNT_CREDENTIALS", global = true)]
    account_credentials: Option<PathBuf>,
}

impl ConfigOptions {
    /// Load the base configuration and apply command line overrides
    fn load(&self) -> Result<RenewalConfig> {
        let mut config = match &self.config {
            Some(path) => {
                info!("Loading configuration from: {}", path.display());
                RenewalConfig::from_file(path).context("Failed to load configuration file")?
            }
            None => match (&self.domain, &self.email) {
                (Some(domain), Some(email)) => RenewalConfig::new(domain, email),
                _ => RenewalConfig::from_env()?,
            },
        };

        if let Some(domain) = &self.domain {
            config.domain = domain.clone();
        }
        if let Some(email) = &self.email {
            config.email = email.clone();
        }
        config.staging |= self.staging;
        config.force_new_certificate |= self.force_new;
        config.force_renew |= self.force_renew;
        if let Some(certs_dir) = &self.certs_dir {
            config.certs_dir = certs_dir.clone();
        }
        if let Some(listen) = self.listen {
            config.listen_address = listen;
        }
        if let Some(days) = self.renew_before_days {
            config.renew_before_days = days;
        }
        if let Some(path) = &self.account_credentials {
            config.account_credentials = Some(path.clone());
        }

        config.validate()?;
        Ok(config)
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_format);

    let result = match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_renewal(&cli.options),
        Commands::Check => check_certificate(&cli.options),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("certsmith: {:#}", e);
            if let Some(hint) = e
                .downcast_ref::<certsmith::RunError>()
                .and_then(|e| e.hint())
            {
                eprintln!("hint: {}", hint);
            }
            ExitCode::FAILURE
        }
    }
}

/// Initialize logging based on verbose flag and format
fn init_logging(verbose: bool, format: LogFormat) {
    let log_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init(),
    }
}

/// Perform one renewal decision and, if needed, issue
fn run_renewal(options: &ConfigOptions) -> Result<()> {
    let config = options.load()?;
    let context = RenewalContext::from(&config);
    let backend = context.backend();
    let run = RenewalRun::new(context);

    let runtime = tokio::runtime::Runtime::new()?;
    match runtime.block_on(run.run(backend))? {
        RunOutcome::Skipped(decision) => {
            println!("certsmith: {} - {}, nothing to do", config.domain, decision);
        }
        RunOutcome::Issued { paths, .. } => {
            println!(
                "certsmith: issued certificate for {} into {}",
                config.domain,
                paths
                    .full_chain
                    .parent()
                    .unwrap_or(&config.certs_dir)
                    .display()
            );
        }
    }

    Ok(())
}

/// Report the current certificate state without touching the network
fn check_certificate(options: &ConfigOptions) -> Result<()> {
    let config = options.load()?;
    let context = RenewalContext::from(&config);
    let cert_path = context.materializer().cert_path();

    match certsmith::acme::ExistingCertificate::read(&cert_path) {
        Ok(cert) => println!(
            "certsmith: {} expires {} ({} days)",
            cert_path.display(),
            cert.not_after,
            cert.days_until_expiry(chrono::Utc::now())
        ),
        Err(e) => println!("certsmith: {}", e),
    }

    let decision = RenewalRun::new(context).check();
    println!(
        "certsmith: renewal {} ({})",
        if decision.proceed { "needed" } else { "not needed" },
        decision
    );

    Ok(())
}
