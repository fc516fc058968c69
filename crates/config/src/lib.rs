//! Configuration for certsmith
//!
//! A [`RenewalConfig`] can be loaded from a KDL, JSON or TOML file, or from
//! `CERTSMITH_*` environment variables. The binary layers command line flags
//! on top before calling [`RenewalConfig::validate`].
//!
//! # Example
//!
//! ```kdl
//! acme {
//!     domain "example.org"
//!     email "admin@example.org"
//!     staging #true
//!     certs-dir "/etc/certsmith/certs"
//!     listen-address "0.0.0.0:80"
//!     renew-before-days 30
//! }
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};
use validator::Validate;

pub mod kdl;

/// Environment variable prefix used by [`RenewalConfig::from_env`]
pub const ENV_PREFIX: &str = "CERTSMITH_";

/// Let's Encrypt production directory URL
pub const LETSENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";
/// Let's Encrypt staging directory URL
pub const LETSENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// ACME directory to issue against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcmeDirectory {
    /// Let's Encrypt staging (untrusted certificates, generous rate limits)
    Staging,
    /// Let's Encrypt production
    #[default]
    Production,
}

impl AcmeDirectory {
    /// Resolve the directory to its URL
    pub fn url(self) -> &'static str {
        match self {
            AcmeDirectory::Staging => LETSENCRYPT_STAGING,
            AcmeDirectory::Production => LETSENCRYPT_PRODUCTION,
        }
    }

    pub fn from_staging_flag(staging: bool) -> Self {
        if staging {
            AcmeDirectory::Staging
        } else {
            AcmeDirectory::Production
        }
    }
}

impl fmt::Display for AcmeDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcmeDirectory::Staging => write!(f, "staging"),
            AcmeDirectory::Production => write!(f, "production"),
        }
    }
}

/// Renewal configuration for a single domain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct RenewalConfig {
    /// Domain the certificate is issued for (used as the common name)
    #[validate(length(min = 1, message = "domain must not be empty"))]
    pub domain: String,

    /// Contact email registered with the ACME account
    #[validate(email(message = "email must be a valid address"))]
    pub email: String,

    /// Issue against the staging directory instead of production
    #[serde(default)]
    pub staging: bool,

    /// Skip the expiry check and always issue a fresh certificate
    #[serde(default)]
    pub force_new_certificate: bool,

    /// Renew even when the existing certificate is far from expiry
    #[serde(default)]
    pub force_renew: bool,

    /// Directory the certificate artifacts are written to
    #[serde(default = "default_certs_dir")]
    pub certs_dir: PathBuf,

    /// Address the HTTP-01 responder binds
    #[serde(default = "default_listen_address")]
    pub listen_address: SocketAddr,

    /// Renew when the certificate expires within this many days
    #[serde(default = "default_renew_before_days")]
    #[validate(range(min = 1, max = 89, message = "renew_before_days must be between 1 and 89"))]
    pub renew_before_days: u32,

    /// Optional file holding ACME account credentials to reuse across runs
    #[serde(default)]
    pub account_credentials: Option<PathBuf>,
}

pub fn default_certs_dir() -> PathBuf {
    PathBuf::from("./certs")
}

pub fn default_listen_address() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 80))
}

pub fn default_renew_before_days() -> u32 {
    30
}

impl RenewalConfig {
    /// Create a configuration with defaults for everything except the
    /// domain and contact email
    pub fn new(domain: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            email: email.into(),
            staging: false,
            force_new_certificate: false,
            force_renew: false,
            certs_dir: default_certs_dir(),
            listen_address: default_listen_address(),
            renew_before_days: default_renew_before_days(),
            account_credentials: None,
        }
    }

    /// Load configuration from a file, picking the format by extension
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("kdl");

        debug!(path = %path.display(), format = %extension, "Loading configuration file");

        match extension {
            "kdl" => Self::from_kdl(&content),
            "json" => Self::from_json(&content),
            "toml" => Self::from_toml(&content),
            _ => Err(anyhow::anyhow!("Unsupported config format: {}", extension)),
        }
    }

    /// Load configuration from `CERTSMITH_*` environment variables
    ///
    /// Field names map to upper snake case, e.g. `CERTSMITH_DOMAIN`,
    /// `CERTSMITH_FORCE_NEW_CERTIFICATE`, `CERTSMITH_CERTS_DIR`.
    pub fn from_env() -> Result<Self> {
        trace!(prefix = ENV_PREFIX, "Loading configuration from environment");
        envy::prefixed(ENV_PREFIX)
            .from_env::<Self>()
            .context("Failed to load configuration from environment")
    }

    /// Parse configuration from KDL format
    pub fn from_kdl(content: &str) -> Result<Self> {
        let doc: ::kdl::KdlDocument = content.parse().map_err(|e: ::kdl::KdlError| {
            use miette::Diagnostic;

            let mut error_msg = format!("KDL configuration parse error: {}", e);
            if let Some(related) = e.related() {
                for diagnostic in related {
                    error_msg.push_str(&format!("\n  {}", diagnostic));
                    if let Some(label) = diagnostic.labels().and_then(|mut l| l.next()) {
                        let (line, col) = kdl::offset_to_line_col(content, label.offset());
                        error_msg.push_str(&format!("\n  --> at line {}, column {}", line, col));
                    }
                    if let Some(help) = diagnostic.help() {
                        error_msg.push_str(&format!("\n  Help: {}", help));
                    }
                }
            }

            anyhow::anyhow!("{}", error_msg)
        })?;

        kdl::parse_kdl_document(&doc)
    }

    /// Parse configuration from JSON format
    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).context("Failed to parse JSON configuration")
    }

    /// Parse configuration from TOML format
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse TOML configuration")
    }

    /// Run field validation
    pub fn validate(&self) -> Result<()> {
        Validate::validate(self).map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

        if self.domain.contains('*') {
            anyhow::bail!(
                "Invalid configuration: wildcard domain '{}' requires DNS-01 validation",
                self.domain
            );
        }
        if self.domain.contains('/') || self.domain.contains(char::is_whitespace) {
            anyhow::bail!("Invalid configuration: '{}' is not a domain name", self.domain);
        }

        Ok(())
    }

    /// The ACME directory selected by the `staging` flag
    pub fn directory(&self) -> AcmeDirectory {
        AcmeDirectory::from_staging_flag(self.staging)
    }
}
