//! ACME error types

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// ACME problem type returned when a rate limit is exceeded
pub const RATE_LIMITED_PROBLEM: &str = "urn:ietf:params:acme:error:rateLimited";

/// Errors that can occur during the ACME protocol exchange
#[derive(Debug, Error)]
pub enum AcmeError {
    /// No ACME account has been registered
    #[error("ACME account not initialized - call register_account() first")]
    NoAccount,

    /// No order has been created
    #[error("No certificate order in progress - call new_order() first")]
    NoOrder,

    /// Failed to create or load ACME account
    #[error("Failed to create ACME account: {0}")]
    AccountCreation(String),

    /// Failed to create certificate order
    #[error("Failed to create certificate order: {0}")]
    OrderCreation(String),

    /// Challenge validation failed
    #[error("Challenge validation failed for domain '{domain}': {message}")]
    ChallengeValidation { domain: String, message: String },

    /// No HTTP-01 challenge available for domain
    #[error("No HTTP-01 challenge available for domain '{0}'")]
    NoHttp01Challenge(String),

    /// Failed to generate the certificate key or signing request
    #[error("Failed to generate certificate signing request: {0}")]
    Csr(String),

    /// Certificate finalization failed
    #[error("Failed to finalize certificate: {0}")]
    Finalization(String),

    /// The ACME server rejected the request because a rate limit was hit
    #[error("Rate limited by ACME server: {detail}")]
    RateLimited { detail: String },

    /// Operation timed out
    #[error("Operation timed out after {elapsed:?}: {message}")]
    Timeout { message: String, elapsed: Duration },

    /// Reading or writing stored account credentials failed
    #[error("Account credentials error: {0}")]
    Credentials(String),
}

impl AcmeError {
    /// Remediation hint shown to the operator, if one applies
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            AcmeError::RateLimited { .. } => Some(
                "Let's Encrypt rate limit reached. Retry later, or test with --staging \
                 which has much higher limits.",
            ),
            AcmeError::ChallengeValidation { .. } | AcmeError::Timeout { .. } => Some(
                "Make sure the domain resolves to this host and port 80 is reachable \
                 from the internet.",
            ),
            _ => None,
        }
    }

    /// Whether this error was caused by a rate limit
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, AcmeError::RateLimited { .. })
    }

    /// Classify a problem document returned by the ACME server
    ///
    /// Rate limits are recognised by the problem `type` URN. Anything else is
    /// wrapped with `wrap`, which names the step that failed.
    pub fn classify_problem(
        problem_type: Option<&str>,
        detail: Option<&str>,
        wrap: impl FnOnce(String) -> AcmeError,
    ) -> AcmeError {
        let detail = detail.unwrap_or("no detail provided").to_string();
        match problem_type {
            Some(RATE_LIMITED_PROBLEM) => AcmeError::RateLimited { detail },
            Some(kind) => wrap(format!("{} ({})", detail, kind)),
            None => wrap(detail),
        }
    }

    /// Convert an instant-acme error, naming the step that failed
    pub fn from_acme(e: instant_acme::Error, wrap: impl FnOnce(String) -> AcmeError) -> AcmeError {
        match e {
            instant_acme::Error::Api(problem) => Self::classify_problem(
                problem.r#type.as_deref(),
                problem.detail.as_deref(),
                wrap,
            ),
            other => wrap(other.to_string()),
        }
    }
}

/// Errors specific to writing certificate artifacts
#[derive(Debug, Error)]
pub enum StorageError {
    /// IO error during file operations
    #[error("IO error writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The issued chain did not contain any certificate block
    #[error("Invalid certificate chain: {0}")]
    InvalidChain(String),
}

impl StorageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        StorageError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors reading the existing certificate during the expiry check
///
/// These never abort a run; the policy treats them as "no certificate".
#[derive(Debug, Error)]
pub enum ExpiryError {
    #[error("Failed to read certificate {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse certificate {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Errors starting or stopping the HTTP-01 challenge responder
#[derive(Debug, Error)]
pub enum ResponderError {
    /// Binding a privileged port without the required privilege
    #[error("Permission denied binding challenge responder to {addr}")]
    PermissionDenied { addr: SocketAddr },

    /// Another process already listens on the port
    #[error("Challenge responder address {addr} is already in use")]
    AddrInUse { addr: SocketAddr },

    #[error("Failed to bind challenge responder to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

impl ResponderError {
    /// Classify a bind failure
    pub fn from_bind(addr: SocketAddr, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::PermissionDenied => ResponderError::PermissionDenied { addr },
            io::ErrorKind::AddrInUse => ResponderError::AddrInUse { addr },
            _ => ResponderError::Bind { addr, source },
        }
    }

    pub fn hint(&self) -> Option<&'static str> {
        match self {
            ResponderError::PermissionDenied { .. } => Some(
                "Ports below 1024 need elevated privileges. Run as root, or grant the \
                 binary CAP_NET_BIND_SERVICE (setcap 'cap_net_bind_service=+ep').",
            ),
            ResponderError::AddrInUse { .. } => Some(
                "Stop the web server holding the port for the duration of the run, \
                 or point --listen at a port it forwards challenge requests to.",
            ),
            ResponderError::Bind { .. } => None,
        }
    }
}
