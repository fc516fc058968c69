//! Renewal gate
//!
//! Decides from the certificate already on disk, and the force flags, whether
//! a run should contact the ACME server at all.

use std::fmt;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::error::ExpiryError;

const SECONDS_PER_DAY: i64 = 86_400;

/// Validity information of a previously issued certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExistingCertificate {
    pub not_after: DateTime<Utc>,
}

impl ExistingCertificate {
    /// Parse the first certificate of a PEM file
    pub fn read(path: &Path) -> Result<Self, ExpiryError> {
        let content = fs::read(path).map_err(|source| ExpiryError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content).map_err(|message| ExpiryError::Parse {
            path: path.to_path_buf(),
            message,
        })
    }

    fn parse(pem_bytes: &[u8]) -> Result<Self, String> {
        let pem = pem::parse(pem_bytes).map_err(|e| format!("invalid PEM: {}", e))?;
        let (_, cert) = x509_parser::parse_x509_certificate(pem.contents())
            .map_err(|e| format!("invalid X.509 certificate: {}", e))?;

        let timestamp = cert.validity().not_after.timestamp();
        let not_after = DateTime::from_timestamp(timestamp, 0)
            .ok_or_else(|| format!("expiry timestamp out of range: {}", timestamp))?;

        Ok(Self { not_after })
    }

    /// Whole days until expiry, rounded down
    ///
    /// Negative once the certificate has expired.
    pub fn days_until_expiry(&self, now: DateTime<Utc>) -> i64 {
        (self.not_after - now).num_seconds().div_euclid(SECONDS_PER_DAY)
    }
}

/// Why a renewal decision was made
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionReason {
    /// `force_new_certificate` was set; the existing certificate was not read
    ForcedNew,
    /// No readable certificate exists
    NoCertificate,
    /// The certificate expires within the renewal window
    ExpiringSoon { days_remaining: i64 },
    /// The certificate is still valid but `force_renew` was set
    ForcedRenewal { days_remaining: i64 },
    /// The certificate is still valid
    StillValid { days_remaining: i64 },
}

/// Outcome of the renewal gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenewalDecision {
    pub proceed: bool,
    pub reason: DecisionReason,
}

impl fmt::Display for RenewalDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reason {
            DecisionReason::ForcedNew => write!(f, "forced new certificate"),
            DecisionReason::NoCertificate => write!(f, "no valid certificate found"),
            DecisionReason::ExpiringSoon { days_remaining } => {
                write!(f, "certificate expires in {} days", days_remaining)
            }
            DecisionReason::ForcedRenewal { days_remaining } => write!(
                f,
                "forced renewal of certificate valid for {} more days",
                days_remaining
            ),
            DecisionReason::StillValid { days_remaining } => {
                write!(f, "certificate still valid for {} days", days_remaining)
            }
        }
    }
}

/// Renewal gate configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiryPolicy {
    pub force_new_certificate: bool,
    pub force_renew: bool,
    /// Renew when at most this many whole days remain
    pub renew_before_days: u32,
}

impl ExpiryPolicy {
    /// Decide from an already parsed `not_after`
    ///
    /// `existing` is `None` when there is no usable certificate.
    pub fn decide(
        &self,
        existing: Option<ExistingCertificate>,
        now: DateTime<Utc>,
    ) -> RenewalDecision {
        if self.force_new_certificate {
            return RenewalDecision {
                proceed: true,
                reason: DecisionReason::ForcedNew,
            };
        }

        let Some(cert) = existing else {
            return RenewalDecision {
                proceed: true,
                reason: DecisionReason::NoCertificate,
            };
        };

        let days_remaining = cert.days_until_expiry(now);
        if days_remaining <= i64::from(self.renew_before_days) {
            RenewalDecision {
                proceed: true,
                reason: DecisionReason::ExpiringSoon { days_remaining },
            }
        } else if self.force_renew {
            RenewalDecision {
                proceed: true,
                reason: DecisionReason::ForcedRenewal { days_remaining },
            }
        } else {
            RenewalDecision {
                proceed: false,
                reason: DecisionReason::StillValid { days_remaining },
            }
        }
    }

    /// Read `cert_path` (unless forced) and decide
    ///
    /// Unreadable or unparsable certificates are logged and treated as
    /// missing.
    pub fn evaluate(&self, cert_path: &Path, now: DateTime<Utc>) -> RenewalDecision {
        if self.force_new_certificate {
            debug!("Forced new certificate, skipping expiry check");
            return self.decide(None, now);
        }

        let existing = if cert_path.exists() {
            match ExistingCertificate::read(cert_path) {
                Ok(cert) => {
                    debug!(
                        path = %cert_path.display(),
                        not_after = %cert.not_after,
                        "Loaded existing certificate"
                    );
                    Some(cert)
                }
                Err(e) => {
                    warn!(error = %e, "Existing certificate unusable, renewing");
                    None
                }
            }
        } else {
            debug!(path = %cert_path.display(), "No existing certificate found");
            None
        };

        let decision = self.decide(existing, now);
        info!(proceed = decision.proceed, reason = %decision, "Renewal decision");
        decision
    }
}
