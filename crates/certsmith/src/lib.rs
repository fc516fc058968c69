//! certsmith Library
//!
//! One-shot ACME certificate issuance and renewal over HTTP-01.
//!
//! A run reads the certificate already on disk, decides whether it needs
//! renewing, and if so binds a transient HTTP-01 responder, drives one ACME
//! order and writes the result as `privkey.pem`, `fullchain.pem`,
//! `cert.pem`, `chain.pem` and `bundle.pem`.
//!
//! # Example
//!
//! ```ignore
//! use certsmith::{RenewalContext, RenewalRun};
//! use certsmith_config::RenewalConfig;
//!
//! let config = RenewalConfig::from_file("certsmith.kdl")?;
//! let context = RenewalContext::from(&config);
//! let backend = context.backend();
//! let outcome = RenewalRun::new(context).run(backend).await?;
//! ```

// ============================================================================
// Module Declarations
// ============================================================================

pub mod acme;
pub mod run;

// ============================================================================
// Public API Re-exports
// ============================================================================

pub use acme::{
    AcmeBackend, AcmeError, AcmeOrchestrator, CertificateMaterializer, ChallengeHooks,
    ChallengeResponder, ChallengeStore, ExpiryPolicy, InstantAcmeBackend, IssuedCertificate,
    PendingChallenge, RenewalDecision,
};
pub use run::{RenewalContext, RenewalRun, RunError, RunOutcome};
