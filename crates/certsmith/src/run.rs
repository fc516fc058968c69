//! One renewal run
//!
//! Sequences the expiry gate, the challenge responder, the ACME exchange and
//! the artifact writes for a single domain.

use std::net::SocketAddr;
use std::path::PathBuf;

use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};

use certsmith_config::{AcmeDirectory, RenewalConfig};

use crate::acme::{
    AcmeBackend, AcmeError, AcmeOrchestrator, CertificateMaterializer, ChallengeResponder,
    ChallengeStore, ExpiryPolicy, InstantAcmeBackend, MaterializedPaths, RenewalDecision,
    ResponderError, StorageError,
};

/// Settings for one run, fixed once built from configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenewalContext {
    pub domain: String,
    pub contact_email: String,
    pub directory: AcmeDirectory,
    /// Resolved from `directory`
    pub directory_url: &'static str,
    pub force_new_certificate: bool,
    pub force_renew: bool,
    pub certs_dir: PathBuf,
    pub renew_before_days: u32,
    pub listen_address: SocketAddr,
    pub account_credentials: Option<PathBuf>,
}

impl From<&RenewalConfig> for RenewalContext {
    fn from(config: &RenewalConfig) -> Self {
        let directory = config.directory();
        Self {
            domain: config.domain.clone(),
            contact_email: config.email.clone(),
            directory,
            directory_url: directory.url(),
            force_new_certificate: config.force_new_certificate,
            force_renew: config.force_renew,
            certs_dir: config.certs_dir.clone(),
            renew_before_days: config.renew_before_days,
            listen_address: config.listen_address,
            account_credentials: config.account_credentials.clone(),
        }
    }
}

impl RenewalContext {
    pub fn expiry_policy(&self) -> ExpiryPolicy {
        ExpiryPolicy {
            force_new_certificate: self.force_new_certificate,
            force_renew: self.force_renew,
            renew_before_days: self.renew_before_days,
        }
    }

    /// The production backend for this context
    pub fn backend(&self) -> InstantAcmeBackend {
        let backend = InstantAcmeBackend::new(self.directory_url);
        match &self.account_credentials {
            Some(path) => backend.with_credentials_path(path),
            None => backend,
        }
    }

    pub fn materializer(&self) -> CertificateMaterializer {
        CertificateMaterializer::new(&self.certs_dir)
    }
}

/// How a successful run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The existing certificate is still good; nothing was contacted
    Skipped(RenewalDecision),
    /// A new certificate was issued and written
    Issued {
        decision: RenewalDecision,
        paths: MaterializedPaths,
    },
}

/// Errors that fail a run
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Responder(#[from] ResponderError),

    #[error(transparent)]
    Acme(#[from] AcmeError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl RunError {
    /// Remediation hint for the operator, if one applies
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            RunError::Responder(e) => e.hint(),
            RunError::Acme(e) => e.hint(),
            RunError::Storage(_) => None,
        }
    }
}

/// A single renewal decision and, if needed, issuance
#[derive(Debug)]
pub struct RenewalRun {
    context: RenewalContext,
}

impl RenewalRun {
    pub fn new(context: RenewalContext) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &RenewalContext {
        &self.context
    }

    /// Apply the expiry gate to the certificate currently on disk
    pub fn check(&self) -> RenewalDecision {
        self.context
            .expiry_policy()
            .evaluate(&self.context.materializer().cert_path(), Utc::now())
    }

    /// Run the renewal against `backend`
    ///
    /// The responder is only bound when the gate says to proceed, and it is
    /// stopped again before any artifact is written.
    pub async fn run<B: AcmeBackend>(&self, backend: B) -> Result<RunOutcome, RunError> {
        let ctx = &self.context;

        let decision = self.check();
        if !decision.proceed {
            info!(domain = %ctx.domain, reason = %decision, "Renewal not needed, skipping");
            return Ok(RunOutcome::Skipped(decision));
        }

        info!(
            domain = %ctx.domain,
            directory = %ctx.directory,
            reason = %decision,
            "Renewing certificate"
        );

        let store = ChallengeStore::new();
        let mut responder = ChallengeResponder::new(ctx.listen_address, store.clone());
        responder.start().await?;

        let mut orchestrator = AcmeOrchestrator::new(backend);
        let issued = orchestrator
            .issue(&ctx.domain, &ctx.contact_email, &store)
            .await;

        responder.stop().await;
        if !store.is_empty() {
            warn!(remaining = store.len(), "Challenges left after issuance, clearing");
            store.clear();
        }

        let issued = issued?;
        let paths = ctx.materializer().write(&issued)?;

        info!(
            domain = %ctx.domain,
            certs_dir = %ctx.certs_dir.display(),
            "Certificate renewal completed"
        );

        Ok(RunOutcome::Issued { decision, paths })
    }
}
