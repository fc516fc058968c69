//! ACME certificate issuance over HTTP-01
//!
//! # Architecture
//!
//! - [`ChallengeStore`] - Pending HTTP-01 tokens and their key authorizations
//! - [`ChallengeResponder`] - Transient HTTP server answering validation requests
//! - [`ExpiryPolicy`] - Decides whether the certificate on disk needs renewing
//! - [`AcmeOrchestrator`] - Drives the order through an [`AcmeBackend`]
//! - [`CertificateMaterializer`] - Writes the issued chain and key to disk
//!
//! # Challenge Flow
//!
//! 1. [`AcmeBackend::new_order`] creates the order and returns the HTTP-01 challenge
//! 2. [`ChallengeHooks::on_challenge_ready`] puts the token into the [`ChallengeStore`]
//! 3. Only then is the ACME server told the challenge is ready
//! 4. The server requests `/.well-known/acme-challenge/<token>` from the [`ChallengeResponder`]
//! 5. Once validation concludes, [`ChallengeHooks::on_challenge_done`] removes the token
//! 6. The order is finalized with the CSR and the chain is handed to the [`CertificateMaterializer`]

pub mod challenge;
pub mod client;
pub mod error;
pub mod expiry;
pub mod responder;
pub mod storage;

pub use challenge::{ChallengeHooks, ChallengeStore, PendingChallenge, ACME_CHALLENGE_PREFIX};
pub use client::{generate_csr, AcmeBackend, AcmeOrchestrator, InstantAcmeBackend};
pub use error::{AcmeError, ExpiryError, ResponderError, StorageError};
pub use expiry::{DecisionReason, ExistingCertificate, ExpiryPolicy, RenewalDecision};
pub use responder::ChallengeResponder;
pub use storage::{split_chain, CertificateMaterializer, IssuedCertificate, MaterializedPaths};
