//! HTTP-01 challenge token store
//!
//! Holds the token -> key authorization mapping that the challenge
//! responder serves under `/.well-known/acme-challenge/<token>`.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, trace};

use super::error::AcmeError;

/// HTTP-01 challenge path prefix
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// An HTTP-01 challenge the ACME server expects to be answered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingChallenge {
    /// Domain this challenge is for
    pub domain: String,
    /// Challenge token (appears in URL path)
    pub token: String,
    /// Key authorization (the response content)
    pub key_authorization: String,
    /// Challenge URL for validation notification
    pub url: String,
}

/// Hooks the orchestrator calls around each challenge
///
/// `on_challenge_ready` must have published the key authorization by the
/// time it returns; the orchestrator only tells the ACME server the
/// challenge is ready afterwards. `on_challenge_done` is cleanup and cannot
/// fail the flow.
pub trait ChallengeHooks: Send + Sync {
    fn on_challenge_ready(&self, challenge: &PendingChallenge) -> Result<(), AcmeError>;

    fn on_challenge_done(&self, challenge: &PendingChallenge);
}

/// In-memory store of pending HTTP-01 challenges
///
/// Clones share the same map, so the run can hand one handle to the
/// responder and another to the orchestrator.
///
/// # Thread Safety
///
/// Uses `DashMap` so request handlers can read while the orchestrator
/// inserts or removes tokens.
#[derive(Debug, Clone, Default)]
pub struct ChallengeStore {
    /// Map of challenge token -> key authorization response
    challenges: Arc<DashMap<String, String>>,
}

impl ChallengeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending challenge
    pub fn put(&self, token: &str, key_authorization: &str) {
        debug!(token = %token, "Registering ACME HTTP-01 challenge");
        self.challenges
            .insert(token.to_string(), key_authorization.to_string());
    }

    /// Get the key authorization for a challenge token
    pub fn get(&self, token: &str) -> Option<String> {
        let result = self.challenges.get(token).map(|v| v.clone());
        if result.is_some() {
            trace!(token = %token, "ACME challenge token found");
        } else {
            trace!(token = %token, "ACME challenge token not found");
        }
        result
    }

    /// Remove a completed or expired challenge
    pub fn remove(&self, token: &str) {
        if self.challenges.remove(token).is_some() {
            debug!(token = %token, "Removed ACME challenge");
        }
    }

    /// Number of pending challenges
    pub fn len(&self) -> usize {
        self.challenges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.challenges.is_empty()
    }

    /// Clear all pending challenges
    pub fn clear(&self) {
        let count = self.challenges.len();
        self.challenges.clear();
        if count > 0 {
            debug!(cleared = count, "Cleared all pending ACME challenges");
        }
    }

    /// Extract the token from an ACME challenge request path
    ///
    /// Returns `None` for paths outside the challenge prefix, for an empty
    /// token and for tokens containing further path segments.
    pub fn extract_token(path: &str) -> Option<&str> {
        path.strip_prefix(ACME_CHALLENGE_PREFIX)
            .filter(|token| !token.is_empty() && !token.contains('/'))
    }
}

impl ChallengeHooks for ChallengeStore {
    fn on_challenge_ready(&self, challenge: &PendingChallenge) -> Result<(), AcmeError> {
        self.put(&challenge.token, &challenge.key_authorization);
        Ok(())
    }

    fn on_challenge_done(&self, challenge: &PendingChallenge) {
        self.remove(&challenge.token);
    }
}
