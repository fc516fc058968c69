//! Shared test utilities for integration tests
//!
//! Provides a scripted [`AcmeBackend`] that records every call and, when
//! asked to mark a challenge ready, looks the token up the way the ACME
//! server would.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use certsmith::{AcmeBackend, AcmeError, ChallengeStore, PendingChallenge};

/// Steps of the ACME exchange, used to inject failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    RegisterAccount,
    NewOrder,
    SetChallengeReady,
    WaitUntilReady,
    Finalize,
}

/// A call observed by the fake backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    RegisterAccount(String),
    NewOrder(String),
    /// `served` is what the challenge URL returned when readiness was signalled
    SetChallengeReady { token: String, served: Option<String> },
    WaitUntilReady,
    Finalize,
}

/// How the fake checks that a challenge is being served
#[derive(Debug, Clone)]
pub enum Probe {
    /// Read the store directly
    Store(ChallengeStore),
    /// Issue a real HTTP request, like the ACME server's validator
    Http(SocketAddr),
}

type ErrorFactory = Box<dyn Fn() -> AcmeError + Send + Sync>;

pub struct FakeBackend {
    calls: Arc<Mutex<Vec<Call>>>,
    challenges: Vec<PendingChallenge>,
    chain: String,
    probe: Option<Probe>,
    failure: Option<(Step, ErrorFactory)>,
}

impl FakeBackend {
    pub fn new(challenges: Vec<PendingChallenge>, chain: impl Into<String>) -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            challenges,
            chain: chain.into(),
            probe: None,
            failure: None,
        }
    }

    pub fn with_probe(mut self, probe: Probe) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn failing_at(
        mut self,
        step: Step,
        error: impl Fn() -> AcmeError + Send + Sync + 'static,
    ) -> Self {
        self.failure = Some((step, Box::new(error)));
        self
    }

    /// Handle to the recorded calls that outlives the backend
    pub fn calls(&self) -> Arc<Mutex<Vec<Call>>> {
        Arc::clone(&self.calls)
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn check(&self, step: Step) -> Result<(), AcmeError> {
        match &self.failure {
            Some((failing, error)) if *failing == step => Err(error()),
            _ => Ok(()),
        }
    }

    async fn observe(&self, token: &str) -> Option<String> {
        match self.probe.as_ref()? {
            Probe::Store(store) => store.get(token),
            Probe::Http(addr) => {
                let url = format!("http://{}/.well-known/acme-challenge/{}", addr, token);
                let resp = reqwest::get(url).await.ok()?;
                if resp.status() == reqwest::StatusCode::OK {
                    resp.text().await.ok()
                } else {
                    None
                }
            }
        }
    }
}

#[async_trait]
impl AcmeBackend for FakeBackend {
    async fn register_account(&mut self, contact_email: &str) -> Result<(), AcmeError> {
        self.record(Call::RegisterAccount(contact_email.to_string()));
        self.check(Step::RegisterAccount)
    }

    async fn new_order(&mut self, domain: &str) -> Result<Vec<PendingChallenge>, AcmeError> {
        self.record(Call::NewOrder(domain.to_string()));
        self.check(Step::NewOrder)?;
        Ok(self.challenges.clone())
    }

    async fn set_challenge_ready(&mut self, challenge: &PendingChallenge) -> Result<(), AcmeError> {
        let served = self.observe(&challenge.token).await;
        self.record(Call::SetChallengeReady {
            token: challenge.token.clone(),
            served,
        });
        self.check(Step::SetChallengeReady)
    }

    async fn wait_until_ready(&mut self) -> Result<(), AcmeError> {
        self.record(Call::WaitUntilReady);
        self.check(Step::WaitUntilReady)
    }

    async fn finalize(&mut self, csr_der: &[u8]) -> Result<String, AcmeError> {
        assert!(!csr_der.is_empty(), "finalize called without a CSR");
        self.record(Call::Finalize);
        self.check(Step::Finalize)?;
        Ok(self.chain.clone())
    }
}

/// A pending HTTP-01 challenge for `domain`
pub fn challenge(domain: &str, token: &str) -> PendingChallenge {
    PendingChallenge {
        domain: domain.to_string(),
        token: token.to_string(),
        key_authorization: format!("{}.account-thumbprint", token),
        url: format!("https://acme.test/chall/{}", token),
    }
}

/// PEM of a self-signed certificate valid until the given date
pub fn certificate_pem(name: &str, not_after: (i32, u8, u8)) -> String {
    let key = rcgen::KeyPair::generate().unwrap();
    let mut params = rcgen::CertificateParams::new(vec![name.to_string()]).unwrap();
    params.not_before = rcgen::date_time_ymd(2020, 1, 1);
    params.not_after = rcgen::date_time_ymd(not_after.0, not_after.1, not_after.2);
    params.self_signed(&key).unwrap().pem()
}

/// A leaf and an intermediate certificate, returned as (leaf, intermediate)
pub fn two_block_chain(domain: &str) -> (String, String) {
    (
        certificate_pem(domain, (2099, 1, 1)),
        certificate_pem("Test Intermediate", (2099, 6, 1)),
    )
}

/// A loopback address that was free a moment ago
pub fn free_local_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}
