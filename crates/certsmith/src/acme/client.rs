//! ACME issuance
//!
//! [`AcmeOrchestrator`] drives one order from account registration to the
//! signed chain. The protocol itself sits behind [`AcmeBackend`];
//! [`InstantAcmeBackend`] implements it with `instant-acme`.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, Order, OrderStatus,
};
use tokio::time::Instant;
use tracing::{debug, error, info, trace};

use super::challenge::{ChallengeHooks, PendingChallenge};
use super::error::AcmeError;
use super::storage::IssuedCertificate;

/// Timeout for certificate issuance after finalization
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
/// Timeout for challenge validation
const CHALLENGE_TIMEOUT: Duration = Duration::from_secs(120);
/// Delay between order status polls while challenges validate
const POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Delay between order status polls after finalization
const FINALIZE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// ACME protocol operations needed for one HTTP-01 order
///
/// Calls arrive in order: `register_account`, `new_order`, then
/// `set_challenge_ready` once per returned challenge, `wait_until_ready`,
/// and finally `finalize`.
#[async_trait]
pub trait AcmeBackend: Send {
    /// Create (or load) the account, agreeing to the terms of service
    async fn register_account(&mut self, contact_email: &str) -> Result<(), AcmeError>;

    /// Create an order for `domain` and return its pending HTTP-01 challenges
    ///
    /// Authorizations that are already valid yield no challenge.
    async fn new_order(&mut self, domain: &str) -> Result<Vec<PendingChallenge>, AcmeError>;

    /// Tell the server the challenge response is being served
    async fn set_challenge_ready(&mut self, challenge: &PendingChallenge) -> Result<(), AcmeError>;

    /// Poll until the order is ready for finalization
    async fn wait_until_ready(&mut self) -> Result<(), AcmeError>;

    /// Submit the CSR and return the issued chain as PEM
    async fn finalize(&mut self, csr_der: &[u8]) -> Result<String, AcmeError>;
}

/// A freshly generated certificate key and its signing request
pub struct CertificateRequest {
    /// PEM-encoded private key
    pub key_pem: String,
    /// DER-encoded PKCS#10 request
    pub der: Vec<u8>,
}

/// Generate a certificate key and a CSR with `domain` as its common name
pub fn generate_csr(domain: &str) -> Result<CertificateRequest, AcmeError> {
    let key = rcgen::KeyPair::generate()
        .map_err(|e| AcmeError::Csr(format!("Failed to generate key: {}", e)))?;

    // CAs take the name from the SAN extension, so it mirrors the CN
    let mut params = rcgen::CertificateParams::new(vec![domain.to_string()])
        .map_err(|e| AcmeError::Csr(format!("Failed to create CSR params: {}", e)))?;
    let mut distinguished_name = rcgen::DistinguishedName::new();
    distinguished_name.push(rcgen::DnType::CommonName, domain.to_string());
    params.distinguished_name = distinguished_name;

    let csr = params
        .serialize_request(&key)
        .map_err(|e| AcmeError::Csr(format!("Failed to serialize CSR: {}", e)))?;

    Ok(CertificateRequest {
        key_pem: key.serialize_pem(),
        der: csr.der().to_vec(),
    })
}

/// Runs the issuance flow for a single domain
pub struct AcmeOrchestrator<B> {
    backend: B,
}

impl<B: AcmeBackend> AcmeOrchestrator<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    /// Obtain a certificate for `domain`
    ///
    /// Each challenge is published through `hooks` before the server is told
    /// it is ready, and retracted once validation has concluded, whether it
    /// succeeded or not.
    pub async fn issue(
        &mut self,
        domain: &str,
        contact_email: &str,
        hooks: &dyn ChallengeHooks,
    ) -> Result<IssuedCertificate, AcmeError> {
        let start = Instant::now();
        info!(domain = %domain, "Starting certificate issuance");

        self.backend.register_account(contact_email).await?;

        let request = generate_csr(domain)?;
        debug!(domain = %domain, "Generated certificate key and CSR");

        let challenges = self.backend.new_order(domain).await?;
        info!(
            domain = %domain,
            challenges = challenges.len(),
            "Order created"
        );

        let mut published = Vec::with_capacity(challenges.len());
        let validation = self
            .validate_challenges(&challenges, hooks, &mut published)
            .await;

        for challenge in published {
            hooks.on_challenge_done(challenge);
        }
        validation?;

        let full_chain_pem = self.backend.finalize(&request.der).await?;

        info!(
            domain = %domain,
            elapsed_secs = start.elapsed().as_secs(),
            "Certificate issued"
        );

        Ok(IssuedCertificate {
            private_key_pem: request.key_pem,
            full_chain_pem,
        })
    }

    async fn validate_challenges<'a>(
        &mut self,
        challenges: &'a [PendingChallenge],
        hooks: &dyn ChallengeHooks,
        published: &mut Vec<&'a PendingChallenge>,
    ) -> Result<(), AcmeError> {
        for challenge in challenges {
            hooks.on_challenge_ready(challenge)?;
            published.push(challenge);

            debug!(domain = %challenge.domain, token = %challenge.token, "Challenge published");
            self.backend.set_challenge_ready(challenge).await?;
        }

        self.backend.wait_until_ready().await
    }
}

impl<B> std::fmt::Debug for AcmeOrchestrator<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcmeOrchestrator").finish_non_exhaustive()
    }
}

/// [`AcmeBackend`] backed by `instant-acme`
pub struct InstantAcmeBackend {
    directory_url: String,
    /// Where account credentials are loaded from and saved to, if anywhere
    credentials_path: Option<PathBuf>,
    account: Option<Account>,
    order: Option<Order>,
}

impl InstantAcmeBackend {
    pub fn new(directory_url: impl Into<String>) -> Self {
        Self {
            directory_url: directory_url.into(),
            credentials_path: None,
            account: None,
            order: None,
        }
    }

    /// Reuse the account stored at `path`, creating and saving one if absent
    pub fn with_credentials_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.credentials_path = Some(path.into());
        self
    }

    pub fn directory_url(&self) -> &str {
        &self.directory_url
    }

    fn order_mut(&mut self) -> Result<&mut Order, AcmeError> {
        self.order.as_mut().ok_or(AcmeError::NoOrder)
    }

    async fn load_account(&self) -> Result<Option<Account>, AcmeError> {
        let Some(path) = &self.credentials_path else {
            return Ok(None);
        };
        if !path.exists() {
            trace!(path = %path.display(), "No stored ACME account found");
            return Ok(None);
        }

        let json = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| AcmeError::Credentials(format!("{}: {}", path.display(), e)))?;
        let credentials: AccountCredentials = serde_json::from_str(&json).map_err(|e| {
            AcmeError::Credentials(format!("Failed to deserialize {}: {}", path.display(), e))
        })?;

        let account = Account::from_credentials(credentials)
            .await
            .map_err(|e| AcmeError::from_acme(e, AcmeError::AccountCreation))?;

        info!(path = %path.display(), "Loaded existing ACME account");
        Ok(Some(account))
    }

    async fn save_credentials(&self, credentials: &AccountCredentials) -> Result<(), AcmeError> {
        let Some(path) = &self.credentials_path else {
            return Ok(());
        };

        let json = serde_json::to_string_pretty(credentials).map_err(|e| {
            AcmeError::Credentials(format!("Failed to serialize credentials: {}", e))
        })?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AcmeError::Credentials(format!("{}: {}", parent.display(), e)))?;
        }
        tokio::fs::write(path, json)
            .await
            .map_err(|e| AcmeError::Credentials(format!("{}: {}", path.display(), e)))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .await
                .map_err(|e| AcmeError::Credentials(format!("{}: {}", path.display(), e)))?;
        }

        info!(path = %path.display(), "Saved ACME account credentials");
        Ok(())
    }

    /// Describe why an order became invalid from its failed challenges
    async fn invalid_order_error(&mut self) -> AcmeError {
        let order = match self.order_mut() {
            Ok(order) => order,
            Err(e) => return e,
        };

        let authorizations = match order.authorizations().await {
            Ok(authorizations) => authorizations,
            Err(e) => return AcmeError::from_acme(e, AcmeError::OrderCreation),
        };

        for authz in &authorizations {
            if authz.status != AuthorizationStatus::Invalid {
                continue;
            }
            let domain = identifier_domain(&authz.identifier);
            let problem = authz
                .challenges
                .iter()
                .find_map(|challenge| challenge.error.as_ref());

            return match problem {
                Some(problem) => AcmeError::classify_problem(
                    problem.r#type.as_deref(),
                    problem.detail.as_deref(),
                    |message| AcmeError::ChallengeValidation {
                        domain: domain.clone(),
                        message,
                    },
                ),
                None => AcmeError::ChallengeValidation {
                    domain,
                    message: "authorization is invalid".to_string(),
                },
            };
        }

        AcmeError::OrderCreation("Order became invalid".to_string())
    }
}

fn identifier_domain(identifier: &Identifier) -> String {
    #[allow(unreachable_patterns)]
    match identifier {
        Identifier::Dns(domain) => domain.clone(),
        other => format!("{:?}", other),
    }
}

#[async_trait]
impl AcmeBackend for InstantAcmeBackend {
    async fn register_account(&mut self, contact_email: &str) -> Result<(), AcmeError> {
        if let Some(account) = self.load_account().await? {
            self.account = Some(account);
            return Ok(());
        }

        info!(
            email = %contact_email,
            directory = %self.directory_url,
            "Creating new ACME account"
        );

        let contact = format!("mailto:{}", contact_email);
        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &[&contact],
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            &self.directory_url,
            None,
        )
        .await
        .map_err(|e| AcmeError::from_acme(e, AcmeError::AccountCreation))?;

        self.save_credentials(&credentials).await?;
        self.account = Some(account);
        info!("ACME account created successfully");

        Ok(())
    }

    async fn new_order(&mut self, domain: &str) -> Result<Vec<PendingChallenge>, AcmeError> {
        let account = self.account.as_ref().ok_or(AcmeError::NoAccount)?;

        info!(domain = %domain, "Creating certificate order");

        let identifiers = [Identifier::Dns(domain.to_string())];
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await
            .map_err(|e| AcmeError::from_acme(e, AcmeError::OrderCreation))?;

        let authorizations = order.authorizations().await.map_err(|e| {
            AcmeError::from_acme(e, |m| {
                AcmeError::OrderCreation(format!("Failed to get authorization: {}", m))
            })
        })?;

        let mut challenges = Vec::new();
        for authz in &authorizations {
            let domain = identifier_domain(&authz.identifier);
            debug!(domain = %domain, status = ?authz.status, "Processing authorization");

            match &authz.status {
                AuthorizationStatus::Valid => {
                    debug!(domain = %domain, "Authorization already valid");
                    continue;
                }
                AuthorizationStatus::Pending => {}
                status => {
                    return Err(AcmeError::ChallengeValidation {
                        domain,
                        message: format!("authorization is {:?}", status),
                    });
                }
            }

            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
                .ok_or_else(|| AcmeError::NoHttp01Challenge(domain.clone()))?;

            challenges.push(PendingChallenge {
                domain,
                token: challenge.token.clone(),
                key_authorization: order.key_authorization(challenge).as_str().to_string(),
                url: challenge.url.clone(),
            });
        }

        self.order = Some(order);
        Ok(challenges)
    }

    async fn set_challenge_ready(&mut self, challenge: &PendingChallenge) -> Result<(), AcmeError> {
        debug!(challenge_url = %challenge.url, "Setting challenge ready");

        self.order_mut()?
            .set_challenge_ready(&challenge.url)
            .await
            .map_err(|e| {
                AcmeError::from_acme(e, |message| AcmeError::ChallengeValidation {
                    domain: challenge.domain.clone(),
                    message,
                })
            })
    }

    async fn wait_until_ready(&mut self) -> Result<(), AcmeError> {
        let start = Instant::now();

        loop {
            let status = self
                .order_mut()?
                .refresh()
                .await
                .map_err(|e| AcmeError::from_acme(e, AcmeError::OrderCreation))?
                .status;

            match status {
                OrderStatus::Ready => {
                    info!("Order is ready for finalization");
                    return Ok(());
                }
                OrderStatus::Valid => {
                    info!("Order is already valid (certificate issued)");
                    return Ok(());
                }
                OrderStatus::Invalid => {
                    error!("Order became invalid");
                    return Err(self.invalid_order_error().await);
                }
                OrderStatus::Pending | OrderStatus::Processing => {
                    if start.elapsed() > CHALLENGE_TIMEOUT {
                        return Err(AcmeError::Timeout {
                            message: "waiting for challenge validation".to_string(),
                            elapsed: start.elapsed(),
                        });
                    }
                    trace!(status = ?status, "Order not ready yet, waiting...");
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            }
        }
    }

    async fn finalize(&mut self, csr_der: &[u8]) -> Result<String, AcmeError> {
        info!("Finalizing certificate order");

        let order = self.order_mut()?;
        order.finalize(csr_der).await.map_err(|e| {
            AcmeError::from_acme(e, |m| {
                AcmeError::Finalization(format!("Failed to finalize order: {}", m))
            })
        })?;

        let start = Instant::now();
        loop {
            let status = order
                .refresh()
                .await
                .map_err(|e| AcmeError::from_acme(e, AcmeError::Finalization))?
                .status;

            match status {
                OrderStatus::Valid => {
                    let chain = order.certificate().await.map_err(|e| {
                        AcmeError::from_acme(e, |m| {
                            AcmeError::Finalization(format!("Failed to get certificate: {}", m))
                        })
                    })?;
                    return chain.ok_or_else(|| {
                        AcmeError::Finalization("No certificate in response".to_string())
                    });
                }
                OrderStatus::Invalid => {
                    return Err(AcmeError::Finalization("Order became invalid".to_string()));
                }
                _ => {
                    if start.elapsed() > DEFAULT_TIMEOUT {
                        return Err(AcmeError::Timeout {
                            message: "waiting for certificate".to_string(),
                            elapsed: start.elapsed(),
                        });
                    }
                    tokio::time::sleep(FINALIZE_POLL_INTERVAL).await;
                }
            }
        }
    }
}

impl std::fmt::Debug for InstantAcmeBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstantAcmeBackend")
            .field("directory_url", &self.directory_url)
            .field("credentials_path", &self.credentials_path)
            .field("has_account", &self.account.is_some())
            .field("has_order", &self.order.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use x509_parser::prelude::*;

    #[test]
    fn test_generate_csr_sets_common_name() {
        let request = generate_csr("example.org").unwrap();

        assert!(request.key_pem.contains("PRIVATE KEY"));

        let (_, csr) = X509CertificationRequest::from_der(&request.der).unwrap();
        let cn = csr
            .certification_request_info
            .subject
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok());
        assert_eq!(cn, Some("example.org"));
    }

    #[test]
    fn test_generate_csr_uses_fresh_keys() {
        let first = generate_csr("example.org").unwrap();
        let second = generate_csr("example.org").unwrap();
        assert_ne!(first.key_pem, second.key_pem);
    }

    #[tokio::test]
    async fn test_backend_requires_account_before_order() {
        let mut backend = InstantAcmeBackend::new("https://acme.invalid/directory");
        let err = backend.new_order("example.org").await.unwrap_err();
        assert!(matches!(err, AcmeError::NoAccount));
    }

    #[tokio::test]
    async fn test_backend_requires_order_before_finalize() {
        let mut backend = InstantAcmeBackend::new("https://acme.invalid/directory");
        assert!(matches!(
            backend.wait_until_ready().await.unwrap_err(),
            AcmeError::NoOrder
        ));
        assert!(matches!(
            backend.finalize(&[]).await.unwrap_err(),
            AcmeError::NoOrder
        ));
    }

    #[tokio::test]
    async fn test_corrupt_credentials_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("account.json");
        std::fs::write(&path, "{not json").unwrap();

        let mut backend =
            InstantAcmeBackend::new("https://acme.invalid/directory").with_credentials_path(&path);
        let err = backend.register_account("admin@example.org").await.unwrap_err();
        assert!(matches!(err, AcmeError::Credentials(_)));
    }
}
