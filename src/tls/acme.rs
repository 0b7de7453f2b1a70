//! Certificate issuance against the ACME authority.
//!
//! The [`Issuer`] trait is the gateway's entire contract with the authority:
//! supply domain-validation proof, receive a signed certificate and chain.
//! [`AcmeIssuer`] implements it over `instant-acme` with the HTTP-01
//! challenge, answered by the plaintext listener through the shared
//! [`ChallengeSet`]. Tests substitute a counting mock.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use instant_acme::{
    Account, AuthorizationStatus, ChallengeType, Identifier, LetsEncrypt, NewAccount, NewOrder,
    OrderStatus, RetryPolicy,
};
use tokio::sync::Mutex;

use super::challenge::ChallengeSet;
use super::store::CertStore;
use crate::error::StoreError;

/// A freshly issued certificate with its chain and private key.
#[derive(Debug, Clone)]
pub struct IssuedCert {
    pub cert_pem: String,
    pub key_pem: String,
    pub not_after: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum IssueError {
    #[error("ACME protocol error: {0}")]
    Acme(#[from] instant_acme::Error),

    #[error("challenge failed for {hostname}: {reason}")]
    Challenge { hostname: String, reason: String },

    #[error("issued certificate could not be parsed: {0}")]
    Parse(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("account credentials error: {0}")]
    Credentials(#[from] serde_json::Error),
}

/// The authority seam. At most one call per hostname is ever in flight;
/// the certificate manager enforces that, not the issuer.
#[async_trait]
pub trait Issuer: Send + Sync + 'static {
    async fn issue(&self, hostname: &str) -> Result<IssuedCert, IssueError>;
}

/// `instant-acme` backed issuer using the HTTP-01 challenge.
pub struct AcmeIssuer {
    directory_url: String,
    contact_email: String,
    challenges: ChallengeSet,
    store: Arc<CertStore>,
    // Lazily created on first issuance, then reused for every order.
    account: Mutex<Option<Account>>,
}

impl AcmeIssuer {
    pub fn new(
        production: bool,
        contact_email: String,
        challenges: ChallengeSet,
        store: Arc<CertStore>,
    ) -> Self {
        let directory = if production {
            LetsEncrypt::Production
        } else {
            LetsEncrypt::Staging
        };
        Self {
            directory_url: directory.url().to_owned(),
            contact_email,
            challenges,
            store,
            account: Mutex::new(None),
        }
    }

    /// Load the persisted ACME account or register a new one.
    async fn account(&self) -> Result<Account, IssueError> {
        let mut guard = self.account.lock().await;
        if let Some(account) = guard.as_ref() {
            return Ok(account.clone());
        }

        let account = match self.store.load_account()? {
            Some(json) => {
                let credentials = serde_json::from_str(&json)?;
                Account::builder()?.from_credentials(credentials).await?
            }
            None => {
                let mailto = format!("mailto:{}", self.contact_email);
                let (account, credentials) = Account::builder()?
                    .create(
                        &NewAccount {
                            contact: &[&mailto],
                            terms_of_service_agreed: true,
                            only_return_existing: false,
                        },
                        self.directory_url.clone(),
                        None,
                    )
                    .await?;
                self.store.save_account(&serde_json::to_string(&credentials)?)?;
                tracing::info!(contact = %self.contact_email, "Registered ACME account");
                account
            }
        };

        *guard = Some(account.clone());
        Ok(account)
    }

    async fn run_order(&self, hostname: &str) -> Result<IssuedCert, IssueError> {
        let account = self.account().await?;

        let identifiers = [Identifier::Dns(hostname.to_string())];
        let mut order = account.new_order(&NewOrder::new(&identifiers)).await?;

        let mut tokens = Vec::new();
        {
            let mut authorizations = order.authorizations();
            while let Some(result) = authorizations.next().await {
                let mut authz = result?;
                match authz.status {
                    AuthorizationStatus::Pending => {}
                    AuthorizationStatus::Valid => continue,
                    status => {
                        return Err(IssueError::Challenge {
                            hostname: hostname.to_string(),
                            reason: format!("authorization in unexpected state {status:?}"),
                        });
                    }
                }

                let mut challenge = challenge_or_err(&mut authz, hostname)?;
                let key_authorization = challenge.key_authorization();
                self.challenges
                    .insert(&challenge.token, key_authorization.as_str());
                tokens.push(challenge.token.clone());
                challenge.set_ready().await?;
            }
        }

        let outcome = self.finish_order(&mut order, hostname).await;

        // Tokens are one-shot; clear them whether validation succeeded or not.
        for token in &tokens {
            self.challenges.remove(token);
        }

        outcome
    }

    async fn finish_order(
        &self,
        order: &mut instant_acme::Order,
        hostname: &str,
    ) -> Result<IssuedCert, IssueError> {
        let status = order.poll_ready(&RetryPolicy::default()).await?;
        if status != OrderStatus::Ready {
            return Err(IssueError::Challenge {
                hostname: hostname.to_string(),
                reason: format!("order did not become ready: {status:?}"),
            });
        }

        let key_pem = order.finalize().await?;
        let cert_pem = order.poll_certificate(&RetryPolicy::default()).await?;
        let not_after = not_after_from_pem(&cert_pem)?;

        Ok(IssuedCert {
            cert_pem,
            key_pem,
            not_after,
        })
    }
}

fn challenge_or_err<'a>(
    authz: &'a mut instant_acme::AuthorizationHandle<'a>,
    hostname: &str,
) -> Result<instant_acme::ChallengeHandle<'a>, IssueError> {
    authz
        .challenge(ChallengeType::Http01)
        .ok_or_else(|| IssueError::Challenge {
            hostname: hostname.to_string(),
            reason: "authority offered no http-01 challenge".to_string(),
        })
}

#[async_trait]
impl Issuer for AcmeIssuer {
    async fn issue(&self, hostname: &str) -> Result<IssuedCert, IssueError> {
        tracing::info!(hostname = %hostname, directory = %self.directory_url, "Requesting certificate");
        let issued = self.run_order(hostname).await?;
        tracing::info!(
            hostname = %hostname,
            not_after = %issued.not_after,
            "Certificate issued"
        );
        Ok(issued)
    }
}

/// Extract `notAfter` from the leaf certificate of a PEM chain.
pub fn not_after_from_pem(cert_pem: &str) -> Result<DateTime<Utc>, IssueError> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(cert_pem.as_bytes())
        .map_err(|e| IssueError::Parse(e.to_string()))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| IssueError::Parse(e.to_string()))?;
    let timestamp = cert.validity().not_after.to_datetime().unix_timestamp();
    DateTime::from_timestamp(timestamp, 0)
        .ok_or_else(|| IssueError::Parse("notAfter out of range".to_string()))
}
