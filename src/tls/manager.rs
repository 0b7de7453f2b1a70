//! On-demand certificate manager.
//!
//! One logical state machine per hostname: unprovisioned names are issued on
//! first handshake, cached names are served from memory or disk, expiring
//! names are reissued, and names outside the allow-list are refused before
//! the authority is ever contacted.
//!
//! Concurrency: a per-hostname async mutex makes issuance at-most-once per
//! hostname; concurrent handshakes for the same name wait on the first
//! issuance and reuse its result. The issuance itself runs in a spawned task
//! so an abandoned handshake cannot cancel it mid-order.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use rustls::ServerConfig;
use rustls_pki_types::CertificateDer;
use tokio::sync::Mutex;

use super::acme::Issuer;
use super::store::{CertMeta, CertStore, StoredCert};
use crate::error::CertError;

#[derive(Clone)]
struct CachedConfig {
    config: Arc<ServerConfig>,
    meta: CertMeta,
}

pub struct CertManager {
    allow: HashSet<String>,
    renew_before_days: u32,
    store: Arc<CertStore>,
    issuer: Arc<dyn Issuer>,
    /// Built rustls configs, keyed by hostname.
    memory: DashMap<String, CachedConfig>,
    /// Per-hostname issuance gates.
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl CertManager {
    pub fn new(
        allow_hosts: &[String],
        renew_before_days: u32,
        store: Arc<CertStore>,
        issuer: Arc<dyn Issuer>,
    ) -> Self {
        let allow = allow_hosts
            .iter()
            .map(|h| h.to_ascii_lowercase())
            .collect();
        Self {
            allow,
            renew_before_days,
            store,
            issuer,
            memory: DashMap::new(),
            locks: DashMap::new(),
        }
    }

    /// Resolve the `ServerConfig` to complete a handshake for `server_name`.
    ///
    /// Refusal and issuance failure abort the handshake for this connection
    /// only; a cached not-yet-expired certificate is preferred over a failed
    /// reissue so renewal trouble never takes a hostname offline.
    pub async fn config_for(&self, server_name: &str) -> Result<Arc<ServerConfig>, CertError> {
        let hostname = server_name.to_ascii_lowercase();

        if !self.allow.contains(&hostname) {
            tracing::warn!(hostname = %hostname, "Refusing handshake for non-allow-listed name");
            return Err(CertError::Refused(hostname));
        }

        if let Some(cached) = self.fresh_from_memory(&hostname) {
            return Ok(cached);
        }

        // Issuance gate: at most one order per hostname in flight.
        let gate = self
            .locks
            .entry(hostname.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = gate.lock().await;

        // A waiter that queued behind an issuance sees its result here.
        if let Some(cached) = self.fresh_from_memory(&hostname) {
            return Ok(cached);
        }

        let stored = self.store.load(&hostname)?;
        if let Some(cert) = &stored {
            // Expiry is re-checked on every load, not only at issuance time.
            if !cert.meta.expires_within(self.renew_before_days) {
                return self.cache(&hostname, cert);
            }
            tracing::info!(
                hostname = %hostname,
                not_after = %cert.meta.not_after,
                "Cached certificate is within the renewal window"
            );
        }

        match self.issue_detached(&hostname).await {
            Ok(cert) => self.cache(&hostname, &cert),
            Err(err) => self.serve_stale(&hostname, stored, err),
        }
    }

    fn fresh_from_memory(&self, hostname: &str) -> Option<Arc<ServerConfig>> {
        let cached = self.memory.get(hostname)?;
        if cached.meta.expires_within(self.renew_before_days) {
            return None;
        }
        Some(cached.config.clone())
    }

    /// Run the issuance in its own task: the order completes (and is
    /// persisted) even if the triggering handshake is abandoned.
    async fn issue_detached(&self, hostname: &str) -> Result<StoredCert, CertError> {
        let issuer = self.issuer.clone();
        let store = self.store.clone();
        let host = hostname.to_string();

        let handle = tokio::spawn(async move {
            let issued = issuer.issue(&host).await?;
            store.save(&host, &issued.cert_pem, &issued.key_pem, issued.not_after)?;
            Ok::<_, super::acme::IssueError>(issued)
        });

        let issued = match handle.await {
            Ok(Ok(issued)) => issued,
            Ok(Err(err)) => {
                return Err(CertError::Issuance {
                    hostname: hostname.to_string(),
                    source: Box::new(err),
                });
            }
            Err(join_err) => {
                return Err(CertError::Issuance {
                    hostname: hostname.to_string(),
                    source: Box::new(join_err),
                });
            }
        };

        Ok(StoredCert {
            meta: CertMeta {
                not_after: issued.not_after,
                issued: chrono::Utc::now(),
            },
            cert_pem: issued.cert_pem,
            key_pem: issued.key_pem,
        })
    }

    /// Reissue failed: fall back to a stale-but-valid cached certificate if
    /// one exists, otherwise surface the failure.
    fn serve_stale(
        &self,
        hostname: &str,
        stored: Option<StoredCert>,
        err: CertError,
    ) -> Result<Arc<ServerConfig>, CertError> {
        match stored {
            Some(cert) if !cert.meta.is_expired() => {
                tracing::warn!(
                    hostname = %hostname,
                    not_after = %cert.meta.not_after,
                    error = %err,
                    "Reissue failed; serving stale certificate"
                );
                // Deliberately not put in the memory cache: the next
                // handshake for this name retries the reissue.
                self.build(hostname, &cert)
            }
            _ => Err(err),
        }
    }

    fn cache(&self, hostname: &str, cert: &StoredCert) -> Result<Arc<ServerConfig>, CertError> {
        let config = self.build(hostname, cert)?;
        self.memory.insert(
            hostname.to_string(),
            CachedConfig {
                config: config.clone(),
                meta: cert.meta.clone(),
            },
        );
        Ok(config)
    }

    fn build(&self, hostname: &str, cert: &StoredCert) -> Result<Arc<ServerConfig>, CertError> {
        let chain: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert.cert_pem.as_bytes())
            .collect::<Result<_, _>>()
            .map_err(|e| CertError::BadMaterial {
                hostname: hostname.to_string(),
                reason: format!("certificate chain: {e}"),
            })?;
        if chain.is_empty() {
            return Err(CertError::BadMaterial {
                hostname: hostname.to_string(),
                reason: "empty certificate chain".to_string(),
            });
        }

        let key = rustls_pemfile::private_key(&mut cert.key_pem.as_bytes())
            .map_err(|e| CertError::BadMaterial {
                hostname: hostname.to_string(),
                reason: format!("private key: {e}"),
            })?
            .ok_or_else(|| CertError::BadMaterial {
                hostname: hostname.to_string(),
                reason: "no private key in PEM".to_string(),
            })?;

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .map_err(|e| CertError::BadMaterial {
                hostname: hostname.to_string(),
                reason: e.to_string(),
            })?;
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

        Ok(Arc::new(config))
    }
}
