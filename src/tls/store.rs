//! Durable certificate cache.
//!
//! One `<hostname>.crt` / `<hostname>.key` / `<hostname>.json` triple per
//! hostname. Writes go through a temp file in the same directory followed by
//! a rename, so a concurrent handshake can never observe a half-written
//! certificate. Key material and account credentials are written `0600`.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Metadata persisted alongside each certificate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertMeta {
    /// Certificate expiry (`notAfter`)
    pub not_after: DateTime<Utc>,
    /// When the certificate was obtained
    pub issued: DateTime<Utc>,
}

impl CertMeta {
    /// Whether the certificate is past the renewal threshold.
    pub fn expires_within(&self, days: u32) -> bool {
        self.not_after <= Utc::now() + Duration::days(i64::from(days))
    }

    /// Whether the certificate is still usable at all (stale-but-valid).
    pub fn is_expired(&self) -> bool {
        self.not_after <= Utc::now()
    }
}

/// A cached certificate as loaded from disk.
#[derive(Debug, Clone)]
pub struct StoredCert {
    pub cert_pem: String,
    pub key_pem: String,
    pub meta: CertMeta,
}

/// Filesystem-backed certificate cache.
#[derive(Debug)]
pub struct CertStore {
    dir: PathBuf,
}

impl CertStore {
    /// Open (creating if necessary) the cache directory. Restrictive
    /// permissions on Unix since private keys live here.
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(dir)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
        }

        tracing::info!(dir = %dir.display(), "Opened certificate cache");
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn paths(&self, hostname: &str) -> (PathBuf, PathBuf, PathBuf) {
        let host = hostname.to_ascii_lowercase();
        (
            self.dir.join(format!("{host}.crt")),
            self.dir.join(format!("{host}.key")),
            self.dir.join(format!("{host}.json")),
        )
    }

    /// Load the cached certificate for a hostname, if all three files are
    /// present and parseable. Validity is the caller's decision; the expiry
    /// in the metadata is re-checked on every load, not only at issuance.
    pub fn load(&self, hostname: &str) -> Result<Option<StoredCert>, StoreError> {
        let (cert_path, key_path, meta_path) = self.paths(hostname);

        if !cert_path.exists() || !key_path.exists() || !meta_path.exists() {
            return Ok(None);
        }

        let cert_pem = fs::read_to_string(&cert_path)?;
        let key_pem = fs::read_to_string(&key_path)?;
        let meta: CertMeta = serde_json::from_str(&fs::read_to_string(&meta_path)?)?;

        tracing::debug!(
            hostname = %hostname,
            not_after = %meta.not_after,
            "Loaded cached certificate"
        );

        Ok(Some(StoredCert {
            cert_pem,
            key_pem,
            meta,
        }))
    }

    /// Persist a freshly issued certificate, replacing any previous one
    /// atomically.
    pub fn save(
        &self,
        hostname: &str,
        cert_pem: &str,
        key_pem: &str,
        not_after: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let (cert_path, key_path, meta_path) = self.paths(hostname);

        let meta = CertMeta {
            not_after,
            issued: Utc::now(),
        };

        // Key first so a loadable .crt/.json never points at a missing key.
        self.write_atomic(&key_path, key_pem.as_bytes(), true)?;
        self.write_atomic(&cert_path, cert_pem.as_bytes(), false)?;
        self.write_atomic(&meta_path, serde_json::to_string_pretty(&meta)?.as_bytes(), false)?;

        tracing::info!(hostname = %hostname, not_after = %not_after, "Saved certificate");
        Ok(())
    }

    /// ACME account credentials, stored as the authority client's opaque JSON.
    pub fn load_account(&self) -> Result<Option<String>, StoreError> {
        let path = self.dir.join("account.json");
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(fs::read_to_string(path)?))
    }

    pub fn save_account(&self, json: &str) -> Result<(), StoreError> {
        let path = self.dir.join("account.json");
        self.write_atomic(&path, json.as_bytes(), true)?;
        tracing::info!("Saved ACME account credentials");
        Ok(())
    }

    fn write_atomic(&self, path: &Path, contents: &[u8], secret: bool) -> Result<(), StoreError> {
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(contents)?;
        tmp.flush()?;

        #[cfg(unix)]
        if secret {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(tmp.path(), fs::Permissions::from_mode(0o600))?;
        }
        #[cfg(not(unix))]
        let _ = secret;

        tmp.persist(path).map_err(|e| StoreError::Io(e.error))?;
        Ok(())
    }
}
