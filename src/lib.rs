//! Hostgate - multi-tenant HTTPS host gateway
//!
//! One process fronting many hostnames: requests are routed by hostname to
//! per-host handlers (static trees, fixed redirects, reverse proxies with
//! upgrade relay), certificates are provisioned on demand at the first TLS
//! handshake for an allow-listed name, and all plaintext traffic is upgraded
//! to HTTPS apart from the ACME HTTP-01 challenge path.

pub mod access_log;
pub mod config;
pub mod error;
pub mod gateway;
pub mod http;
pub mod router;
pub mod tls;

pub use config::AppConfig;
pub use error::GatewayError;
pub use gateway::Gateway;
