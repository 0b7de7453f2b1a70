//! Gateway error taxonomy.
//!
//! Per-connection failures (unknown host, upstream unreachable, a failed
//! handshake) never take down a listener; only configuration load and server
//! bind failures are fatal at the process level.

use std::io;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Certificate manager errors surfaced during a TLS handshake.
///
/// These terminate the handshake for the offending connection only; there is
/// no HTTP response to send at that point.
#[derive(Debug, thiserror::Error)]
pub enum CertError {
    /// Server name is not in the allow-list. Raised before any authority
    /// contact so a flood of bogus SNI values cannot burn authority rate
    /// limits.
    #[error("hostname not allow-listed: {0}")]
    Refused(String),

    /// Handshake carried no server name, so no certificate can be selected.
    #[error("no server name in ClientHello")]
    NoServerName,

    /// The authority or the challenge flow failed and no usable cached
    /// certificate exists.
    #[error("certificate issuance failed for {hostname}: {source}")]
    Issuance {
        hostname: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Cached certificate or key material could not be loaded or parsed.
    #[error("certificate store error: {0}")]
    Store(#[from] StoreError),

    /// PEM material did not yield a usable rustls configuration.
    #[error("invalid certificate material for {hostname}: {reason}")]
    BadMaterial { hostname: String, reason: String },
}

/// On-disk certificate cache errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("certificate cache I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("certificate metadata error: {0}")]
    Meta(#[from] serde_json::Error),
}

/// Reverse proxy failures. Connection-scoped: the client gets a gateway
/// error status and everything else keeps serving.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("upstream request failed: {0}")]
    Upstream(#[from] hyper_util::client::legacy::Error),

    #[error("invalid upstream request: {0}")]
    Request(#[from] axum::http::Error),

    #[error("connection upgrade failed: {0}")]
    Upgrade(#[from] hyper::Error),
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        tracing::warn!(error = %self, "Proxy error");
        (StatusCode::BAD_GATEWAY, "upstream unavailable").into_response()
    }
}

/// Fatal gateway construction/startup errors. Anything here stops the
/// process before it serves a single request.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    #[error("static root for '{hostname}' is unusable: {source}")]
    StaticRoot {
        hostname: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid mount prefix '{0}': must start with '/'")]
    MountPrefix(String),

    #[error("failed to open access log: {0}")]
    AccessLog(io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Server(#[from] ServerError),
}

/// Server startup error.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind server: {0}")]
    Bind(#[from] io::Error),

    #[error("Invalid listen address: {0}")]
    Addr(#[from] std::net::AddrParseError),

    #[error("Server error: {0}")]
    Server(String),
}
