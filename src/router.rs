//! Hostname-based request dispatch.
//!
//! A `HostRouter` maps each served hostname to its own `axum::Router`, so a
//! host handler can itself sub-route by path (an API mount beside a static
//! fallback). Matching is case-insensitive with any `:port` suffix stripped;
//! hosts without a registration get a plain 404 rather than failing the
//! listener.

use std::collections::HashMap;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tower::ServiceExt;

#[derive(Debug, Default)]
pub struct HostRouter {
    routes: HashMap<String, Router>,
}

impl HostRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a hostname. Last writer wins.
    pub fn register(&mut self, hostname: &str, handler: Router) {
        let key = normalize_host(hostname);
        if self.routes.insert(key.clone(), handler).is_some() {
            tracing::debug!(hostname = %key, "Replaced existing host registration");
        }
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn hostnames(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    /// Route a request to the handler registered for its target hostname.
    pub async fn dispatch(&self, req: Request<Body>) -> Response {
        let Some(host) = request_host(&req) else {
            tracing::debug!("Request without a Host header or authority");
            return (StatusCode::BAD_REQUEST, "missing host").into_response();
        };

        let Some(handler) = self.routes.get(&host).cloned() else {
            tracing::debug!(host = %host, "No handler registered for host");
            return (StatusCode::NOT_FOUND, "not found").into_response();
        };

        match handler.oneshot(req).await {
            Ok(response) => response,
            Err(infallible) => match infallible {},
        }
    }
}

/// Target hostname of a request: the `Host` header for HTTP/1.1, the URI
/// authority for HTTP/2 (`:authority`), normalized.
pub fn request_host<B>(req: &Request<B>) -> Option<String> {
    let raw = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()))?;
    Some(normalize_host(raw))
}

/// Lowercase and strip any port suffix.
pub fn normalize_host(raw: &str) -> String {
    let trimmed = raw.trim();
    let without_port = trimmed.split(':').next().unwrap_or(trimmed);
    without_port.to_ascii_lowercase()
}
