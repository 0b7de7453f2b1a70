//! Reverse proxy to a fixed upstream.
//!
//! Forwards method, headers, and body with the authority rewritten,
//! hop-by-hop headers stripped, and the client address appended to
//! `X-Forwarded-For`, then streams the upstream response back. When the
//! upstream accepts a connection upgrade (101), both sides are promoted to
//! raw byte streams and relayed with `copy_bidirectional`, so
//! post-handshake frames pass through untouched. No load balancing, no
//! retries: one upstream, and a failure is a 502 for that connection only.

use std::net::{IpAddr, SocketAddr};

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::uri::{Authority, Scheme};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use hyper::upgrade::OnUpgrade;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};

use crate::error::ProxyError;

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Forwards everything for one hostname to one upstream address.
#[derive(Clone)]
pub struct ReverseProxy {
    upstream: Authority,
    client: Client<HttpConnector, Body>,
}

impl ReverseProxy {
    /// Upstream traffic is plain HTTP to a fixed (usually loopback) address.
    pub fn new(upstream: Authority) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Self { upstream, client }
    }

    /// Wrap the proxy as a host handler.
    pub fn into_router(self) -> Router {
        Router::new().fallback(any(forward)).with_state(self)
    }

    async fn handle(&self, mut req: Request) -> Result<Response, ProxyError> {
        // Take the client-side upgrade handle before the request is consumed;
        // it only fires if we end up answering 101.
        let client_upgrade = req.extensions_mut().remove::<OnUpgrade>();
        let client_ip = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());

        // Hop-by-hop headers are connection-scoped and must not leak
        // upstream; the upgrade pair goes back in when the client
        // connection can actually be promoted.
        let upgrade_proto = req
            .headers()
            .get(header::UPGRADE)
            .cloned()
            .filter(|_| client_upgrade.is_some());
        strip_hop_by_hop(req.headers_mut());
        if let Some(proto) = upgrade_proto {
            req.headers_mut()
                .insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
            req.headers_mut().insert(header::UPGRADE, proto);
        }
        if let Some(ip) = client_ip {
            append_forwarded_for(req.headers_mut(), ip);
        }

        let authority = self.upstream.clone();

        let mut parts = req.uri().clone().into_parts();
        parts.scheme = Some(Scheme::HTTP);
        parts.authority = Some(authority.clone());
        *req.uri_mut() = Uri::from_parts(parts).map_err(axum::http::Error::from)?;

        req.headers_mut().insert(
            header::HOST,
            HeaderValue::from_str(authority.as_str()).map_err(axum::http::Error::from)?,
        );

        let mut upstream_response = self.client.request(req).await?;

        if upstream_response.status() == StatusCode::SWITCHING_PROTOCOLS {
            match client_upgrade {
                Some(client_upgrade) => {
                    let upstream_upgrade = hyper::upgrade::on(&mut upstream_response);
                    // The relay outlives this request handler; it ends when
                    // either side closes.
                    tokio::spawn(relay(client_upgrade, upstream_upgrade));
                }
                None => {
                    tracing::warn!("Upstream answered 101 to a request without an upgrade handle");
                    return Ok((StatusCode::BAD_GATEWAY, "unexpected upgrade").into_response());
                }
            }
        } else {
            strip_hop_by_hop(upstream_response.headers_mut());
        }

        let (parts, body) = upstream_response.into_parts();
        Ok(Response::from_parts(parts, Body::new(body)))
    }
}

async fn forward(State(proxy): State<ReverseProxy>, req: Request) -> Response {
    match proxy.handle(req).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

/// Remove the standard hop-by-hop headers plus anything named in
/// `Connection`.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| name.trim().parse::<HeaderName>().ok())
        .collect();
    for name in listed {
        headers.remove(&name);
    }

    for name in [
        header::CONNECTION,
        HeaderName::from_static("keep-alive"),
        header::PROXY_AUTHENTICATE,
        header::PROXY_AUTHORIZATION,
        header::TE,
        header::TRAILER,
        header::TRANSFER_ENCODING,
        header::UPGRADE,
    ] {
        headers.remove(&name);
    }
}

/// Append the client address to any forwarding chain a previous hop
/// started.
fn append_forwarded_for(headers: &mut HeaderMap, client_ip: IpAddr) {
    let value = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(prior) => format!("{prior}, {client_ip}"),
        None => client_ip.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

/// Bidirectional byte relay between the upgraded client and upstream
/// connections. Frames are not inspected.
async fn relay(client: OnUpgrade, upstream: OnUpgrade) {
    let (client_io, upstream_io) = match tokio::try_join!(client, upstream) {
        Ok(pair) => pair,
        Err(e) => {
            tracing::warn!(error = %e, "Connection upgrade failed");
            return;
        }
    };

    let mut client_io = TokioIo::new(client_io);
    let mut upstream_io = TokioIo::new(upstream_io);

    match tokio::io::copy_bidirectional(&mut client_io, &mut upstream_io).await {
        Ok((from_client, from_upstream)) => {
            tracing::debug!(from_client, from_upstream, "Upgraded connection closed");
        }
        Err(e) => {
            tracing::debug!(error = %e, "Upgraded connection ended with error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_standard_and_connection_listed_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONNECTION,
            HeaderValue::from_static("close, x-request-meta"),
        );
        headers.insert("x-request-meta", HeaderValue::from_static("1"));
        headers.insert(header::TE, HeaderValue::from_static("trailers"));
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(header::HOST, HeaderValue::from_static("example.com"));
        headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));

        strip_hop_by_hop(&mut headers);

        assert!(!headers.contains_key(header::CONNECTION));
        assert!(!headers.contains_key("x-request-meta"));
        assert!(!headers.contains_key(header::TE));
        assert!(!headers.contains_key(header::UPGRADE));
        // End-to-end headers pass through.
        assert!(headers.contains_key(header::HOST));
        assert!(headers.contains_key(header::ACCEPT));
    }

    #[test]
    fn forwarded_for_appends_to_existing_chain() {
        let mut headers = HeaderMap::new();

        append_forwarded_for(&mut headers, "10.0.0.1".parse().unwrap());
        assert_eq!(headers[&X_FORWARDED_FOR], "10.0.0.1");

        append_forwarded_for(&mut headers, "127.0.0.1".parse().unwrap());
        assert_eq!(headers[&X_FORWARDED_FOR], "10.0.0.1, 127.0.0.1");
    }
}
