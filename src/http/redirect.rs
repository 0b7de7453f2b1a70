//! Scheme upgrader: the plaintext listener's entire behavior.
//!
//! Every plaintext request is answered with a 301 to the encrypted origin,
//! preserving path and query. The single exception, matched before the
//! blanket rule, is the ACME HTTP-01 challenge path, answered from the
//! shared [`ChallengeSet`] so certificate issuance can validate over port 80.

use axum::extract::{Path, State};
use axum::http::{header, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::Router;
use axum_extra::extract::Host;

use crate::router::normalize_host;
use crate::tls::{ChallengeSet, ACME_CHALLENGE_PREFIX};

#[derive(Clone)]
struct PlainState {
    https_port: u16,
    challenges: ChallengeSet,
}

/// Build the app served on the plaintext port.
pub fn plain_app(https_port: u16, challenges: ChallengeSet) -> Router {
    Router::new()
        .route(&format!("{ACME_CHALLENGE_PREFIX}{{token}}"), get(challenge))
        .fallback(any(upgrade_scheme))
        .with_state(PlainState {
            https_port,
            challenges,
        })
}

/// Serve a pending HTTP-01 key authorization; unknown tokens get a 404.
async fn challenge(State(state): State<PlainState>, Path(token): Path<String>) -> Response {
    match state.challenges.response(&token) {
        Some(key_authorization) => {
            tracing::debug!(token = %token, "Answering ACME challenge");
            key_authorization.into_response()
        }
        None => (StatusCode::NOT_FOUND, "unknown challenge").into_response(),
    }
}

/// Blanket 301 to the encrypted origin. Never serves content.
async fn upgrade_scheme(State(state): State<PlainState>, Host(host): Host, uri: Uri) -> Response {
    let location = https_location(&host, &uri, state.https_port);
    tracing::debug!(from = %uri, to = %location, "Upgrading request to HTTPS");

    // 301 to match the original gateway's contract; axum's Redirect helper
    // would answer 308.
    (
        StatusCode::MOVED_PERMANENTLY,
        [(header::LOCATION, location)],
    )
        .into_response()
}

/// Host handler that unconditionally 301s every request to a fixed target.
/// Stateless; evaluated per request.
pub fn redirect_router(target: &str) -> Router {
    let target = target.to_string();
    Router::new().fallback(any(move || {
        let target = target.clone();
        async move {
            (
                StatusCode::MOVED_PERMANENTLY,
                [(header::LOCATION, target)],
            )
                .into_response()
        }
    }))
}

fn https_location(host: &str, uri: &Uri, https_port: u16) -> String {
    let host = normalize_host(host);
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    if https_port == 443 {
        format!("https://{host}{path_and_query}")
    } else {
        format!("https://{host}:{https_port}{path_and_query}")
    }
}
