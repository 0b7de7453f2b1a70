//! Gateway assembly.
//!
//! A [`Gateway`] is built from an [`AppConfig`]: each configured hostname is
//! turned into its handler (static tree, fixed redirect, or reverse proxy)
//! and registered with the [`HostRouter`]. Hosts that need an in-process API
//! beside their static tree are mounted programmatically with
//! [`Gateway::mount_api`] before serving starts.
//!
//! `serve` wires the rest: the shared challenge set, the certificate store
//! and manager, the plaintext scheme-upgrade listener, and the encrypted
//! listener behind the SNI acceptor.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::uri::Authority;
use axum::middleware;
use axum::response::Response;
use axum::routing::any;
use axum::Router;
use axum_server::Handle;

use crate::access_log::{access_log_layer, AccessLog};
use crate::config::{AppConfig, ConfigError, HandlerConfig, HostConfig};
use crate::error::{GatewayError, ServerError};
use crate::http::proxy::ReverseProxy;
use crate::http::redirect::{plain_app, redirect_router};
use crate::http::server::{bind_plain, serve_tls, spawn_plain_server};
use crate::http::static_files::StaticTree;
use crate::router::HostRouter;
use crate::tls::{AcmeIssuer, CertManager, CertStore, ChallengeSet, SniAcceptor};

#[derive(Debug)]
pub struct Gateway {
    config: AppConfig,
    router: HostRouter,
}

impl Gateway {
    /// Build the host routing table from configuration. Fails fast: a
    /// missing static root or unusable upstream stops the process before
    /// either listener binds.
    pub fn from_config(config: AppConfig) -> Result<Self, GatewayError> {
        let mut router = HostRouter::new();
        for host in &config.hosts {
            router.register(&host.hostname, build_handler(host)?);
        }
        Ok(Self { config, router })
    }

    /// Mount an in-process API under `prefix` for `hostname`, with the rest
    /// of the host's request space served from `static_root`.
    ///
    /// This is the seam for hosts whose handlers need collaborator state
    /// that a declarative config entry cannot carry. Replaces any handler
    /// the config registered for the same hostname.
    pub fn mount_api<P: AsRef<Path>>(
        &mut self,
        hostname: &str,
        prefix: &str,
        api: Router,
        static_root: P,
    ) -> Result<(), GatewayError> {
        if !prefix.starts_with('/') || prefix.len() < 2 {
            return Err(GatewayError::MountPrefix(prefix.to_string()));
        }
        if !self.config.tls.is_allowed(hostname) {
            return Err(GatewayError::Config(ConfigError::Validation(format!(
                "host '{hostname}' is mounted but missing from tls.allow_hosts"
            ))));
        }

        let static_tree =
            StaticTree::new(static_root).map_err(|source| GatewayError::StaticRoot {
                hostname: hostname.to_string(),
                source,
            })?;
        let handler = Router::new()
            .nest(prefix, api)
            .fallback_service(static_tree.into_router());

        self.router.register(hostname, handler);
        Ok(())
    }

    /// The app served on the encrypted listener: host dispatch behind the
    /// access-log layer. Also usable standalone when embedding the gateway
    /// behind an existing listener.
    pub fn into_app(self, access_log: AccessLog) -> Router {
        build_app(Arc::new(self.router), access_log)
    }

    /// Run both listeners. Blocks until the encrypted listener shuts down.
    pub async fn serve(self) -> Result<(), GatewayError> {
        let Self { config, router } = self;

        let access_log = match &config.logging.access_log {
            Some(path) => AccessLog::open(Path::new(path))
                .await
                .map_err(GatewayError::AccessLog)?,
            None => AccessLog::disabled(),
        };

        let challenges = ChallengeSet::new();
        let store = Arc::new(CertStore::open(Path::new(&config.tls.cache_dir))?);
        let issuer = Arc::new(AcmeIssuer::new(
            config.tls.production,
            config.tls.contact_email.clone(),
            challenges.clone(),
            store.clone(),
        ));
        let manager = Arc::new(CertManager::new(
            &config.tls.allow_hosts,
            config.tls.renew_before_days,
            store,
            issuer,
        ));

        let bind: IpAddr = config
            .http
            .bind
            .parse()
            .map_err(ServerError::Addr)
            .map_err(GatewayError::Server)?;
        let plain_addr = SocketAddr::new(bind, config.http.port);
        let tls_addr = SocketAddr::new(bind, config.http.https_port);

        for hostname in router.hostnames() {
            tracing::info!(hostname = %hostname, "Serving host");
        }

        // Bind before serving anything: issuance depends on the challenge
        // responder, so a dead plaintext port is a startup failure, not a
        // log line.
        let plain_listener = bind_plain(plain_addr)?;
        let plain = plain_app(config.http.https_port, challenges).layer(
            middleware::from_fn_with_state(access_log.clone(), access_log_layer),
        );
        spawn_plain_server(plain_listener, plain);

        let app = build_app(Arc::new(router), access_log);
        serve_tls(tls_addr, app, SniAcceptor::new(manager), Handle::new())
            .await
            .map_err(GatewayError::Server)
    }
}

fn build_app(router: Arc<HostRouter>, access_log: AccessLog) -> Router {
    Router::new()
        .fallback(any(dispatch))
        .with_state(router)
        .layer(middleware::from_fn_with_state(access_log, access_log_layer))
}

async fn dispatch(State(router): State<Arc<HostRouter>>, req: Request) -> Response {
    router.dispatch(req).await
}

fn build_handler(host: &HostConfig) -> Result<Router, GatewayError> {
    match &host.handler {
        HandlerConfig::Static { root } => {
            let tree = StaticTree::new(root).map_err(|source| GatewayError::StaticRoot {
                hostname: host.hostname.clone(),
                source,
            })?;
            Ok(tree.into_router())
        }
        HandlerConfig::Redirect { target } => Ok(redirect_router(target)),
        HandlerConfig::Proxy { upstream } => {
            let authority = upstream_authority(&host.hostname, upstream)?;
            Ok(ReverseProxy::new(authority).into_router())
        }
    }
}

/// Config validation already requires an authority; re-deriving it here
/// keeps this module total over raw `HostConfig` values too.
fn upstream_authority(hostname: &str, upstream: &str) -> Result<Authority, GatewayError> {
    let uri: axum::http::Uri = upstream.parse().map_err(|_| {
        GatewayError::Config(ConfigError::Validation(format!(
            "host '{hostname}': invalid upstream '{upstream}'"
        )))
    })?;
    uri.authority().cloned().ok_or_else(|| {
        GatewayError::Config(ConfigError::Validation(format!(
            "host '{hostname}': upstream '{upstream}' has no authority"
        )))
    })
}
