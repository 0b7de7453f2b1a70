//! Listener startup and shutdown.
//!
//! Two listeners: a plaintext one that only upgrades schemes (and answers
//! ACME challenges), and the encrypted one that carries all application
//! traffic behind the SNI-driven acceptor.

use std::net::{SocketAddr, TcpListener};

use axum::Router;
use axum_server::Handle;

use crate::error::ServerError;
use crate::tls::SniAcceptor;

/// Bind the plaintext port, failing startup if it is unavailable. Bound
/// separately from the accept loop: without this listener the HTTP-01
/// challenge responder can never answer, so issuance would fail on every
/// handshake while the process looked healthy.
pub fn bind_plain(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    let listener = TcpListener::bind(addr)?;
    listener.set_nonblocking(true)?;
    tracing::info!(%addr, "Bound plaintext listener (scheme upgrade + ACME challenges)");
    Ok(listener)
}

/// Run the accept loop for an already-bound plaintext listener in the
/// background. It has no state worth draining, so it is not tied to the
/// graceful-shutdown handle.
pub fn spawn_plain_server(listener: TcpListener, app: Router) {
    tokio::spawn(async move {
        if let Err(e) = axum_server::from_tcp(listener)
            .serve(app.into_make_service())
            .await
        {
            tracing::error!(error = %e, "Plaintext listener failed");
        }
    });
}

/// Run the encrypted listener. Blocks until shutdown. The caller supplies
/// the handle, so an embedder can await `listening()` or trigger its own
/// shutdown.
pub async fn serve_tls(
    addr: SocketAddr,
    app: Router,
    acceptor: SniAcceptor,
    handle: Handle,
) -> Result<(), ServerError> {
    setup_shutdown_handler(handle.clone());

    tracing::info!(%addr, "Starting encrypted listener");
    axum_server::bind(addr)
        .handle(handle)
        .acceptor(acceptor)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .map_err(|e| ServerError::Server(e.to_string()))
}

/// Graceful shutdown on SIGTERM/SIGINT: stop accepting, drain connections,
/// then exit.
fn setup_shutdown_handler(handle: Handle) {
    tokio::spawn(async move {
        let ctrl_c = async {
            tokio::signal::ctrl_c()
                .await
                .expect("Failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("Failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, initiating graceful shutdown");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
            }
        }

        handle.graceful_shutdown(Some(std::time::Duration::from_secs(30)));
    });
}
