//! SNI-driven TLS acceptor for axum-server.
//!
//! The handshake is paused after the ClientHello (`LazyConfigAcceptor`) so
//! the certificate manager can be consulted for the negotiated server name
//! before any certificate is committed to. Refused or failed resolutions
//! abort the handshake; the client sees a TLS-level termination, never an
//! HTTP response.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;

use axum_server::accept::Accept;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;
use tokio_rustls::LazyConfigAcceptor;

use super::manager::CertManager;
use crate::error::CertError;

#[derive(Clone)]
pub struct SniAcceptor {
    manager: Arc<CertManager>,
}

impl SniAcceptor {
    pub fn new(manager: Arc<CertManager>) -> Self {
        Self { manager }
    }
}

impl<I, S> Accept<I, S> for SniAcceptor
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    S: Send + 'static,
{
    type Stream = TlsStream<I>;
    type Service = S;
    type Future = Pin<Box<dyn Future<Output = io::Result<(Self::Stream, Self::Service)>> + Send>>;

    fn accept(&self, stream: I, service: S) -> Self::Future {
        let manager = self.manager.clone();

        Box::pin(async move {
            let handshake =
                LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream).await?;

            let server_name = {
                let hello = handshake.client_hello();
                hello.server_name().map(str::to_owned)
            };
            let server_name = server_name
                .ok_or_else(|| io::Error::other(CertError::NoServerName))?;

            let config = manager
                .config_for(&server_name)
                .await
                .map_err(io::Error::other)?;

            let stream = handshake.into_stream(config).await?;
            Ok((stream, service))
        })
    }
}
