//! HTTP listeners and the per-host dispatch handlers.
//!
//! - `server`: listener startup, graceful shutdown
//! - `redirect`: scheme upgrader, ACME challenge responder, host redirector
//! - `static_files`: bounded static tree handler
//! - `proxy`: reverse proxy with connection-upgrade relay

pub mod proxy;
pub mod redirect;
pub mod server;
pub mod static_files;
