//! TLS certificate lifecycle.
//!
//! An explicit, locally-owned certificate manager replaces the kind of
//! opaque library-managed cache a typical deployment leans on:
//!
//! - [`CertManager`] decides, per handshake, whether to refuse, serve from
//!   cache, or (re)issue — with per-hostname issuance dedup and
//!   serve-stale-on-renewal-failure.
//! - [`CertStore`] is the durable cache: a file triple per hostname,
//!   replaced atomically.
//! - [`ChallengeSet`] holds pending HTTP-01 proofs for the plaintext
//!   listener to answer.
//! - [`AcmeIssuer`] runs the order flow against the authority; the
//!   [`Issuer`] trait keeps the authority mockable.
//! - [`SniAcceptor`] wires the manager into the encrypted listener's
//!   handshake path.

mod acceptor;
mod acme;
mod challenge;
mod manager;
mod store;

pub use acceptor::SniAcceptor;
pub use acme::{not_after_from_pem, AcmeIssuer, IssueError, IssuedCert, Issuer};
pub use challenge::{ChallengeSet, ACME_CHALLENGE_PREFIX};
pub use manager::CertManager;
pub use store::{CertMeta, CertStore, StoredCert};
