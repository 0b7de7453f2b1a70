//! Pending ACME HTTP-01 challenge registry.
//!
//! The issuer registers `token -> key authorization` pairs here while an
//! order is in flight; the plaintext listener answers the authority's
//! validation requests from the same registry. Shared between tasks via
//! cheap clones.

use std::sync::Arc;

use dashmap::DashMap;

/// Path prefix the issuing authority fetches HTTP-01 proofs from.
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

#[derive(Debug, Default, Clone)]
pub struct ChallengeSet {
    tokens: Arc<DashMap<String, String>>,
}

impl ChallengeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending challenge before telling the authority it is ready.
    pub fn insert(&self, token: &str, key_authorization: &str) {
        tracing::debug!(token = %token, "Registered HTTP-01 challenge");
        self.tokens
            .insert(token.to_string(), key_authorization.to_string());
    }

    /// Drop a challenge once the order is validated or abandoned.
    pub fn remove(&self, token: &str) {
        if self.tokens.remove(token).is_some() {
            tracing::debug!(token = %token, "Removed HTTP-01 challenge");
        }
    }

    /// Key authorization for a token, if the token is pending.
    pub fn response(&self, token: &str) -> Option<String> {
        self.tokens.get(token).map(|v| v.clone())
    }

    pub fn pending(&self) -> usize {
        self.tokens.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_answer() {
        let challenges = ChallengeSet::new();
        challenges.insert("tok", "tok.thumbprint");
        assert_eq!(challenges.response("tok").as_deref(), Some("tok.thumbprint"));
        assert_eq!(challenges.response("other"), None);
    }

    #[test]
    fn remove_clears_token() {
        let challenges = ChallengeSet::new();
        challenges.insert("tok", "auth");
        challenges.remove("tok");
        assert_eq!(challenges.response("tok"), None);
        assert_eq!(challenges.pending(), 0);
    }

    #[test]
    fn clones_share_state() {
        let a = ChallengeSet::new();
        let b = a.clone();
        a.insert("tok", "auth");
        assert_eq!(b.response("tok").as_deref(), Some("auth"));
    }
}
