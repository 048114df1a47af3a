//! The authentication collaborator.
//!
//! The hub never sees credentials beyond handing them to an
//! [`Authenticator`]; identities are opaque strings. Token state (for
//! `auth.resume`) lives inside the authenticator, not in the hub.

use std::collections::HashMap;

use parking_lot::RwLock;

/// Maps credentials to opaque identity keys.
pub trait Authenticator: Send + Sync {
    /// Check `(username, secret)`; `Some(identity)` on success.
    fn authenticate(&self, username: &str, secret: &str) -> Option<String>;

    /// Issue a resumable token for an authenticated identity.
    ///
    /// `None` (the default) disables session resumption.
    fn issue_token(&self, identity: &str) -> Option<String> {
        let _ = identity;
        None
    }

    /// Redeem a token issued by [`issue_token`](Self::issue_token).
    fn resume(&self, token: &str) -> Option<String> {
        let _ = token;
        None
    }
}

/// In-memory authenticator with a username/secret table and a resumable
/// token store.
#[derive(Default)]
pub struct TokenAuthenticator {
    users: RwLock<HashMap<String, String>>,
    tokens: RwLock<HashMap<String, String>>,
}

impl TokenAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) a user.
    pub fn with_user(self, username: impl Into<String>, secret: impl Into<String>) -> Self {
        self.users.write().insert(username.into(), secret.into());
        self
    }
}

impl Authenticator for TokenAuthenticator {
    fn authenticate(&self, username: &str, secret: &str) -> Option<String> {
        let users = self.users.read();
        match users.get(username) {
            Some(stored) if stored == secret => Some(username.to_string()),
            _ => None,
        }
    }

    fn issue_token(&self, identity: &str) -> Option<String> {
        let token = format!("{:032x}", rand::random::<u128>());
        self.tokens
            .write()
            .insert(token.clone(), identity.to_string());
        Some(token)
    }

    fn resume(&self, token: &str) -> Option<String> {
        self.tokens.read().get(token).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authenticates_known_user() {
        let auth = TokenAuthenticator::new().with_user("admin", "hunter2");
        assert_eq!(auth.authenticate("admin", "hunter2").as_deref(), Some("admin"));
        assert_eq!(auth.authenticate("admin", "wrong"), None);
        assert_eq!(auth.authenticate("ghost", "hunter2"), None);
    }

    #[test]
    fn tokens_resume_identity() {
        let auth = TokenAuthenticator::new().with_user("admin", "hunter2");
        let token = auth.issue_token("admin").unwrap();
        assert_eq!(auth.resume(&token).as_deref(), Some("admin"));
        assert_eq!(auth.resume("bogus"), None);
    }

    #[test]
    fn tokens_are_unique() {
        let auth = TokenAuthenticator::new();
        let a = auth.issue_token("x").unwrap();
        let b = auth.issue_token("x").unwrap();
        assert_ne!(a, b);
    }
}
