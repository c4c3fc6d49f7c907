//! Authenticated identities and the identity-provider seam.
//!
//! An [`Identity`] is created once at successful authentication and is
//! immutable for the life of its connection. Roles are opaque string
//! tokens, compared only by set containment.

use async_trait::async_trait;
use std::collections::HashSet;
use thiserror::Error;

/// An authenticated principal with its role set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Principal identifier.
    pub principal: String,
    /// Roles granted to the principal.
    pub roles: HashSet<String>,
}

impl Identity {
    /// Create a new identity.
    #[must_use]
    pub fn new(principal: impl Into<String>, roles: impl IntoIterator<Item = String>) -> Self {
        Self {
            principal: principal.into(),
            roles: roles.into_iter().collect(),
        }
    }
}

/// Errors from identity resolution.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// Credential is malformed, expired, or unknown.
    #[error("Invalid credential")]
    InvalidCredential,

    /// The identity provider could not be reached.
    #[error("Identity provider unavailable: {0}")]
    Unavailable(String),
}

/// External identity provider.
///
/// Resolution may fail transiently; callers guard invocations with a
/// circuit breaker.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Resolve a credential to an identity and its role set.
    async fn resolve(&self, credential: &str) -> Result<Identity, IdentityError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_collects_roles() {
        let identity = Identity::new("u1", ["admin".to_string(), "admin".to_string()]);
        assert_eq!(identity.principal, "u1");
        assert_eq!(identity.roles.len(), 1);
        assert!(identity.roles.contains("admin"));
    }
}
