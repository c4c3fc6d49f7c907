//! Identity-provider wiring.
//!
//! Production deployments point the gateway at an external identity
//! service; credential issuance and token formats live there. This module
//! ships the development stand-in used for local runs and tests.

use async_trait::async_trait;
use pylon_core::{Identity, IdentityError, IdentityProvider};

/// Development identity provider.
///
/// Accepts credentials of the form `principal` or `principal:role1,role2`
/// and never talks to the network. Do not deploy.
#[derive(Debug, Default)]
pub struct DevIdentityProvider;

#[async_trait]
impl IdentityProvider for DevIdentityProvider {
    async fn resolve(&self, credential: &str) -> Result<Identity, IdentityError> {
        let credential = credential.trim();
        if credential.is_empty() {
            return Err(IdentityError::InvalidCredential);
        }

        let (principal, roles) = match credential.split_once(':') {
            Some((principal, roles)) => (
                principal,
                roles
                    .split(',')
                    .filter(|role| !role.is_empty())
                    .map(String::from)
                    .collect::<Vec<_>>(),
            ),
            None => (credential, Vec::new()),
        };

        if principal.is_empty() {
            return Err(IdentityError::InvalidCredential);
        }

        Ok(Identity::new(principal, roles))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolves_principal_and_roles() {
        let provider = DevIdentityProvider;
        let identity = provider.resolve("alice:admin,user").await.unwrap();

        assert_eq!(identity.principal, "alice");
        assert!(identity.roles.contains("admin"));
        assert!(identity.roles.contains("user"));
    }

    #[tokio::test]
    async fn test_resolves_bare_principal() {
        let provider = DevIdentityProvider;
        let identity = provider.resolve("bob").await.unwrap();

        assert_eq!(identity.principal, "bob");
        assert!(identity.roles.is_empty());
    }

    #[tokio::test]
    async fn test_rejects_empty_credential() {
        let provider = DevIdentityProvider;
        assert!(matches!(
            provider.resolve("").await,
            Err(IdentityError::InvalidCredential)
        ));
        assert!(matches!(
            provider.resolve(":admin").await,
            Err(IdentityError::InvalidCredential)
        ));
    }
}
