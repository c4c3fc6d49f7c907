//! Role-based access control.
//!
//! A handler is authorized when its required roles are a subset of the
//! identity's roles (AND semantics). An empty requirement is public.

use std::collections::HashSet;

/// Check whether an identity's roles satisfy a handler's requirements.
///
/// Returns `true` iff `required_roles` is empty or every required role is
/// present in `identity_roles`. Deterministic, no I/O, no side effects.
#[must_use]
pub fn authorize(identity_roles: &HashSet<String>, required_roles: &HashSet<String>) -> bool {
    required_roles.is_subset(identity_roles)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roles(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_empty_requirement_is_public() {
        assert!(authorize(&roles(&[]), &roles(&[])));
        assert!(authorize(&roles(&["user"]), &roles(&[])));
    }

    #[test]
    fn test_subset_is_authorized() {
        assert!(authorize(&roles(&["admin", "user"]), &roles(&["admin"])));
        assert!(authorize(&roles(&["admin", "user"]), &roles(&["admin", "user"])));
    }

    #[test]
    fn test_missing_role_is_denied() {
        assert!(!authorize(&roles(&["user"]), &roles(&["admin"])));
        assert!(!authorize(&roles(&[]), &roles(&["admin"])));
    }

    #[test]
    fn test_all_roles_required() {
        // AND semantics: holding one of two required roles is not enough.
        assert!(!authorize(&roles(&["admin"]), &roles(&["admin", "auditor"])));
    }
}
