use crate::plans::Tier;

/// A verified user attached to the request by the auth middleware.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub id: String,
    pub email: String,
    pub username: String,
    pub tier: Tier,
}

/// The quota key for one request. Exactly one variant is attributed to a
/// ledger entry; `Untracked` requests are never recorded.
#[derive(Debug, Clone)]
pub enum Identity {
    User(AuthenticatedUser),
    /// Client-generated opaque string. Not verified, collisions and
    /// spoofing are accepted as a limitation of the trust boundary.
    Fingerprint(String),
    Untracked,
}

impl Identity {
    /// A valid session wins over a fingerprint; a fingerprint wins over
    /// nothing. Tampered or expired tokens never reach this point on
    /// optional-auth routes, so absence of a user means the guest path.
    pub fn resolve(user: Option<AuthenticatedUser>, fingerprint: Option<String>) -> Self {
        if let Some(user) = user {
            return Identity::User(user);
        }
        match fingerprint.map(|f| f.trim().to_string()).filter(|f| !f.is_empty()) {
            Some(fingerprint) => Identity::Fingerprint(fingerprint),
            None => Identity::Untracked,
        }
    }

    /// `(user_id, fingerprint)` columns for a ledger row.
    pub fn ledger_columns(&self) -> Option<(Option<&str>, Option<&str>)> {
        match self {
            Identity::User(user) => Some((Some(user.id.as_str()), None)),
            Identity::Fingerprint(fingerprint) => Some((None, Some(fingerprint.as_str()))),
            Identity::Untracked => None,
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> AuthenticatedUser {
        AuthenticatedUser {
            id: "user-1".to_string(),
            email: "user@example.com".to_string(),
            username: "user".to_string(),
            tier: Tier::Free,
        }
    }

    #[test]
    fn authenticated_user_wins_over_fingerprint() {
        let identity = Identity::resolve(Some(user()), Some("fp_abc".to_string()));
        match identity {
            Identity::User(u) => assert_eq!(u.id, "user-1"),
            other => panic!("expected user identity, got {other:?}"),
        }
    }

    #[test]
    fn fingerprint_used_when_unauthenticated() {
        let identity = Identity::resolve(None, Some(" fp_abc ".to_string()));
        match identity {
            Identity::Fingerprint(f) => assert_eq!(f, "fp_abc"),
            other => panic!("expected fingerprint identity, got {other:?}"),
        }
    }

    #[test]
    fn blank_fingerprint_is_untracked() {
        assert!(matches!(
            Identity::resolve(None, Some("   ".to_string())),
            Identity::Untracked
        ));
        assert!(matches!(Identity::resolve(None, None), Identity::Untracked));
    }

    #[test]
    fn ledger_columns_carry_exactly_one_side() {
        let user_identity = Identity::resolve(Some(user()), None);
        assert_eq!(user_identity.ledger_columns(), Some((Some("user-1"), None)));

        let guest = Identity::resolve(None, Some("fp_abc".to_string()));
        assert_eq!(guest.ledger_columns(), Some((None, Some("fp_abc"))));

        assert_eq!(Identity::Untracked.ledger_columns(), None);
    }
}
