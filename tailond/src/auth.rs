//! Per-application authorization rules

use tailon_supervisor::{AppSnapshot, Identity, Role};

/// Access required by an API operation on one application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    /// State and logs.
    AppViewer,
    /// Start, stop, restart.
    AppOperator,
    /// Sensitive configuration such as environment variables.
    AppAdmin,
}

impl Rule {
    pub fn required_role(self) -> Role {
        match self {
            Rule::AppViewer => Role::Viewer,
            Rule::AppOperator => Role::Operator,
            Rule::AppAdmin => Role::Admin,
        }
    }

    pub fn allows(self, identity: &Identity, app: &str) -> bool {
        identity.role_for(app) >= self.required_role()
    }
}

/// The view of `snapshot` that `identity` may see, or `None` if the
/// application is hidden from it entirely.
pub fn visible_snapshot(identity: &Identity, mut snapshot: AppSnapshot) -> Option<AppSnapshot> {
    let name = snapshot.config.name.clone();
    if !Rule::AppViewer.allows(identity, &name) {
        return None;
    }
    if !Rule::AppAdmin.allows(identity, &name) {
        snapshot.sanitize();
    }
    Some(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tailon_supervisor::{AppState, ApplicationConfig, Grants};

    fn snapshot() -> AppSnapshot {
        AppSnapshot {
            config: ApplicationConfig::new("web", "/bin/web").with_env("TOKEN", "secret"),
            state: AppState::NotRunning,
            pid: 0,
            last_exit_code: 0,
            state_changed_by: None,
            state_changed_at: None,
        }
    }

    fn with_grants(grants: Grants) -> Identity {
        Identity::user("u1", "Jane", grants)
    }

    #[test]
    fn test_rules_follow_role_order() {
        let mut grants = Grants::new();
        grants.insert("web", Role::Operator);
        let jane = with_grants(grants);

        assert!(Rule::AppViewer.allows(&jane, "web"));
        assert!(Rule::AppOperator.allows(&jane, "web"));
        assert!(!Rule::AppAdmin.allows(&jane, "web"));
        assert!(!Rule::AppViewer.allows(&jane, "db"));
    }

    #[test]
    fn test_admin_sees_env() {
        let admin = with_grants(Grants::wildcard(Role::Admin));
        let snap = visible_snapshot(&admin, snapshot()).unwrap();
        assert_eq!(snap.config.env.get("TOKEN").map(String::as_str), Some("secret"));
    }

    #[test]
    fn test_operator_gets_sanitized_config() {
        let op = with_grants(Grants::wildcard(Role::Operator));
        let snap = visible_snapshot(&op, snapshot()).unwrap();
        assert!(snap.config.env.is_empty());
        assert_eq!(snap.config.path, std::path::PathBuf::from("/bin/web"));
    }

    #[test]
    fn test_no_role_hides_application() {
        assert!(visible_snapshot(&with_grants(Grants::new()), snapshot()).is_none());

        let mut grants = Grants::wildcard(Role::None);
        grants.insert("db", Role::Admin);
        assert!(visible_snapshot(&with_grants(grants), snapshot()).is_none());
    }
}
