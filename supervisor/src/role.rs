//! Role model: per-application access levels and grant resolution.
//!
//! Roles are totally ordered: `Admin ⊇ Operator ⊇ Viewer ⊇ None`. A caller's
//! grants map application names (or the `*` wildcard) to a role.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};

/// Wildcard key matching every application.
pub const WILDCARD: &str = "*";

/// Access level granted to a caller for one application.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Role {
    /// Prohibits access to any resource of the application.
    #[default]
    None,
    /// Application state and logs, no lifecycle control.
    Viewer,
    /// Lifecycle control and logs, but not sensitive configuration.
    Operator,
    /// Everything, including environment variables.
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::None => "none",
            Role::Viewer => "viewer",
            Role::Operator => "operator",
            Role::Admin => "admin",
        }
    }

    /// `None` denies everything; any other role allows at least viewing.
    pub fn is_allowed(&self) -> bool {
        *self != Role::None
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error for role names outside the closed set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown role: {0}")]
pub struct UnknownRole(pub String);

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "operator" => Ok(Role::Operator),
            "viewer" => Ok(Role::Viewer),
            "" | "none" => Ok(Role::None),
            _ => Err(UnknownRole(s.to_string())),
        }
    }
}

impl Serialize for Role {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

// Any value that is not a recognised role string collapses to `Role::None`
// instead of failing the surrounding document.
impl<'de> Deserialize<'de> for Role {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RoleVisitor;

        impl<'de> Visitor<'de> for RoleVisitor {
            type Value = Role;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a role name")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Role, E> {
                Ok(v.parse().unwrap_or(Role::None))
            }

            fn visit_bool<E: de::Error>(self, _: bool) -> Result<Role, E> {
                Ok(Role::None)
            }

            fn visit_i64<E: de::Error>(self, _: i64) -> Result<Role, E> {
                Ok(Role::None)
            }

            fn visit_u64<E: de::Error>(self, _: u64) -> Result<Role, E> {
                Ok(Role::None)
            }

            fn visit_f64<E: de::Error>(self, _: f64) -> Result<Role, E> {
                Ok(Role::None)
            }

            fn visit_unit<E: de::Error>(self) -> Result<Role, E> {
                Ok(Role::None)
            }

            fn visit_none<E: de::Error>(self) -> Result<Role, E> {
                Ok(Role::None)
            }

            fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<Role, A::Error> {
                while seq.next_element::<de::IgnoredAny>()?.is_some() {}
                Ok(Role::None)
            }

            fn visit_map<A: de::MapAccess<'de>>(self, mut map: A) -> Result<Role, A::Error> {
                while map.next_entry::<de::IgnoredAny, de::IgnoredAny>()?.is_some() {}
                Ok(Role::None)
            }
        }

        deserializer.deserialize_any(RoleVisitor)
    }
}

/// A role granted over a set of applications, as handed out by an identity
/// provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleAssignment {
    pub role: Role,
    #[serde(default)]
    pub applications: Vec<String>,
}

/// Resolved mapping from application name (or `*`) to role.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Grants(BTreeMap<String, Role>);

impl Grants {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grants that give `role` on every application.
    pub fn wildcard(role: Role) -> Self {
        let mut grants = Self::new();
        grants.insert(WILDCARD, role);
        grants
    }

    /// Start from `default_role` on `*` and layer each assignment on top.
    /// Later assignments override earlier ones for the same application.
    pub fn from_assignments(default_role: Role, assignments: &[RoleAssignment]) -> Self {
        let mut grants = Self::wildcard(default_role);
        for assignment in assignments {
            for app in &assignment.applications {
                grants.insert(app, assignment.role);
            }
        }
        grants
    }

    pub fn insert(&mut self, app: impl Into<String>, role: Role) {
        self.0.insert(app.into(), role);
    }

    /// Exact application grant, then the wildcard, then `Role::None`. An
    /// exact grant of `None` (including a malformed one) does not count and
    /// falls through to the wildcard.
    pub fn resolve(&self, app: &str) -> Role {
        self.0
            .get(app)
            .copied()
            .filter(Role::is_allowed)
            .or_else(|| self.0.get(WILDCARD).copied())
            .unwrap_or(Role::None)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>> FromIterator<(K, Role)> for Grants {
    fn from_iter<I: IntoIterator<Item = (K, Role)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_ordering() {
        assert!(Role::Admin > Role::Operator);
        assert!(Role::Operator > Role::Viewer);
        assert!(Role::Viewer > Role::None);
        assert!(!Role::None.is_allowed());
        assert!(Role::Viewer.is_allowed());
    }

    #[test]
    fn test_role_parse() {
        assert_eq!("admin".parse::<Role>().unwrap(), Role::Admin);
        assert_eq!(" Operator ".parse::<Role>().unwrap(), Role::Operator);
        assert_eq!("".parse::<Role>().unwrap(), Role::None);
        assert!("superuser".parse::<Role>().is_err());
    }

    #[test]
    fn test_exact_grant_wins_over_wildcard() {
        let grants: Grants = [("*", Role::Viewer), ("web", Role::Admin)]
            .into_iter()
            .collect();
        assert_eq!(grants.resolve("web"), Role::Admin);
        assert_eq!(grants.resolve("worker"), Role::Viewer);
    }

    #[test]
    fn test_exact_none_falls_back_to_wildcard() {
        let grants: Grants = [("*", Role::Viewer), ("secret", Role::None)]
            .into_iter()
            .collect();
        assert_eq!(grants.resolve("secret"), Role::Viewer);
    }

    #[test]
    fn test_malformed_exact_grant_falls_back_to_wildcard() {
        let grants: Grants = serde_json::from_str(r#"{"*": "viewer", "web": "superuser"}"#).unwrap();
        assert_eq!(grants.resolve("web"), Role::Viewer);
    }

    #[test]
    fn test_missing_grants_resolve_to_none() {
        assert_eq!(Grants::new().resolve("anything"), Role::None);
    }

    #[test]
    fn test_malformed_roles_deserialize_as_none() {
        let grants: Grants = serde_json::from_str(
            r#"{"*": "root", "web": 7, "db": null, "api": ["admin"], "ok": "operator"}"#,
        )
        .unwrap();
        assert_eq!(grants.resolve("web"), Role::None);
        assert_eq!(grants.resolve("db"), Role::None);
        assert_eq!(grants.resolve("api"), Role::None);
        assert_eq!(grants.resolve("unlisted"), Role::None);
        assert_eq!(grants.resolve("ok"), Role::Operator);
    }

    #[test]
    fn test_from_assignments() {
        let grants = Grants::from_assignments(
            Role::Viewer,
            &[
                RoleAssignment {
                    role: Role::Operator,
                    applications: vec!["web".into(), "worker".into()],
                },
                RoleAssignment {
                    role: Role::Admin,
                    applications: vec!["worker".into()],
                },
            ],
        );
        assert_eq!(grants.resolve("web"), Role::Operator);
        assert_eq!(grants.resolve("worker"), Role::Admin);
        assert_eq!(grants.resolve("other"), Role::Viewer);
    }

    #[test]
    fn test_role_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Operator).unwrap(), "\"operator\"");
    }
}
