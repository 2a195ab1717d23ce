//! Acting caller attributed to lifecycle transitions.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::role::{Grants, Role};

/// Display name used for anonymous callers in audit lines.
pub const ANONYMOUS: &str = "Anonymous";

/// The identity behind a request. Built once per request by the caller's
/// identity layer and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    pub is_anonymous: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(rename = "app_roles", default, skip_serializing_if = "Grants::is_empty")]
    pub grants: Grants,
}

impl Identity {
    /// An authenticated user.
    pub fn user(id: impl Into<String>, display_name: impl Into<String>, grants: Grants) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            login_name: None,
            node: None,
            is_anonymous: false,
            ip_address: None,
            grants,
        }
    }

    /// The anonymous caller with `default_role` on every application.
    pub fn anonymous(default_role: Role) -> Self {
        Self {
            id: "$anonymous$".to_string(),
            display_name: ANONYMOUS.to_string(),
            login_name: None,
            node: None,
            is_anonymous: true,
            ip_address: None,
            grants: Grants::wildcard(default_role),
        }
    }

    /// An anonymous caller tracked by the host part of its remote address.
    /// Unparseable addresses are kept verbatim.
    pub fn anonymous_from_addr(remote_addr: &str, default_role: Role) -> Self {
        let host = remote_addr
            .parse::<SocketAddr>()
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|_| remote_addr.to_string());

        Self {
            id: format!("$anonymous-{host}$"),
            display_name: format!("{ANONYMOUS} ({host})"),
            login_name: None,
            node: None,
            is_anonymous: true,
            ip_address: Some(host),
            grants: Grants::wildcard(default_role),
        }
    }

    pub fn with_login_name(mut self, login_name: impl Into<String>) -> Self {
        self.login_name = Some(login_name.into());
        self
    }

    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.node = Some(node.into());
        self
    }

    pub fn with_ip_address(mut self, ip: impl Into<String>) -> Self {
        self.ip_address = Some(ip.into());
        self
    }

    /// Role this identity holds for `app`.
    pub fn role_for(&self, app: &str) -> Role {
        self.grants.resolve(app)
    }

    /// Name written into audit lines: anonymous callers are never named.
    pub fn audit_name(&self) -> &str {
        if self.is_anonymous {
            ANONYMOUS
        } else {
            &self.display_name
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anonymous_from_addr_strips_port() {
        let id = Identity::anonymous_from_addr("192.168.1.100:54321", Role::Viewer);
        assert_eq!(id.id, "$anonymous-192.168.1.100$");
        assert_eq!(id.display_name, "Anonymous (192.168.1.100)");
        assert_eq!(id.ip_address.as_deref(), Some("192.168.1.100"));
        assert!(id.is_anonymous);
        assert_eq!(id.role_for("anything"), Role::Viewer);
    }

    #[test]
    fn test_anonymous_from_unparseable_addr() {
        let id = Identity::anonymous_from_addr("pipe", Role::None);
        assert_eq!(id.ip_address.as_deref(), Some("pipe"));
        assert_eq!(id.role_for("web"), Role::None);
    }

    #[test]
    fn test_audit_name() {
        let user = Identity::user("u1", "Jane Doe", Grants::new());
        assert_eq!(user.audit_name(), "Jane Doe");
        let anon = Identity::anonymous_from_addr("10.0.0.1:1", Role::Admin);
        assert_eq!(anon.audit_name(), "Anonymous");
    }

    #[test]
    fn test_serialization_shape() {
        let user = Identity::user("u1", "Jane", Grants::wildcard(Role::Operator))
            .with_login_name("jane@example.com")
            .with_node("laptop");
        let json = serde_json::to_value(&user).unwrap();
        assert_eq!(json["display_name"], "Jane");
        assert_eq!(json["login_name"], "jane@example.com");
        assert_eq!(json["node"], "laptop");
        assert_eq!(json["is_anonymous"], false);
        assert_eq!(json["app_roles"]["*"], "operator");
        assert!(json.get("ip_address").is_none());
    }
}
