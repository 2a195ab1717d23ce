//! Caller resolution and request logging middleware.
//!
//! Every request gets an [`Identity`] attached as a request extension before
//! it reaches a handler. Without a network identity provider in front of the
//! daemon, callers are anonymous and identified by their remote address.

use std::net::SocketAddr;
use std::time::Instant;

use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::Response;
use tailon_supervisor::{Identity, Role};
use tracing::info;

use crate::api::ApiState;

/// Identity for a request from `remote`.
pub fn resolve(remote: Option<SocketAddr>, default_role: Role) -> Identity {
    match remote {
        Some(addr) => Identity::anonymous_from_addr(&addr.to_string(), default_role),
        None => Identity::anonymous(default_role),
    }
}

pub async fn identify(
    State(state): State<ApiState>,
    remote: Option<ConnectInfo<SocketAddr>>,
    mut req: Request,
    next: Next,
) -> Response {
    let remote = remote.map(|ConnectInfo(addr)| addr);
    let identity = resolve(remote, state.default_role);

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let user = identity.display_name.clone();
    req.extensions_mut().insert(identity);

    let started = Instant::now();
    let response = next.run(req).await;

    info!(
        %method,
        path = %path,
        status = response.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        remote = ?remote,
        user = %user,
        "HTTP request"
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_from_address() {
        let addr: SocketAddr = "10.0.0.7:41234".parse().unwrap();
        let identity = resolve(Some(addr), Role::Viewer);
        assert_eq!(identity.id, "$anonymous-10.0.0.7$");
        assert_eq!(identity.display_name, "Anonymous (10.0.0.7)");
        assert_eq!(identity.role_for("anything"), Role::Viewer);
    }

    #[test]
    fn test_resolve_without_address() {
        let identity = resolve(None, Role::Admin);
        assert!(identity.is_anonymous);
        assert!(identity.ip_address.is_none());
        assert_eq!(identity.role_for("web"), Role::Admin);
    }

    #[test]
    fn test_resolve_ipv6() {
        let addr: SocketAddr = "[::1]:8080".parse().unwrap();
        let identity = resolve(Some(addr), Role::None);
        assert_eq!(identity.ip_address.as_deref(), Some("::1"));
    }
}
