//! HTTP front door.
//!
//! Requests are routed by `Host` header:
//! - Port is stripped and the hostname normalized (lowercase, no trailing dot)
//! - A matching virtual host hands the request to one of its services
//! - Anything else is served by the fallback router (the admin API)

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, Request};
use axum::response::Response;
use axum::Router;
use tower::ServiceExt;
use tracing::debug;

use crate::model::normalize_hostname;
use crate::registry::ServiceRegistry;

/// Remove a trailing `:port` from a Host value.
///
/// Bracketed IPv6 literals lose their brackets; a bare IPv6 address is
/// returned unchanged.
pub fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return match rest.find(']') {
            Some(end) => &rest[..end],
            None => host,
        };
    }

    match host.rsplit_once(':') {
        Some((name, _)) if !name.contains(':') => name,
        _ => host,
    }
}

fn request_host(req: &Request<Body>) -> Option<String> {
    let raw = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()))?;

    let host = normalize_hostname(strip_port(raw));
    (!host.is_empty()).then_some(host)
}

fn client_addr(req: &Request<Body>) -> SocketAddr {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr)
        .unwrap_or_else(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
}

/// Resolves the Host header to a service, or falls back.
#[derive(Clone)]
pub struct HostRouter {
    registry: Arc<ServiceRegistry>,
    fallback: Router,
}

impl HostRouter {
    pub fn new(registry: Arc<ServiceRegistry>, fallback: Router) -> Self {
        Self { registry, fallback }
    }

    /// Router that sends every request through [`HostRouter::dispatch`].
    ///
    /// Serve it with `into_make_service_with_connect_info::<SocketAddr>()`
    /// so backends see the real client address in `X-Forwarded-For`.
    pub fn into_router(self) -> Router {
        Router::new().fallback(dispatch).with_state(self)
    }

    pub async fn handle(&self, req: Request<Body>) -> Response {
        if let Some(host) = request_host(&req) {
            if let Some(service) = self.registry.route_host(&host) {
                debug!(host = %host, service = %service.name(), "Routing request to service");
                let client = client_addr(&req);
                return service.serve_http(req, client).await;
            }
        }

        match self.fallback.clone().oneshot(req).await {
            Ok(response) => response,
            Err(never) => match never {},
        }
    }
}

async fn dispatch(State(router): State<HostRouter>, req: Request<Body>) -> Response {
    router.handle(req).await
}
