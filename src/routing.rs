//! Routing of app subdomains to instances
//!
//! The reverse proxy is outside this crate. The dispenser tells it where
//! traffic should go through [`RoutingController`]; [`RouteTable`] is an
//! in-memory implementation a proxy front end can resolve Host headers
//! against.

use crate::runtime::InstanceId;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Receives routing updates from the dispenser
#[async_trait]
pub trait RoutingController: Send + Sync {
    /// Send traffic for `name` to the given instance
    async fn route(&self, name: &str, id: &InstanceId);

    /// Stop sending traffic for `name`, if it is still routed to `id`
    async fn unroute(&self, name: &str, id: &InstanceId);
}

pub type SharedRouter = Arc<dyn RoutingController>;

/// Routes keyed by app name, resolved from request hosts
#[derive(Debug)]
pub struct RouteTable {
    domain: String,
    routes: DashMap<String, InstanceId>,
}

impl RouteTable {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            routes: DashMap::new(),
        }
    }

    /// Look up the instance serving a request host
    ///
    /// Accepts `name.domain` with an optional `:port`. The domain comparison
    /// ignores case; the name must match exactly.
    pub fn resolve(&self, host: &str) -> Option<InstanceId> {
        let host = strip_port(host);
        let name = strip_domain(host, &self.domain)?;
        self.routes.get(name).map(|entry| entry.value().clone())
    }

    /// Instance currently routed for an app name
    pub fn get(&self, name: &str) -> Option<InstanceId> {
        self.routes.get(name).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[async_trait]
impl RoutingController for RouteTable {
    async fn route(&self, name: &str, id: &InstanceId) {
        let previous = self.routes.insert(name.to_string(), id.clone());
        info!(
            name,
            instance_id = %id.short(),
            replaced = previous.is_some(),
            "Route added"
        );
    }

    async fn unroute(&self, name: &str, id: &InstanceId) {
        if self.routes.remove_if(name, |_, current| current == id).is_some() {
            info!(name, instance_id = %id.short(), "Route removed");
        } else {
            debug!(name, instance_id = %id.short(), "No matching route to remove");
        }
    }
}

fn strip_port(host: &str) -> &str {
    match host.rsplit_once(':') {
        Some((h, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => h,
        _ => host,
    }
}

fn strip_domain<'a>(host: &'a str, domain: &str) -> Option<&'a str> {
    let split = host.len().checked_sub(domain.len() + 1)?;
    if !host.is_char_boundary(split) {
        return None;
    }
    let (name, suffix) = host.split_at(split);
    let suffix = suffix.strip_prefix('.')?;
    if name.is_empty() || !suffix.eq_ignore_ascii_case(domain) {
        return None;
    }
    Some(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_route_and_resolve() {
        let table = RouteTable::new("example.com");
        table.route("blog", &InstanceId::from("c1")).await;

        assert_eq!(table.resolve("blog.example.com"), Some(InstanceId::from("c1")));
        assert_eq!(table.resolve("blog.example.com:8080"), Some(InstanceId::from("c1")));
        assert_eq!(table.resolve("blog.EXAMPLE.com"), Some(InstanceId::from("c1")));
        assert_eq!(table.resolve("shop.example.com"), None);
        assert_eq!(table.resolve("blog.example.org"), None);
        assert_eq!(table.resolve("example.com"), None);
        assert_eq!(table.resolve("blogexample.com"), None);
    }

    #[tokio::test]
    async fn test_route_replaces_existing() {
        let table = RouteTable::new("example.com");
        table.route("api", &InstanceId::from("old")).await;
        table.route("api", &InstanceId::from("new")).await;

        assert_eq!(table.len(), 1);
        assert_eq!(table.get("api"), Some(InstanceId::from("new")));
    }

    #[tokio::test]
    async fn test_unroute() {
        let table = RouteTable::new("example.com");
        table.route("api", &InstanceId::from("c1")).await;

        table.unroute("api", &InstanceId::from("c1")).await;
        assert!(table.is_empty());
        assert_eq!(table.resolve("api.example.com"), None);

        // Removing a missing route is harmless
        table.unroute("api", &InstanceId::from("c1")).await;
    }

    #[tokio::test]
    async fn test_unroute_ignores_newer_route() {
        let table = RouteTable::new("example.com");
        table.route("api", &InstanceId::from("new")).await;

        table.unroute("api", &InstanceId::from("old")).await;
        assert_eq!(table.get("api"), Some(InstanceId::from("new")));
    }

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("a.example.com:443"), "a.example.com");
        assert_eq!(strip_port("a.example.com"), "a.example.com");
        assert_eq!(strip_port("a.example.com:"), "a.example.com:");
    }
}
