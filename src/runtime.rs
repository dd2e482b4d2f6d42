//! Container runtime abstraction
//!
//! The dispenser never talks to Docker directly. It drives instances through
//! [`RuntimeClient`], which [`DockerRuntime`](crate::docker::DockerRuntime)
//! implements for real deployments and tests implement with fakes.

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Identifier the runtime assigns to an instance when it starts it
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Shortened form for log output (Docker-style 12 characters)
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(12)
            .map(|(i, _)| i)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for InstanceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for InstanceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Operations the dispenser needs from a container runtime
///
/// Calls may be slow. The dispenser bounds each one with a timeout and never
/// holds its own locks across them.
#[async_trait]
pub trait RuntimeClient: Send + Sync {
    /// Check that the runtime is reachable
    async fn ping(&self) -> anyhow::Result<()>;

    /// Start a new instance for the given app name
    async fn start(&self, name: &str) -> anyhow::Result<InstanceId>;

    /// Whether the instance is currently running
    async fn is_alive(&self, id: &InstanceId) -> bool;

    /// Stop the instance, keeping its resources around
    async fn stop(&self, id: &InstanceId) -> anyhow::Result<()>;

    /// Destroy the instance and its resources
    async fn kill(&self, id: &InstanceId) -> anyhow::Result<()>;
}

pub type SharedRuntime = Arc<dyn RuntimeClient>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_id_short() {
        let id = InstanceId::from("4f2a9c81d0e3b7aa55c1");
        assert_eq!(id.short(), "4f2a9c81d0e3");

        let id = InstanceId::from("abc");
        assert_eq!(id.short(), "abc");
    }

    #[test]
    fn test_instance_id_display_and_serialize() {
        let id = InstanceId::new("c0ffee");
        assert_eq!(id.to_string(), "c0ffee");
        assert_eq!(id.as_str(), "c0ffee");
        assert_eq!(
            toml::Value::try_from(&id).unwrap(),
            toml::Value::String("c0ffee".to_string())
        );
    }
}
