//! Appdispenser - short-lived app instances on their own subdomains
//!
//! This library hands out application containers on demand:
//! - Validates and reserves a subdomain-style name for each app
//! - Enforces a configurable cap on concurrently live apps
//! - Starts apps through a pluggable container runtime (Docker by default)
//! - Tracks each app through Pending, Running, Stopped and Killed
//! - Tells a routing controller which instance serves which subdomain

pub mod config;
pub mod dispenser;
pub mod docker;
pub mod error;
pub mod names;
pub mod routing;
pub mod runtime;

pub use config::Config;
pub use dispenser::{Instance, InstanceDispenser, InstanceState};
pub use error::{CreateError, DispenserError, NameError};
pub use names::NameRegistry;
pub use routing::{RouteTable, RoutingController};
pub use runtime::{InstanceId, RuntimeClient};
