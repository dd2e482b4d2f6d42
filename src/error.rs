//! Error types for name admission and instance creation

use crate::runtime::InstanceId;
use thiserror::Error;

/// Errors from the name registry
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NameError {
    /// The name belongs to a live instance
    #[error("name '{0}' is already reserved")]
    AlreadyReserved(String),
}

/// Errors from [`InstanceDispenser::create_instance`](crate::dispenser::InstanceDispenser::create_instance)
///
/// All of these are local to the failing call. The dispenser is left in a
/// consistent state and the caller may retry.
#[derive(Debug, Error)]
pub enum CreateError {
    /// Name is empty or not a valid subdomain label
    #[error("invalid app name '{0}'")]
    InvalidName(String),

    /// Name is held by another live instance
    #[error("app name '{0}' is already taken")]
    NameTaken(String),

    /// The dispenser is at its app limit
    #[error("app limit of {limit} reached")]
    CapacityExceeded { limit: usize },

    /// The runtime refused or failed to start the instance
    #[error("failed to start app '{name}': {source}")]
    RuntimeStartFailed {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    /// The runtime started the instance but it never reported alive
    #[error("app '{name}' ({id}) did not become alive")]
    RuntimeNotAlive { name: String, id: InstanceId },
}

impl CreateError {
    /// Stable error code, suitable for API responses and log fields
    pub fn code(&self) -> &'static str {
        match self {
            CreateError::InvalidName(_) => "INVALID_NAME",
            CreateError::NameTaken(_) => "NAME_TAKEN",
            CreateError::CapacityExceeded { .. } => "CAPACITY_EXCEEDED",
            CreateError::RuntimeStartFailed { .. } => "RUNTIME_START_FAILED",
            CreateError::RuntimeNotAlive { .. } => "RUNTIME_NOT_ALIVE",
        }
    }

    /// Whether retrying the same request later may succeed
    ///
    /// An invalid name never becomes valid. Everything else depends on
    /// other instances going away or the runtime recovering.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, CreateError::InvalidName(_))
    }
}

/// Fatal errors raised while constructing the dispenser
#[derive(Debug, Error)]
pub enum DispenserError {
    /// The container runtime could not be reached
    #[error("container runtime is unreachable: {0}")]
    RuntimeClientUnreachable(#[source] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_error_codes() {
        assert_eq!(CreateError::InvalidName("-a".into()).code(), "INVALID_NAME");
        assert_eq!(CreateError::NameTaken("a".into()).code(), "NAME_TAKEN");
        assert_eq!(
            CreateError::CapacityExceeded { limit: 3 }.code(),
            "CAPACITY_EXCEEDED"
        );
        assert_eq!(
            CreateError::RuntimeNotAlive {
                name: "a".into(),
                id: InstanceId::from("c1"),
            }
            .code(),
            "RUNTIME_NOT_ALIVE"
        );
    }

    #[test]
    fn test_create_error_messages() {
        let err = CreateError::CapacityExceeded { limit: 2 };
        assert_eq!(err.to_string(), "app limit of 2 reached");

        let err = CreateError::RuntimeStartFailed {
            name: "blog".into(),
            source: anyhow::anyhow!("image not found"),
        };
        assert_eq!(err.to_string(), "failed to start app 'blog': image not found");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_retryable() {
        assert!(!CreateError::InvalidName("!".into()).is_retryable());
        assert!(CreateError::NameTaken("a".into()).is_retryable());
        assert!(CreateError::CapacityExceeded { limit: 0 }.is_retryable());
    }

    #[test]
    fn test_dispenser_error_message() {
        let err = DispenserError::RuntimeClientUnreachable(anyhow::anyhow!("connection refused"));
        assert_eq!(
            err.to_string(),
            "container runtime is unreachable: connection refused"
        );
    }
}
