//! Error types for network operations.

use std::time::Duration;

use thiserror::Error;

use crate::store::StoreError;

/// Errors raised by the network driver and by steps.
///
/// Call sites dispatch on the variant. The not-found variants with a known
/// cause are definite and never retried; `Driver` covers transient substrate
/// failures.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("network not found: {0}")]
    NetworkNotFound(String),

    #[error("port not found: {0}")]
    PortNotFound(String),

    #[error("subnet not found: {0}")]
    SubnetNotFound(String),

    #[error("security group not found: {0}")]
    SecurityGroupNotFound(String),

    #[error("amphora not found: {0}")]
    AmphoraNotFound(String),

    /// Not-found reported by the substrate without a classified resource.
    /// The message names the resource, e.g. "Network abc could not be found".
    #[error("not found: {0}")]
    NotFound(String),

    #[error("failed to create port: {0}")]
    CreatePort(String),

    #[error("failed to plug network: {0}")]
    PlugNetwork(String),

    #[error("network driver error: {0}")]
    Driver(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation timed out after {0:?}")]
    TimedOut(Duration),
}

impl NetworkError {
    /// Whether a retrying step may attempt the operation again.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            NetworkError::NetworkNotFound(_)
                | NetworkError::PortNotFound(_)
                | NetworkError::SubnetNotFound(_)
                | NetworkError::SecurityGroupNotFound(_)
                | NetworkError::AmphoraNotFound(_)
                | NetworkError::InvalidInput(_)
                | NetworkError::Cancelled
                | NetworkError::TimedOut(_)
        )
    }

    /// Whether the error reports a missing resource of any kind.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            NetworkError::NetworkNotFound(_)
                | NetworkError::PortNotFound(_)
                | NetworkError::SubnetNotFound(_)
                | NetworkError::SecurityGroupNotFound(_)
                | NetworkError::AmphoraNotFound(_)
                | NetworkError::NotFound(_)
                | NetworkError::Store(StoreError::NotFound(_))
        )
    }
}

/// Result type for network operations.
pub type Result<T> = std::result::Result<T, NetworkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(NetworkError::Driver("503".into()).is_transient());
        assert!(NetworkError::CreatePort("boom".into()).is_transient());
        assert!(!NetworkError::NetworkNotFound("n1".into()).is_transient());
        assert!(!NetworkError::Cancelled.is_transient());
        assert!(!NetworkError::TimedOut(Duration::from_secs(1)).is_transient());
    }

    #[test]
    fn test_not_found_classification() {
        assert!(NetworkError::NotFound("Instance i-1 not found".into()).is_not_found());
        assert!(NetworkError::Store(StoreError::NotFound("amphora a1".into())).is_not_found());
        assert!(!NetworkError::Driver("x".into()).is_not_found());
    }
}
