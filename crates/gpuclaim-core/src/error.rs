//! Error types for gpuclaim

use thiserror::Error;

/// Main error type for gpuclaim
#[derive(Error, Debug)]
pub enum SchedError {
    /// Claim or node catalog does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// The pod cannot be placed in this cycle
    #[error("Unschedulable: {0}")]
    Unschedulable(String),

    /// Fewer leases could be acquired than the claim requires
    #[error("Insufficient devices on node {node}: requested {requested}, total {total}")]
    InsufficientDevices {
        node: String,
        requested: u32,
        total: u32,
    },

    /// Claim is malformed
    #[error("Invalid claim: {0}")]
    InvalidClaim(String),

    /// Remote store failure unrelated to contention
    #[error("Transient store error: {0}")]
    TransientStore(String),

    /// The caller cancelled the cycle
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Allocation record could not be persisted
    #[error("Commit failed: {0}")]
    Commit(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SchedError {
    /// Whether the pod should be reported unschedulable and retried in a later
    /// cycle, as opposed to the attempt itself having malfunctioned.
    pub fn is_unschedulable(&self) -> bool {
        matches!(
            self,
            SchedError::NotFound(_)
                | SchedError::Unschedulable(_)
                | SchedError::InsufficientDevices { .. }
                | SchedError::InvalidClaim(_)
        )
    }
}

/// Result type for gpuclaim operations
pub type SchedResult<T> = Result<T, SchedError>;

impl From<serde_json::Error> for SchedError {
    fn from(err: serde_json::Error) -> Self {
        SchedError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for SchedError {
    fn from(err: toml::de::Error) -> Self {
        SchedError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SchedError::InsufficientDevices {
            node: "node-a".to_string(),
            requested: 4,
            total: 2,
        };
        assert_eq!(
            err.to_string(),
            "Insufficient devices on node node-a: requested 4, total 2"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: SchedError = io_err.into();
        assert!(matches!(err, SchedError::Io(_)));
    }

    #[test]
    fn test_unschedulable_classification() {
        assert!(SchedError::NotFound("claim".into()).is_unschedulable());
        assert!(SchedError::InvalidClaim("count".into()).is_unschedulable());
        assert!(!SchedError::TransientStore("timeout".into()).is_unschedulable());
        assert!(!SchedError::Commit("patch".into()).is_unschedulable());
        assert!(!SchedError::Cancelled("shutdown".into()).is_unschedulable());
    }
}
