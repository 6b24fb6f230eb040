use thiserror::Error;

use crate::link::LinkError;
use crate::store::StoreError;

/// Result type used throughout the driver core
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by the network and endpoint resource manager
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or missing required option
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A network or endpoint with this identifier is already registered
    #[error("{kind} {id} already exists")]
    AlreadyExists { kind: &'static str, id: String },

    /// No network or endpoint with this identifier
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    /// The network still has endpoints attached
    #[error("network {0} is busy: endpoints still attached")]
    Busy(String),

    #[error("failed to create link {name}: {source}")]
    LinkCreateFailed {
        name: String,
        #[source]
        source: LinkError,
    },

    #[error("failed to delete link {name}: {source}")]
    LinkDeleteFailed {
        name: String,
        #[source]
        source: LinkError,
    },

    #[error("failed to create veth {name}: {source}")]
    VethCreateFailed {
        name: String,
        #[source]
        source: LinkError,
    },

    #[error("failed to delete veth {name}: {source}")]
    VethDeleteFailed {
        name: String,
        #[source]
        source: LinkError,
    },

    /// Persistence layer could not be reached; the in-memory change was rolled back
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    /// No free interface name could be derived from the identifier
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The physical uplink the driver was configured with does not exist
    #[error("could not find base interface {0}")]
    UplinkNotFound(String),
}

impl Error {
    pub fn network_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "network",
            id: id.into(),
        }
    }

    pub fn endpoint_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "endpoint",
            id: id.into(),
        }
    }

    pub fn network_exists(id: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind: "network",
            id: id.into(),
        }
    }

    pub fn endpoint_exists(id: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind: "endpoint",
            id: id.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Returns true if a request-level retry of the same operation may succeed.
    ///
    /// Kernel and store failures are transient from the driver's point of view;
    /// everything else reflects the request itself or the registry state.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::LinkCreateFailed { .. }
                | Error::LinkDeleteFailed { .. }
                | Error::VethCreateFailed { .. }
                | Error::VethDeleteFailed { .. }
                | Error::StoreUnavailable(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::network_not_found("net1");
        assert_eq!(err.to_string(), "network net1 not found");

        let err = Error::endpoint_exists("ep1");
        assert_eq!(err.to_string(), "endpoint ep1 already exists");

        let err = Error::Busy("net1".to_string());
        assert!(err.to_string().contains("busy"));
    }

    #[test]
    fn test_kernel_error_keeps_source() {
        let err = Error::LinkCreateFailed {
            name: "bran100".to_string(),
            source: LinkError::Failed {
                command: "ip link add name bran100 type bridge".to_string(),
                stderr: "RTNETLINK answers: Operation not permitted".to_string(),
            },
        };
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert!(source.unwrap_or_default().contains("Operation not permitted"));
    }

    #[test]
    fn test_is_retryable() {
        assert!(Error::StoreUnavailable(StoreError::Unavailable("down".into())).is_retryable());
        assert!(!Error::invalid("vlan").is_retryable());
        assert!(!Error::Busy("net1".into()).is_retryable());
        assert!(!Error::ResourceExhausted("veth".into()).is_retryable());
    }
}
