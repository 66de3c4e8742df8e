//! Error types for meshgate

use thiserror::Error;

/// Result type alias using the meshgate Error
pub type Result<T> = std::result::Result<T, Error>;

/// Which pooled resource ran out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exhausted {
    /// Every host address of the private /24 is bound to a node
    NoAddressAvailable,
    /// Every Docker subnet of the pool is bound to a gateway or server
    NoSubnetAvailable,
}

impl std::fmt::Display for Exhausted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoAddressAvailable => write!(f, "no private address available"),
            Self::NoSubnetAvailable => write!(f, "no docker subnet available"),
        }
    }
}

/// meshgate error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Resource not found: {kind} with id {id}")]
    NotFound { kind: String, id: String },

    #[error("Resource already exists: {kind} with id {id}")]
    AlreadyExists { kind: String, id: String },

    #[error("No gateway node exists in this mesh")]
    NoGateway,

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(Exhausted),

    #[error("Docker subnet {0} is already bound to another node")]
    SubnetInUse(String),

    #[error("Docker subnet {0} is not a member of the subnet pool")]
    SubnetOutOfPool(String),

    #[error("Join token does not match the stored request")]
    Tampered,

    #[error("Role not supported for this operation: {0}")]
    RoleUnsupported(String),

    #[error("Invalid join token: {0}")]
    InvalidToken(String),

    #[error("PKI error: {0}")]
    Pki(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn not_found(kind: &str, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind: kind.to_string(),
            id: id.into(),
        }
    }

    /// True for failures caused by the caller's input rather than by this process.
    ///
    /// The control endpoint collapses all of these into one undifferentiated
    /// client-error response.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::NotFound { .. }
                | Error::AlreadyExists { .. }
                | Error::NoGateway
                | Error::ResourceExhausted(_)
                | Error::SubnetInUse(_)
                | Error::SubnetOutOfPool(_)
                | Error::Tampered
                | Error::RoleUnsupported(_)
                | Error::InvalidToken(_)
        )
    }
}

impl From<rcgen::Error> for Error {
    fn from(e: rcgen::Error) -> Self {
        Error::Pki(e.to_string())
    }
}

impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        Error::Tls(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_error_classification() {
        assert!(Error::Tampered.is_client_error());
        assert!(Error::not_found("join request", "abc").is_client_error());
        assert!(Error::ResourceExhausted(Exhausted::NoSubnetAvailable).is_client_error());
        assert!(Error::RoleUnsupported("gateway".into()).is_client_error());

        assert!(!Error::Internal("boom".into()).is_client_error());
        assert!(!Error::Database(rusqlite::Error::InvalidQuery).is_client_error());
    }

    #[test]
    fn test_exhausted_display() {
        let err = Error::ResourceExhausted(Exhausted::NoAddressAvailable);
        assert_eq!(err.to_string(), "Resource exhausted: no private address available");
    }
}
