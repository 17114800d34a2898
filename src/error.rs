//! Error taxonomy
//!
//! Each subsystem owns a `thiserror` enum; this module groups them under the
//! service-level classification used for logging and the control surface.

use thiserror::Error;

pub use crate::config::ConfigError;
pub use crate::enforcement::EnforcementError;
pub use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum Error {
    /// Log source unreadable or enforcement backend unreachable; retried
    #[error("transient I/O error: {0}")]
    TransientIo(String),

    /// Unparseable line, address or timestamp; never leaves the matcher
    #[error("malformed input: {0}")]
    MalformedInput(String),

    /// Bad jail definition; fatal for that jail only
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Backend rejected an install/remove after retries
    #[error("enforcement failure: {0}")]
    EnforcementFailure(String),

    /// Persisted ban state unreadable; fatal at startup
    #[error("ban store corrupted: {0}")]
    StoreCorruption(String),

    #[error("ban store error: {0}")]
    Store(String),

    #[error("jail not found: {0}")]
    UnknownJail(String),

    #[error("{0} is in the ignore list of jail {1}")]
    Ignored(std::net::IpAddr, String),

    #[error("jail {0} is shutting down")]
    JailClosed(String),
}

impl From<EnforcementError> for Error {
    fn from(err: EnforcementError) -> Self {
        match err {
            EnforcementError::Unreachable(msg) => Error::TransientIo(msg),
            EnforcementError::Io(e) => Error::TransientIo(e.to_string()),
            other => Error::EnforcementFailure(other.to_string()),
        }
    }
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Corrupt(msg) => Error::StoreCorruption(msg),
            other => Error::Store(other.to_string()),
        }
    }
}

impl Error {
    /// Stable code for the control surface
    pub fn code(&self) -> &'static str {
        match self {
            Error::TransientIo(_) => "TRANSIENT_IO",
            Error::MalformedInput(_) => "MALFORMED_INPUT",
            Error::Config(_) => "CONFIG_ERROR",
            Error::EnforcementFailure(_) => "ENFORCEMENT_FAILURE",
            Error::StoreCorruption(_) => "STORE_CORRUPTION",
            Error::Store(_) => "STORE_ERROR",
            Error::UnknownJail(_) => "UNKNOWN_JAIL",
            Error::Ignored(_, _) => "IGNORED",
            Error::JailClosed(_) => "UNAVAILABLE",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enforcement_error_classification() {
        let err: Error = EnforcementError::Unreachable("nft not found".into()).into();
        assert!(matches!(err, Error::TransientIo(_)));
        assert_eq!(err.code(), "TRANSIENT_IO");

        let err: Error = EnforcementError::Rejected {
            ip: "203.0.113.7".parse().unwrap(),
            reason: "exit status 1".into(),
        }
        .into();
        assert!(matches!(err, Error::EnforcementFailure(_)));
    }

    #[test]
    fn test_store_corruption_classification() {
        let err: Error = StoreError::Corrupt("file is not a database".into()).into();
        assert!(matches!(err, Error::StoreCorruption(_)));
        assert_eq!(err.code(), "STORE_CORRUPTION");
    }
}
