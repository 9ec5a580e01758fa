//! Error Module
//!
//! Defines error types and result types used throughout the build cache proxy.
//! Classified backend failures live in [`crate::backend::BackendError`]; this
//! type covers everything local to the proxy process.

use thiserror::Error;

/// Main error type for the proxy
#[derive(Error, Debug, Clone)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Opening a connection to the backend failed
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Connecting to the backend took longer than the connect timeout
    #[error("Timeout error: {0}")]
    TimeoutError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// An upload body could not be written to or read back from staging
    #[error("Staging error: {0}")]
    StagingError(String),

    #[error("System error: {0}")]
    SystemError(String),
}

impl ProxyError {
    /// Whether the failure comes from the local disk rather than the network
    pub fn is_local_resource(&self) -> bool {
        matches!(self, ProxyError::IoError(_) | ProxyError::StagingError(_))
    }
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        ProxyError::IoError(err.to_string())
    }
}

impl From<hyper::Error> for ProxyError {
    fn from(err: hyper::Error) -> Self {
        ProxyError::HttpError(err.to_string())
    }
}

impl From<hyper::http::Error> for ProxyError {
    fn from(err: hyper::http::Error) -> Self {
        ProxyError::HttpError(format!("Failed to build request: {}", err))
    }
}

impl From<serde_json::Error> for ProxyError {
    fn from(err: serde_json::Error) -> Self {
        ProxyError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for ProxyError {
    fn from(err: serde_yaml::Error) -> Self {
        ProxyError::SerializationError(err.to_string())
    }
}

/// Result type alias for the proxy
pub type Result<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_conversion() {
        let err: ProxyError = std::io::Error::new(std::io::ErrorKind::Other, "disk full").into();
        assert!(matches!(err, ProxyError::IoError(ref msg) if msg.contains("disk full")));
        assert!(err.is_local_resource());
    }

    #[test]
    fn test_network_errors_are_not_local() {
        assert!(!ProxyError::ConnectionError("refused".into()).is_local_resource());
        assert!(ProxyError::StagingError("no space".into()).is_local_resource());
    }
}
