//! Backend Module
//!
//! The object-store abstraction the proxy sits in front of, and the classified
//! failure type every backend call reports.
//!
//! Failures fall into three classes that drive all degradation decisions:
//!
//! | Class        | Variant(s)                  | Counted toward pausing | Hidden from client |
//! |--------------|-----------------------------|------------------------|--------------------|
//! | connectivity | `Unreachable`, `Paused`     | yes                    | when offline is allowed |
//! | not-found    | `NotFound`                  | no (resets counter)    | surfaced as a miss |
//! | other        | `Rejected`                  | configurable           | never              |

use async_trait::async_trait;
use bytes::Bytes;
use hyper::StatusCode;
use serde::Serialize;
use thiserror::Error;

/// Classified failure of a backend operation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The request could not be completed because the backend was not reachable
    #[error("backend unreachable: {0}")]
    Unreachable(String),

    /// Synthetic connectivity failure returned without contacting the backend
    #[error("backend access paused after repeated connectivity failures")]
    Paused,

    /// The backend affirmatively reported that the object does not exist
    #[error("object not found: {0}")]
    NotFound(String),

    /// The backend answered but refused the request (permissions, validation, quota)
    #[error("backend rejected request ({status} {code}): {message}")]
    Rejected {
        status: u16,
        code: String,
        message: String,
    },
}

/// Result type for backend operations
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// JSON body returned to clients for surfaced backend failures
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    pub status: u16,
}

impl BackendError {
    /// Whether this failure was caused by reachability rather than a backend answer
    pub fn is_connectivity(&self) -> bool {
        matches!(self, BackendError::Unreachable(_) | BackendError::Paused)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound(_))
    }

    /// HTTP status to surface to the client when this failure is not hidden
    pub fn status(&self) -> StatusCode {
        match self {
            BackendError::Unreachable(_) | BackendError::Paused => StatusCode::SERVICE_UNAVAILABLE,
            BackendError::NotFound(_) => StatusCode::NOT_FOUND,
            BackendError::Rejected { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
        }
    }

    /// Short machine-readable code for logs and error bodies
    pub fn code(&self) -> &str {
        match self {
            BackendError::Unreachable(_) => "BackendUnreachable",
            BackendError::Paused => "BackendPaused",
            BackendError::NotFound(_) => "NoSuchKey",
            BackendError::Rejected { code, .. } => code,
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        let message = match self {
            BackendError::Rejected { message, .. } => message.clone(),
            other => other.to_string(),
        };
        ErrorBody {
            code: self.code().to_string(),
            message,
            status: self.status().as_u16(),
        }
    }
}

/// Handle to the remote object store, bound to one bucket
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch the full object body
    async fn get_object(&self, key: &str) -> BackendResult<Bytes>;

    /// Check for existence, returning the object's size in bytes
    async fn head_object(&self, key: &str) -> BackendResult<u64>;

    /// Store an object, replacing any previous content
    async fn put_object(&self, key: &str, data: Bytes) -> BackendResult<()>;

    /// Remove an object
    async fn delete_object(&self, key: &str) -> BackendResult<()>;
}
