//! Error types for the broker.
//!
//! Three layers of errors exist:
//!
//! - [`ProviderError`] - failures talking to a backend (cloud API, orchestrator, cache node)
//! - [`StorageError`] - failures of the durable catalog and task queue
//! - [`BrokerError`] - the protocol-visible error kinds returned to callers
//!
//! Provider and storage errors never reach a caller directly. The broker logs them with
//! context and maps them onto the small protocol vocabulary in [`BrokerError`].

use crate::config::ConfigurationError;
use crate::providers::workflow::WorkflowFailure;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Machine-readable sub-codes carried by [`BrokerError::UnprocessableEntity`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnprocessableCode {
    AsyncRequired,
    InstanceRequired,
    InstanceInvalid,
    ServiceNotYetAvailable,
    ConcurrencyError,
    UpgradeError,
}

impl fmt::Display for UnprocessableCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AsyncRequired => write!(f, "AsyncRequired"),
            Self::InstanceRequired => write!(f, "InstanceRequired"),
            Self::InstanceInvalid => write!(f, "InstanceInvalid"),
            Self::ServiceNotYetAvailable => write!(f, "ServiceNotYetAvailable"),
            Self::ConcurrencyError => write!(f, "ConcurrencyError"),
            Self::UpgradeError => write!(f, "UpgradeError"),
        }
    }
}

/// Protocol-visible error kinds
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("Not Found")]
    NotFound,
    #[error("Unprocessable Entity ({code}): {description}")]
    UnprocessableEntity {
        code: UnprocessableCode,
        description: String,
    },
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Internal Server Error")]
    InternalServerError,
}

impl BrokerError {
    pub fn unprocessable(code: UnprocessableCode, description: impl Into<String>) -> Self {
        Self::UnprocessableEntity {
            code,
            description: description.into(),
        }
    }

    /// HTTP status an outer transport should use for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Self::NotFound => 404,
            Self::UnprocessableEntity { .. } => 422,
            Self::Conflict(_) => 409,
            Self::InternalServerError => 500,
        }
    }

    /// Sub-code for unprocessable entities, if any
    pub fn code(&self) -> Option<UnprocessableCode> {
        match self {
            Self::UnprocessableEntity { code, .. } => Some(*code),
            _ => None,
        }
    }
}

pub type BrokerResult<T> = Result<T, BrokerError>;

/// Errors raised by backend providers and their clients
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProviderError {
    /// The backend has no resource (cluster, deployment, snapshot) under the given name
    #[error("Not found: {0}")]
    NotFound(String),
    /// The operation is not offered by this backend (e.g. snapshots on memcached)
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
    /// The resource exists but its current status forbids the operation
    #[error("Invalid state: {0}")]
    InvalidState(String),
    /// The plan's private settings could not be decoded
    #[error("Invalid plan settings: {0}")]
    InvalidSettings(String),
    /// No provider is registered or enabled for the plan's backend
    #[error("No provider available: {0}")]
    NoProvider(String),
    /// A polling wait ran out of attempts
    #[error("Timed out waiting for {0}")]
    Timeout(String),
    /// Native protocol or network I/O failed
    #[error("I/O error: {0}")]
    Io(String),
    /// A multi-step workflow stopped part way through
    #[error("{0}")]
    Workflow(Box<WorkflowFailure>),
    /// The backend API rejected the call
    #[error("Backend error: {0}")]
    Backend(String),
}

impl ProviderError {
    /// True for a missing resource, including a workflow that failed on one before
    /// touching the backend
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Workflow(failure) => failure.is_untouched() && failure.cause.is_not_found(),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(error: serde_json::Error) -> Self {
        ProviderError::InvalidSettings(error.to_string())
    }
}

impl From<std::io::Error> for ProviderError {
    fn from(error: std::io::Error) -> Self {
        ProviderError::Io(error.to_string())
    }
}

impl From<WorkflowFailure> for ProviderError {
    fn from(failure: WorkflowFailure) -> Self {
        ProviderError::Workflow(Box::new(failure))
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Errors raised by the storage collaborator
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StorageError {
    /// No instance, plan or task exists with the given identifier
    #[error("Not found: {0}")]
    NotFound(String),
    /// The instance id was already used or is malformed
    #[error("Invalid instance id: {0}")]
    InvalidInstanceId(String),
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StorageError::NotFound("row not found".to_string()),
            other => StorageError::Database(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(error: serde_json::Error) -> Self {
        StorageError::Serialization(error.to_string())
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Failure resolving an instance through storage and its provider
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LookupError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl LookupError {
    /// True when either layer reported that the instance does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Storage(e) => e.is_not_found(),
            Self::Provider(e) => e.is_not_found(),
        }
    }
}

/// Failure assembling a broker from configuration
#[derive(Debug, Error)]
pub enum SetupError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(BrokerError::NotFound.status_code(), 404);
        assert_eq!(BrokerError::Conflict("x".into()).status_code(), 409);
        assert_eq!(BrokerError::InternalServerError.status_code(), 500);
        let err = BrokerError::unprocessable(UnprocessableCode::AsyncRequired, "async");
        assert_eq!(err.status_code(), 422);
        assert_eq!(err.code(), Some(UnprocessableCode::AsyncRequired));
    }

    #[test]
    fn test_lookup_not_found_detection() {
        let storage = LookupError::from(StorageError::NotFound("abc".into()));
        assert!(storage.is_not_found());

        let provider = LookupError::from(ProviderError::NotFound("cluster".into()));
        assert!(provider.is_not_found());

        let backend = LookupError::from(ProviderError::Backend("throttled".into()));
        assert!(!backend.is_not_found());
    }

    #[test]
    fn test_sqlx_row_not_found_maps_to_not_found() {
        let err: StorageError = sqlx::Error::RowNotFound.into();
        assert!(err.is_not_found());
    }
}
