//! Error types for the Lattice storage controller
//!
//! Errors are structured with fields to aid debugging in production.
//! Validation errors carry the offending storage and field path so they can
//! be surfaced as conditions without reparsing the message.

use thiserror::Error;

use crate::crd::BackendValidationError;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for Lattice storage operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for CRD specs
    #[error("validation error for {storage}: {message}")]
    Validation {
        /// BackupStorage with invalid configuration (`namespace/name`)
        storage: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.storage.s3.bucket")
        field: Option<String>,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "registry", "controller")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            storage: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with storage context and field path
    pub fn validation_for_field(
        storage: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            storage: storage.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Wrap a rejected backend descriptor
    pub fn invalid_backend(storage: impl Into<String>, err: &BackendValidationError) -> Self {
        let field = match err {
            BackendValidationError::MissingRequiredField { provider, field } => {
                format!("spec.storage.{}.{}", provider, field)
            }
            BackendValidationError::InvalidVolumeSource { .. } => "spec.storage.local".to_string(),
            _ => "spec.storage".to_string(),
        };
        Self::validation_for_field(storage, field, err.to_string())
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation and serialization errors need a spec change, so retrying
    /// them is pointless. Kubernetes 4xx responses are likewise permanent.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code)
            ),
            Error::Validation { .. } => false,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// The storage this error refers to, if any
    pub fn storage(&self) -> Option<&str> {
        match self {
            Error::Validation { storage, .. } => Some(storage),
            _ => None,
        }
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Internal { context, .. } => Some(context),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::StorageProvider;

    /// Story: a rejected descriptor points at the field to fix
    #[test]
    fn story_invalid_backend_names_field() {
        let err = Error::invalid_backend(
            "backups/s3-prod",
            &BackendValidationError::MissingRequiredField {
                provider: StorageProvider::S3,
                field: "bucket",
            },
        );

        match &err {
            Error::Validation { storage, field, .. } => {
                assert_eq!(storage, "backups/s3-prod");
                assert_eq!(field.as_deref(), Some("spec.storage.s3.bucket"));
            }
            _ => panic!("Expected Validation variant"),
        }
        assert!(err.to_string().contains("missing required field 'bucket'"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_multiple_variants_maps_to_storage_field() {
        let err = Error::invalid_backend(
            "ns/a",
            &BackendValidationError::MultipleVariantsSet {
                set: vec![StorageProvider::Gcs, StorageProvider::B2],
            },
        );
        match err {
            Error::Validation { field, .. } => assert_eq!(field.as_deref(), Some("spec.storage")),
            _ => panic!("Expected Validation variant"),
        }
    }

    #[test]
    fn test_validation_defaults_context() {
        let err = Error::validation("bad");
        assert_eq!(err.storage(), Some(UNKNOWN_CONTEXT));
        assert!(err.to_string().contains("validation error"));
    }

    #[test]
    fn test_serialization_not_retryable() {
        let err = Error::serialization_for_kind("BackupStorage", "missing field 'spec'");
        match &err {
            Error::Serialization { kind, .. } => {
                assert_eq!(kind.as_deref(), Some("BackupStorage"));
            }
            _ => panic!("Expected Serialization variant"),
        }
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_internal_error_with_context() {
        let err = Error::internal_with_context("registry", "record vanished");
        assert!(err.is_retryable());
        assert_eq!(err.context(), Some("registry"));
        assert!(err.to_string().contains("[registry]"));
        assert_eq!(Error::internal("x").context(), Some(UNKNOWN_CONTEXT));
    }
}
