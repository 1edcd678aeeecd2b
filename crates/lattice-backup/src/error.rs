//! Controller error types

/// Errors raised while reconciling a BackupStorage
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    #[error("{0}")]
    Common(#[from] lattice_common::Error),

    #[error("missing namespace on {kind}")]
    MissingNamespace { kind: &'static str },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ReconcileError {
    /// Whether retrying the reconcile can help
    pub fn is_retryable(&self) -> bool {
        match self {
            ReconcileError::Kube(e) => {
                !matches!(e, kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409)
            }
            ReconcileError::Common(e) => e.is_retryable(),
            ReconcileError::MissingNamespace { .. } | ReconcileError::Serialization(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_common_errors_keep_retryability() {
        let validation: ReconcileError = lattice_common::Error::validation("bad").into();
        assert!(!validation.is_retryable());

        let internal: ReconcileError = lattice_common::Error::internal("flaky").into();
        assert!(internal.is_retryable());
    }

    #[test]
    fn test_missing_namespace_display() {
        let err = ReconcileError::MissingNamespace {
            kind: "BackupStorage",
        };
        assert_eq!(err.to_string(), "missing namespace on BackupStorage");
        assert!(!err.is_retryable());
    }
}
