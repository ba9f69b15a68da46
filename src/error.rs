//! Error taxonomy shared by the orchestrators and lifecycle primitives.

use thiserror::Error;

/// EC2 API error code returned when a security group no longer exists.
pub const GROUP_NOT_FOUND: &str = "InvalidGroup.NotFound";
/// EC2 API error code returned when an ingress rule already exists.
pub const DUPLICATE_PERMISSION: &str = "InvalidPermission.Duplicate";
/// EC2 API error code returned when a volume no longer exists.
pub const VOLUME_NOT_FOUND: &str = "InvalidVolume.NotFound";

/// Errors raised while orchestrating EC2 resources.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum Ec2Error {
    /// Raised when the remote API rejects a request. The provider's own error
    /// code is preserved so callers can recognise idempotency cases.
    #[error("{action} failed: {message}")]
    Api {
        /// Operation that was being performed.
        action: String,
        /// Provider error code, when one was returned.
        code: Option<String>,
        /// Message returned by the provider.
        message: String,
    },
    /// Raised when cooperative cancellation was observed mid-sequence.
    #[error("{action} cancelled")]
    Cancelled {
        /// Operation that observed the cancellation.
        action: String,
    },
    /// Raised when a bounded wait elapsed before the desired state was seen.
    /// Distinct from [`Ec2Error::Cancelled`] so callers can apply different
    /// recovery to "user gave up" and "this is taking unusually long".
    #[error("timed out waiting for {action}")]
    Timeout {
        /// Operation that was being waited on.
        action: String,
    },
    /// Raised when a resource that had been observed at least once disappears
    /// from the provider while being polled.
    #[error("resource vanished while waiting for {action}")]
    Vanished {
        /// Operation that was being waited on.
        action: String,
    },
    /// Raised when a caller-supplied identifier or argument is malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Raised when every device name in the mount point pool is in use.
    #[error("no free device mount points remain on this instance")]
    MountPointsExhausted,
    /// Raised when an operation is invoked in the wrong lifecycle state.
    #[error("operation not valid in state {state}: {operation}")]
    InvalidState {
        /// Current lifecycle state of the entity.
        state: String,
        /// Operation that was attempted.
        operation: String,
    },
    /// Raised when the key-store collaborator fails.
    #[error("key store error: {0}")]
    KeyStore(String),
    /// Raised when the guest-configuration collaborator fails.
    #[error("guest configuration failed: {0}")]
    Guest(String),
    /// Raised when configuration is incomplete or fails to load.
    #[error("configuration error: {0}")]
    Config(String),
    /// Raised when a rollback sub-step failed while unwinding a failed
    /// sequence. The original error is preserved as the source; the rollback
    /// failures are appended so neither is masked.
    #[error("{source} (rollback also failed: {details})")]
    RollbackFailed {
        /// The error that triggered the rollback.
        source: Box<Ec2Error>,
        /// Description of the compensating actions that failed.
        details: String,
    },
}

impl Ec2Error {
    /// Returns the provider error code carried by an API error, if any.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Api { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// Returns `true` when this is an API error carrying the given code.
    #[must_use]
    pub fn is_code(&self, expected: &str) -> bool {
        self.code() == Some(expected)
    }

    /// Wraps `original` with the outcomes of a rollback chain. When every
    /// compensating action succeeded the original error is returned untouched.
    #[must_use]
    pub fn with_rollback_failures(self, failures: Vec<(String, Ec2Error)>) -> Self {
        if failures.is_empty() {
            return self;
        }
        let details = failures
            .iter()
            .map(|(label, err)| format!("{label}: {err}"))
            .collect::<Vec<_>>()
            .join("; ");
        Self::RollbackFailed {
            source: Box::new(self),
            details,
        }
    }

    /// Returns the error that triggered a rollback, unwrapping any rollback
    /// annotation.
    #[must_use]
    pub fn root_cause(&self) -> &Self {
        match self {
            Self::RollbackFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::absent_group(GROUP_NOT_FOUND)]
    #[case::duplicate_rule(DUPLICATE_PERMISSION)]
    #[case::absent_volume(VOLUME_NOT_FOUND)]
    fn api_errors_are_recognised_by_provider_code(#[case] code: &str) {
        let err = Ec2Error::Api {
            action: String::from("call"),
            code: Some(code.to_owned()),
            message: String::from("rejected"),
        };
        assert!(err.is_code(code));
        assert!(!err.is_code("DependencyViolation"));
    }

    #[rstest]
    #[case::codeless(Ec2Error::Api {
        action: String::from("call"),
        code: None,
        message: String::from("rejected"),
    })]
    #[case::local(Ec2Error::MountPointsExhausted)]
    fn errors_without_a_code_match_nothing(#[case] err: Ec2Error) {
        assert!(!err.is_code(GROUP_NOT_FOUND));
        assert_eq!(err.code(), None);
    }
}
