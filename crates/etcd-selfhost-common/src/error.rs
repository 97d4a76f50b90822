//! Error types for the self-hosted etcd bootstrap
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant carries the context a caller needs to decide whether to
//! retry the whole bootstrap, tear down partial state, or alert an operator:
//! cluster and member names, the operation or endpoint involved, and the
//! underlying cause.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for bootstrap operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Network failure that may succeed on retry
    #[error("transient network error talking to {endpoint}: {message}")]
    TransientNetwork {
        /// Endpoint that could not be reached
        endpoint: String,
        /// Description of what failed
        message: String,
    },

    /// A phase or operation ran past its deadline
    #[error("{operation} for {cluster} exceeded its deadline of {seconds}s")]
    DeadlineExceeded {
        /// Cluster the operation was running for
        cluster: String,
        /// Operation that timed out (e.g., "wait_until_size", "adopt_boot")
        operation: String,
        /// Deadline budget in seconds
        seconds: u64,
    },

    /// The attempted membership change would risk losing majority
    #[error("quorum unsafe for {cluster}: {message} ({healthy}/{total} healthy voters)")]
    QuorumUnsafe {
        /// Cluster whose membership would change
        cluster: String,
        /// Description of the refused change
        message: String,
        /// Healthy voters at the time of the check
        healthy: usize,
        /// Total voters at the time of the check
        total: usize,
    },

    /// Member resource creation or deletion failed
    #[error("provisioner error for member {member} of {cluster}: {message}")]
    Provisioner {
        /// Cluster the member belongs to
        cluster: String,
        /// Member being created or destroyed
        member: String,
        /// Description of what failed
        message: String,
        /// Whether repeating the call is idempotent-safe
        retryable: bool,
    },

    /// The externally started boot member could not be reached
    #[error("boot member {endpoint} unreachable: {message}")]
    BootMemberUnreachable {
        /// Client endpoint of the boot member
        endpoint: String,
        /// Description of the last failure
        message: String,
    },

    /// etcd rejected a membership API call
    #[error("etcd error from {endpoint}: {message}")]
    Etcd {
        /// Endpoint that answered
        endpoint: String,
        /// Error reported by etcd
        message: String,
        /// Whether etcd signalled a temporary condition
        retryable: bool,
    },

    /// A member with this name is already registered
    #[error("member {name} is already registered")]
    DuplicateName {
        /// Conflicting member name
        name: String,
    },

    /// No member with this name is registered
    #[error("member {name} not found")]
    NotFound {
        /// Missing member name
        name: String,
    },

    /// Validation error for cluster specs and configuration
    #[error("validation error for {cluster}: {message}")]
    Validation {
        /// Name of the cluster with invalid configuration
        cluster: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.selfHosted.bootMemberClientEndpoint")
        field: Option<String>,
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
            cluster: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with cluster context
    pub fn validation_for(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            cluster: cluster.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with cluster context and field path
    pub fn validation_for_field(
        cluster: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            cluster: cluster.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a transient network error
    pub fn transient(endpoint: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::TransientNetwork {
            endpoint: endpoint.into(),
            message: msg.into(),
        }
    }

    /// Create a deadline error for an operation
    pub fn deadline(
        cluster: impl Into<String>,
        operation: impl Into<String>,
        budget: Duration,
    ) -> Self {
        Self::DeadlineExceeded {
            cluster: cluster.into(),
            operation: operation.into(),
            seconds: budget.as_secs(),
        }
    }

    /// Create a quorum safety error
    pub fn quorum_unsafe(
        cluster: impl Into<String>,
        msg: impl Into<String>,
        healthy: usize,
        total: usize,
    ) -> Self {
        Self::QuorumUnsafe {
            cluster: cluster.into(),
            message: msg.into(),
            healthy,
            total,
        }
    }

    /// Create a retryable provisioner error
    pub fn provisioner(
        cluster: impl Into<String>,
        member: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Provisioner {
            cluster: cluster.into(),
            member: member.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable provisioner error (repeating the call is not safe)
    pub fn provisioner_permanent(
        cluster: impl Into<String>,
        member: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Provisioner {
            cluster: cluster.into(),
            member: member.into(),
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create a boot member reachability error
    pub fn boot_unreachable(endpoint: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::BootMemberUnreachable {
            endpoint: endpoint.into(),
            message: msg.into(),
        }
    }

    /// Create an etcd API error
    pub fn etcd(endpoint: impl Into<String>, msg: impl Into<String>, retryable: bool) -> Self {
        Self::Etcd {
            endpoint: endpoint.into(),
            message: msg.into(),
            retryable,
        }
    }

    /// Create a duplicate member error
    pub fn duplicate(name: impl Into<String>) -> Self {
        Self::DuplicateName { name: name.into() }
    }

    /// Create a missing member error
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound { name: name.into() }
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
    /// Quorum, validation and registry errors are never retried automatically.
    /// Provisioner and etcd errors carry their own retryability.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                // Don't retry on 4xx errors (validation, not found, etc.)
                !matches!(
                    source,
                    kube::Error::Api(ae) if (400..500).contains(&ae.code)
                )
            }
            Error::TransientNetwork { .. } => true,
            Error::DeadlineExceeded { .. } => false,
            Error::QuorumUnsafe { .. } => false,
            Error::Provisioner { retryable, .. } => *retryable,
            Error::BootMemberUnreachable { .. } => false,
            Error::Etcd { retryable, .. } => *retryable,
            Error::DuplicateName { .. } => false,
            Error::NotFound { .. } => false,
            Error::Validation { .. } => false,
            Error::Internal { .. } => false,
        }
    }

    /// Get the cluster name if this error is associated with a specific cluster
    pub fn cluster(&self) -> Option<&str> {
        match self {
            Error::DeadlineExceeded { cluster, .. } => Some(cluster),
            Error::QuorumUnsafe { cluster, .. } => Some(cluster),
            Error::Provisioner { cluster, .. } => Some(cluster),
            Error::Validation { cluster, .. } => Some(cluster),
            _ => None,
        }
    }

    /// Get the member name if this error is associated with a specific member
    pub fn member(&self) -> Option<&str> {
        match self {
            Error::Provisioner { member, .. } => Some(member),
            Error::DuplicateName { name } => Some(name),
            Error::NotFound { name } => Some(name),
            _ => None,
        }
    }

    /// Map this error to the caller-facing result code
    pub fn code(&self) -> ResultCode {
        match self {
            Error::DeadlineExceeded { .. } => ResultCode::Timeout,
            Error::BootMemberUnreachable { .. } => ResultCode::BootMemberUnreachable,
            Error::Provisioner { .. } | Error::Kube { .. } => ResultCode::ProvisionerError,
            Error::QuorumUnsafe { .. } => ResultCode::QuorumUnsafe,
            Error::Validation { .. } => ResultCode::InvalidSpec,
            Error::TransientNetwork { .. }
            | Error::Etcd { .. }
            | Error::DuplicateName { .. }
            | Error::NotFound { .. }
            | Error::Internal { .. } => ResultCode::Internal,
        }
    }
}

/// Caller-facing outcome of `bootstrap` and `wait_until_size_reached`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResultCode {
    /// Operation completed
    Success,
    /// A deadline expired before the operation completed
    Timeout,
    /// The boot member never became reachable
    BootMemberUnreachable,
    /// Member resources could not be created or destroyed
    ProvisionerError,
    /// The operation was refused because it could lose majority
    QuorumUnsafe,
    /// The cluster spec or configuration was rejected before starting
    InvalidSpec,
    /// Any other failure (etcd API, registry invariant, unexpected state)
    Internal,
}

impl ResultCode {
    /// Derive the result code for any bootstrap result
    pub fn of<T>(result: &Result<T, Error>) -> Self {
        match result {
            Ok(_) => ResultCode::Success,
            Err(e) => e.code(),
        }
    }

    /// Process exit code used by the operator binary
    pub fn exit_code(self) -> i32 {
        match self {
            ResultCode::Success => 0,
            ResultCode::Internal => 1,
            ResultCode::Timeout => 2,
            ResultCode::BootMemberUnreachable => 3,
            ResultCode::ProvisionerError => 4,
            ResultCode::QuorumUnsafe => 5,
            ResultCode::InvalidSpec => 6,
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResultCode::Success => "Success",
            ResultCode::Timeout => "Timeout",
            ResultCode::BootMemberUnreachable => "BootMemberUnreachable",
            ResultCode::ProvisionerError => "ProvisionerError",
            ResultCode::QuorumUnsafe => "QuorumUnsafe",
            ResultCode::InvalidSpec => "InvalidSpec",
            ResultCode::Internal => "Internal",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Story: a boot member that never answers is reported as its own outcome
    ///
    /// Callers treat an unreachable boot member differently from a timeout in
    /// a later phase: nothing was created, so there is nothing to tear down.
    #[test]
    fn story_unreachable_boot_member_has_dedicated_code() {
        let err = Error::boot_unreachable("http://10.0.0.5:2379", "connection refused");
        assert!(err.to_string().contains("http://10.0.0.5:2379"));
        assert_eq!(err.code(), ResultCode::BootMemberUnreachable);
        assert!(!err.is_retryable());
    }

    /// Story: quorum violations are always fatal
    #[test]
    fn story_quorum_unsafe_is_never_retried() {
        let err = Error::quorum_unsafe("etcd", "removing boot member", 1, 4);
        assert!(err.to_string().contains("1/4 healthy voters"));
        assert_eq!(err.cluster(), Some("etcd"));
        assert_eq!(err.code(), ResultCode::QuorumUnsafe);
        assert!(!err.is_retryable());
    }

    /// Story: provisioner errors carry member context and idempotency
    #[test]
    fn story_provisioner_errors_name_the_member() {
        let err = Error::provisioner("etcd", "etcd-0002", "pod quota exceeded");
        assert_eq!(err.member(), Some("etcd-0002"));
        assert_eq!(err.cluster(), Some("etcd"));
        assert!(err.is_retryable());
        assert_eq!(err.code(), ResultCode::ProvisionerError);

        let err = Error::provisioner_permanent("etcd", "etcd-0002", "invalid image");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_deadline_display_and_code() {
        let err = Error::deadline("etcd", "wait_until_size", Duration::from_secs(240));
        assert_eq!(
            err.to_string(),
            "wait_until_size for etcd exceeded its deadline of 240s"
        );
        assert_eq!(err.code(), ResultCode::Timeout);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_registry_errors_are_programming_errors() {
        let dup = Error::duplicate("etcd-0000");
        assert_eq!(dup.to_string(), "member etcd-0000 is already registered");
        assert!(!dup.is_retryable());

        let missing = Error::not_found("etcd-0009");
        assert_eq!(missing.to_string(), "member etcd-0009 not found");
        assert_eq!(missing.member(), Some("etcd-0009"));
        assert_eq!(missing.code(), ResultCode::Internal);
    }

    #[test]
    fn test_transient_and_etcd_retryability() {
        assert!(Error::transient("http://a:2379", "reset").is_retryable());
        assert!(Error::etcd("http://a:2379", "etcdserver: too many requests", true).is_retryable());
        assert!(!Error::etcd("http://a:2379", "etcdserver: member not found", false).is_retryable());
    }

    #[test]
    fn test_validation_field_path() {
        let err = Error::validation_for_field(
            "etcd",
            "spec.selfHosted.bootMemberClientEndpoint",
            "must be an http(s) URL",
        );
        match &err {
            Error::Validation { field, .. } => {
                assert_eq!(
                    field.as_deref(),
                    Some("spec.selfHosted.bootMemberClientEndpoint")
                );
            }
            _ => panic!("Expected Validation variant"),
        }
        assert_eq!(err.code(), ResultCode::InvalidSpec);
    }

    #[test]
    fn test_internal_error_default_context() {
        let err = Error::internal("unexpected state");
        assert!(err.to_string().contains("[unknown]"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_result_code_exit_codes_are_distinct() {
        let codes = [
            ResultCode::Success,
            ResultCode::Timeout,
            ResultCode::BootMemberUnreachable,
            ResultCode::ProvisionerError,
            ResultCode::QuorumUnsafe,
            ResultCode::InvalidSpec,
            ResultCode::Internal,
        ];
        let exits: std::collections::HashSet<i32> = codes.iter().map(|c| c.exit_code()).collect();
        assert_eq!(exits.len(), codes.len());
        assert_eq!(ResultCode::Success.exit_code(), 0);
    }

    #[test]
    fn test_result_code_of_result() {
        let ok: Result<usize, Error> = Ok(3);
        assert_eq!(ResultCode::of(&ok), ResultCode::Success);
        let err: Result<usize, Error> = Err(Error::deadline("c", "op", Duration::from_secs(1)));
        assert_eq!(ResultCode::of(&err), ResultCode::Timeout);
        assert_eq!(ResultCode::Timeout.to_string(), "Timeout");
    }
}
