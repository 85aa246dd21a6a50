//! Error types for the Skylift operator
//!
//! Errors are structured with fields to aid debugging in production. Each
//! variant is one handling category for the reconcile loop: validation
//! failures drop a single ingress, transient failures skip one action,
//! configuration failures abort the process.

use thiserror::Error;

/// Main error type for Skylift operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Ingress annotations violate a policy rule; the ingress is dropped
    /// from the tick
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// `namespace/name` of the offending resource
        resource: String,
        /// Description of what's invalid
        message: String,
    },

    /// Controller-level configuration is missing or invalid; fatal
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of what's invalid
        message: String,
    },

    /// A network or API call failed in a way the next tick may recover from
    #[error("transient error [{operation}]: {message}")]
    Transient {
        /// The outbound operation that failed (e.g. "CreateStack")
        operation: String,
        /// Description of what failed
        message: String,
    },

    /// A resource was absent where one was expected
    #[error("not found: {what}")]
    NotFound {
        /// Description of the missing resource
        what: String,
    },

    /// AWS or Kubernetes denied access to a resource
    #[error("permission denied [{operation}]: {message}")]
    PermissionDenied {
        /// The operation that was denied
        operation: String,
        /// Description of the denial
        message: String,
    },

    /// A CloudFormation stack is in a non-progressing failed state;
    /// requires operator intervention
    #[error("stack {name} in unexpected state {status}: {reason}")]
    Stack {
        /// Stack name
        name: String,
        /// CloudFormation stack status
        status: String,
        /// Status reason reported by CloudFormation
        reason: String,
    },

    /// Sentinel: a status patch would be a no-op; callers treat as success
    #[error("update to ingress resource not needed")]
    UpdateNotNeeded,
}

impl Error {
    /// Create a validation error for a resource
    pub fn validation(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a configuration error with the given message
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    /// Create a transient error for an outbound operation
    pub fn transient(operation: impl Into<String>, msg: impl std::fmt::Display) -> Self {
        Self::Transient {
            operation: operation.into(),
            message: msg.to_string(),
        }
    }

    /// Create a not-found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Create a permission-denied error
    pub fn permission_denied(operation: impl Into<String>, msg: impl std::fmt::Display) -> Self {
        Self::PermissionDenied {
            operation: operation.into(),
            message: msg.to_string(),
        }
    }

    /// True when this error must abort the process rather than the tick
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration { .. })
    }

    /// True when the error is the no-op status patch sentinel
    pub fn is_update_not_needed(&self) -> bool {
        matches!(self, Self::UpdateNotNeeded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_carries_resource_context() {
        let err = Error::validation("default/myapp", "extra listeners are only supported on NLBs");
        assert!(err.to_string().contains("default/myapp"));
        assert!(err.to_string().contains("extra listeners"));
        assert!(!err.is_fatal());
    }

    #[test]
    fn only_configuration_is_fatal() {
        assert!(Error::configuration("cluster id missing").is_fatal());
        assert!(!Error::transient("DescribeStacks", "timeout").is_fatal());
        assert!(!Error::not_found("stack skylift-abc").is_fatal());
        assert!(!Error::permission_denied("list routegroups", "403").is_fatal());
        assert!(!Error::UpdateNotNeeded.is_fatal());
    }

    #[test]
    fn update_not_needed_is_a_sentinel() {
        let err = Error::UpdateNotNeeded;
        assert!(err.is_update_not_needed());
        assert!(!Error::not_found("x").is_update_not_needed());
    }

    #[test]
    fn stack_error_reports_status_and_reason() {
        let err = Error::Stack {
            name: "skylift-0badc0de".into(),
            status: "CREATE_FAILED".into(),
            reason: "Resource limit exceeded".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("CREATE_FAILED"));
        assert!(msg.contains("Resource limit exceeded"));
    }
}
