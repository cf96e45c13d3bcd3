//! Error types for the capmk provider
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant carries the object or profile it concerns so log lines and
//! status failure messages can be traced back to a specific resource.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Category of a Node Provisioner failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionerErrorKind {
    /// The profile or node does not exist
    NotFound,
    /// The provisioner could not be reached or is temporarily unusable
    Unavailable,
    /// The provisioner ran but the operation failed
    Provision,
}

impl std::fmt::Display for ProvisionerErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => write!(f, "not found"),
            Self::Unavailable => write!(f, "unavailable"),
            Self::Provision => write!(f, "provision failed"),
        }
    }
}

/// Main error type for capmk operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Node Provisioner error
    #[error("provisioner error [{profile}] ({kind}): {message}")]
    Provisioner {
        /// Profile the call was made against
        profile: String,
        /// Failure category
        kind: ProvisionerErrorKind,
        /// Description of what failed
        message: String,
    },

    /// Optimistic-concurrency rejection from the resource store
    #[error("conflict writing {kind} {name}: object was modified")]
    Conflict {
        /// Kind of the object being written
        kind: String,
        /// Namespaced name of the object
        name: String,
    },

    /// Object missing from the resource store
    #[error("{kind} {name} not found")]
    NotFound {
        /// Kind of the missing object
        kind: String,
        /// Namespaced name of the missing object
        name: String,
    },

    /// An operation exceeded the reconcile deadline
    #[error("{operation} timed out")]
    Timeout {
        /// The operation that timed out
        operation: String,
    },

    /// Validation error for resource specs
    #[error("validation error for {object}: {message}")]
    Validation {
        /// Name of the object with invalid configuration
        object: String,
        /// Description of what's invalid
        message: String,
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
        /// Context where the error occurred (e.g., "scheduler", "patch")
        context: String,
    },
}

impl Error {
    /// Create a provisioner error of the given kind
    pub fn provisioner(
        profile: impl Into<String>,
        kind: ProvisionerErrorKind,
        msg: impl Into<String>,
    ) -> Self {
        Self::Provisioner {
            profile: profile.into(),
            kind,
            message: msg.into(),
        }
    }

    /// Create a conflict error for the given object
    pub fn conflict(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Conflict {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a not-found error for the given object
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a timeout error for the named operation
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Create a validation error without object context
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            object: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
        }
    }

    /// Create a validation error for a specific object
    pub fn validation_for(object: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            object: object.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error without specific context
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
    /// Validation and serialization errors need a spec or code change.
    /// A missing profile or node is retried too: the profile may be created
    /// out of band after the objects that reference it.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409 && ae.code != 429
            ),
            Error::Provisioner { .. } => true,
            Error::Conflict { .. } => true,
            Error::NotFound { .. } => true,
            Error::Timeout { .. } => true,
            Error::Validation { .. } => false,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// True if this is an optimistic-concurrency rejection
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 409,
            _ => false,
        }
    }

    /// True if the object, profile or node does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Provisioner { kind, .. } => *kind == ProvisionerErrorKind::NotFound,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 404,
            _ => false,
        }
    }

    /// Get the provisioner failure category, if this is a provisioner error
    pub fn provisioner_kind(&self) -> Option<ProvisionerErrorKind> {
        match self {
            Error::Provisioner { kind, .. } => Some(*kind),
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
