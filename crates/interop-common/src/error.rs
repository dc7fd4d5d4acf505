//! Error types for the interoperator
//!
//! Errors carry the cluster id and the attempted operation so a failed
//! reconcile can be diagnosed from a single log line.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for interoperator operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A required object does not exist
    #[error("{kind} {name} not found")]
    NotFound {
        /// Kind of the missing object (e.g., "SFCluster", "Secret")
        kind: String,
        /// Namespaced name of the missing object
        name: String,
    },

    /// Optimistic concurrency failure (stale resourceVersion)
    #[error("conflict updating {kind} {name}")]
    Conflict {
        /// Kind of the object that could not be written
        kind: String,
        /// Namespaced name of the object
        name: String,
    },

    /// Component used before it was ready, or used in an unsupported way
    #[error("precondition failed [{operation}]: {message}")]
    Precondition {
        /// Operation that was attempted (e.g., "get_watch_channel")
        operation: String,
        /// Description of the unmet precondition
        message: String,
    },

    /// Invalid or missing data on an object
    #[error("validation error for {cluster}: {message}")]
    Validation {
        /// Cluster id the invalid object belongs to
        cluster: String,
        /// Description of what's invalid
        message: String,
    },

    /// A sister cluster's credentials could not be resolved
    #[error("credentials error for cluster {cluster}: {message}")]
    Credentials {
        /// Cluster id whose credentials failed
        cluster: String,
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "watch_manager", "registry")
        context: String,
    },
}

impl Error {
    /// Create a not-found error for the given kind and name
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a conflict error for the given kind and name
    pub fn conflict(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Conflict {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a precondition error
    pub fn precondition(operation: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Precondition {
            operation: operation.into(),
            message: msg.into(),
        }
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            cluster: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
        }
    }

    /// Create a validation error with cluster context
    pub fn validation_for(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create a credentials error for a cluster
    pub fn credentials(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Credentials {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
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

    /// True for NotFound and for kube API errors with code 404
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 404,
            _ => false,
        }
    }

    /// True for Conflict and for kube API errors with code 409
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 409,
            _ => false,
        }
    }

    /// Check if this error is retryable
    ///
    /// Precondition, validation and serialization errors need a code or
    /// config fix and are never retried. Conflicts are always retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) => ae.code == 409 || !(400..500).contains(&ae.code),
                _ => true,
            },
            Error::NotFound { .. } => false,
            Error::Conflict { .. } => true,
            Error::Precondition { .. } => false,
            Error::Validation { .. } => false,
            Error::Credentials { .. } => true,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Get the cluster id if this error is associated with a specific cluster
    pub fn cluster(&self) -> Option<&str> {
        match self {
            Error::Validation { cluster, .. } => Some(cluster),
            Error::Credentials { cluster, .. } => Some(cluster),
            _ => None,
        }
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Internal { context, .. } => Some(context),
            Error::Precondition { operation, .. } => Some(operation),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Self::serialization(e.to_string())
    }
}
