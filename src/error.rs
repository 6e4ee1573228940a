//! Error types for the MongoDB operator
//!
//! Errors are structured with fields to aid debugging in production. Each
//! variant carries enough context (instance name, command, pod) to be surfaced
//! verbatim in the instance status.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for operator operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The MongoDB specification is internally inconsistent
    #[error("validation error for {instance}: {message}")]
    Validation {
        /// Name of the instance with the invalid specification
        instance: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.sharded.shards.count")
        field: Option<String>,
    },

    /// Administrative command against a live database failed
    #[error("admin command {command} failed on {target}: {message}")]
    Admin {
        /// Command that failed (e.g., "replSetInitiate")
        command: String,
        /// Pod the command was executed in
        target: String,
        /// Description of what failed
        message: String,
        /// Whether the failure is expected to clear on its own
        retryable: bool,
    },

    /// Random key material could not be generated
    #[error("entropy source failure: {message}")]
    Entropy {
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
        /// Context where the error occurred (e.g., "reconciler", "exec")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            instance: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with instance context and field path
    pub fn validation_for_field(
        instance: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            instance: instance.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a transient admin command error
    pub fn admin(
        command: impl Into<String>,
        target: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Admin {
            command: command.into(),
            target: target.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create an admin command error that will not clear by retrying
    pub fn admin_permanent(
        command: impl Into<String>,
        target: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Admin {
            command: command.into(),
            target: target.into(),
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create an entropy error
    pub fn entropy(msg: impl Into<String>) -> Self {
        Self::Entropy {
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

    /// Check if this error is retryable
    ///
    /// Validation, entropy and serialization errors require a spec change or
    /// operator fix. Kubernetes errors are retried unless the API server
    /// rejected the request outright, except for conflicts which are retried
    /// against a fresh read.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) if ae.code == 409 || ae.code == 429 => true,
                kube::Error::Api(ae) => !(400..500).contains(&ae.code),
                _ => true,
            },
            Error::Validation { .. } => false,
            Error::Admin { retryable, .. } => *retryable,
            Error::Entropy { .. } => false,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Whether the API server answered 404
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 404)
    }

    /// Machine-readable reason code for status reporting
    pub fn reason(&self) -> &'static str {
        match self {
            Error::Kube { .. } => "KubernetesApiError",
            Error::Validation { .. } => "InvalidSpec",
            Error::Admin { .. } => "AdminCommandFailed",
            Error::Entropy { .. } => "KeyMaterialUnavailable",
            Error::Serialization { .. } => "SerializationFailed",
            Error::Internal { .. } => "InternalError",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}
