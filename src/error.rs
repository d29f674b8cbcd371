//! Error types for the stack operator
//!
//! Errors carry the stack name and the provisioning operation where one is
//! known, so a log line is enough to tell which resource and which engine call
//! failed.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for stack operator operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for a Stack spec
    #[error("validation error for {stack}: {message}")]
    Validation {
        /// Name of the stack with invalid configuration
        stack: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.templateURL")
        field: Option<String>,
    },

    /// Credential acquisition failed (role assumption or ambient identity)
    #[error("credential error: {message}")]
    Credential {
        /// Description of what failed
        message: String,
        /// Role that was being assumed, if any
        role_arn: Option<String>,
    },

    /// Provisioning engine error
    #[error("provider error [{operation}] for {stack}: {message}")]
    Provider {
        /// Name of the stack the call was about
        stack: String,
        /// Engine call that failed (create_stack, describe_stacks, ...)
        operation: String,
        /// Description of what failed
        message: String,
        /// Whether this error is retryable
        retryable: bool,
    },

    /// Static operator configuration is malformed
    #[error("configuration error for {setting}: {message}")]
    Config {
        /// Setting that failed to parse
        setting: String,
        /// Description of what's wrong
        message: String,
    },

    /// The reconcile was cancelled (shutdown or resource deletion)
    #[error("{operation} cancelled")]
    Cancelled {
        /// Call that was in flight when the cancellation arrived
        operation: String,
    },

    /// The reconcile ran past its deadline
    #[error("{operation} exceeded the reconcile deadline")]
    DeadlineExceeded {
        /// Call that was in flight when the deadline passed
        operation: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            stack: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with stack context
    pub fn validation_for(stack: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            stack: stack.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with stack context and field path
    pub fn validation_for_field(
        stack: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            stack: stack.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a credential error
    pub fn credential(msg: impl Into<String>) -> Self {
        Self::Credential {
            message: msg.into(),
            role_arn: None,
        }
    }

    /// Create a credential error for a failed role assumption
    pub fn credential_for_role(role_arn: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Credential {
            message: msg.into(),
            role_arn: Some(role_arn.into()),
        }
    }

    /// Create a retryable provider error with full context
    pub fn provider_for(
        stack: impl Into<String>,
        operation: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Provider {
            stack: stack.into(),
            operation: operation.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable provider error (template or request rejected)
    pub fn provider_rejected(
        stack: impl Into<String>,
        operation: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Provider {
            stack: stack.into(),
            operation: operation.into(),
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create a configuration error for a named setting
    pub fn config(setting: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Config {
            setting: setting.into(),
            message: msg.into(),
        }
    }

    /// Create a cancellation error for the call that was interrupted
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Create a deadline error for the call that was interrupted
    pub fn deadline_exceeded(operation: impl Into<String>) -> Self {
        Self::DeadlineExceeded {
            operation: operation.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation, configuration and serialization errors need a spec or
    /// config fix. Kubernetes errors are retryable unless they are 4xx.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code)
            ),
            Error::Validation { .. } => false,
            Error::Credential { .. } => true,
            Error::Provider { retryable, .. } => *retryable,
            Error::Config { .. } => false,
            Error::Cancelled { .. } => true,
            Error::DeadlineExceeded { .. } => true,
            Error::Serialization { .. } => false,
        }
    }

    /// True when the error came from the reconcile scope rather than a call
    ///
    /// Interruptions must never be mistaken for an engine answer such as
    /// "stack absent" or "request rejected".
    pub fn is_interruption(&self) -> bool {
        matches!(self, Error::Cancelled { .. } | Error::DeadlineExceeded { .. })
    }

    /// Get the stack name if this error is associated with a specific stack
    pub fn stack(&self) -> Option<&str> {
        match self {
            Error::Validation { stack, .. } => Some(stack),
            Error::Provider { stack, .. } => Some(stack),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Story: a spec with both template sources is rejected with the field
    /// path, so users can find the offending key.
    #[test]
    fn story_validation_error_names_stack_and_field() {
        let err = Error::validation_for_field(
            "vpc",
            "spec.templateURL",
            "template and templateURL are mutually exclusive",
        );
        assert!(err.to_string().contains("validation error for vpc"));
        assert_eq!(err.stack(), Some("vpc"));
        match err {
            Error::Validation { field, .. } => {
                assert_eq!(field.as_deref(), Some("spec.templateURL"))
            }
            _ => panic!("Expected Validation variant"),
        }
        assert!(!Error::validation("bad").is_retryable());
    }

    /// Story: engine rejections are permanent until the spec changes, while
    /// transport failures are retried.
    #[test]
    fn story_provider_errors_carry_retry_hint() {
        let rejected = Error::provider_rejected("vpc", "create_stack", "Template format error");
        assert!(!rejected.is_retryable());
        assert!(rejected.to_string().contains("[create_stack]"));

        let transient = Error::provider_for("vpc", "describe_stacks", "connection reset");
        assert!(transient.is_retryable());
        assert_eq!(transient.stack(), Some("vpc"));
    }

    /// Story: credential failures keep the role that was being assumed.
    #[test]
    fn story_credential_error_keeps_role() {
        let err = Error::credential_for_role("arn:aws:iam::1:role/deployer", "AccessDenied");
        match &err {
            Error::Credential { role_arn, .. } => {
                assert_eq!(role_arn.as_deref(), Some("arn:aws:iam::1:role/deployer"))
            }
            _ => panic!("Expected Credential variant"),
        }
        assert!(err.is_retryable());
        assert!(!err.is_interruption());
    }

    /// Story: shutdown and deadline errors are interruptions, nothing else is.
    #[test]
    fn story_interruptions_are_distinguishable() {
        assert!(Error::cancelled("describe_stacks").is_interruption());
        assert!(Error::deadline_exceeded("sleep").is_interruption());
        assert!(!Error::provider_for("s", "describe_stacks", "x").is_interruption());
        assert_eq!(
            Error::deadline_exceeded("describe_stacks").to_string(),
            "describe_stacks exceeded the reconcile deadline"
        );
    }

    #[test]
    fn config_error_is_not_retryable() {
        let err = Error::config("DEFAULT_TAGS", "entry 'owner' is not key:value");
        assert!(err.to_string().contains("DEFAULT_TAGS"));
        assert!(!err.is_retryable());
    }
}
