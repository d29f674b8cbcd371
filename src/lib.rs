//! Stack Operator - converges `Stack` custom resources onto AWS CloudFormation
//!
//! Each `Stack` resource names a template, parameters and tags. The operator
//! creates the matching CloudFormation stack, updates it when the spec
//! changes, waits for it to settle, and mirrors the stack id, outputs and a
//! coarse state back into the resource status. Deleting the resource deletes
//! the stack.
//!
//! # Modules
//!
//! - [`crd`] - The `Stack` custom resource
//! - [`controller`] - Reconcile engine and kube-runtime adapter
//! - [`lifecycle`] - Create, update and delete decisions
//! - [`poller`] - Waits for a stack to reach a terminal status
//! - [`status`] - Decides which status changes are written
//! - [`provider`] - CloudFormation abstraction and its AWS SDK adapter
//! - [`credentials`] - AWS credential acquisition, with optional role assumption
//! - [`mapper`] - Maps resource fields onto provider request fields
//! - [`scope`] - Deadline and cancellation for external calls
//! - [`config`] - Operator configuration
//! - [`telemetry`] - Logging setup
//! - [`health`] - Liveness endpoint
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod config;
pub mod controller;
pub mod credentials;
pub mod crd;
pub mod error;
pub mod health;
pub mod lifecycle;
pub mod mapper;
pub mod poller;
pub mod provider;
pub mod scope;
pub mod status;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Ownership Constants
// =============================================================================

/// Tag key attached to every stack the operator creates or updates
pub const SENTINEL_TAG_KEY: &str = "kubernetes.io/controlled-by";

/// Tag value identifying this operator as the stack owner
pub const SENTINEL_TAG_VALUE: &str = "cloudformation.mdstechinc.com/operator";

/// Finalizer holding a `Stack` until its CloudFormation stack is deleted
pub const STACK_FINALIZER: &str = "cloudformation.mdstechinc.com/stack-cleanup";

/// Field manager for status and finalizer patches
pub const FIELD_MANAGER: &str = "stack-operator";
