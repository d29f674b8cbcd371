//! Provisioning engine abstraction layer
//!
//! The lifecycle engine talks to CloudFormation only through the
//! [`StackProvider`] trait. [`AwsStackProvider`] is the real implementation;
//! tests substitute a mock or a scripted in-memory provider.
//!
//! Types here are engine-shaped but SDK-free: the SDK types stay inside
//! [`aws`], so the decision logic can be exercised without AWS.

mod aws;

pub use aws::AwsStackProvider;

use std::collections::BTreeMap;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::Result;

/// Status of an external stack as reported by the engine
///
/// Unknown codes are kept verbatim in [`StackStatusCode::Other`] and treated
/// as non-terminal by every built-in [`TerminalSet`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum StackStatusCode {
    CreateInProgress,
    CreateFailed,
    CreateComplete,
    RollbackInProgress,
    RollbackFailed,
    RollbackComplete,
    DeleteInProgress,
    DeleteFailed,
    DeleteComplete,
    UpdateInProgress,
    UpdateCompleteCleanupInProgress,
    UpdateComplete,
    UpdateFailed,
    UpdateRollbackInProgress,
    UpdateRollbackFailed,
    UpdateRollbackCompleteCleanupInProgress,
    UpdateRollbackComplete,
    ReviewInProgress,
    ImportInProgress,
    ImportComplete,
    ImportRollbackInProgress,
    ImportRollbackFailed,
    ImportRollbackComplete,
    /// A status this operator does not know about
    Other(String),
}

impl StackStatusCode {
    /// Statuses a stack must be in to count as existing for create-vs-update
    pub const EXISTS: [StackStatusCode; 2] =
        [StackStatusCode::CreateComplete, StackStatusCode::UpdateComplete];

    /// Engine wire representation
    pub fn as_str(&self) -> &str {
        match self {
            Self::CreateInProgress => "CREATE_IN_PROGRESS",
            Self::CreateFailed => "CREATE_FAILED",
            Self::CreateComplete => "CREATE_COMPLETE",
            Self::RollbackInProgress => "ROLLBACK_IN_PROGRESS",
            Self::RollbackFailed => "ROLLBACK_FAILED",
            Self::RollbackComplete => "ROLLBACK_COMPLETE",
            Self::DeleteInProgress => "DELETE_IN_PROGRESS",
            Self::DeleteFailed => "DELETE_FAILED",
            Self::DeleteComplete => "DELETE_COMPLETE",
            Self::UpdateInProgress => "UPDATE_IN_PROGRESS",
            Self::UpdateCompleteCleanupInProgress => "UPDATE_COMPLETE_CLEANUP_IN_PROGRESS",
            Self::UpdateComplete => "UPDATE_COMPLETE",
            Self::UpdateFailed => "UPDATE_FAILED",
            Self::UpdateRollbackInProgress => "UPDATE_ROLLBACK_IN_PROGRESS",
            Self::UpdateRollbackFailed => "UPDATE_ROLLBACK_FAILED",
            Self::UpdateRollbackCompleteCleanupInProgress => {
                "UPDATE_ROLLBACK_COMPLETE_CLEANUP_IN_PROGRESS"
            }
            Self::UpdateRollbackComplete => "UPDATE_ROLLBACK_COMPLETE",
            Self::ReviewInProgress => "REVIEW_IN_PROGRESS",
            Self::ImportInProgress => "IMPORT_IN_PROGRESS",
            Self::ImportComplete => "IMPORT_COMPLETE",
            Self::ImportRollbackInProgress => "IMPORT_ROLLBACK_IN_PROGRESS",
            Self::ImportRollbackFailed => "IMPORT_ROLLBACK_FAILED",
            Self::ImportRollbackComplete => "IMPORT_ROLLBACK_COMPLETE",
            Self::Other(s) => s,
        }
    }

    /// True when the status means the requested operation did not succeed
    ///
    /// A completed rollback is a failure of the operation that triggered it.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::CreateFailed
                | Self::RollbackFailed
                | Self::RollbackComplete
                | Self::DeleteFailed
                | Self::UpdateFailed
                | Self::UpdateRollbackFailed
                | Self::UpdateRollbackComplete
                | Self::ImportRollbackFailed
                | Self::ImportRollbackComplete
        )
    }

    /// True while the engine is still working on the stack
    pub fn is_in_progress(&self) -> bool {
        self.as_str().ends_with("_IN_PROGRESS")
    }
}

impl From<&str> for StackStatusCode {
    fn from(s: &str) -> Self {
        match s {
            "CREATE_IN_PROGRESS" => Self::CreateInProgress,
            "CREATE_FAILED" => Self::CreateFailed,
            "CREATE_COMPLETE" => Self::CreateComplete,
            "ROLLBACK_IN_PROGRESS" => Self::RollbackInProgress,
            "ROLLBACK_FAILED" => Self::RollbackFailed,
            "ROLLBACK_COMPLETE" => Self::RollbackComplete,
            "DELETE_IN_PROGRESS" => Self::DeleteInProgress,
            "DELETE_FAILED" => Self::DeleteFailed,
            "DELETE_COMPLETE" => Self::DeleteComplete,
            "UPDATE_IN_PROGRESS" => Self::UpdateInProgress,
            "UPDATE_COMPLETE_CLEANUP_IN_PROGRESS" => Self::UpdateCompleteCleanupInProgress,
            "UPDATE_COMPLETE" => Self::UpdateComplete,
            "UPDATE_FAILED" => Self::UpdateFailed,
            "UPDATE_ROLLBACK_IN_PROGRESS" => Self::UpdateRollbackInProgress,
            "UPDATE_ROLLBACK_FAILED" => Self::UpdateRollbackFailed,
            "UPDATE_ROLLBACK_COMPLETE_CLEANUP_IN_PROGRESS" => {
                Self::UpdateRollbackCompleteCleanupInProgress
            }
            "UPDATE_ROLLBACK_COMPLETE" => Self::UpdateRollbackComplete,
            "REVIEW_IN_PROGRESS" => Self::ReviewInProgress,
            "IMPORT_IN_PROGRESS" => Self::ImportInProgress,
            "IMPORT_COMPLETE" => Self::ImportComplete,
            "IMPORT_ROLLBACK_IN_PROGRESS" => Self::ImportRollbackInProgress,
            "IMPORT_ROLLBACK_FAILED" => Self::ImportRollbackFailed,
            "IMPORT_ROLLBACK_COMPLETE" => Self::ImportRollbackComplete,
            other => Self::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for StackStatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Set of statuses that end a completion poll
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TerminalSet {
    /// After a create request
    Create,
    /// After an update request
    Update,
    /// After a delete request
    Delete,
    /// Any status that is not in progress
    ///
    /// Used when no request of ours is in flight (rejected or no-op update),
    /// to report whatever the stack settles into.
    Settled,
}

impl TerminalSet {
    /// Whether a status ends the poll
    pub fn contains(&self, status: &StackStatusCode) -> bool {
        use StackStatusCode as S;
        match self {
            // A create that fails with rollback enabled ends in ROLLBACK_COMPLETE
            Self::Create => matches!(
                status,
                S::CreateComplete | S::CreateFailed | S::RollbackFailed | S::RollbackComplete
            ),
            Self::Update => matches!(
                status,
                S::UpdateComplete | S::UpdateRollbackFailed | S::UpdateRollbackComplete
            ),
            Self::Delete => matches!(status, S::DeleteComplete | S::DeleteFailed),
            Self::Settled => !status.is_in_progress() && !matches!(status, S::Other(_)),
        }
    }
}

impl std::fmt::Display for TerminalSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
            Self::Settled => write!(f, "settled"),
        }
    }
}

/// Key/value tag attached to a stack
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tag {
    /// Tag key
    pub key: String,
    /// Tag value
    pub value: String,
}

impl Tag {
    /// Create a tag
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Template parameter
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Parameter {
    /// Parameter name
    pub key: String,
    /// Parameter value
    pub value: String,
}

/// Where the engine reads the template from
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TemplateSource {
    /// Inline template body
    Body(String),
    /// Remote template URL
    Url(String),
}

/// Effective create or update request
///
/// `parameters` is `None` rather than empty when the spec has none, so the
/// engine keeps previous values for omitted parameters on update.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StackRequest {
    /// Stack name (the resource name)
    pub name: String,
    /// Service role the engine executes the stack with
    pub role_arn: Option<String>,
    /// Template source
    pub template: TemplateSource,
    /// Mapped parameters, omitted when the spec has none
    pub parameters: Option<Vec<Parameter>>,
    /// Merged tags, sentinel first
    pub tags: Vec<Tag>,
    /// Static capability acknowledgments
    pub capabilities: Option<Vec<String>>,
}

/// Entry of a stack listing
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StackSummary {
    /// Stack name
    pub name: String,
    /// Current status
    pub status: StackStatusCode,
}

/// Stack output
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StackOutput {
    /// Output key
    pub key: String,
    /// Output value
    pub value: String,
}

/// Full describe record of a stack
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StackRecord {
    /// Stack name
    pub name: String,
    /// Engine-assigned identifier
    pub stack_id: Option<String>,
    /// Current status
    pub status: StackStatusCode,
    /// Engine explanation for the status, if any
    pub status_reason: Option<String>,
    /// Declared outputs
    pub outputs: Vec<StackOutput>,
}

impl StackRecord {
    /// Outputs as a mapping, `None` when the stack declares none
    pub fn outputs_map(&self) -> Option<BTreeMap<String, String>> {
        if self.outputs.is_empty() {
            return None;
        }
        Some(
            self.outputs
                .iter()
                .map(|o| (o.key.clone(), o.value.clone()))
                .collect(),
        )
    }
}

/// Provisioning engine operations used by the lifecycle engine
///
/// Implementations report engine answers as values and transport or API
/// failures as errors. In particular a describe of a stack that does not
/// exist returns an empty list, never an error.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StackProvider: Send + Sync {
    /// Create a stack, returning its identifier
    async fn create_stack(&self, request: &StackRequest) -> Result<String>;

    /// Update a stack, returning its identifier
    ///
    /// Returns `Ok(None)` when the engine reports there is nothing to update.
    async fn update_stack(&self, request: &StackRequest) -> Result<Option<String>>;

    /// Request deletion of a stack
    async fn delete_stack(&self, name: &str) -> Result<()>;

    /// List stack summaries whose status is in `filter`
    async fn list_stacks(&self, filter: &[StackStatusCode]) -> Result<Vec<StackSummary>>;

    /// Describe a stack by name
    async fn describe_stacks(&self, name: &str) -> Result<Vec<StackRecord>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_round_trip_through_wire_form() {
        for code in [
            "CREATE_COMPLETE",
            "UPDATE_ROLLBACK_COMPLETE_CLEANUP_IN_PROGRESS",
            "IMPORT_ROLLBACK_FAILED",
        ] {
            assert_eq!(StackStatusCode::from(code).as_str(), code);
        }
        let unknown = StackStatusCode::from("SOMETHING_NEW");
        assert_eq!(unknown, StackStatusCode::Other("SOMETHING_NEW".to_string()));
        assert_eq!(unknown.to_string(), "SOMETHING_NEW");
    }

    /// Story: each request kind stops polling on its own outcomes only
    #[test]
    fn story_terminal_sets_match_request_kind() {
        use StackStatusCode as S;
        assert!(TerminalSet::Create.contains(&S::CreateComplete));
        assert!(TerminalSet::Create.contains(&S::RollbackFailed));
        assert!(TerminalSet::Create.contains(&S::RollbackComplete));
        assert!(!TerminalSet::Create.contains(&S::RollbackInProgress));
        assert!(!TerminalSet::Create.contains(&S::UpdateComplete));

        assert!(TerminalSet::Update.contains(&S::UpdateRollbackComplete));
        assert!(!TerminalSet::Update.contains(&S::UpdateRollbackInProgress));

        assert!(TerminalSet::Delete.contains(&S::DeleteFailed));
        assert!(!TerminalSet::Delete.contains(&S::CreateComplete));
    }

    /// Story: with nothing of ours in flight, any settled status is reported
    #[test]
    fn story_settled_set_waits_out_foreign_operations() {
        use StackStatusCode as S;
        assert!(TerminalSet::Settled.contains(&S::UpdateComplete));
        assert!(TerminalSet::Settled.contains(&S::RollbackComplete));
        assert!(!TerminalSet::Settled.contains(&S::UpdateInProgress));
        assert!(!TerminalSet::Settled.contains(&S::Other("NEW".to_string())));
    }

    #[test]
    fn completed_rollbacks_are_failures() {
        assert!(StackStatusCode::UpdateRollbackComplete.is_failure());
        assert!(StackStatusCode::RollbackComplete.is_failure());
        assert!(!StackStatusCode::UpdateComplete.is_failure());
        assert!(!StackStatusCode::DeleteComplete.is_failure());
    }

    #[test]
    fn record_without_outputs_maps_to_none() {
        let mut record = StackRecord {
            name: "vpc".to_string(),
            stack_id: Some("id".to_string()),
            status: StackStatusCode::CreateComplete,
            status_reason: None,
            outputs: vec![],
        };
        assert_eq!(record.outputs_map(), None);

        record.outputs.push(StackOutput {
            key: "VpcId".to_string(),
            value: "vpc-1".to_string(),
        });
        assert_eq!(record.outputs_map().unwrap()["VpcId"], "vpc-1");
    }
}
