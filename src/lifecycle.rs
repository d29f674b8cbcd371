//! Stack lifecycle decisions
//!
//! Decides create versus update, builds the effective request, and owns the
//! delete precondition. Exactly one engine request is issued per call; waiting
//! for the result is the poller's job.

use tracing::{info, warn};

use crate::config::OperatorConfig;
use crate::crd::StackSpec;
use crate::mapper::{map_parameters, merge_tags};
use crate::provider::{
    StackProvider, StackRequest, StackStatusCode, Tag, TemplateSource, TerminalSet,
};
use crate::scope::CallScope;
use crate::{Error, Result};

/// Kind of engine request a reconcile issued
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    /// Stack did not exist
    Create,
    /// Stack existed in a completed state
    Update,
    /// Resource is being deleted
    Delete,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// What the engine said to a create or update request
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Request accepted
    Submitted {
        /// Identifier of the stack the request applies to
        stack_id: String,
    },
    /// Update accepted as a no-op because nothing changed
    NoChanges,
    /// Request refused (invalid template, missing capability, ...)
    Rejected {
        /// Engine explanation
        message: String,
    },
}

/// Result of the create-or-update step
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Request kind that was issued
    pub operation: Operation,
    /// Engine answer
    pub request: RequestOutcome,
    /// Statuses that end the poll for the issued request
    pub terminal_set: TerminalSet,
}

impl ApplyOutcome {
    /// Terminal set to poll with
    ///
    /// When our request did not start an operation, wait for whatever the
    /// stack is doing to settle instead of the request's own outcomes.
    pub fn poll_set(&self) -> TerminalSet {
        match self.request {
            RequestOutcome::Submitted { .. } => self.terminal_set,
            RequestOutcome::NoChanges | RequestOutcome::Rejected { .. } => TerminalSet::Settled,
        }
    }

    /// Rejection message, if the request was refused
    pub fn rejection(&self) -> Option<&str> {
        match &self.request {
            RequestOutcome::Rejected { message } => Some(message),
            _ => None,
        }
    }
}

/// Result of the delete step
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// Stack absent or already deleted; no delete was issued
    AlreadyDeleted,
    /// Delete issued
    Requested {
        /// Statuses that end the poll
        terminal_set: TerminalSet,
    },
    /// Delete refused by the engine
    Rejected {
        /// Engine explanation
        message: String,
    },
}

/// Create/update/delete decision logic
#[derive(Clone, Debug, Default)]
pub struct StackLifecycle {
    default_tags: Vec<Tag>,
    capabilities: Option<Vec<String>>,
}

fn rejection_message(err: &Error) -> String {
    match err {
        Error::Provider { message, .. } => message.clone(),
        other => other.to_string(),
    }
}

impl StackLifecycle {
    /// Create a lifecycle engine with static defaults
    pub fn new(default_tags: Vec<Tag>, capabilities: Option<Vec<String>>) -> Self {
        Self {
            default_tags,
            capabilities,
        }
    }

    /// Create a lifecycle engine from operator configuration
    pub fn from_config(config: &OperatorConfig) -> Self {
        Self::new(config.default_tags.clone(), config.capabilities.clone())
    }

    /// Build the effective request for a stack
    pub fn build_request(&self, name: &str, spec: &StackSpec) -> Result<StackRequest> {
        spec.validate(name)?;

        let template = match (&spec.template, &spec.template_url) {
            (Some(body), _) if !body.trim().is_empty() => TemplateSource::Body(body.clone()),
            (_, Some(url)) => TemplateSource::Url(url.trim().to_string()),
            _ => return Err(Error::validation_for(name, "no template source")),
        };

        Ok(StackRequest {
            name: name.to_string(),
            role_arn: spec
                .custom_role_arn
                .as_deref()
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(str::to_string),
            template,
            parameters: map_parameters(spec.parameters.as_ref()),
            tags: merge_tags(&self.default_tags, spec.tags.as_ref()),
            capabilities: self.capabilities.clone(),
        })
    }

    /// Whether a stack with exactly `name` exists in a completed state
    pub async fn is_exist(
        &self,
        provider: &dyn StackProvider,
        name: &str,
        scope: &CallScope,
    ) -> Result<bool> {
        let summaries = scope
            .run("list_stacks", provider.list_stacks(&StackStatusCode::EXISTS))
            .await?;
        Ok(summaries
            .iter()
            .any(|s| s.name == name && StackStatusCode::EXISTS.contains(&s.status)))
    }

    /// Whether a stack with exactly `name` is present and not yet deleted
    ///
    /// Deleted stacks stay listed for a while. A name that was deleted and
    /// recreated has several summaries, so any live one makes it deletable.
    pub async fn is_deletable(
        &self,
        provider: &dyn StackProvider,
        name: &str,
        scope: &CallScope,
    ) -> Result<bool> {
        let summaries = scope.run("list_stacks", provider.list_stacks(&[])).await?;
        Ok(summaries
            .iter()
            .any(|s| s.name == name && s.status != StackStatusCode::DeleteComplete))
    }

    /// Issue a create or update for the stack
    ///
    /// Engine rejections are returned as [`RequestOutcome::Rejected`], not as
    /// errors: a previous operation on the same name may still settle into a
    /// state worth reporting. Interruptions and listing failures are errors.
    pub async fn reconcile_create_or_update(
        &self,
        name: &str,
        spec: &StackSpec,
        provider: &dyn StackProvider,
        scope: &CallScope,
    ) -> Result<ApplyOutcome> {
        let request = self.build_request(name, spec)?;

        let (operation, terminal_set, result) = if self.is_exist(provider, name, scope).await? {
            info!(stack = %name, "updating stack");
            let result = scope
                .run("update_stack", provider.update_stack(&request))
                .await
                .map(|id| match id {
                    Some(stack_id) => RequestOutcome::Submitted { stack_id },
                    None => RequestOutcome::NoChanges,
                });
            (Operation::Update, TerminalSet::Update, result)
        } else {
            info!(stack = %name, "creating stack");
            let result = scope
                .run("create_stack", provider.create_stack(&request))
                .await
                .map(|stack_id| RequestOutcome::Submitted { stack_id });
            (Operation::Create, TerminalSet::Create, result)
        };

        let request = match result {
            Ok(outcome) => outcome,
            Err(e) if e.is_interruption() => return Err(e),
            Err(e) => {
                warn!(stack = %name, operation = %operation, error = %e, "engine rejected request");
                RequestOutcome::Rejected {
                    message: rejection_message(&e),
                }
            }
        };

        Ok(ApplyOutcome {
            operation,
            request,
            terminal_set,
        })
    }

    /// Issue a delete unless the stack is already gone
    pub async fn reconcile_delete(
        &self,
        name: &str,
        provider: &dyn StackProvider,
        scope: &CallScope,
    ) -> Result<DeleteOutcome> {
        if !self.is_deletable(provider, name, scope).await? {
            info!(stack = %name, "stack absent or already deleted, skipping delete");
            return Ok(DeleteOutcome::AlreadyDeleted);
        }

        info!(stack = %name, "deleting stack");
        match scope.run("delete_stack", provider.delete_stack(name)).await {
            Ok(()) => Ok(DeleteOutcome::Requested {
                terminal_set: TerminalSet::Delete,
            }),
            Err(e) if e.is_interruption() => Err(e),
            Err(e) => {
                warn!(stack = %name, error = %e, "engine rejected delete");
                Ok(DeleteOutcome::Rejected {
                    message: rejection_message(&e),
                })
            }
        }
    }
}
