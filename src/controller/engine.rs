//! Reconcile engine
//!
//! Composes credential acquisition, the lifecycle decision, the completion
//! poll and status suppression into one outcome per reconcile. The engine
//! never talks to Kubernetes: it reads a [`ReconcileRequest`] and returns a
//! [`ReconcileOutcome`] for the runtime adapter to apply.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::config::OperatorConfig;
use crate::credentials::CredentialProvider;
use crate::crd::{StackSpec, StackState, StackStatus};
use crate::lifecycle::{DeleteOutcome, Operation, StackLifecycle};
use crate::poller::{CompletionPoller, PollOutcome};
use crate::provider::StackProvider;
use crate::scope::CallScope;
use crate::status::{observed_status, reconcile_status, StatusDecision};
use crate::{Error, Result};

/// Input of one reconcile
#[derive(Clone, Debug)]
pub struct ReconcileRequest {
    /// Resource name, also the stack name
    pub name: String,
    /// Resource namespace
    pub namespace: String,
    /// Desired spec
    pub spec: StackSpec,
    /// Last written status
    pub previous_status: Option<StackStatus>,
    /// Whether the resource is being deleted
    pub deletion_requested: bool,
}

/// What the runtime should do after a reconcile
#[derive(Clone, Debug, PartialEq)]
pub enum ReconcileOutcome {
    /// Nothing to write
    NoOp,
    /// Write the status
    PersistStatus(StackStatus),
    /// Write the status and retry soon
    PersistStatusAndRequeue(StackStatus),
    /// External stack is gone; write the status if any and release the resource
    RemoveFinalizer(Option<StackStatus>),
    /// Deletion failed; write the status, keep the finalizer and retry
    KeepFinalizerRequeueError(StackStatus),
}

impl ReconcileOutcome {
    /// Status this outcome writes, if any
    pub fn status(&self) -> Option<&StackStatus> {
        match self {
            Self::NoOp => None,
            Self::PersistStatus(s)
            | Self::PersistStatusAndRequeue(s)
            | Self::KeepFinalizerRequeueError(s) => Some(s),
            Self::RemoveFinalizer(s) => s.as_ref(),
        }
    }
}

/// Create-or-update and delete entry points
#[async_trait]
pub trait StackReconciler: Send + Sync {
    /// Converge the external stack onto the spec
    async fn create_or_update(&self, request: &ReconcileRequest, scope: &CallScope)
        -> ReconcileOutcome;

    /// Remove the external stack
    async fn delete(&self, request: &ReconcileRequest, scope: &CallScope) -> ReconcileOutcome;

    /// Dispatch on the deletion flag
    async fn reconcile(&self, request: &ReconcileRequest, scope: &CallScope) -> ReconcileOutcome {
        if request.deletion_requested {
            self.delete(request, scope).await
        } else {
            self.create_or_update(request, scope).await
        }
    }
}

/// Production reconciler
pub struct StackEngine {
    config: OperatorConfig,
    credentials: Arc<dyn CredentialProvider>,
    lifecycle: StackLifecycle,
    poller: CompletionPoller,
}

impl StackEngine {
    /// Create an engine from configuration and a credential provider
    pub fn new(config: OperatorConfig, credentials: Arc<dyn CredentialProvider>) -> Self {
        Self {
            lifecycle: StackLifecycle::from_config(&config),
            poller: CompletionPoller::new(config.poll_interval),
            config,
            credentials,
        }
    }

    /// Configuration this engine was built with
    pub fn config(&self) -> &OperatorConfig {
        &self.config
    }

    async fn acquire(&self, scope: &CallScope) -> Result<Arc<dyn StackProvider>> {
        scope
            .run(
                "acquire_client",
                self.credentials.acquire_client(&self.config.target),
            )
            .await
    }

    async fn try_apply(
        &self,
        request: &ReconcileRequest,
        scope: &CallScope,
    ) -> Result<ReconcileOutcome> {
        // Validate before credentials so a broken spec costs no STS call
        request.spec.validate(&request.name)?;

        let provider = self.acquire(scope).await?;
        let applied = self
            .lifecycle
            .reconcile_create_or_update(&request.name, &request.spec, provider.as_ref(), scope)
            .await?;

        let polled = self
            .poller
            .wait_for_terminal(provider.as_ref(), &request.name, applied.poll_set(), scope)
            .await?;

        let previous = request.previous_status.as_ref();
        let observed = observed_status(previous, &polled, applied.operation, applied.rejection());

        let decision = reconcile_status(previous, &polled, applied.operation, applied.rejection());

        Ok(match decision {
            // An ERROR stack is retried on the error interval even when the
            // stored status already says so
            StatusDecision::Skip if observed.state == Some(StackState::Error) => {
                ReconcileOutcome::PersistStatusAndRequeue(previous.cloned().unwrap_or(observed))
            }
            StatusDecision::Skip => ReconcileOutcome::NoOp,
            StatusDecision::Persist(status) if status.state == Some(StackState::Error) => {
                ReconcileOutcome::PersistStatusAndRequeue(status)
            }
            StatusDecision::Persist(status) => ReconcileOutcome::PersistStatus(status),
        })
    }

    async fn try_delete(
        &self,
        request: &ReconcileRequest,
        scope: &CallScope,
    ) -> Result<ReconcileOutcome> {
        let provider = self.acquire(scope).await?;
        let previous = request.previous_status.as_ref();

        // Nothing was deleted yet, so a failed lookup never releases the resource
        let deleted = match self
            .lifecycle
            .reconcile_delete(&request.name, provider.as_ref(), scope)
            .await
        {
            Ok(deleted) => deleted,
            Err(e @ Error::Cancelled { .. }) => return Err(e),
            Err(e) => {
                warn!(stack = %request.name, error = %e, "delete precondition failed");
                return Ok(ReconcileOutcome::KeepFinalizerRequeueError(
                    StackStatus::error_from(previous, e.to_string()),
                ));
            }
        };

        let polled = match deleted {
            DeleteOutcome::AlreadyDeleted => PollOutcome::Absent,
            DeleteOutcome::Rejected { message } => {
                return Ok(self.delete_failed(previous, message));
            }
            DeleteOutcome::Requested { terminal_set } => {
                self.poller
                    .wait_for_terminal(provider.as_ref(), &request.name, terminal_set, scope)
                    .await?
            }
        };

        // The finalizer follows the observed state; the decision only gates the write
        let observed = observed_status(previous, &polled, Operation::Delete, None);
        if observed.state == Some(StackState::Error) {
            let message = observed
                .message
                .unwrap_or_else(|| "stack deletion failed".to_string());
            return Ok(self.delete_failed(previous, message));
        }

        match reconcile_status(previous, &polled, Operation::Delete, None) {
            StatusDecision::Persist(status) => Ok(ReconcileOutcome::RemoveFinalizer(Some(status))),
            StatusDecision::Skip => Ok(ReconcileOutcome::RemoveFinalizer(None)),
        }
    }

    /// Apply the delete error policy
    fn delete_failed(&self, previous: Option<&StackStatus>, message: String) -> ReconcileOutcome {
        let status = StackStatus::error_from(previous, message);
        if self.config.retain_finalizer_on_delete_error {
            ReconcileOutcome::KeepFinalizerRequeueError(status)
        } else {
            ReconcileOutcome::RemoveFinalizer(Some(status))
        }
    }
}

#[async_trait]
impl StackReconciler for StackEngine {
    async fn create_or_update(
        &self,
        request: &ReconcileRequest,
        scope: &CallScope,
    ) -> ReconcileOutcome {
        match self.try_apply(request, scope).await {
            Ok(outcome) => outcome,
            Err(Error::Cancelled { operation }) => {
                info!(stack = %request.name, %operation, "reconcile cancelled");
                ReconcileOutcome::NoOp
            }
            Err(e) => {
                warn!(stack = %request.name, error = %e, "create or update failed");
                ReconcileOutcome::PersistStatusAndRequeue(StackStatus::error_from(
                    request.previous_status.as_ref(),
                    e.to_string(),
                ))
            }
        }
    }

    async fn delete(&self, request: &ReconcileRequest, scope: &CallScope) -> ReconcileOutcome {
        match self.try_delete(request, scope).await {
            Ok(outcome) => outcome,
            Err(Error::Cancelled { operation }) => {
                info!(stack = %request.name, %operation, "delete cancelled, finalizer kept");
                ReconcileOutcome::NoOp
            }
            // Without a client nothing is known about the stack, so never
            // release the resource on a credential failure
            Err(e @ Error::Credential { .. }) => {
                warn!(stack = %request.name, error = %e, "cannot acquire credentials for delete");
                ReconcileOutcome::KeepFinalizerRequeueError(StackStatus::error_from(
                    request.previous_status.as_ref(),
                    e.to_string(),
                ))
            }
            Err(e) => {
                warn!(stack = %request.name, error = %e, "delete failed");
                self.delete_failed(request.previous_status.as_ref(), e.to_string())
            }
        }
    }
}
