//! Stack controller implementation
//!
//! Adapts the kube-runtime `Controller` to the [`StackReconciler`]: manages
//! the cleanup finalizer, turns each watched object into a
//! [`ReconcileRequest`], and applies the returned [`ReconcileOutcome`] as a
//! status patch, finalizer removal and requeue [`Action`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use super::engine::{ReconcileOutcome, ReconcileRequest, StackEngine, StackReconciler};
use super::registry::{InFlightRegistry, ReconcileKind};
use crate::config::OperatorConfig;
use crate::credentials::{AwsCredentialProvider, CredentialProvider};
use crate::crd::{Stack, StackStatus};
use crate::scope::CallScope;
use crate::{Error, FIELD_MANAGER, STACK_FINALIZER};

/// Trait abstracting Kubernetes client operations for Stack resources
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Patch the status of a Stack
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &StackStatus,
    ) -> Result<(), Error>;

    /// Add a finalizer to a Stack if it is not already present
    async fn add_finalizer(&self, namespace: &str, name: &str, finalizer: &str)
        -> Result<(), Error>;

    /// Remove a finalizer from a Stack
    async fn remove_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<Stack> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &StackStatus,
    ) -> Result<(), Error> {
        let status_patch = serde_json::json!({ "status": status });
        self.api(namespace)
            .patch_status(
                name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&status_patch),
            )
            .await?;
        Ok(())
    }

    async fn add_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<(), Error> {
        let api = self.api(namespace);
        let stack = api.get(name).await?;
        let mut finalizers = stack.metadata.finalizers.unwrap_or_default();
        if finalizers.iter().any(|f| f == finalizer) {
            return Ok(());
        }
        finalizers.push(finalizer.to_string());

        let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn remove_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<(), Error> {
        let api = self.api(namespace);
        let stack = match api.get_opt(name).await? {
            Some(stack) => stack,
            None => return Ok(()),
        };
        let finalizers: Vec<String> = stack
            .metadata
            .finalizers
            .unwrap_or_default()
            .into_iter()
            .filter(|f| f != finalizer)
            .collect();

        let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Controller context shared across reconciles
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```ignore
/// let ctx = Context::builder(client, config, shutdown).build();
/// ```
pub struct Context {
    /// Kubernetes client (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Stack reconcile engine
    pub reconciler: Arc<dyn StackReconciler>,
    /// Running reconciles
    pub registry: Arc<InFlightRegistry>,
    /// Deadline for one reconcile
    pub reconcile_timeout: Duration,
    /// Requeue delay after success
    pub resync_interval: Duration,
    /// Requeue delay after failure
    pub error_requeue: Duration,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(
        client: Client,
        config: OperatorConfig,
        shutdown: CancellationToken,
    ) -> ContextBuilder {
        ContextBuilder::new(client, config, shutdown)
    }

    /// Create a context for testing with custom mocks
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn KubeClient>,
        reconciler: Arc<dyn StackReconciler>,
        config: &OperatorConfig,
    ) -> Self {
        Self {
            kube,
            reconciler,
            registry: Arc::new(InFlightRegistry::new(CancellationToken::new())),
            reconcile_timeout: config.reconcile_timeout,
            resync_interval: config.resync_interval,
            error_requeue: config.error_requeue,
        }
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    config: OperatorConfig,
    shutdown: CancellationToken,
    kube: Option<Arc<dyn KubeClient>>,
    credentials: Option<Arc<dyn CredentialProvider>>,
    reconciler: Option<Arc<dyn StackReconciler>>,
}

impl ContextBuilder {
    fn new(client: Client, config: OperatorConfig, shutdown: CancellationToken) -> Self {
        Self {
            client,
            config,
            shutdown,
            kube: None,
            credentials: None,
            reconciler: None,
        }
    }

    /// Override the Kubernetes client (primarily for testing)
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the credential provider used by the default engine
    pub fn credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Override the reconcile engine
    pub fn reconciler(mut self, reconciler: Arc<dyn StackReconciler>) -> Self {
        self.reconciler = Some(reconciler);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        let credentials = self
            .credentials
            .unwrap_or_else(|| Arc::new(AwsCredentialProvider::new()));
        let reconciler = self
            .reconciler
            .unwrap_or_else(|| Arc::new(StackEngine::new(self.config.clone(), credentials)));

        Context {
            kube: self
                .kube
                .unwrap_or_else(|| Arc::new(KubeClientImpl::new(self.client.clone()))),
            reconciler,
            registry: Arc::new(InFlightRegistry::new(self.shutdown)),
            reconcile_timeout: self.config.reconcile_timeout,
            resync_interval: self.config.resync_interval,
            error_requeue: self.config.error_requeue,
        }
    }
}

fn has_finalizer(stack: &Stack) -> bool {
    stack
        .metadata
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|s| s == STACK_FINALIZER))
}

/// Requeue action for an outcome
pub fn requeue_action(outcome: &ReconcileOutcome, ctx: &Context) -> Action {
    match outcome {
        ReconcileOutcome::NoOp | ReconcileOutcome::PersistStatus(_) => {
            Action::requeue(ctx.resync_interval)
        }
        ReconcileOutcome::PersistStatusAndRequeue(_)
        | ReconcileOutcome::KeepFinalizerRequeueError(_) => Action::requeue(ctx.error_requeue),
        ReconcileOutcome::RemoveFinalizer(_) => Action::await_change(),
    }
}

/// Reconcile a Stack resource
#[instrument(skip(stack, ctx), fields(stack = %stack.name_any(), namespace = %stack.namespace().unwrap_or_default()))]
pub async fn reconcile(stack: Arc<Stack>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = stack.name_any();
    let namespace = stack
        .namespace()
        .ok_or_else(|| Error::validation_for(&name, "Stack has no namespace"))?;
    let deleting = stack.metadata.deletion_timestamp.is_some();

    if !has_finalizer(&stack) {
        if deleting {
            debug!("deleting without our finalizer, nothing to clean up");
            return Ok(Action::await_change());
        }
        info!("adding cleanup finalizer");
        ctx.kube
            .add_finalizer(&namespace, &name, STACK_FINALIZER)
            .await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    let request = ReconcileRequest {
        name: name.clone(),
        namespace: namespace.clone(),
        spec: stack.spec.clone(),
        previous_status: stack.status.clone(),
        deletion_requested: deleting,
    };

    let kind = if deleting {
        ReconcileKind::Delete
    } else {
        ReconcileKind::Apply
    };
    let outcome = {
        let guard = ctx
            .registry
            .register(InFlightRegistry::key(&namespace, &name), kind);
        let scope = CallScope::new(guard.token(), ctx.reconcile_timeout);
        ctx.reconciler.reconcile(&request, &scope).await
    };

    if let Some(status) = outcome.status() {
        if stack.status.as_ref() == Some(status) {
            debug!("Status unchanged, skipping update");
        } else {
            info!(state = ?status.state, "updating stack status");
            ctx.kube.patch_status(&namespace, &name, status).await?;
        }
    }

    if let ReconcileOutcome::RemoveFinalizer(_) = outcome {
        info!("external stack cleaned up, removing finalizer");
        ctx.kube
            .remove_finalizer(&namespace, &name, STACK_FINALIZER)
            .await?;
    }

    Ok(requeue_action(&outcome, &ctx))
}

/// Error policy for the controller
pub fn error_policy(stack: Arc<Stack>, error: &Error, ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        stack = %stack.name_any(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );
    Action::requeue(ctx.error_requeue)
}

/// Cancel in-flight create/update reconciles of Stacks being deleted
///
/// The controller serializes reconciles per object, so the deletion event
/// would otherwise wait for the running poll to finish. Runs until `shutdown`.
pub async fn watch_deletions(
    api: Api<Stack>,
    registry: Arc<InFlightRegistry>,
    shutdown: CancellationToken,
) {
    let stream = watcher(api, watcher::Config::default())
        .default_backoff()
        .applied_objects();
    tokio::pin!(stream);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("deletion watcher stopped");
                return;
            }
            event = stream.next() => match event {
                Some(Ok(stack)) => {
                    if stack.metadata.deletion_timestamp.is_none() {
                        continue;
                    }
                    let namespace = stack.namespace().unwrap_or_default();
                    let key = InFlightRegistry::key(&namespace, &stack.name_any());
                    registry.cancel_apply(&key);
                }
                Some(Err(e)) => warn!(error = %e, "deletion watch error"),
                None => {
                    warn!("deletion watch stream ended");
                    return;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

    use crate::crd::{StackSpec, StackState};

    struct FixedReconciler {
        outcome: ReconcileOutcome,
        seen: Mutex<Vec<ReconcileRequest>>,
    }

    impl FixedReconciler {
        fn new(outcome: ReconcileOutcome) -> Arc<Self> {
            Arc::new(Self {
                outcome,
                seen: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.seen.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl StackReconciler for FixedReconciler {
        async fn create_or_update(
            &self,
            request: &ReconcileRequest,
            _scope: &CallScope,
        ) -> ReconcileOutcome {
            self.seen.lock().unwrap().push(request.clone());
            self.outcome.clone()
        }

        async fn delete(&self, request: &ReconcileRequest, _scope: &CallScope) -> ReconcileOutcome {
            self.seen.lock().unwrap().push(request.clone());
            self.outcome.clone()
        }
    }

    /// Captured status updates for verification
    #[derive(Clone, Default)]
    struct StatusCapture {
        updates: Arc<Mutex<Vec<StackStatus>>>,
    }

    impl StatusCapture {
        fn record(&self, status: StackStatus) {
            self.updates.lock().unwrap().push(status);
        }

        fn last_state(&self) -> Option<StackState> {
            self.updates.lock().unwrap().last().and_then(|s| s.state)
        }

        fn was_updated(&self) -> bool {
            !self.updates.lock().unwrap().is_empty()
        }
    }

    fn sample_stack(finalized: bool, deleting: bool, status: Option<StackStatus>) -> Arc<Stack> {
        Arc::new(Stack {
            metadata: ObjectMeta {
                name: Some("vpc".to_string()),
                namespace: Some("infra".to_string()),
                finalizers: finalized.then(|| vec![STACK_FINALIZER.to_string()]),
                deletion_timestamp: deleting.then(|| Time(Default::default())),
                ..Default::default()
            },
            spec: StackSpec {
                template: Some("T".to_string()),
                ..Default::default()
            },
            status,
        })
    }

    fn created() -> StackStatus {
        StackStatus {
            stack_id: Some("id-1".to_string()),
            outputs: None,
            state: Some(StackState::Created),
            message: None,
        }
    }

    fn context(
        kube: MockKubeClient,
        reconciler: Arc<dyn StackReconciler>,
    ) -> (Arc<Context>, OperatorConfig) {
        let config = OperatorConfig::default();
        (
            Arc::new(Context::for_testing(Arc::new(kube), reconciler, &config)),
            config,
        )
    }

    fn capturing_kube(capture: &StatusCapture) -> MockKubeClient {
        let capture = capture.clone();
        let mut kube = MockKubeClient::new();
        kube.expect_patch_status().returning(move |_, _, status| {
            capture.record(status.clone());
            Ok(())
        });
        kube
    }

    // =========================================================================
    // Finalizer Stories
    // =========================================================================

    /// Story: a new Stack first gets the cleanup finalizer, before any
    /// engine work happens
    #[tokio::test]
    async fn story_finalizer_added_before_reconcile() {
        let mut kube = MockKubeClient::new();
        kube.expect_add_finalizer().times(1).returning(|ns, name, f| {
            assert_eq!((ns, name, f), ("infra", "vpc", STACK_FINALIZER));
            Ok(())
        });
        let reconciler = FixedReconciler::new(ReconcileOutcome::NoOp);
        let (ctx, _) = context(kube, reconciler.clone());

        let action = reconcile(sample_stack(false, false, None), ctx).await.unwrap();

        assert_eq!(action, Action::requeue(Duration::from_secs(1)));
        assert_eq!(reconciler.calls(), 0);
    }

    /// Story: a Stack deleted before we ever finalized it is left alone
    #[tokio::test]
    async fn story_foreign_deletion_is_ignored() {
        let kube = MockKubeClient::new();
        let reconciler = FixedReconciler::new(ReconcileOutcome::NoOp);
        let (ctx, _) = context(kube, reconciler.clone());

        let action = reconcile(sample_stack(false, true, None), ctx).await.unwrap();

        assert_eq!(action, Action::await_change());
        assert_eq!(reconciler.calls(), 0);
    }

    /// Story: once the external stack is gone the finalizer is removed,
    /// after the DELETED status is written
    #[tokio::test]
    async fn story_cleanup_removes_finalizer() {
        let capture = StatusCapture::default();
        let mut kube = capturing_kube(&capture);
        kube.expect_remove_finalizer()
            .times(1)
            .returning(|_, _, _| Ok(()));
        let deleted = StackStatus {
            state: Some(StackState::Deleted),
            ..created()
        };
        let reconciler = FixedReconciler::new(ReconcileOutcome::RemoveFinalizer(Some(deleted)));
        let (ctx, _) = context(kube, reconciler.clone());

        let action = reconcile(sample_stack(true, true, Some(created())), ctx)
            .await
            .unwrap();

        assert_eq!(action, Action::await_change());
        assert_eq!(capture.last_state(), Some(StackState::Deleted));
        assert!(reconciler.seen.lock().unwrap()[0].deletion_requested);
    }

    #[tokio::test]
    async fn retained_finalizer_requeues_on_error_interval() {
        let capture = StatusCapture::default();
        let mut kube = capturing_kube(&capture);
        kube.expect_remove_finalizer().never();
        let reconciler = FixedReconciler::new(ReconcileOutcome::KeepFinalizerRequeueError(
            StackStatus::error_from(Some(&created()), "AccessDenied"),
        ));
        let (ctx, config) = context(kube, reconciler);

        let action = reconcile(sample_stack(true, true, Some(created())), ctx)
            .await
            .unwrap();

        assert_eq!(action, Action::requeue(config.error_requeue));
        assert_eq!(capture.last_state(), Some(StackState::Error));
    }

    // =========================================================================
    // Status Write Stories
    // =========================================================================

    /// Story: a status identical to the stored one is not patched
    #[tokio::test]
    async fn story_identical_status_is_not_patched() {
        let mut kube = MockKubeClient::new();
        kube.expect_patch_status().never();
        let reconciler = FixedReconciler::new(ReconcileOutcome::PersistStatus(created()));
        let (ctx, config) = context(kube, reconciler);

        let action = reconcile(sample_stack(true, false, Some(created())), ctx)
            .await
            .unwrap();

        assert_eq!(action, Action::requeue(config.resync_interval));
    }

    #[tokio::test]
    async fn new_status_is_patched_and_resynced() {
        let capture = StatusCapture::default();
        let kube = capturing_kube(&capture);
        let reconciler = FixedReconciler::new(ReconcileOutcome::PersistStatus(created()));
        let (ctx, config) = context(kube, reconciler);

        let action = reconcile(sample_stack(true, false, None), ctx).await.unwrap();

        assert!(capture.was_updated());
        assert_eq!(action, Action::requeue(config.resync_interval));
    }

    #[tokio::test]
    async fn error_status_requeues_on_error_interval() {
        let capture = StatusCapture::default();
        let kube = capturing_kube(&capture);
        let reconciler = FixedReconciler::new(ReconcileOutcome::PersistStatusAndRequeue(
            StackStatus::error_from(None, "Template format error"),
        ));
        let (ctx, config) = context(kube, reconciler);

        let action = reconcile(sample_stack(true, false, None), ctx).await.unwrap();

        assert_eq!(capture.last_state(), Some(StackState::Error));
        assert_eq!(action, Action::requeue(config.error_requeue));
    }

    #[tokio::test]
    async fn no_op_writes_nothing() {
        let mut kube = MockKubeClient::new();
        kube.expect_patch_status().never();
        let (ctx, config) = context(kube, FixedReconciler::new(ReconcileOutcome::NoOp));

        let action = reconcile(sample_stack(true, false, Some(created())), ctx)
            .await
            .unwrap();
        assert_eq!(action, Action::requeue(config.resync_interval));
    }

    #[test]
    fn error_policy_uses_error_interval() {
        let (ctx, config) = context(
            MockKubeClient::new(),
            FixedReconciler::new(ReconcileOutcome::NoOp),
        );
        let action = error_policy(
            sample_stack(true, false, None),
            &Error::validation("bad"),
            ctx,
        );
        assert_eq!(action, Action::requeue(config.error_requeue));
    }
}
