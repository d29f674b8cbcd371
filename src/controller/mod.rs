//! Stack controller
//!
//! [`engine`] decides what a reconcile does, [`stack`] applies the decision
//! to the cluster, and [`registry`] tracks running reconciles so they can be
//! cancelled.

mod engine;
mod registry;
mod stack;

pub use engine::{ReconcileOutcome, ReconcileRequest, StackEngine, StackReconciler};
pub use registry::{InFlightGuard, InFlightRegistry, ReconcileKind};
pub use stack::{
    error_policy, reconcile, requeue_action, watch_deletions, Context, ContextBuilder,
    KubeClient, KubeClientImpl,
};
