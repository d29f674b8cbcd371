//! Stack Operator - converges Stack resources onto AWS CloudFormation

use std::sync::Arc;

use clap::Parser;
use futures::StreamExt;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};
use tokio_util::sync::CancellationToken;

use stack_operator::config::{OperatorArgs, OperatorConfig};
use stack_operator::controller::{error_policy, reconcile, watch_deletions, Context};
use stack_operator::crd::Stack;
use stack_operator::health::serve_health;
use stack_operator::telemetry::{init_telemetry, TelemetryConfig};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Stack Operator - provisions CloudFormation stacks from Stack resources
#[derive(Parser, Debug)]
#[command(name = "stack-operator", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Emit JSON log lines
    #[arg(long, env = "LOG_JSON", default_value_t = false)]
    log_json: bool,

    #[command(flatten)]
    operator: OperatorArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&Stack::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_telemetry(&TelemetryConfig {
        json: cli.log_json,
        ..Default::default()
    })?;

    let config = OperatorConfig::try_from(&cli.operator)?;
    run_controller(config, cli.operator.health_port).await
}

/// Run the Stack controller until a termination signal arrives
async fn run_controller(config: OperatorConfig, health_port: u16) -> anyhow::Result<()> {
    tracing::info!(
        region = %config.target.region,
        assume_role = config.target.assume_role_arn.is_some(),
        poll_interval = ?config.poll_interval,
        reconcile_timeout = ?config.reconcile_timeout,
        "Starting Stack controller"
    );

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let shutdown = CancellationToken::new();
    let ctx = Arc::new(Context::builder(client.clone(), config, shutdown.clone()).build());
    let stacks: Api<Stack> = Api::all(client);

    tokio::spawn(cancel_on_signal(shutdown.clone()));

    let health = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = serve_health(health_port, shutdown).await {
                tracing::error!(error = %e, "health endpoint failed");
            }
        }
    });

    let deletions = tokio::spawn(watch_deletions(
        stacks.clone(),
        ctx.registry.clone(),
        shutdown.clone(),
    ));

    Controller::new(stacks, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx.clone())
        .for_each(log_reconcile_result("Stack"))
        .await;

    ctx.registry.cancel_all();
    let _ = tokio::join!(health, deletions);

    tracing::info!("Stack controller stopped");
    Ok(())
}

/// Cancel every in-flight reconcile on SIGINT or SIGTERM
///
/// The controller drains running reconciles on shutdown; cancelling them
/// stops their completion polls instead of waiting out the deadline.
async fn cancel_on_signal(shutdown: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for SIGTERM");
                let _ = ctrl_c.await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }

    tracing::info!("termination signal received, cancelling in-flight reconciles");
    shutdown.cancel();
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
