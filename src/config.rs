//! Operator configuration
//!
//! Settings are read once at startup from flags or environment variables and
//! frozen into an [`OperatorConfig`]. Nothing below `main` reads the
//! environment.

use std::time::Duration;

use clap::Args;

use crate::mapper::{map_capabilities, parse_default_tags};
use crate::provider::Tag;
use crate::{Error, Result};

/// Region used when none is configured
pub const DEFAULT_REGION: &str = "us-east-1";

/// Command-line and environment settings
#[derive(Args, Debug, Clone)]
pub struct OperatorArgs {
    /// AWS region stacks are provisioned in
    #[arg(long, env = "AWS_REGION", default_value = DEFAULT_REGION)]
    pub region: String,

    /// Role to assume before each reconcile; ambient credentials are used when unset
    #[arg(long, env = "ASSUME_ROLE_ARN")]
    pub assume_role_arn: Option<String>,

    /// Comma-separated capability acknowledgments sent with every request
    #[arg(long, env = "DEFAULT_CAPABILITIES")]
    pub default_capabilities: Option<String>,

    /// Tags added to every stack, as `key:value,key:value`
    #[arg(long, env = "DEFAULT_TAGS")]
    pub default_tags: Option<String>,

    /// Seconds between status checks while waiting for a stack to settle
    #[arg(
        long = "status-check-wait-time",
        env = "STATUS_CHECK_WAIT_TIME_IN_SEC",
        default_value_t = 10
    )]
    pub status_check_wait_secs: u64,

    /// Upper bound on a single reconcile, including the completion poll
    #[arg(long, env = "RECONCILE_TIMEOUT_SECS", default_value_t = 3600)]
    pub reconcile_timeout_secs: u64,

    /// Requeue delay after a successful reconcile
    #[arg(long, env = "RESYNC_INTERVAL_SECS", default_value_t = 300)]
    pub resync_interval_secs: u64,

    /// Requeue delay after a failed reconcile
    #[arg(long, env = "ERROR_REQUEUE_SECS", default_value_t = 60)]
    pub error_requeue_secs: u64,

    /// Keep the finalizer when deleting the external stack fails
    #[arg(long, env = "RETAIN_FINALIZER_ON_DELETE_ERROR")]
    pub retain_finalizer_on_delete_error: bool,

    /// Port of the health endpoint
    #[arg(long, env = "HEALTH_PORT", default_value_t = 8080)]
    pub health_port: u16,
}

/// Where and as whom stacks are provisioned
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProvisioningTarget {
    /// AWS region
    pub region: String,
    /// Role assumed for every reconcile, if any
    pub assume_role_arn: Option<String>,
}

/// Immutable operator configuration injected into the reconcile engine
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Region and credential policy
    pub target: ProvisioningTarget,
    /// Parsed default tags
    pub default_tags: Vec<Tag>,
    /// Static capability list
    pub capabilities: Option<Vec<String>>,
    /// Completion poll interval
    pub poll_interval: Duration,
    /// Deadline for one reconcile
    pub reconcile_timeout: Duration,
    /// Requeue delay after success
    pub resync_interval: Duration,
    /// Requeue delay after failure
    pub error_requeue: Duration,
    /// Keep the finalizer on delete errors instead of releasing the resource
    pub retain_finalizer_on_delete_error: bool,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            target: ProvisioningTarget {
                region: DEFAULT_REGION.to_string(),
                assume_role_arn: None,
            },
            default_tags: Vec::new(),
            capabilities: None,
            poll_interval: Duration::from_secs(10),
            reconcile_timeout: Duration::from_secs(3600),
            resync_interval: Duration::from_secs(300),
            error_requeue: Duration::from_secs(60),
            retain_finalizer_on_delete_error: false,
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn positive_secs(setting: &str, secs: u64) -> Result<Duration> {
    if secs == 0 {
        return Err(Error::config(setting, "must be greater than zero"));
    }
    Ok(Duration::from_secs(secs))
}

impl TryFrom<&OperatorArgs> for OperatorConfig {
    type Error = Error;

    fn try_from(args: &OperatorArgs) -> Result<Self> {
        let region = non_blank(Some(&args.region)).unwrap_or(DEFAULT_REGION);

        Ok(Self {
            target: ProvisioningTarget {
                region: region.to_string(),
                assume_role_arn: non_blank(args.assume_role_arn.as_deref()).map(str::to_string),
            },
            default_tags: parse_default_tags(non_blank(args.default_tags.as_deref()))?,
            capabilities: map_capabilities(non_blank(args.default_capabilities.as_deref())),
            poll_interval: positive_secs(
                "STATUS_CHECK_WAIT_TIME_IN_SEC",
                args.status_check_wait_secs,
            )?,
            reconcile_timeout: positive_secs(
                "RECONCILE_TIMEOUT_SECS",
                args.reconcile_timeout_secs,
            )?,
            resync_interval: positive_secs("RESYNC_INTERVAL_SECS", args.resync_interval_secs)?,
            error_requeue: positive_secs("ERROR_REQUEUE_SECS", args.error_requeue_secs)?,
            retain_finalizer_on_delete_error: args.retain_finalizer_on_delete_error,
        })
    }
}
