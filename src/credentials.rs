//! Credential acquisition for the provisioning engine
//!
//! Every reconcile acquires a fresh client. With an assume-role ARN configured
//! the role is exchanged for short-lived session credentials; otherwise the
//! ambient workload identity of the pod is used. Nothing is cached.

use std::sync::Arc;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_credential_types::provider::ProvideCredentials;
use aws_sdk_sts::error::DisplayErrorContext;
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use crate::config::ProvisioningTarget;
use crate::provider::{AwsStackProvider, StackProvider};
use crate::{Error, Result};

/// Session name used for every role assumption
pub const ROLE_SESSION_NAME: &str = "awsCFSession";

/// Provider name recorded on credentials built from an assumed role
const ASSUMED_ROLE_PROVIDER: &str = "stack-operator-assume-role";

/// Short-lived credentials from a role assumption
#[derive(Clone)]
pub struct SessionCredentials {
    /// Access key ID
    pub access_key_id: String,
    /// Secret access key
    pub secret_access_key: String,
    /// Session token
    pub session_token: String,
}

impl std::fmt::Debug for SessionCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &"<redacted>")
            .finish()
    }
}

impl SessionCredentials {
    fn from_sts(role_arn: &str, creds: &aws_sdk_sts::types::Credentials) -> Result<Self> {
        let missing = |field: &str| {
            Error::credential_for_role(role_arn, format!("assume-role response missing {field}"))
        };
        Ok(Self {
            access_key_id: Option::<&str>::from(creds.access_key_id())
                .ok_or_else(|| missing("access key"))?
                .to_string(),
            secret_access_key: Option::<&str>::from(creds.secret_access_key())
                .ok_or_else(|| missing("secret key"))?
                .to_string(),
            session_token: Option::<&str>::from(creds.session_token())
                .ok_or_else(|| missing("session token"))?
                .to_string(),
        })
    }

    fn into_sdk(self) -> aws_credential_types::Credentials {
        aws_credential_types::Credentials::new(
            self.access_key_id,
            self.secret_access_key,
            Some(self.session_token),
            None,
            ASSUMED_ROLE_PROVIDER,
        )
    }
}

/// Obtains an authorized provisioning client for one reconcile
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Build a client for `target`, assuming its role if one is set
    async fn acquire_client(&self, target: &ProvisioningTarget) -> Result<Arc<dyn StackProvider>>;
}

/// Credential provider backed by STS and the default AWS credential chain
#[derive(Clone, Debug, Default)]
pub struct AwsCredentialProvider;

impl AwsCredentialProvider {
    /// Create a credential provider
    pub fn new() -> Self {
        Self
    }

    async fn assume_role(
        &self,
        base: &aws_config::SdkConfig,
        role_arn: &str,
    ) -> Result<SessionCredentials> {
        let sts = aws_sdk_sts::Client::new(base);
        let out = sts
            .assume_role()
            .role_arn(role_arn)
            .role_session_name(ROLE_SESSION_NAME)
            .send()
            .await
            .map_err(|e| Error::credential_for_role(role_arn, DisplayErrorContext(&e).to_string()))?;

        let creds = out.credentials().ok_or_else(|| {
            Error::credential_for_role(role_arn, "assume-role response carried no credentials")
        })?;
        SessionCredentials::from_sts(role_arn, creds)
    }
}

#[async_trait]
impl CredentialProvider for AwsCredentialProvider {
    async fn acquire_client(&self, target: &ProvisioningTarget) -> Result<Arc<dyn StackProvider>> {
        let region = Region::new(target.region.clone());
        let base = aws_config::defaults(BehaviorVersion::latest())
            .region(region.clone())
            .load()
            .await;

        let config = match &target.assume_role_arn {
            Some(role_arn) => {
                let session = self.assume_role(&base, role_arn).await?;
                debug!(role = %role_arn, "assumed role for stack operations");
                aws_sdk_cloudformation::Config::builder()
                    .behavior_version(BehaviorVersion::latest())
                    .region(region)
                    .credentials_provider(session.into_sdk())
                    .build()
            }
            None => {
                // Resolve ambient credentials now so an expired identity fails
                // here instead of on the first engine call
                let provider = base
                    .credentials_provider()
                    .ok_or_else(|| Error::credential("no ambient credential provider available"))?;
                provider
                    .provide_credentials()
                    .await
                    .map_err(|e| Error::credential(e.to_string()))?;
                aws_sdk_cloudformation::config::Builder::from(&base).build()
            }
        };

        Ok(Arc::new(AwsStackProvider::new(
            aws_sdk_cloudformation::Client::from_conf(config),
        )))
    }
}
