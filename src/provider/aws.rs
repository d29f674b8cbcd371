//! CloudFormation implementation of [`StackProvider`]

use async_trait::async_trait;
use aws_sdk_cloudformation::error::{DisplayErrorContext, ProvideErrorMetadata};
use aws_sdk_cloudformation::types;
use aws_sdk_cloudformation::Client;
use tracing::debug;

use super::{
    StackOutput, StackProvider, StackRecord, StackRequest, StackStatusCode, StackSummary,
    TemplateSource,
};
use crate::{Error, Result};

/// Error code CloudFormation uses for request validation failures
const VALIDATION_ERROR: &str = "ValidationError";
/// Message fragment of the no-op update rejection
const NO_UPDATES: &str = "No updates are to be performed";
/// Message fragment of a describe for an unknown stack
const DOES_NOT_EXIST: &str = "does not exist";

/// Error codes that will not succeed on retry without a spec change
const PERMANENT_CODES: &[&str] = &[
    VALIDATION_ERROR,
    "InsufficientCapabilitiesException",
    "AlreadyExistsException",
    "TokenAlreadyExistsException",
];

/// Stack provider backed by the CloudFormation API
#[derive(Clone, Debug)]
pub struct AwsStackProvider {
    client: Client,
}

impl AwsStackProvider {
    /// Wrap a CloudFormation client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// Converts an SDK error into a provider error, keeping the engine message
fn provider_error<E>(stack: &str, operation: &str, err: &E) -> Error
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    let message = err
        .message()
        .map(str::to_string)
        .unwrap_or_else(|| DisplayErrorContext(err).to_string());
    match err.code() {
        Some(code) if PERMANENT_CODES.contains(&code) => {
            Error::provider_rejected(stack, operation, message)
        }
        _ => Error::provider_for(stack, operation, message),
    }
}

fn is_validation_error_containing<E: ProvideErrorMetadata>(err: &E, fragment: &str) -> bool {
    err.code() == Some(VALIDATION_ERROR) && err.message().is_some_and(|m| m.contains(fragment))
}

fn sdk_tags(request: &StackRequest) -> Vec<types::Tag> {
    request
        .tags
        .iter()
        .map(|t| types::Tag::builder().key(&t.key).value(&t.value).build())
        .collect()
}

fn sdk_parameters(request: &StackRequest) -> Option<Vec<types::Parameter>> {
    request.parameters.as_ref().map(|params| {
        params
            .iter()
            .map(|p| {
                types::Parameter::builder()
                    .parameter_key(&p.key)
                    .parameter_value(&p.value)
                    .build()
            })
            .collect()
    })
}

fn sdk_capabilities(request: &StackRequest) -> Option<Vec<types::Capability>> {
    request
        .capabilities
        .as_ref()
        .map(|caps| caps.iter().map(|c| types::Capability::from(c.as_str())).collect())
}

fn split_template(source: &TemplateSource) -> (Option<String>, Option<String>) {
    match source {
        TemplateSource::Body(body) => (Some(body.clone()), None),
        TemplateSource::Url(url) => (None, Some(url.clone())),
    }
}

fn record_from_sdk(stack: &types::Stack) -> StackRecord {
    let status = Option::<&types::StackStatus>::from(stack.stack_status())
        .map(|s| StackStatusCode::from(s.as_str()))
        .unwrap_or_else(|| StackStatusCode::Other(String::new()));
    let outputs = stack
        .outputs()
        .iter()
        .filter_map(|o| {
            Some(StackOutput {
                key: o.output_key()?.to_string(),
                value: o.output_value().unwrap_or_default().to_string(),
            })
        })
        .collect();

    StackRecord {
        name: Option::<&str>::from(stack.stack_name())
            .unwrap_or_default()
            .to_string(),
        stack_id: stack.stack_id().map(str::to_string),
        status,
        status_reason: stack.stack_status_reason().map(str::to_string),
        outputs,
    }
}

#[async_trait]
impl StackProvider for AwsStackProvider {
    async fn create_stack(&self, request: &StackRequest) -> Result<String> {
        let (body, url) = split_template(&request.template);
        let out = self
            .client
            .create_stack()
            .stack_name(&request.name)
            .set_role_arn(request.role_arn.clone())
            .set_template_body(body)
            .set_template_url(url)
            .set_parameters(sdk_parameters(request))
            .set_tags(Some(sdk_tags(request)))
            .set_capabilities(sdk_capabilities(request))
            .send()
            .await
            .map_err(|e| provider_error(&request.name, "create_stack", &e))?;

        Ok(out.stack_id().unwrap_or_default().to_string())
    }

    async fn update_stack(&self, request: &StackRequest) -> Result<Option<String>> {
        let (body, url) = split_template(&request.template);
        let result = self
            .client
            .update_stack()
            .stack_name(&request.name)
            .set_role_arn(request.role_arn.clone())
            .set_template_body(body)
            .set_template_url(url)
            .set_parameters(sdk_parameters(request))
            .set_tags(Some(sdk_tags(request)))
            .set_capabilities(sdk_capabilities(request))
            .send()
            .await;

        match result {
            Ok(out) => Ok(Some(out.stack_id().unwrap_or_default().to_string())),
            Err(e) if is_validation_error_containing(&e, NO_UPDATES) => {
                debug!(stack = %request.name, "engine reports no updates to perform");
                Ok(None)
            }
            Err(e) => Err(provider_error(&request.name, "update_stack", &e)),
        }
    }

    async fn delete_stack(&self, name: &str) -> Result<()> {
        self.client
            .delete_stack()
            .stack_name(name)
            .send()
            .await
            .map_err(|e| provider_error(name, "delete_stack", &e))?;
        Ok(())
    }

    async fn list_stacks(&self, filter: &[StackStatusCode]) -> Result<Vec<StackSummary>> {
        let status_filter: Vec<types::StackStatus> = filter
            .iter()
            .map(|s| types::StackStatus::from(s.as_str()))
            .collect();

        let mut summaries = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let out = self
                .client
                .list_stacks()
                .set_stack_status_filter(Some(status_filter.clone()))
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(|e| provider_error(crate::error::UNKNOWN_CONTEXT, "list_stacks", &e))?;

            for summary in out.stack_summaries() {
                let Some(name) = Option::<&str>::from(summary.stack_name()) else {
                    continue;
                };
                let status = Option::<&types::StackStatus>::from(summary.stack_status())
                    .map(|s| StackStatusCode::from(s.as_str()))
                    .unwrap_or_else(|| StackStatusCode::Other(String::new()));
                summaries.push(StackSummary {
                    name: name.to_string(),
                    status,
                });
            }

            match out.next_token() {
                Some(token) if !token.is_empty() => next_token = Some(token.to_string()),
                _ => break,
            }
        }

        Ok(summaries)
    }

    async fn describe_stacks(&self, name: &str) -> Result<Vec<StackRecord>> {
        match self.client.describe_stacks().stack_name(name).send().await {
            Ok(out) => Ok(out.stacks().iter().map(record_from_sdk).collect()),
            Err(e) if is_validation_error_containing(&e, DOES_NOT_EXIST) => Ok(Vec::new()),
            Err(e) => Err(provider_error(name, "describe_stacks", &e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{Parameter, Tag};

    fn request() -> StackRequest {
        StackRequest {
            name: "vpc".to_string(),
            role_arn: None,
            template: TemplateSource::Url("https://bucket/vpc.yaml".to_string()),
            parameters: None,
            tags: vec![Tag::new("team", "x")],
            capabilities: Some(vec!["CAPABILITY_IAM".to_string()]),
        }
    }

    #[test]
    fn omitted_parameters_stay_omitted() {
        assert!(sdk_parameters(&request()).is_none());

        let mut with_params = request();
        with_params.parameters = Some(vec![Parameter {
            key: "Env".to_string(),
            value: "prod".to_string(),
        }]);
        let params = sdk_parameters(&with_params).unwrap();
        assert_eq!(params[0].parameter_key(), Some("Env"));
        assert_eq!(params[0].parameter_value(), Some("prod"));
    }

    #[test]
    fn template_source_selects_exactly_one_field() {
        assert_eq!(
            split_template(&TemplateSource::Body("T".to_string())),
            (Some("T".to_string()), None)
        );
        assert_eq!(
            split_template(&request().template),
            (None, Some("https://bucket/vpc.yaml".to_string()))
        );
    }

    #[test]
    fn capabilities_map_to_sdk_enum() {
        let caps = sdk_capabilities(&request()).unwrap();
        assert_eq!(caps, vec![types::Capability::CapabilityIam]);
    }

    #[test]
    fn tags_map_in_order() {
        let tags = sdk_tags(&request());
        assert_eq!(tags.len(), 1);
        assert_eq!(Option::<&str>::from(tags[0].key()), Some("team"));
        assert_eq!(Option::<&str>::from(tags[0].value()), Some("x"));
    }
}
