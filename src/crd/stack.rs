//! Stack Custom Resource Definition
//!
//! A Stack declares one externally provisioned CloudFormation stack: the
//! template it is built from, its parameters and tags, and an optional
//! execution role. The stack name on the engine side is the resource name.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::Error;

/// Specification for a Stack
///
/// Field names follow the existing `cloudformation.mdstechinc.com` schema so
/// resources written for earlier controllers keep deserializing.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cloudformation.mdstechinc.com",
    version = "v1alpha1",
    kind = "Stack",
    plural = "stacks",
    shortname = "cfs",
    status = "StackStatus",
    namespaced,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.status"}"#,
    printcolumn = r#"{"name":"StackID","type":"string","jsonPath":".status.stackID","priority":1}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct StackSpec {
    /// Inline template body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,

    /// Remote template location (e.g. an S3 URL)
    #[serde(rename = "templateURL", default, skip_serializing_if = "Option::is_none")]
    pub template_url: Option<String>,

    /// Template parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<BTreeMap<String, String>>,

    /// User tags, appended after the controller defaults
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<BTreeMap<String, String>>,

    /// Service role the engine assumes while executing the stack
    #[serde(rename = "customRoleARN", default, skip_serializing_if = "Option::is_none")]
    pub custom_role_arn: Option<String>,
}

impl StackSpec {
    /// Validate the stack specification
    ///
    /// Exactly one template source must be set. Blank strings count as unset.
    pub fn validate(&self, stack: &str) -> Result<(), Error> {
        let body = self.template.as_deref().is_some_and(|t| !t.trim().is_empty());
        let url = self
            .template_url
            .as_deref()
            .is_some_and(|u| !u.trim().is_empty());

        match (body, url) {
            (true, false) | (false, true) => Ok(()),
            (true, true) => Err(Error::validation_for_field(
                stack,
                "spec.templateURL",
                "template and templateURL are mutually exclusive",
            )),
            (false, false) => Err(Error::validation_for_field(
                stack,
                "spec.template",
                "one of template or templateURL is required",
            )),
        }
    }
}

/// Coarse lifecycle state reported on the resource
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StackState {
    /// First create reached a successful terminal status
    Created,
    /// An update (or a later observation) reached a successful terminal status
    Updated,
    /// The external stack is gone
    Deleted,
    /// The last operation failed
    Error,
}

impl StackState {
    /// Whether this state describes a live, usable stack
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Created | Self::Updated)
    }
}

impl std::fmt::Display for StackState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "CREATED"),
            Self::Updated => write!(f, "UPDATED"),
            Self::Deleted => write!(f, "DELETED"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

/// Status for a Stack
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct StackStatus {
    /// Engine-assigned stack identifier
    #[serde(rename = "stackID", default, skip_serializing_if = "Option::is_none")]
    pub stack_id: Option<String>,

    /// Outputs from the last terminal describe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<BTreeMap<String, String>>,

    /// Coarse state token
    #[serde(rename = "status", default, skip_serializing_if = "Option::is_none")]
    pub state: Option<StackState>,

    /// Engine status reason or error text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StackStatus {
    /// Health of the recorded state
    ///
    /// Statuses written before the state token existed carry no state and
    /// are read as healthy.
    pub fn is_healthy(&self) -> bool {
        self.state.map_or(true, |s| s.is_healthy())
    }

    /// Error status that keeps the last known identifier and outputs
    pub fn error_from(previous: Option<&StackStatus>, message: impl Into<String>) -> Self {
        Self {
            stack_id: previous.and_then(|p| p.stack_id.clone()),
            outputs: previous.and_then(|p| p.outputs.clone()),
            state: Some(StackState::Error),
            message: Some(message.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    fn body_spec() -> StackSpec {
        StackSpec {
            template: Some("Resources: {}".to_string()),
            ..Default::default()
        }
    }

    // =========================================================================
    // Template Source Stories
    // =========================================================================

    /// Story: an inline template on its own is a valid spec
    #[test]
    fn story_inline_template_is_valid() {
        assert!(body_spec().validate("vpc").is_ok());
    }

    /// Story: a remote template on its own is a valid spec
    #[test]
    fn story_remote_template_is_valid() {
        let spec = StackSpec {
            template_url: Some("https://bucket.s3.amazonaws.com/vpc.yaml".to_string()),
            ..Default::default()
        };
        assert!(spec.validate("vpc").is_ok());
    }

    /// Story: setting both sources is ambiguous and rejected before any
    /// engine call is made
    #[test]
    fn story_both_template_sources_rejected() {
        let spec = StackSpec {
            template_url: Some("https://bucket/vpc.yaml".to_string()),
            ..body_spec()
        };
        let err = spec.validate("vpc").unwrap_err();
        assert!(err.to_string().contains("mutually exclusive"));
        assert_eq!(err.stack(), Some("vpc"));
    }

    /// Story: a blank template counts as missing
    #[test]
    fn story_blank_template_is_missing() {
        let spec = StackSpec {
            template: Some("   ".to_string()),
            ..Default::default()
        };
        let err = spec.validate("vpc").unwrap_err();
        assert!(err.to_string().contains("required"));
    }

    // =========================================================================
    // Wire Format
    // =========================================================================

    #[test]
    fn spec_uses_legacy_field_names() {
        let spec: StackSpec = serde_json::from_value(serde_json::json!({
            "templateURL": "https://bucket/t.yaml",
            "customRoleARN": "arn:aws:iam::1:role/exec",
            "parameters": {"Env": "prod"}
        }))
        .unwrap();
        assert_eq!(spec.template_url.as_deref(), Some("https://bucket/t.yaml"));
        assert_eq!(spec.custom_role_arn.as_deref(), Some("arn:aws:iam::1:role/exec"));
        assert_eq!(spec.parameters.unwrap()["Env"], "prod");
    }

    #[test]
    fn status_serializes_state_as_status_token() {
        let status = StackStatus {
            stack_id: Some("arn:stack/vpc/1".to_string()),
            outputs: None,
            state: Some(StackState::Created),
            message: None,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["status"], "CREATED");
        assert_eq!(json["stackID"], "arn:stack/vpc/1");
        assert!(json.get("outputs").is_none());
    }

    /// Story: a status written by an older controller without a state token
    /// is treated as healthy, so it is not flagged as a health change
    #[test]
    fn story_legacy_status_without_state_is_healthy() {
        let status: StackStatus =
            serde_json::from_value(serde_json::json!({"stackID": "id-1"})).unwrap();
        assert!(status.is_healthy());
        assert!(!StackStatus::error_from(Some(&status), "boom").is_healthy());
    }

    #[test]
    fn error_status_keeps_previous_identity() {
        let previous = StackStatus {
            stack_id: Some("id-1".to_string()),
            outputs: Some(BTreeMap::from([("VpcId".to_string(), "vpc-1".to_string())])),
            state: Some(StackState::Updated),
            message: None,
        };
        let err = StackStatus::error_from(Some(&previous), "AccessDenied");
        assert_eq!(err.stack_id, previous.stack_id);
        assert_eq!(err.outputs, previous.outputs);
        assert_eq!(err.state, Some(StackState::Error));
        assert_eq!(err.message.as_deref(), Some("AccessDenied"));
    }

    #[test]
    fn crd_is_namespaced_in_expected_group() {
        let crd = Stack::crd();
        assert_eq!(crd.spec.group, "cloudformation.mdstechinc.com");
        assert_eq!(crd.spec.names.kind, "Stack");
        assert_eq!(crd.spec.names.plural, "stacks");
        assert_eq!(crd.spec.scope, "Namespaced");
    }
}
