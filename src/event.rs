//! The custom-resource lifecycle callback contract.
//!
//! CloudFormation invokes the function with the raw event; [`TeardownRequest`]
//! is the validated, immutable view the reconciler works from.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error("Malformed custom resource event: {0}")]
    Malformed(String),

    #[error("Custom resource event is missing {0}")]
    MissingField(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestType {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResourceProperties {
    pub policy_id: Option<String>,
    pub rule_group_arn: Option<String>,
    pub web_acl_arn: Option<String>,
    pub target_account: Option<String>,
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CustomResourceEvent {
    pub request_type: RequestType,
    #[serde(rename = "ResponseURL")]
    pub response_url: String,
    pub stack_id: String,
    pub request_id: String,
    pub logical_resource_id: String,
    #[serde(default)]
    pub physical_resource_id: Option<String>,
    #[serde(default)]
    pub resource_properties: ResourceProperties,
}

/// Opaque identifiers echoed back to CloudFormation in the callback.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CorrelationIds {
    pub stack_id: String,
    pub request_id: String,
    pub logical_resource_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TeardownRequest {
    pub request_type: RequestType,
    pub policy_id: Option<String>,
    pub rule_group_arn: Option<String>,
    pub web_acl_arn: Option<String>,
    pub target_account: Option<String>,
    pub callback_url: String,
    pub physical_resource_id: Option<String>,
    pub correlation_ids: CorrelationIds,
}

impl TeardownRequest {
    pub fn is_delete(&self) -> bool {
        self.request_type == RequestType::Delete
    }
}

impl From<CustomResourceEvent> for TeardownRequest {
    fn from(event: CustomResourceEvent) -> Self {
        let properties = event.resource_properties;

        Self {
            request_type: event.request_type,
            policy_id: non_blank(properties.policy_id),
            rule_group_arn: non_blank(properties.rule_group_arn),
            web_acl_arn: non_blank(properties.web_acl_arn),
            target_account: non_blank(properties.target_account),
            callback_url: event.response_url,
            physical_resource_id: non_blank(event.physical_resource_id),
            correlation_ids: CorrelationIds {
                stack_id: event.stack_id,
                request_id: event.request_id,
                logical_resource_id: event.logical_resource_id,
            },
        }
    }
}

pub fn parse(payload: Value) -> Result<TeardownRequest, Error> {
    let event: CustomResourceEvent = match serde_json::from_value(payload) {
        Ok(event) => event,
        Err(error) => return Err(Error::Malformed(error.to_string())),
    };

    if event.response_url.trim().is_empty() {
        return Err(Error::MissingField("ResponseURL"));
    }

    Ok(TeardownRequest::from(event))
}

/// Best-effort extraction of where to acknowledge an event that failed to
/// parse, so a malformed payload still unblocks the stack.
pub fn callback_target(payload: &Value) -> Option<(String, CorrelationIds)> {
    let field = |name: &str| {
        payload
            .get(name)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };

    let url = field("ResponseURL");
    if url.is_empty() {
        return None;
    }

    Some((
        url,
        CorrelationIds {
            stack_id: field("StackId"),
            request_id: field("RequestId"),
            logical_resource_id: field("LogicalResourceId"),
        },
    ))
}

// CDK renders unresolved optional properties as empty strings.
fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
