use async_trait::async_trait;
use aws_sdk_fms::types::PolicyComplianceStatusType;
use aws_types::SdkConfig;

use crate::error::{self, AwsError};

#[derive(Debug, Clone, PartialEq)]
pub struct PolicySummary {
    pub policy_id: String,
    pub policy_name: String,
    pub resource_type: String,
    pub remediation_enabled: bool,
}

/// One member account's standing against a Firewall Manager policy.
#[derive(Debug, Clone, PartialEq)]
pub struct ComplianceEntry {
    pub member_account: Option<String>,
    pub evaluations: usize,
    pub non_compliant: usize,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PolicyApi: Send + Sync {
    async fn get_policy(&self, policy_id: &str) -> Result<PolicySummary, AwsError>;

    /// Every compliance entry for the policy, fetched `page_size` at a time.
    async fn list_compliance_status(
        &self,
        policy_id: &str,
        page_size: i32,
    ) -> Result<Vec<ComplianceEntry>, AwsError>;

    async fn delete_policy(&self, policy_id: &str) -> Result<(), AwsError>;
}

pub struct FmsPolicies {
    client: aws_sdk_fms::Client,
}

impl FmsPolicies {
    pub fn new(sdk_config: &SdkConfig) -> Self {
        Self {
            client: aws_sdk_fms::Client::new(sdk_config),
        }
    }
}

#[async_trait]
impl PolicyApi for FmsPolicies {
    async fn get_policy(&self, policy_id: &str) -> Result<PolicySummary, AwsError> {
        let result = self
            .client
            .get_policy()
            .policy_id(policy_id)
            .send()
            .await
            .map_err(error::from_sdk)?;

        let policy = match result.policy() {
            Some(policy) => policy,
            None => return Err(AwsError::NotFound(policy_id.to_string())),
        };

        Ok(PolicySummary {
            policy_id: policy.policy_id().unwrap_or(policy_id).to_string(),
            policy_name: policy.policy_name().to_string(),
            resource_type: policy.resource_type().to_string(),
            remediation_enabled: policy.remediation_enabled(),
        })
    }

    async fn list_compliance_status(
        &self,
        policy_id: &str,
        page_size: i32,
    ) -> Result<Vec<ComplianceEntry>, AwsError> {
        let statuses = self
            .client
            .list_compliance_status()
            .policy_id(policy_id)
            .max_results(page_size)
            .into_paginator()
            .items()
            .send()
            .try_collect()
            .await
            .map_err(error::from_sdk)?;

        let entries = statuses
            .iter()
            .map(|status| ComplianceEntry {
                member_account: status.member_account().map(str::to_string),
                evaluations: status.evaluation_results().len(),
                non_compliant: status
                    .evaluation_results()
                    .iter()
                    .filter(|result| {
                        result.compliance_status()
                            == Some(&PolicyComplianceStatusType::NonCompliant)
                    })
                    .count(),
            })
            .collect();

        Ok(entries)
    }

    async fn delete_policy(&self, policy_id: &str) -> Result<(), AwsError> {
        self.client
            .delete_policy()
            .policy_id(policy_id)
            .send()
            .await
            .map_err(error::from_sdk)?;

        Ok(())
    }
}
