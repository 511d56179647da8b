//! Cross-account access for one reconciliation pass.
//!
//! Credentials obtained here live only as long as the [`AccountApis`] built
//! from them; nothing is cached between invocations.

use std::fmt;
use std::time::SystemTime;

use async_trait::async_trait;
use aws_credential_types::provider::SharedCredentialsProvider;
use aws_credential_types::Credentials;
use aws_types::SdkConfig;
use tracing::debug;

use crate::config::ReconcilerConfig;
use crate::error::{self, AwsError};
use crate::firewall::{FmsPolicies, PolicyApi};
use crate::waf::{Wafv2WebAcls, WebAclApi};

/// Temporary credentials scoped to the target account.
#[derive(Clone)]
pub struct CrossAccountSession {
    pub account: String,
    access_key_id: String,
    secret_access_key: String,
    session_token: String,
    expiration: Option<SystemTime>,
}

impl CrossAccountSession {
    pub fn new(
        account: String,
        access_key_id: String,
        secret_access_key: String,
        session_token: String,
        expiration: Option<SystemTime>,
    ) -> Self {
        Self {
            account,
            access_key_id,
            secret_access_key,
            session_token,
            expiration,
        }
    }

    /// `base` with its credentials swapped for this session's; region and
    /// retry settings carry over.
    pub fn sdk_config(&self, base: &SdkConfig) -> SdkConfig {
        let credentials = Credentials::new(
            self.access_key_id.clone(),
            self.secret_access_key.clone(),
            Some(self.session_token.clone()),
            self.expiration,
            "cross-account-session",
        );

        base.to_builder()
            .credentials_provider(SharedCredentialsProvider::new(credentials))
            .build()
    }
}

impl fmt::Debug for CrossAccountSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrossAccountSession")
            .field("account", &self.account)
            .field("access_key_id", &"** redacted **")
            .field("secret_access_key", &"** redacted **")
            .field("session_token", &"** redacted **")
            .field("expiration", &self.expiration)
            .finish()
    }
}

/// The API clients the reconciler drives in one account.
pub struct AccountApis {
    pub policies: Box<dyn PolicyApi>,
    pub web_acls: Box<dyn WebAclApi>,
}

impl AccountApis {
    pub fn for_config(sdk_config: &SdkConfig, config: &ReconcilerConfig) -> Self {
        Self {
            policies: Box::new(FmsPolicies::new(sdk_config)),
            web_acls: Box::new(Wafv2WebAcls::new(
                sdk_config,
                &config.protected_resource_type,
            )),
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AccountConnector: Send + Sync {
    /// Assumes the administrative role in `account` and returns clients
    /// acting as it.
    async fn connect(&self, account: &str) -> Result<AccountApis, AwsError>;
}

pub struct StsConnector {
    sts: aws_sdk_sts::Client,
    base: SdkConfig,
    config: ReconcilerConfig,
}

impl StsConnector {
    pub fn new(sdk_config: &SdkConfig, config: &ReconcilerConfig) -> Self {
        Self {
            sts: aws_sdk_sts::Client::new(sdk_config),
            base: sdk_config.clone(),
            config: config.clone(),
        }
    }

    pub async fn assume_role(&self, account: &str) -> Result<CrossAccountSession, AwsError> {
        let role_arn = self.config.role_arn(account);

        let result = self
            .sts
            .assume_role()
            .role_arn(&role_arn)
            .role_session_name(&self.config.role_session_name)
            .duration_seconds(self.config.session_duration_seconds)
            .send()
            .await
            .map_err(error::from_sdk)?;

        let credentials = match result.credentials() {
            Some(credentials) => credentials,
            None => {
                return Err(AwsError::Unknown(format!(
                    "AssumeRole for {} returned no credentials",
                    role_arn
                )))
            }
        };

        debug!(role_arn = %role_arn, "Assumed cross-account role");

        Ok(CrossAccountSession::new(
            account.to_string(),
            credentials.access_key_id().to_string(),
            credentials.secret_access_key().to_string(),
            credentials.session_token().to_string(),
            SystemTime::try_from(*credentials.expiration()).ok(),
        ))
    }
}

#[async_trait]
impl AccountConnector for StsConnector {
    async fn connect(&self, account: &str) -> Result<AccountApis, AwsError> {
        let session = self.assume_role(account).await?;
        let sdk_config = session.sdk_config(&self.base);

        Ok(AccountApis::for_config(&sdk_config, &self.config))
    }
}
