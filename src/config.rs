use serde::{Deserialize, Serialize};
use std::{env, fs, io, path::Path, time::Duration};
use tracing::error;
use validator::{Validate, ValidationError};

/// Environment variable naming an optional YAML file with reconciler settings.
pub const CONFIG_PATH_VAR: &str = "TEARDOWN_CONFIG";
pub const ROLE_NAME_VAR: &str = "TEARDOWN_ROLE_NAME";
pub const FINAL_SETTLE_VAR: &str = "TEARDOWN_FINAL_SETTLE_SECONDS";

/// Region used when neither the config file nor the environment names one.
pub const DEFAULT_REGION: &str = "us-west-2";

/// Time kept aside at the end of the invocation to deliver the callback.
pub const CALLBACK_RESERVE_SECONDS: u64 = 10;

const PROTECTED_RESOURCE_TYPES: &[&str] = &[
    "APPLICATION_LOAD_BALANCER",
    "API_GATEWAY",
    "APPSYNC",
    "COGNITO_USER_POOL",
    "APP_RUNNER_SERVICE",
    "VERIFIED_ACCESS_INSTANCE",
];

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error("File {0} not found")]
    FileNotFound(String),

    #[error("Parsing error: {0}")]
    ParsingError(String),

    #[error("Validation errors: {0}")]
    ValidationError(String),

    #[error("Unknown error occurred: {0}")]
    Unknown(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default, deny_unknown_fields)]
#[validate(schema(function = "validate_wait_budget"))]
pub struct ReconcilerConfig {
    pub region: Option<String>,

    #[validate(length(min = 1, max = 64))]
    pub cross_account_role_name: String,

    #[validate(length(min = 2, max = 64))]
    pub role_session_name: String,

    // STS refuses anything shorter, and sessions must not outlive 15 minutes.
    #[validate(range(min = 900, max = 900))]
    pub session_duration_seconds: i32,

    #[validate(range(min = 1, max = 100))]
    pub compliance_page_size: i32,

    #[validate(range(min = 1, max = 100))]
    pub web_acl_page_size: i32,

    #[validate(custom = "validate_resource_type")]
    pub protected_resource_type: String,

    pub policy_settle_seconds: u64,

    pub disassociation_settle_seconds: u64,

    pub final_settle_seconds: u64,

    #[validate(range(min = 30, max = 900))]
    pub timeout_budget_seconds: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            region: None,
            cross_account_role_name: String::from("OrganizationAccountAccessRole"),
            role_session_name: String::from("FirewallManagerCleanup"),
            session_duration_seconds: 900,
            compliance_page_size: 100,
            web_acl_page_size: 100,
            protected_resource_type: String::from("APPLICATION_LOAD_BALANCER"),
            policy_settle_seconds: 10,
            disassociation_settle_seconds: 5,
            final_settle_seconds: 15,
            timeout_budget_seconds: 120,
        }
    }
}

impl ReconcilerConfig {
    pub fn role_arn(&self, account: &str) -> String {
        format!("arn:aws:iam::{}:role/{}", account, self.cross_account_role_name)
    }

    pub fn policy_settle(&self) -> Duration {
        Duration::from_secs(self.policy_settle_seconds)
    }

    pub fn disassociation_settle(&self) -> Duration {
        Duration::from_secs(self.disassociation_settle_seconds)
    }

    pub fn final_settle(&self) -> Duration {
        Duration::from_secs(self.final_settle_seconds)
    }

    /// Upper bound for the whole cleanup pass, leaving room for the callback.
    pub fn reconcile_deadline(&self) -> Duration {
        Duration::from_secs(
            self.timeout_budget_seconds
                .saturating_sub(CALLBACK_RESERVE_SECONDS),
        )
    }

    /// Sum of every fixed pause a single pass can take.
    pub fn worst_case_wait(&self) -> Duration {
        self.policy_settle() + self.disassociation_settle() * 2 + self.final_settle()
    }
}

pub fn parse(path: &Path) -> Result<ReconcilerConfig, Error> {
    let contents = match fs::read_to_string(path) {
        Ok(raw_contents) => Ok(raw_contents),
        Err(error) => match error.kind() {
            io::ErrorKind::NotFound => Err(Error::FileNotFound(path.display().to_string())),
            _ => Err(Error::Unknown(error.to_string())),
        },
    }?;

    let config: ReconcilerConfig = match serde_yaml::from_str(&contents) {
        Ok(data) => Ok(data),
        Err(error) => Err(Error::ParsingError(error.to_string())),
    }?;

    validate(&config)?;

    return Ok(config);
}

pub fn from_env() -> ReconcilerConfig {
    load_or_default(|key| env::var(key).ok())
}

/// Like [`from_lookup`], but a rejected configuration is logged and replaced
/// by the defaults. The function still has to acknowledge every event.
pub fn load_or_default<F>(lookup: F) -> ReconcilerConfig
where
    F: Fn(&str) -> Option<String>,
{
    match from_lookup(lookup) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "Rejected reconciler configuration, using defaults");
            ReconcilerConfig::default()
        }
    }
}

/// Builds the configuration from a file named by `TEARDOWN_CONFIG` (or the
/// defaults) and applies the single-value environment overrides on top.
pub fn from_lookup<F>(lookup: F) -> Result<ReconcilerConfig, Error>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = match lookup(CONFIG_PATH_VAR).filter(|path| !path.is_empty()) {
        Some(path) => parse(Path::new(&path))?,
        None => ReconcilerConfig::default(),
    };

    if let Some(role_name) = lookup(ROLE_NAME_VAR).filter(|name| !name.is_empty()) {
        config.cross_account_role_name = role_name;
    }

    if let Some(raw) = lookup(FINAL_SETTLE_VAR) {
        config.final_settle_seconds = match raw.trim().parse::<u64>() {
            Ok(seconds) => seconds,
            Err(error) => {
                return Err(Error::ParsingError(format!(
                    "{}={:?}: {}",
                    FINAL_SETTLE_VAR, raw, error
                )))
            }
        };
    }

    validate(&config)?;

    return Ok(config);
}

fn validate(config: &ReconcilerConfig) -> Result<(), Error> {
    match config.validate() {
        Ok(_) => Ok(()),
        Err(error) => Err(Error::ValidationError(error.to_string())),
    }
}

fn validate_resource_type(resource_type: &str) -> Result<(), ValidationError> {
    if !PROTECTED_RESOURCE_TYPES.contains(&resource_type) {
        return Err(ValidationError::new(
            "The protected resource type has to be a regional WAFv2 resource type",
        ));
    }

    return Ok(());
}

fn validate_wait_budget(config: &ReconcilerConfig) -> Result<(), ValidationError> {
    let reserved = config.worst_case_wait() + Duration::from_secs(CALLBACK_RESERVE_SECONDS);
    if reserved >= Duration::from_secs(config.timeout_budget_seconds) {
        return Err(ValidationError::new(
            "The settle delays plus the callback reserve have to fit in the timeout budget",
        ));
    }

    return Ok(());
}
