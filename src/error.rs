//! Classification of AWS SDK failures.
//!
//! Every adapter maps its `SdkError` through [`from_sdk`] so the reconciler can
//! reason about "already gone" and "stale lock token" without knowing which
//! service produced the error.

use aws_sdk_wafv2::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum AwsError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Rate limit exceeded: {0}")]
    Throttled(String),

    #[error("Lock token is stale: {0}")]
    OptimisticLock(String),

    #[error("Service error ({code}): {message}")]
    Service { code: String, message: String },

    #[error("Unknown error occurred: {0}")]
    Unknown(String),
}

impl AwsError {
    /// Deleting or detaching something that is already gone counts as done.
    pub fn is_not_found(&self) -> bool {
        matches!(self, AwsError::NotFound(_))
    }
}

const NOT_FOUND_CODES: &[&str] = &[
    "ResourceNotFoundException",
    "WAFNonexistentItemException",
    "NoSuchEntity",
];

const ACCESS_DENIED_CODES: &[&str] = &[
    "AccessDenied",
    "AccessDeniedException",
    "WAFUnavailableEntityException",
];

const THROTTLING_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "TooManyRequestsException",
    "LimitExceededException",
];

const OPTIMISTIC_LOCK_CODES: &[&str] = &["WAFOptimisticLockException"];

pub fn classify(code: Option<&str>, message: Option<&str>) -> AwsError {
    let message = message.unwrap_or("no message").to_string();

    match code {
        Some(c) if NOT_FOUND_CODES.contains(&c) => AwsError::NotFound(message),
        Some(c) if ACCESS_DENIED_CODES.contains(&c) => AwsError::AccessDenied(message),
        Some(c) if THROTTLING_CODES.contains(&c) => AwsError::Throttled(message),
        Some(c) if OPTIMISTIC_LOCK_CODES.contains(&c) => AwsError::OptimisticLock(message),
        Some(c) => AwsError::Service {
            code: c.to_string(),
            message,
        },
        None => AwsError::Unknown(message),
    }
}

/// Maps any SDK operation error. Service errors are classified by their
/// error code; transport, timeout and construction failures become `Unknown`.
pub fn from_sdk<E, R>(err: SdkError<E, R>) -> AwsError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    match err {
        SdkError::ServiceError(context) => {
            let service_error = context.err();
            classify(service_error.code(), service_error.message())
        }
        other => AwsError::Unknown(DisplayErrorContext(&other).to_string()),
    }
}
