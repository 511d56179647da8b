//! Pre-deletion cleanup for a Firewall Manager WAF policy stack.
//!
//! Deployed as the Lambda behind a CloudFormation custom resource. On stack
//! deletion it deletes the Firewall Manager policy, detaches web ACLs from
//! load balancers in the management and target accounts, and strips
//! references to the stack's rule group so CloudFormation can delete it.

use std::env;
use std::sync::Arc;

use aws_config::meta::region::RegionProviderChain;
use aws_config::BehaviorVersion;
use aws_types::region::Region;
use aws_types::SdkConfig;
use lambda_runtime::{service_fn, LambdaEvent};
use serde_json::Value;
use tracing::info;

pub mod config;
pub mod error;
pub mod event;
pub mod firewall;
pub mod handler;
pub mod reconciler;
pub mod response;
pub mod session;
pub mod waf;

#[cfg(test)]
mod testing;

use config::ReconcilerConfig;
use handler::Handler;
use reconciler::Reconciler;
use response::CallbackClient;
use session::{AccountApis, StsConnector};

pub const LOG_FORMAT_VAR: &str = "TEARDOWN_LOG_FORMAT";

/// Lambda runtime entry point
pub async fn run() -> Result<(), lambda_runtime::Error> {
    init_tracing();

    let config = config::from_env();
    let sdk_config = load_sdk_config(&config).await;
    info!(
        region = ?sdk_config.region(),
        role_name = %config.cross_account_role_name,
        final_settle_seconds = config.final_settle_seconds,
        "Teardown reconciler starting"
    );

    let home = AccountApis::for_config(&sdk_config, &config);
    let connector = StsConnector::new(&sdk_config, &config);
    let reconciler = Reconciler::new(config, home, Box::new(connector));

    let handler = Arc::new(Handler::new(
        reconciler,
        CallbackClient::new()?,
        env::var("AWS_LAMBDA_LOG_STREAM_NAME").ok(),
    ));

    lambda_runtime::run(service_fn(move |event: LambdaEvent<Value>| {
        let handler = handler.clone();
        async move { handler.handle(event).await }
    }))
    .await
}

async fn load_sdk_config(config: &ReconcilerConfig) -> SdkConfig {
    let region = RegionProviderChain::first_try(config.region.clone().map(Region::new))
        .or_default_provider()
        .or_else(Region::new(config::DEFAULT_REGION));

    aws_config::defaults(BehaviorVersion::latest())
        .region(region)
        .load()
        .await
}

fn init_tracing() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let in_lambda = env::var_os("AWS_LAMBDA_FUNCTION_NAME").is_some();
    let json = match env::var(LOG_FORMAT_VAR) {
        Ok(format) => format.eq_ignore_ascii_case("json"),
        Err(_) => in_lambda,
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(env_filter);

    if json {
        registry.with(fmt::layer().json().with_ansi(false)).init();
    } else {
        registry.with(fmt::layer().with_ansi(!in_lambda)).init();
    }
}
