//! Fixtures for tests that drive the real SDK clients against a local server.

use aws_config::retry::RetryConfig;
use aws_config::BehaviorVersion;
use aws_credential_types::provider::SharedCredentialsProvider;
use aws_credential_types::Credentials;
use aws_types::region::Region;
use aws_types::SdkConfig;
use wiremock::{Match, MockServer, Request};

pub fn sdk_config(server: &MockServer) -> SdkConfig {
    let credentials = Credentials::new("AKIDTEST", "secret", None, None, "test");

    SdkConfig::builder()
        .behavior_version(BehaviorVersion::latest())
        .endpoint_url(server.uri())
        .region(Region::new("us-west-2"))
        .credentials_provider(SharedCredentialsProvider::new(credentials))
        .retry_config(RetryConfig::disabled())
        .build()
}

/// Matches requests whose raw body contains the given bytes. The CBOR
/// protocol is not valid UTF-8, so the string matchers never fire on it.
pub struct BodyContainsBytes(pub Vec<u8>);

impl Match for BodyContainsBytes {
    fn matches(&self, request: &Request) -> bool {
        request
            .body
            .windows(self.0.len())
            .any(|window| window == self.0.as_slice())
    }
}
