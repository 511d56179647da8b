//! Regional web ACL access and rule-group reference scrubbing.

use async_trait::async_trait;
use aws_sdk_wafv2::types::{ResourceType, Rule, Scope, WebAcl};
use aws_types::SdkConfig;
use tracing::info;

use crate::error::{self, AwsError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebAclSummary {
    pub name: String,
    pub id: String,
    pub arn: String,
}

/// A rule's pointer at a reusable rule group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebAclRuleReference {
    pub rule_group_arn: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebAclRule {
    pub name: String,
    pub reference: Option<WebAclRuleReference>,
}

impl WebAclRule {
    pub fn references(&self, rule_group_arn: &str) -> bool {
        match &self.reference {
            Some(reference) => reference.rule_group_arn == rule_group_arn,
            None => false,
        }
    }
}

/// A web ACL as read for a rewrite, together with the lock token the write
/// has to present.
#[derive(Debug, Clone)]
pub struct WebAclDocument {
    pub summary: WebAclSummary,
    pub lock_token: String,
    pub rules: Vec<WebAclRule>,
    definition: Option<WebAcl>,
}

impl WebAclDocument {
    #[cfg(test)]
    pub(crate) fn new(summary: WebAclSummary, lock_token: String, rules: Vec<WebAclRule>) -> Self {
        Self {
            summary,
            lock_token,
            rules,
            definition: None,
        }
    }
}

/// The rule list with every reference to `rule_group_arn` removed, or `None`
/// when nothing references it and the ACL can be left alone.
pub fn scrub_rules(rules: &[WebAclRule], rule_group_arn: &str) -> Option<Vec<WebAclRule>> {
    if !rules.iter().any(|rule| rule.references(rule_group_arn)) {
        return None;
    }

    Some(
        rules
            .iter()
            .filter(|rule| !rule.references(rule_group_arn))
            .cloned()
            .collect(),
    )
}

/// Rewrites one web ACL without its references to `rule_group_arn`.
///
/// The rewrite uses the lock token from the same read, so a concurrent edit
/// surfaces as `AwsError::OptimisticLock` instead of being overwritten.
/// Returns whether the ACL was changed.
pub async fn remove_rule_group_references(
    api: &dyn WebAclApi,
    summary: &WebAclSummary,
    rule_group_arn: &str,
) -> Result<bool, AwsError> {
    let document = api.get_web_acl(summary).await?;

    let rules = match scrub_rules(&document.rules, rule_group_arn) {
        Some(rules) => rules,
        None => return Ok(false),
    };

    info!(
        web_acl = %summary.name,
        removed = document.rules.len() - rules.len(),
        "Web ACL references the rule group, updating"
    );
    api.update_rules(&document, rules).await?;

    Ok(true)
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WebAclApi: Send + Sync {
    async fn list_web_acls(&self, page_size: i32) -> Result<Vec<WebAclSummary>, AwsError>;

    /// ARNs of the protected resources of the configured type using the ACL.
    async fn list_resources(&self, web_acl_arn: &str) -> Result<Vec<String>, AwsError>;

    async fn disassociate(&self, resource_arn: &str) -> Result<(), AwsError>;

    async fn get_web_acl(&self, summary: &WebAclSummary) -> Result<WebAclDocument, AwsError>;

    /// Writes `rules` back as the ACL's complete rule list, guarded by the
    /// document's lock token.
    async fn update_rules(
        &self,
        document: &WebAclDocument,
        rules: Vec<WebAclRule>,
    ) -> Result<(), AwsError>;
}

pub struct Wafv2WebAcls {
    client: aws_sdk_wafv2::Client,
    resource_type: ResourceType,
}

impl Wafv2WebAcls {
    pub fn new(sdk_config: &SdkConfig, resource_type: &str) -> Self {
        Self {
            client: aws_sdk_wafv2::Client::new(sdk_config),
            resource_type: ResourceType::from(resource_type),
        }
    }
}

fn to_rule(rule: &Rule) -> WebAclRule {
    let reference = rule
        .statement()
        .and_then(|statement| statement.rule_group_reference_statement())
        .map(|statement| WebAclRuleReference {
            rule_group_arn: statement.arn().to_string(),
        });

    WebAclRule {
        name: rule.name().to_string(),
        reference,
    }
}

#[async_trait]
impl WebAclApi for Wafv2WebAcls {
    async fn list_web_acls(&self, page_size: i32) -> Result<Vec<WebAclSummary>, AwsError> {
        let mut summaries = Vec::new();
        let mut next_marker: Option<String> = None;

        loop {
            let result = self
                .client
                .list_web_acls()
                .scope(Scope::Regional)
                .limit(page_size)
                .set_next_marker(next_marker.take())
                .send()
                .await
                .map_err(error::from_sdk)?;

            let page = result.web_acls();
            summaries.extend(page.iter().map(|acl| WebAclSummary {
                name: acl.name().unwrap_or_default().to_string(),
                id: acl.id().unwrap_or_default().to_string(),
                arn: acl.arn().unwrap_or_default().to_string(),
            }));

            // WAF hands out a marker even on the last page.
            match result.next_marker() {
                Some(marker) if !marker.is_empty() && !page.is_empty() => {
                    next_marker = Some(marker.to_string())
                }
                _ => break,
            }
        }

        Ok(summaries)
    }

    async fn list_resources(&self, web_acl_arn: &str) -> Result<Vec<String>, AwsError> {
        let result = self
            .client
            .list_resources_for_web_acl()
            .web_acl_arn(web_acl_arn)
            .resource_type(self.resource_type.clone())
            .send()
            .await
            .map_err(error::from_sdk)?;

        Ok(result.resource_arns().to_vec())
    }

    async fn disassociate(&self, resource_arn: &str) -> Result<(), AwsError> {
        self.client
            .disassociate_web_acl()
            .resource_arn(resource_arn)
            .send()
            .await
            .map_err(error::from_sdk)?;

        Ok(())
    }

    async fn get_web_acl(&self, summary: &WebAclSummary) -> Result<WebAclDocument, AwsError> {
        let result = self
            .client
            .get_web_acl()
            .name(&summary.name)
            .scope(Scope::Regional)
            .id(&summary.id)
            .send()
            .await
            .map_err(error::from_sdk)?;

        let web_acl = match result.web_acl() {
            Some(web_acl) => web_acl.clone(),
            None => return Err(AwsError::NotFound(summary.arn.clone())),
        };
        let lock_token = match result.lock_token() {
            Some(token) => token.to_string(),
            None => {
                return Err(AwsError::Unknown(format!(
                    "GetWebACL for {} returned no lock token",
                    summary.name
                )))
            }
        };

        Ok(WebAclDocument {
            summary: summary.clone(),
            lock_token,
            rules: web_acl.rules().iter().map(to_rule).collect(),
            definition: Some(web_acl),
        })
    }

    async fn update_rules(
        &self,
        document: &WebAclDocument,
        rules: Vec<WebAclRule>,
    ) -> Result<(), AwsError> {
        let definition = match &document.definition {
            Some(definition) => definition,
            None => {
                return Err(AwsError::Unknown(format!(
                    "web ACL {} was not read from WAF",
                    document.summary.name
                )))
            }
        };

        // Rule names are unique within a web ACL.
        let kept: Vec<Rule> = definition
            .rules()
            .iter()
            .filter(|rule| rules.iter().any(|kept| kept.name == rule.name()))
            .cloned()
            .collect();

        let token_domains = definition.token_domains();

        self.client
            .update_web_acl()
            .name(&document.summary.name)
            .scope(Scope::Regional)
            .id(&document.summary.id)
            .lock_token(&document.lock_token)
            .set_default_action(definition.default_action().cloned())
            .set_description(definition.description().map(str::to_string))
            .set_rules(Some(kept))
            .set_visibility_config(definition.visibility_config().cloned())
            .set_custom_response_bodies(definition.custom_response_bodies().cloned())
            .set_captcha_config(definition.captcha_config().cloned())
            .set_challenge_config(definition.challenge_config().cloned())
            .set_token_domains(if token_domains.is_empty() {
                None
            } else {
                Some(token_domains.to_vec())
            })
            .set_association_config(definition.association_config().cloned())
            .set_data_protection_config(definition.data_protection_config().cloned())
            .set_on_source_d_do_s_protection_config(
                definition.on_source_d_do_s_protection_config().cloned(),
            )
            .set_application_config(definition.application_config().cloned())
            .set_monetization_config(definition.monetization_config().cloned())
            .send()
            .await
            .map_err(error::from_sdk)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use serde_json::{json, Value};
    use wiremock::matchers::{body_partial_json, header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn rule(name: &str, rule_group_arn: Option<&str>) -> WebAclRule {
        WebAclRule {
            name: name.to_string(),
            reference: rule_group_arn.map(|arn| WebAclRuleReference {
                rule_group_arn: arn.to_string(),
            }),
        }
    }

    #[test]
    fn drops_only_matching_references() {
        let rules = vec![
            rule("allow-office", None),
            rule("custom-rules", Some("rg-1")),
            rule("shared-rules", Some("rg-2")),
        ];

        let scrubbed = scrub_rules(&rules, "rg-1").unwrap();
        assert_eq!(
            vec![rule("allow-office", None), rule("shared-rules", Some("rg-2"))],
            scrubbed
        );
    }

    #[test]
    fn untouched_when_nothing_references_the_group() {
        let rules = vec![rule("allow-office", None), rule("shared-rules", Some("rg-2"))];

        assert_eq!(None, scrub_rules(&rules, "rg-1"));
        assert_eq!(None, scrub_rules(&[], "rg-1"));
    }

    #[test]
    fn every_duplicate_reference_is_removed() {
        let rules = vec![rule("a", Some("rg-1")), rule("b", Some("rg-1"))];

        assert_eq!(Some(vec![]), scrub_rules(&rules, "rg-1"));
    }

    #[test]
    fn locally_built_document_has_no_definition() {
        let document = WebAclDocument::new(
            WebAclSummary {
                name: String::from("acl"),
                id: String::from("id"),
                arn: String::from("arn"),
            },
            String::from("lock-1"),
            vec![],
        );

        assert_eq!("lock-1", document.lock_token);
        assert!(document.definition.is_none());
    }

    const ACL_ARN: &str = "arn:aws:wafv2:us-west-2:999:regional/webacl/shop-acl/acl-id";

    fn operation(name: &str) -> wiremock::matchers::HeaderExactMatcher {
        header("x-amz-target", format!("AWSWAF_20190729.{}", name).as_str())
    }

    fn respond(body: Value) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_raw(body.to_string(), "application/x-amz-json-1.1")
    }

    fn web_acls(server: &MockServer) -> Wafv2WebAcls {
        Wafv2WebAcls::new(&testing::sdk_config(server), "APPLICATION_LOAD_BALANCER")
    }

    fn summary_json(name: &str) -> Value {
        json!({ "Name": name, "Id": format!("{}-id", name), "ARN": format!("arn:{}", name) })
    }

    fn visibility(metric: &str) -> Value {
        json!({
            "SampledRequestsEnabled": true,
            "CloudWatchMetricsEnabled": true,
            "MetricName": metric
        })
    }

    fn rule_json(name: &str, priority: i32, rule_group_arn: &str) -> Value {
        json!({
            "Name": name,
            "Priority": priority,
            "Statement": { "RuleGroupReferenceStatement": { "ARN": rule_group_arn } },
            "OverrideAction": { "None": {} },
            "VisibilityConfig": visibility(name)
        })
    }

    fn shop_acl() -> WebAclSummary {
        WebAclSummary {
            name: String::from("shop-acl"),
            id: String::from("acl-id"),
            arn: String::from(ACL_ARN),
        }
    }

    #[tokio::test]
    async fn lists_web_acls_across_pages() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(operation("ListWebACLs"))
            .and(body_partial_json(json!({ "NextMarker": "page-2" })))
            .respond_with(respond(json!({ "WebACLs": [summary_json("c")] })))
            .with_priority(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(operation("ListWebACLs"))
            .and(body_partial_json(json!({ "Scope": "REGIONAL", "Limit": 2 })))
            .respond_with(respond(json!({
                "NextMarker": "page-2",
                "WebACLs": [summary_json("a"), summary_json("b")]
            })))
            .with_priority(2)
            .expect(1)
            .mount(&server)
            .await;

        let acls = web_acls(&server).list_web_acls(2).await.unwrap();

        let names: Vec<&str> = acls.iter().map(|acl| acl.name.as_str()).collect();
        assert_eq!(vec!["a", "b", "c"], names);
        assert_eq!("b-id", acls[1].id);
        assert_eq!("arn:c", acls[2].arn);
    }

    #[tokio::test]
    async fn empty_page_ends_listing_even_with_marker() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(operation("ListWebACLs"))
            .respond_with(respond(json!({ "NextMarker": "again", "WebACLs": [] })))
            .expect(1)
            .mount(&server)
            .await;

        let acls = web_acls(&server).list_web_acls(100).await.unwrap();

        assert!(acls.is_empty());
    }

    #[tokio::test]
    async fn lists_resources_of_configured_type() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(operation("ListResourcesForWebACL"))
            .and(body_partial_json(json!({
                "WebACLArn": ACL_ARN,
                "ResourceType": "APPLICATION_LOAD_BALANCER"
            })))
            .respond_with(respond(json!({ "ResourceArns": ["alb-1", "alb-2"] })))
            .expect(1)
            .mount(&server)
            .await;

        let resources = web_acls(&server).list_resources(ACL_ARN).await.unwrap();

        assert_eq!(vec![String::from("alb-1"), String::from("alb-2")], resources);
    }

    #[tokio::test]
    async fn detached_resource_is_reported_as_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(operation("DisassociateWebACL"))
            .and(body_partial_json(json!({ "ResourceArn": "alb-1" })))
            .respond_with(ResponseTemplate::new(400).set_body_raw(
                json!({ "__type": "WAFNonexistentItemException", "Message": "gone" }).to_string(),
                "application/x-amz-json-1.1",
            ))
            .expect(1)
            .mount(&server)
            .await;

        let result = web_acls(&server).disassociate("alb-1").await;

        match result {
            Err(AwsError::NotFound(_)) => {}
            other => panic!("Expected `NotFound`, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn web_acl_without_lock_token_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(operation("GetWebACL"))
            .respond_with(respond(json!({
                "WebACL": {
                    "Name": "shop-acl",
                    "Id": "acl-id",
                    "ARN": ACL_ARN,
                    "DefaultAction": { "Allow": {} },
                    "VisibilityConfig": visibility("shop-acl")
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let result = web_acls(&server).get_web_acl(&shop_acl()).await;

        match result {
            Err(AwsError::Unknown(message)) => {
                assert!(message.contains("no lock token"), "{}", message)
            }
            other => panic!("Expected `Unknown`, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn rule_scrub_keeps_every_other_setting() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(operation("GetWebACL"))
            .and(body_partial_json(json!({
                "Name": "shop-acl",
                "Id": "acl-id",
                "Scope": "REGIONAL"
            })))
            .respond_with(respond(json!({
                "WebACL": {
                    "Name": "shop-acl",
                    "Id": "acl-id",
                    "ARN": ACL_ARN,
                    "DefaultAction": { "Allow": {} },
                    "Description": "storefront",
                    "Rules": [
                        rule_json("stack-rules", 0, "rg-1"),
                        rule_json("shared-rules", 1, "rg-2")
                    ],
                    "VisibilityConfig": visibility("shop-acl"),
                    "Capacity": 50,
                    "DataProtectionConfig": {
                        "DataProtections": [{
                            "Field": { "FieldType": "SINGLE_HEADER", "FieldKeys": ["x-api-key"] },
                            "Action": "SUBSTITUTION"
                        }]
                    },
                    "CaptchaConfig": { "ImmunityTimeProperty": { "ImmunityTime": 300 } },
                    "TokenDomains": ["shop.example.com"],
                    "OnSourceDDoSProtectionConfig": { "ALBLowReputationMode": "ACTIVE_UNDER_DDOS" },
                    "ApplicationConfig": {
                        "Attributes": [{ "Name": "team", "Values": ["storefront"] }]
                    }
                },
                "LockToken": "lock-1"
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(operation("UpdateWebACL"))
            .respond_with(respond(json!({ "NextLockToken": "lock-2" })))
            .expect(1)
            .mount(&server)
            .await;

        let api = web_acls(&server);
        let changed = remove_rule_group_references(&api, &shop_acl(), "rg-1")
            .await
            .unwrap();
        assert!(changed);

        let requests = server.received_requests().await.unwrap();
        let update = requests
            .iter()
            .find(|request| {
                request
                    .headers
                    .get("x-amz-target")
                    .map_or(false, |value| value == "AWSWAF_20190729.UpdateWebACL")
            })
            .unwrap();
        let body: Value = serde_json::from_slice(&update.body).unwrap();

        assert_eq!("lock-1", body["LockToken"]);
        assert_eq!("REGIONAL", body["Scope"]);
        assert_eq!(1, body["Rules"].as_array().unwrap().len());
        assert_eq!("shared-rules", body["Rules"][0]["Name"]);
        assert_eq!(json!({ "Allow": {} }), body["DefaultAction"]);
        assert_eq!("storefront", body["Description"]);
        assert_eq!("shop-acl", body["VisibilityConfig"]["MetricName"]);
        assert_eq!(
            json!(["x-api-key"]),
            body["DataProtectionConfig"]["DataProtections"][0]["Field"]["FieldKeys"]
        );
        assert_eq!(300, body["CaptchaConfig"]["ImmunityTimeProperty"]["ImmunityTime"]);
        assert_eq!(json!(["shop.example.com"]), body["TokenDomains"]);
        assert_eq!(
            "ACTIVE_UNDER_DDOS",
            body["OnSourceDDoSProtectionConfig"]["ALBLowReputationMode"]
        );
        assert_eq!(
            json!(["storefront"]),
            body["ApplicationConfig"]["Attributes"][0]["Values"]
        );
    }

    #[tokio::test]
    async fn untouched_acl_is_not_written() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(operation("GetWebACL"))
            .respond_with(respond(json!({
                "WebACL": {
                    "Name": "shop-acl",
                    "Id": "acl-id",
                    "ARN": ACL_ARN,
                    "DefaultAction": { "Allow": {} },
                    "Rules": [rule_json("shared-rules", 1, "rg-2")],
                    "VisibilityConfig": visibility("shop-acl")
                },
                "LockToken": "lock-1"
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(operation("UpdateWebACL"))
            .respond_with(respond(json!({ "NextLockToken": "lock-2" })))
            .expect(0)
            .mount(&server)
            .await;

        let api = web_acls(&server);
        let changed = remove_rule_group_references(&api, &shop_acl(), "rg-1")
            .await
            .unwrap();

        assert!(!changed);
    }
}
