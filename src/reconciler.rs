//! The pre-deletion cleanup pipeline.
//!
//! Steps run strictly in order and each one absorbs its own failures into a
//! [`StepOutcome`]. The pass as a whole always acknowledges success: a stuck
//! stack is worse than an auxiliary resource left behind.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::ReconcilerConfig;
use crate::error::AwsError;
use crate::event::TeardownRequest;
use crate::session::{AccountApis, AccountConnector};
use crate::waf::{self, WebAclApi, WebAclSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Status {
    #[serde(rename = "SUCCESS")]
    Success,
    #[serde(rename = "FAILED")]
    Failure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    AssumeRole,
    InspectCompliance,
    DeletePolicy,
    DisassociateHome,
    DisassociateTarget,
    ScrubTarget,
    ScrubHome,
    FinalSettle,
}

impl Step {
    pub fn number(self) -> u8 {
        self as u8 + 1
    }

    pub fn name(self) -> &'static str {
        match self {
            Step::AssumeRole => "assume-role",
            Step::InspectCompliance => "inspect-compliance",
            Step::DeletePolicy => "delete-policy",
            Step::DisassociateHome => "disassociate-home",
            Step::DisassociateTarget => "disassociate-target",
            Step::ScrubTarget => "scrub-target",
            Step::ScrubHome => "scrub-home",
            Step::FinalSettle => "final-settle",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.number(), self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Ok(String),
    Skipped(String),
    Failed(String),
}

impl StepOutcome {
    #[cfg(test)]
    pub(crate) fn is_ok(&self) -> bool {
        matches!(self, StepOutcome::Ok(_))
    }

    #[cfg(test)]
    pub(crate) fn is_skipped(&self) -> bool {
        matches!(self, StepOutcome::Skipped(_))
    }

    #[cfg(test)]
    pub(crate) fn is_failed(&self) -> bool {
        matches!(self, StepOutcome::Failed(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            StepOutcome::Ok(_) => "ok",
            StepOutcome::Skipped(_) => "skipped",
            StepOutcome::Failed(_) => "failed",
        }
    }

    pub fn detail(&self) -> &str {
        match self {
            StepOutcome::Ok(detail) | StepOutcome::Skipped(detail) | StepOutcome::Failed(detail) => {
                detail
            }
        }
    }
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.label(), self.detail())
    }
}

/// What each step of one pass did, in execution order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconciliationReport {
    steps: Vec<(Step, StepOutcome)>,
}

impl ReconciliationReport {
    pub fn record(&mut self, step: Step, outcome: StepOutcome) {
        match &outcome {
            StepOutcome::Ok(detail) => info!(step = %step, detail = %detail, "Step completed"),
            StepOutcome::Skipped(detail) => info!(step = %step, detail = %detail, "Step skipped"),
            StepOutcome::Failed(detail) => {
                warn!(step = %step, detail = %detail, "Step failed, continuing cleanup")
            }
        }

        self.steps.push((step, outcome));
    }

    pub fn steps(&self) -> &[(Step, StepOutcome)] {
        &self.steps
    }

    pub fn outcome(&self, step: Step) -> Option<&StepOutcome> {
        self.steps
            .iter()
            .find(|(recorded, _)| *recorded == step)
            .map(|(_, outcome)| outcome)
    }

    pub fn summary(&self) -> String {
        self.steps
            .iter()
            .map(|(step, outcome)| format!("{} {}", step, outcome))
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// Step counts returned to CloudFormation as the resource's attributes.
    pub fn data(&self) -> BTreeMap<String, String> {
        let count = |label: &str| {
            self.steps
                .iter()
                .filter(|(_, outcome)| outcome.label() == label)
                .count()
                .to_string()
        };

        BTreeMap::from([
            (String::from("StepsSucceeded"), count("ok")),
            (String::from("StepsSkipped"), count("skipped")),
            (String::from("StepsFailed"), count("failed")),
        ])
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconciliationOutcome {
    pub status: Status,
    pub reason: String,
    pub report: ReconciliationReport,
}

impl ReconciliationOutcome {
    pub fn success(reason: String, report: ReconciliationReport) -> Self {
        Self {
            status: Status::Success,
            reason,
            report,
        }
    }

    /// Outcome of a pass that ran to the end.
    pub fn completed(request: &TeardownRequest, report: ReconciliationReport) -> Self {
        if !request.is_delete() {
            return Self::success(
                format!("No cleanup required for {:?} request", request.request_type),
                report,
            );
        }

        Self::success(report.summary(), report)
    }

    /// Outcome of a pass cut short at `deadline`; the steps that finished
    /// before it stay in the report.
    pub fn interrupted(deadline: Duration, report: ReconciliationReport) -> Self {
        let note = format!("cleanup stopped after its {}s deadline", deadline.as_secs());
        let reason = if report.steps().is_empty() {
            note
        } else {
            format!("{}; {}", report.summary(), note)
        };

        Self::success(reason, report)
    }
}

#[derive(Default)]
struct Tally {
    changed: usize,
    failures: Vec<String>,
}

impl Tally {
    fn absorb(&mut self, other: Tally) {
        self.changed += other.changed;
        self.failures.extend(other.failures);
    }

    fn into_outcome(self, detail: String) -> StepOutcome {
        if self.failures.is_empty() {
            return StepOutcome::Ok(detail);
        }

        StepOutcome::Failed(format!(
            "{}; {} failed: {}",
            detail,
            self.failures.len(),
            self.failures.join(", ")
        ))
    }
}

pub struct Reconciler {
    config: ReconcilerConfig,
    home: AccountApis,
    connector: Box<dyn AccountConnector>,
}

impl Reconciler {
    pub fn new(
        config: ReconcilerConfig,
        home: AccountApis,
        connector: Box<dyn AccountConnector>,
    ) -> Self {
        Self {
            config,
            home,
            connector,
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    pub async fn reconcile(&self, request: &TeardownRequest) -> ReconciliationOutcome {
        let mut report = ReconciliationReport::default();
        self.reconcile_into(request, &mut report).await;

        ReconciliationOutcome::completed(request, report)
    }

    /// Runs the pass, recording each step into `report` as soon as it ends so
    /// a caller that abandons the pass keeps what already happened.
    pub async fn reconcile_into(
        &self,
        request: &TeardownRequest,
        report: &mut ReconciliationReport,
    ) {
        if !request.is_delete() {
            info!(request_type = ?request.request_type, "No cleanup required");
            return;
        }

        info!(
            policy_id = ?request.policy_id,
            rule_group_arn = ?request.rule_group_arn,
            web_acl_arn = ?request.web_acl_arn,
            target_account = ?request.target_account,
            "Starting pre-deletion cleanup"
        );

        let (target, outcome) = self.acquire_session(request).await;
        report.record(Step::AssumeRole, outcome);

        let outcome = self.inspect_compliance(request, target.as_ref()).await;
        report.record(Step::InspectCompliance, outcome);

        let outcome = self.delete_policy(request).await;
        report.record(Step::DeletePolicy, outcome);

        let outcome = self.disassociate_home(request).await;
        report.record(Step::DisassociateHome, outcome);

        let (target_acls, outcome) = self.disassociate_target(request, target.as_ref()).await;
        report.record(Step::DisassociateTarget, outcome);

        let outcome = self
            .scrub_target(request, target.as_ref(), target_acls.as_deref())
            .await;
        report.record(Step::ScrubTarget, outcome);

        let outcome = self.scrub_home(request).await;
        report.record(Step::ScrubHome, outcome);

        settle("all operations", self.config.final_settle()).await;
        report.record(
            Step::FinalSettle,
            StepOutcome::Ok(format!("waited {}s", self.config.final_settle_seconds)),
        );
    }

    async fn acquire_session(
        &self,
        request: &TeardownRequest,
    ) -> (Option<AccountApis>, StepOutcome) {
        let account = match &request.target_account {
            Some(account) => account,
            None => return (None, StepOutcome::Skipped(String::from("no target account"))),
        };

        info!(
            account = %account,
            role_arn = %self.config.role_arn(account),
            "Assuming role in target account"
        );

        match self.connector.connect(account).await {
            Ok(apis) => (
                Some(apis),
                StepOutcome::Ok(format!("session for account {}", account)),
            ),
            Err(error) => {
                warn!(
                    account = %account,
                    error = %error,
                    "Will continue with cleanup in management account only"
                );
                (None, StepOutcome::Failed(error.to_string()))
            }
        }
    }

    // Diagnostic only: member-account resources are logged, not detached.
    async fn inspect_compliance(
        &self,
        request: &TeardownRequest,
        target: Option<&AccountApis>,
    ) -> StepOutcome {
        let (policy_id, target) = match (&request.policy_id, target) {
            (Some(policy_id), Some(target)) => (policy_id, target),
            (None, _) => return StepOutcome::Skipped(String::from("no policy id")),
            (_, None) => return StepOutcome::Skipped(String::from("no cross-account session")),
        };

        let policy = match target.policies.get_policy(policy_id).await {
            Ok(policy) => policy,
            Err(error) => return StepOutcome::Failed(format!("reading policy: {}", error)),
        };
        info!(
            policy_id = %policy.policy_id,
            policy_name = %policy.policy_name,
            resource_type = %policy.resource_type,
            remediation_enabled = policy.remediation_enabled,
            "Policy details retrieved"
        );

        let entries = match target
            .policies
            .list_compliance_status(policy_id, self.config.compliance_page_size)
            .await
        {
            Ok(entries) => entries,
            Err(error) => {
                return StepOutcome::Failed(format!("listing compliance status: {}", error))
            }
        };

        for entry in &entries {
            info!(
                member_account = ?entry.member_account,
                evaluations = entry.evaluations,
                non_compliant = entry.non_compliant,
                "Member account covered by policy"
            );
        }

        StepOutcome::Ok(format!("{} compliance entries", entries.len()))
    }

    async fn delete_policy(&self, request: &TeardownRequest) -> StepOutcome {
        let policy_id = match &request.policy_id {
            Some(policy_id) => policy_id,
            None => return StepOutcome::Skipped(String::from("no policy id")),
        };

        info!(policy_id = %policy_id, "Deleting Firewall Manager policy");
        match self.home.policies.delete_policy(policy_id).await {
            Ok(()) => {
                settle("policy deletion", self.config.policy_settle()).await;
                StepOutcome::Ok(format!("deleted policy {}", policy_id))
            }
            Err(error) if error.is_not_found() => {
                StepOutcome::Ok(format!("policy {} already deleted", policy_id))
            }
            Err(error) => StepOutcome::Failed(format!("deleting policy {}: {}", policy_id, error)),
        }
    }

    async fn disassociate_home(&self, request: &TeardownRequest) -> StepOutcome {
        let web_acl_arn = match &request.web_acl_arn {
            Some(web_acl_arn) => web_acl_arn,
            None => return StepOutcome::Skipped(String::from("no web ACL")),
        };

        info!(web_acl = %web_acl_arn, "Processing web ACL in management account");
        let tally = match disassociate_all(self.home.web_acls.as_ref(), web_acl_arn).await {
            Ok(tally) => tally,
            Err(error) => {
                return StepOutcome::Failed(format!("listing associated resources: {}", error))
            }
        };

        if tally.changed > 0 {
            settle("disassociations", self.config.disassociation_settle()).await;
        }

        let detail = format!("disassociated {} resources", tally.changed);
        tally.into_outcome(detail)
    }

    async fn disassociate_target(
        &self,
        request: &TeardownRequest,
        target: Option<&AccountApis>,
    ) -> (Option<Vec<WebAclSummary>>, StepOutcome) {
        let target = match target {
            Some(target) => target,
            None => {
                return (
                    None,
                    StepOutcome::Skipped(String::from("no cross-account session")),
                )
            }
        };
        if request.web_acl_arn.is_none() {
            return (None, StepOutcome::Skipped(String::from("no web ACL")));
        }

        let acls = match target
            .web_acls
            .list_web_acls(self.config.web_acl_page_size)
            .await
        {
            Ok(acls) => acls,
            Err(error) => {
                return (
                    None,
                    StepOutcome::Failed(format!("listing web ACLs in target account: {}", error)),
                )
            }
        };
        info!(count = acls.len(), "Found web ACLs in target account");

        let mut tally = Tally::default();
        for acl in &acls {
            match disassociate_all(target.web_acls.as_ref(), &acl.arn).await {
                Ok(acl_tally) => tally.absorb(acl_tally),
                Err(error) => {
                    warn!(
                        web_acl = %acl.name,
                        error = %error,
                        "Error checking resource associations in target account"
                    );
                    tally.failures.push(format!("{}: {}", acl.name, error));
                }
            }
        }

        if tally.changed > 0 {
            settle(
                "target account disassociations",
                self.config.disassociation_settle(),
            )
            .await;
        }

        let detail = format!(
            "disassociated {} resources across {} web ACLs",
            tally.changed,
            acls.len()
        );
        (Some(acls), tally.into_outcome(detail))
    }

    async fn scrub_target(
        &self,
        request: &TeardownRequest,
        target: Option<&AccountApis>,
        acls: Option<&[WebAclSummary]>,
    ) -> StepOutcome {
        let rule_group_arn = match &request.rule_group_arn {
            Some(rule_group_arn) => rule_group_arn,
            None => return StepOutcome::Skipped(String::from("no rule group")),
        };
        let (target, acls) = match (target, acls) {
            (Some(target), Some(acls)) => (target, acls),
            (None, _) => return StepOutcome::Skipped(String::from("no cross-account session")),
            (_, None) => {
                return StepOutcome::Skipped(String::from(
                    "web ACLs in target account were not enumerated",
                ))
            }
        };

        scrub_all(target.web_acls.as_ref(), acls, rule_group_arn).await
    }

    async fn scrub_home(&self, request: &TeardownRequest) -> StepOutcome {
        let rule_group_arn = match &request.rule_group_arn {
            Some(rule_group_arn) => rule_group_arn,
            None => return StepOutcome::Skipped(String::from("no rule group")),
        };

        info!(
            rule_group_arn = %rule_group_arn,
            "Checking management account web ACLs for rule group"
        );
        let acls = match self
            .home
            .web_acls
            .list_web_acls(self.config.web_acl_page_size)
            .await
        {
            Ok(acls) => acls,
            Err(error) => return StepOutcome::Failed(format!("listing web ACLs: {}", error)),
        };

        scrub_all(self.home.web_acls.as_ref(), &acls, rule_group_arn).await
    }
}

async fn settle(what: &str, delay: Duration) {
    info!(seconds = delay.as_secs(), "Waiting for {} to propagate", what);
    sleep(delay).await;
}

/// Detaches the ACL from every associated resource. A resource that is
/// already detached counts as done; other per-resource failures are tallied.
async fn disassociate_all(api: &dyn WebAclApi, web_acl_arn: &str) -> Result<Tally, AwsError> {
    let resources = api.list_resources(web_acl_arn).await?;

    let mut tally = Tally::default();
    for resource_arn in &resources {
        info!(
            resource_arn = %resource_arn,
            web_acl = %web_acl_arn,
            "Disassociating web ACL from resource"
        );
        match api.disassociate(resource_arn).await {
            Ok(()) => tally.changed += 1,
            Err(error) if error.is_not_found() => tally.changed += 1,
            Err(error) => {
                warn!(
                    resource_arn = %resource_arn,
                    error = %error,
                    "Failed to disassociate web ACL"
                );
                tally.failures.push(format!("{}: {}", resource_arn, error));
            }
        }
    }

    Ok(tally)
}

async fn scrub_all(
    api: &dyn WebAclApi,
    acls: &[WebAclSummary],
    rule_group_arn: &str,
) -> StepOutcome {
    let mut tally = Tally::default();

    for acl in acls {
        match waf::remove_rule_group_references(api, acl, rule_group_arn).await {
            Ok(true) => {
                info!(web_acl = %acl.name, "Removed rule group reference");
                tally.changed += 1;
            }
            Ok(false) => {}
            Err(error) => {
                warn!(
                    web_acl = %acl.name,
                    error = %error,
                    "Error processing web ACL, continuing with the rest"
                );
                tally.failures.push(format!("{}: {}", acl.name, error));
            }
        }
    }

    let detail = format!("updated {} of {} web ACLs", tally.changed, acls.len());
    tally.into_outcome(detail)
}
