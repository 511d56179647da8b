//! Lambda glue: custom-resource event in, cleanup pass, callback out.

use lambda_runtime::LambdaEvent;
use serde_json::Value;
use tokio::time::timeout;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::event::{self, CorrelationIds, TeardownRequest};
use crate::reconciler::{ReconciliationOutcome, ReconciliationReport, Reconciler};
use crate::response::{CallbackBody, CallbackClient};

pub struct Handler {
    reconciler: Reconciler,
    callback: CallbackClient,
    log_stream: Option<String>,
}

impl Handler {
    pub fn new(reconciler: Reconciler, callback: CallbackClient, log_stream: Option<String>) -> Self {
        Self {
            reconciler,
            callback,
            log_stream,
        }
    }

    pub async fn handle(&self, event: LambdaEvent<Value>) -> Result<Value, lambda_runtime::Error> {
        let (payload, context) = event.into_parts();
        let span = info_span!("teardown", invocation_id = %context.request_id);

        Ok(self.process(payload).instrument(span).await)
    }

    /// Runs one invocation to completion and returns the body that was sent
    /// to CloudFormation. Never fails: every path ends in a SUCCESS callback
    /// when there is somewhere to send it.
    pub async fn process(&self, payload: Value) -> Value {
        debug!(event = %payload, "Received custom resource event");

        let request = match event::parse(payload.clone()) {
            Ok(request) => request,
            Err(err) => return self.acknowledge_malformed(&payload, err).await,
        };

        info!(
            request_type = ?request.request_type,
            request_id = %request.correlation_ids.request_id,
            logical_resource_id = %request.correlation_ids.logical_resource_id,
            "Processing custom resource event"
        );

        let deadline = self.reconciler.config().reconcile_deadline();
        let mut report = ReconciliationReport::default();
        let finished = timeout(deadline, self.reconciler.reconcile_into(&request, &mut report))
            .await
            .is_ok();

        let outcome = if finished {
            ReconciliationOutcome::completed(&request, report)
        } else {
            warn!(
                seconds = deadline.as_secs(),
                steps = report.steps().len(),
                "Cleanup did not finish before its deadline, acknowledging anyway"
            );
            ReconciliationOutcome::interrupted(deadline, report)
        };

        let physical_resource_id = self.physical_resource_id(&request);
        self.send(
            &request.callback_url,
            CallbackBody::new(
                &outcome,
                &request.correlation_ids,
                physical_resource_id,
                self.log_stream.as_deref(),
            ),
        )
        .await
    }

    async fn acknowledge_malformed(&self, payload: &Value, err: event::Error) -> Value {
        error!(error = %err, "Cannot process custom resource event");

        let (url, correlation_ids) = match event::callback_target(payload) {
            Some(target) => target,
            None => {
                error!("Event carries no ResponseURL, nothing to acknowledge");
                return Value::Null;
            }
        };

        let outcome = ReconciliationOutcome::success(err.to_string(), ReconciliationReport::default());
        let physical_resource_id = self.fallback_physical_id(&correlation_ids);
        self.send(
            &url,
            CallbackBody::new(
                &outcome,
                &correlation_ids,
                physical_resource_id,
                self.log_stream.as_deref(),
            ),
        )
        .await
    }

    async fn send(&self, url: &str, body: CallbackBody) -> Value {
        self.callback.deliver(url, &body).await;

        match serde_json::to_value(&body) {
            Ok(value) => value,
            Err(err) => {
                error!(error = %err, "Cannot render callback body");
                Value::Null
            }
        }
    }

    // Echoing the existing id keeps CloudFormation from treating an update
    // as a replacement.
    fn physical_resource_id(&self, request: &TeardownRequest) -> String {
        match &request.physical_resource_id {
            Some(id) => id.clone(),
            None => self.fallback_physical_id(&request.correlation_ids),
        }
    }

    fn fallback_physical_id(&self, correlation_ids: &CorrelationIds) -> String {
        match &self.log_stream {
            Some(stream) => stream.clone(),
            None => correlation_ids.logical_resource_id.clone(),
        }
    }
}
