//! Task pipeline
//!
//! Each delivered job becomes exactly one published result envelope, with at
//! most one script invocation in between. Poison bodies and misrouted tasks
//! are disposed of without ever reaching a script.

use std::sync::Arc;

use anyhow::Result;
use chrono::{SecondsFormat, Utc};
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicNackOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::actions::{ActionEnvelope, ActionInvoker, ActionOutput};
use crate::broker::{BrokerSession, PublishOpts, RESULTS_EXCHANGE};
use crate::runtime::RuntimeContext;

/// A work item dequeued from the `jobs` exchange.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Task {
    pub task_id: String,
    pub agent_id: String,
    pub action: String,
    pub tenant_id: String,
    pub data: Map<String, Value>,
    pub reply_to: String,
    pub correlation_id: String,
    pub attempt: u32,
    pub max_attempts: u32,
}

impl Task {
    /// Correlation id echoed on the result: the task's own when set, else
    /// the task id.
    pub fn correlation(&self) -> &str {
        if self.correlation_id.is_empty() {
            &self.task_id
        } else {
            &self.correlation_id
        }
    }
}

/// The canonical shape published for every task.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultEnvelope {
    pub task_id: String,
    pub agent_id: String,
    pub ok: bool,
    pub result: Value,
    pub error: String,
    pub finished_at: String,
}

/// Hook fired after each result publication (light inventory refresh). Must
/// not block; implementations spawn their own worker.
pub type AfterResult = Arc<dyn Fn(Task) + Send + Sync>;

pub struct TaskPipeline {
    agent_id: String,
    session: Arc<BrokerSession>,
    invoker: ActionInvoker,
    ctx: Arc<RuntimeContext>,
    after_result: Option<AfterResult>,
}

impl TaskPipeline {
    pub fn new(
        agent_id: &str,
        session: Arc<BrokerSession>,
        invoker: ActionInvoker,
        ctx: Arc<RuntimeContext>,
        after_result: Option<AfterResult>,
    ) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            session,
            invoker,
            ctx,
            after_result,
        }
    }

    /// Process one delivery end to end: decode, dispatch, publish, ack.
    pub async fn handle_delivery(&self, delivery: Delivery) {
        let task = match decode_task(&delivery.data, &self.agent_id) {
            Decoded::Task(task) => task,
            Decoded::Poison(e) => {
                warn!("invalid task JSON: {e}");
                nack_drop(&delivery).await;
                return;
            }
            Decoded::Misrouted { target } => {
                // Defense against a misbound queue; not our work, drop it.
                info!("ignoring task for {target}");
                ack(&delivery).await;
                return;
            }
        };

        info!(task_id = %task.task_id, action = %task.action, "task received");

        let mut data = task.data.clone();
        data.insert("__ctx".to_string(), self.ctx.to_ctx_value());
        let outcome = self.invoker.run(&task.action, &Value::Object(data)).await;

        let (result, handler_err) = interpret_outcome(outcome);
        let ok = handler_err.is_none();
        if let Some(err) = &handler_err {
            warn!(
                task_id = %task.task_id,
                action = %task.action,
                "handler error: {err}"
            );
        }

        let envelope = build_envelope(&self.agent_id, &task, result, handler_err);
        self.publish_result(&task, &envelope).await;

        // Result publication precedes the acknowledgement and the hook.
        if ok {
            ack(&delivery).await;
        } else {
            nack_drop(&delivery).await;
        }

        if let Some(hook) = &self.after_result {
            hook(task);
        }
    }

    async fn publish_result(&self, task: &Task, envelope: &ResultEnvelope) {
        let body = match serde_json::to_vec(envelope) {
            Ok(body) => body,
            Err(e) => {
                warn!("serialize result envelope: {e}");
                return;
            }
        };
        let opts = PublishOpts {
            correlation_id: Some(task.correlation().to_string()),
            headers: Vec::new(),
        };
        let routing_key = format!("task.{}", task.task_id);
        if let Err(e) = self
            .session
            .publish(RESULTS_EXCHANGE, &routing_key, &body, &opts)
            .await
        {
            warn!("publish result failed: {e:#}");
        }

        if !task.reply_to.is_empty() {
            if let Err(e) = self.publish_reply(task, &body, &opts).await {
                warn!("publish result to replyTo failed: {e:#}");
            }
        }
    }

    /// Private reply convention: declare the caller's queue durable on the
    /// fly and publish the same envelope to the default exchange.
    async fn publish_reply(&self, task: &Task, body: &[u8], opts: &PublishOpts) -> Result<()> {
        let channel = self.session.ensure_channel().await?;
        channel
            .queue_declare(
                &task.reply_to,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        self.session.publish("", &task.reply_to, body, opts).await
    }
}

enum Decoded {
    Task(Task),
    Poison(serde_json::Error),
    Misrouted { target: String },
}

/// Decode a delivery body, rejecting poison and tasks bound for another
/// agent. An empty `agentId` on the task means "whoever consumes this".
fn decode_task(body: &[u8], agent_id: &str) -> Decoded {
    let task: Task = match serde_json::from_slice(body) {
        Ok(task) => task,
        Err(e) => return Decoded::Poison(e),
    };
    if !task.agent_id.is_empty() && task.agent_id != agent_id {
        return Decoded::Misrouted {
            target: task.agent_id,
        };
    }
    Decoded::Task(task)
}

/// Convert the invoker outcome into the envelope's `result` value and the
/// handler error. A `{ok:true, result:R}` success envelope unwraps to `R`;
/// any other valid JSON passes through untouched; non-JSON is wrapped as
/// `{ok, raw}`.
fn interpret_outcome(outcome: Result<ActionOutput>) -> (Value, Option<String>) {
    match outcome {
        Ok(output) => {
            let handler_err = output.error.clone();
            if let Some(envelope) = ActionEnvelope::parse_success(&output.stdout) {
                return (envelope.result, handler_err);
            }
            match serde_json::from_slice::<Value>(&output.stdout) {
                Ok(parsed) => (parsed, handler_err),
                Err(_) => {
                    let raw = String::from_utf8_lossy(&output.stdout).into_owned();
                    (json!({ "ok": output.ok(), "raw": raw }), handler_err)
                }
            }
        }
        Err(e) => (json!({ "ok": false, "raw": "" }), Some(format!("{e:#}"))),
    }
}

fn build_envelope(
    agent_id: &str,
    task: &Task,
    result: Value,
    handler_err: Option<String>,
) -> ResultEnvelope {
    // Error precedence: what the script reported, then the handler failure.
    let mut error = result
        .get("error")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if error.is_empty() {
        error = handler_err.clone().unwrap_or_default();
    }
    ResultEnvelope {
        task_id: task.task_id.clone(),
        agent_id: agent_id.to_string(),
        ok: handler_err.is_none(),
        result,
        error,
        finished_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    }
}

async fn ack(delivery: &Delivery) {
    if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
        warn!("ack failed: {e}");
    }
}

async fn nack_drop(delivery: &Delivery) {
    let opts = BasicNackOptions {
        requeue: false,
        ..Default::default()
    };
    if let Err(e) = delivery.nack(opts).await {
        warn!("nack failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use openhvx_devkit::{
        assert_json_subset, failure_stdout, success_stdout, task_json, task_json_with_data,
    };

    fn sample_task() -> Task {
        serde_json::from_value(task_json("T1", "HOST-A", "vm.power")).unwrap()
    }

    #[test]
    fn decode_accepts_own_and_unaddressed_tasks() {
        let own = serde_json::to_vec(&task_json_with_data(
            "T1",
            "HOST-A",
            "vm.power",
            json!({"guid": "G", "state": "on"}),
        ))
        .unwrap();
        match decode_task(&own, "HOST-A") {
            Decoded::Task(task) => assert_eq!(task.data["state"], "on"),
            _ => panic!("expected task"),
        }

        let unaddressed = br#"{"taskId":"T2","action":"vm.power"}"#;
        assert!(matches!(decode_task(unaddressed, "HOST-A"), Decoded::Task(_)));
    }

    #[test]
    fn decode_drops_misrouted() {
        let body = serde_json::to_vec(&task_json("T2", "HOST-B", "x")).unwrap();
        match decode_task(&body, "HOST-A") {
            Decoded::Misrouted { target } => assert_eq!(target, "HOST-B"),
            _ => panic!("expected misrouted"),
        }
    }

    #[test]
    fn decode_flags_poison() {
        assert!(matches!(decode_task(b"not json", "HOST-A"), Decoded::Poison(_)));
    }

    #[test]
    fn correlation_falls_back_to_task_id() {
        let mut task = sample_task();
        assert_eq!(task.correlation(), "T1");
        task.correlation_id = "corr-9".to_string();
        assert_eq!(task.correlation(), "corr-9");
    }

    #[test]
    fn happy_path_envelope() {
        let task = sample_task();
        let (result, err) = interpret_outcome(Ok(ActionOutput {
            stdout: success_stdout(json!({"vm": {"state": "Running"}})),
            error: None,
        }));
        let envelope = build_envelope("HOST-A", &task, result, err);

        assert!(envelope.ok);
        assert_eq!(envelope.error, "");
        // The success envelope is unwrapped to its inner result.
        assert_eq!(envelope.result["vm"]["state"], "Running");
        assert_eq!(envelope.task_id, "T1");
        // RFC3339 UTC timestamp.
        assert!(envelope.finished_at.ends_with('Z'));
    }

    #[test]
    fn script_failure_takes_script_error_text() {
        let task = sample_task();
        let (result, err) = interpret_outcome(Ok(ActionOutput {
            stdout: failure_stdout("VM not found"),
            error: Some("action script failed".to_string()),
        }));
        let envelope = build_envelope("HOST-A", &task, result, err);

        assert!(!envelope.ok);
        assert_eq!(envelope.error, "VM not found");
    }

    #[test]
    fn script_failure_without_error_field_uses_handler_error() {
        let task = sample_task();
        let (result, err) = interpret_outcome(Ok(ActionOutput {
            stdout: b"{\"partial\":true}".to_vec(),
            error: Some("action script failed".to_string()),
        }));
        let envelope = build_envelope("HOST-A", &task, result, err);

        assert!(!envelope.ok);
        assert_eq!(envelope.error, "action script failed");
        assert_eq!(envelope.result["partial"], true);
    }

    #[test]
    fn non_json_stdout_wraps_raw() {
        let task = sample_task();
        let (result, err) = interpret_outcome(Ok(ActionOutput {
            stdout: b"plain text output".to_vec(),
            error: None,
        }));
        let envelope = build_envelope("HOST-A", &task, result, err);

        assert!(envelope.ok);
        assert_eq!(envelope.result["raw"], "plain text output");
        assert_eq!(envelope.result["ok"], true);
    }

    #[test]
    fn crash_without_stdout_keeps_stderr_error() {
        let task = sample_task();
        let (result, err) = interpret_outcome(Ok(ActionOutput {
            stdout: Vec::new(),
            error: Some("script blew up".to_string()),
        }));
        let envelope = build_envelope("HOST-A", &task, result, err);

        assert!(!envelope.ok);
        assert_eq!(envelope.error, "script blew up");
        assert_eq!(envelope.result["raw"], "");
        assert_eq!(envelope.result["ok"], false);
    }

    #[test]
    fn invoker_failure_becomes_empty_raw() {
        let task = sample_task();
        let (result, err) = interpret_outcome(Err(anyhow!("script not found: x.ps1")));
        let envelope = build_envelope("HOST-A", &task, result, err);

        assert!(!envelope.ok);
        assert!(envelope.error.contains("script not found"));
        assert_eq!(envelope.result["raw"], "");
    }

    #[test]
    fn envelope_wire_shape_is_camel_case() {
        let task = sample_task();
        let envelope = build_envelope("HOST-A", &task, json!({}), None);
        let v = serde_json::to_value(&envelope).unwrap();
        for key in ["taskId", "agentId", "ok", "result", "error", "finishedAt"] {
            assert!(v.get(key).is_some(), "missing {key}");
        }
        assert_json_subset(
            &json!({"taskId": "T1", "agentId": "HOST-A", "ok": true, "error": ""}),
            &v,
        );
    }
}
