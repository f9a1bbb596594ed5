//! Telemetry orchestrator
//!
//! Three flavors of outbound state, all on the `agent.telemetry` exchange:
//! - periodic heartbeats (`heartbeat.<agentId>`)
//! - periodic full inventories (`inventory.<agentId>`), collected by the
//!   external `inventory.refresh` action
//! - an event-driven light refresh after each task, merged non-destructively
//!   by the control plane

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::actions::{ActionEnvelope, ActionInvoker};
use crate::broker::{BrokerSession, PublishOpts, TELEMETRY_EXCHANGE};
use crate::runtime::RuntimeContext;

const LIGHT_REFRESH_ACTION: &str = "inventory.refresh.light";
const FULL_REFRESH_ACTION: &str = "inventory.refresh";

pub struct Telemetry {
    agent_id: String,
    host: String,
    capabilities: Vec<String>,
    session: Arc<BrokerSession>,
    invoker: ActionInvoker,
    ctx: Arc<RuntimeContext>,
}

impl Telemetry {
    pub fn new(
        agent_id: &str,
        host: &str,
        capabilities: Vec<String>,
        session: Arc<BrokerSession>,
        invoker: ActionInvoker,
        ctx: Arc<RuntimeContext>,
    ) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            host: host.to_string(),
            capabilities,
            session,
            invoker,
            ctx,
        }
    }

    /// Publish a heartbeat every `every`, until shutdown.
    pub async fn run_heartbeat_ticker(
        self: Arc<Self>,
        every: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut tick = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = self.publish_heartbeat().await {
                        warn!("heartbeat error: {e:#}");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// Collect and publish a full inventory every `every`, until shutdown.
    pub async fn run_inventory_ticker(
        self: Arc<Self>,
        every: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut tick = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = self.publish_full_inventory().await {
                        warn!("inventory error: {e:#}");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    async fn publish_heartbeat(&self) -> Result<()> {
        let body = heartbeat_envelope(&self.agent_id, &self.host, &self.capabilities);
        let routing_key = format!("heartbeat.{}", self.agent_id);
        self.session
            .publish(
                TELEMETRY_EXCHANGE,
                &routing_key,
                &serde_json::to_vec(&body).context("serialize heartbeat")?,
                &PublishOpts::default(),
            )
            .await?;
        debug!("heartbeat sent");
        Ok(())
    }

    async fn publish_full_inventory(&self) -> Result<()> {
        let inventory = collect_inventory(&self.invoker, &self.ctx).await?;
        let body = full_inventory_envelope(&self.agent_id, inventory);
        let routing_key = format!("inventory.{}", self.agent_id);
        self.session
            .publish(
                TELEMETRY_EXCHANGE,
                &routing_key,
                &serde_json::to_vec(&body).context("serialize inventory")?,
                &PublishOpts::default(),
            )
            .await?;
        debug!("full inventory published");
        Ok(())
    }

    /// Post-task hook: one light refresh per completed task, on its own
    /// worker so the consume loop never waits on it.
    pub fn spawn_light_refresh(self: Arc<Self>) {
        tokio::spawn(async move {
            if let Err(e) = self.light_refresh().await {
                warn!("inventory light error: {e:#}");
            }
        });
    }

    async fn light_refresh(&self) -> Result<()> {
        let payload = json!({
            "basePath": self.ctx.base_path,
            "datastores": self.ctx.datastores_value(),
            "__ctx": {
                "agentId": self.ctx.agent_id,
                "basePath": self.ctx.base_path,
                "datastores": self.ctx.datastores_value(),
            },
        });
        let output = self.invoker.run(LIGHT_REFRESH_ACTION, &payload).await?;

        // A success envelope with an actual result merges non-destructively;
        // anything else goes up raw for the control plane to inspect.
        let (inventory, merge_mode) = match ActionEnvelope::parse_success(&output.stdout) {
            Some(envelope) if !envelope.result.is_null() => {
                (envelope.result, "patch-nondestructive")
            }
            _ => (raw_value(&output.stdout), "raw"),
        };

        let body = meta_inventory_envelope(
            &self.agent_id,
            LIGHT_REFRESH_ACTION,
            merge_mode,
            inventory,
        );
        let opts = PublishOpts {
            correlation_id: None,
            headers: vec![
                ("x-source".to_string(), LIGHT_REFRESH_ACTION.to_string()),
                ("x-merge-mode".to_string(), merge_mode.to_string()),
                ("x-agent-id".to_string(), self.agent_id.clone()),
            ],
        };
        let routing_key = format!("inventory.{}", self.agent_id);
        self.session
            .publish(
                TELEMETRY_EXCHANGE,
                &routing_key,
                &serde_json::to_vec(&body).context("serialize light inventory")?,
                &opts,
            )
            .await?;
        debug!("light inventory published");
        Ok(())
    }
}

/// Run `inventory.refresh` and return the inventory body: the unwrapped
/// `result` of a success envelope, or whatever the script printed.
pub async fn collect_inventory(invoker: &ActionInvoker, ctx: &RuntimeContext) -> Result<Value> {
    let payload = json!({
        "basePath": ctx.base_path,
        "datastores": ctx.datastores_value(),
    });
    let output = invoker.run(FULL_REFRESH_ACTION, &payload).await?;
    if let Some(err) = output.error {
        anyhow::bail!("inventory collect failed: {err}");
    }
    match ActionEnvelope::parse_success(&output.stdout) {
        Some(envelope) => Ok(envelope.result),
        None => Ok(raw_value(&output.stdout)),
    }
}

/// Script stdout as a JSON value: parsed when it is JSON, wrapped as a
/// string otherwise.
fn raw_value(stdout: &[u8]) -> Value {
    serde_json::from_slice(stdout)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(stdout).into_owned()))
}

pub fn heartbeat_envelope(agent_id: &str, host: &str, capabilities: &[String]) -> Value {
    json!({
        "version": env!("CARGO_PKG_VERSION"),
        "agentId": agent_id,
        "host": host,
        "ts": now_rfc3339(),
        "capabilities": capabilities,
    })
}

pub fn full_inventory_envelope(agent_id: &str, inventory: Value) -> Value {
    json!({
        "agentId": agent_id,
        "ts": now_rfc3339(),
        "inventory": inventory,
    })
}

pub fn meta_inventory_envelope(
    agent_id: &str,
    source: &str,
    merge_mode: &str,
    inventory: Value,
) -> Value {
    json!({
        "agentId": agent_id,
        "ts": now_rfc3339(),
        "source": source,
        "mergeMode": merge_mode,
        "inventory": inventory,
    })
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}
