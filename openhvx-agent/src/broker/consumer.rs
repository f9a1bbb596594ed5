//! Supervised task consumer
//!
//! The consume loop owns the queue side of the session: declare
//! `agent.<agentId>.tasks`, bind it to `jobs`, cap in-flight deliveries at
//! five, and hand each delivery to the task pipeline. When the channel dies
//! the supervisor re-ensures the session (unbounded, 3 s spacing) and starts
//! over; transient disconnects are invisible to the rest of the agent.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use lapin::options::{BasicConsumeOptions, BasicQosOptions, QueueBindOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::Channel;
use tokio::sync::watch;
use tracing::{info, warn};

use super::{is_fatal_declare, BrokerSession, JOBS_EXCHANGE};
use crate::tasks::TaskPipeline;

/// Unacknowledged deliveries allowed in flight. Small and explicit: this is
/// the only lever bounding work queued behind a slow hypervisor.
const PREFETCH: u16 = 5;

const RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Run the consume loop until shutdown. Only returns an error for fatal
/// conditions (an exchange declaration mismatch with a peer); everything
/// transient is retried forever.
pub async fn run_task_consumer(
    session: Arc<BrokerSession>,
    agent_id: String,
    pipeline: Arc<TaskPipeline>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let queue_name = format!("agent.{agent_id}.tasks");
    let consumer_tag = format!("agent-{agent_id}");

    loop {
        if *shutdown.borrow() {
            return Ok(());
        }
        let channel = match session.ensure_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                if is_fatal_declare(&e) {
                    return Err(e.context("exchange declaration rejected by broker"));
                }
                warn!("session ensure failed: {e:#}");
                if wait_or_shutdown(RECONNECT_DELAY, &mut shutdown).await {
                    return Ok(());
                }
                continue;
            }
        };

        match consume_until_closed(
            &channel,
            &queue_name,
            &consumer_tag,
            &agent_id,
            &pipeline,
            &mut shutdown,
        )
        .await
        {
            Ok(Stopped::Shutdown) => return Ok(()),
            Ok(Stopped::ChannelClosed) => {
                warn!("consumer stopped for {queue_name}, reconnecting");
            }
            Err(e) => {
                warn!("consume setup failed: {e:#}");
            }
        }
        session.reset().await;
        if wait_or_shutdown(RECONNECT_DELAY, &mut shutdown).await {
            return Ok(());
        }
    }
}

enum Stopped {
    ChannelClosed,
    Shutdown,
}

async fn consume_until_closed(
    channel: &Channel,
    queue_name: &str,
    consumer_tag: &str,
    agent_id: &str,
    pipeline: &TaskPipeline,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<Stopped> {
    channel
        .queue_declare(
            queue_name,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .with_context(|| format!("declare {queue_name}"))?;
    channel
        .queue_bind(
            queue_name,
            JOBS_EXCHANGE,
            agent_id,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .with_context(|| format!("bind {queue_name} to {JOBS_EXCHANGE}"))?;
    channel
        .basic_qos(PREFETCH, BasicQosOptions::default())
        .await
        .context("qos")?;

    let mut consumer = channel
        .basic_consume(
            queue_name,
            consumer_tag,
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
        .context("consume")?;

    info!("consuming {queue_name}");
    loop {
        tokio::select! {
            delivery = consumer.next() => match delivery {
                Some(Ok(delivery)) => pipeline.handle_delivery(delivery).await,
                Some(Err(e)) => {
                    warn!("delivery error: {e}");
                    return Ok(Stopped::ChannelClosed);
                }
                None => return Ok(Stopped::ChannelClosed),
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("consumer stopping for {queue_name}");
                    return Ok(Stopped::Shutdown);
                }
            }
        }
    }
}

/// Sleep `delay`, returning early (true) when shutdown trips meanwhile.
async fn wait_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => *shutdown.borrow(),
        _ = shutdown.changed() => *shutdown.borrow(),
    }
}
