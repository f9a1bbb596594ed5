//! Broker session
//!
//! One logical AMQP session shared by everything that publishes or consumes:
//! a single connection + channel pair behind a mutex, re-established lazily
//! whenever the transport drops. Every (re)connection redeclares the three
//! exchanges with identical parameters so a misconfigured peer fails loudly
//! instead of diverging.

pub mod consumer;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use lapin::options::{BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Tasks, routed directly by target agent id.
pub const JOBS_EXCHANGE: &str = "jobs";
/// Heartbeats (`heartbeat.<agentId>`) and inventories (`inventory.<agentId>`).
pub const TELEMETRY_EXCHANGE: &str = "agent.telemetry";
/// Task result envelopes (`task.<taskId>`).
pub const RESULTS_EXCHANGE: &str = "results";

const INIT_ATTEMPTS: usize = 3;
const RETRY_DELAY: Duration = Duration::from_secs(2);

/// Per-publish options; everything else (mandatory, persistent delivery,
/// JSON content type) is fixed by the wire contract.
#[derive(Debug, Default)]
pub struct PublishOpts {
    pub correlation_id: Option<String>,
    pub headers: Vec<(String, String)>,
}

struct Live {
    connection: Connection,
    channel: Channel,
}

/// The shared session. At most one connection and one channel are live;
/// connect/reset transitions are serialized by the mutex, while publishers
/// only hold it long enough to clone the channel handle out.
pub struct BrokerSession {
    url: String,
    state: Mutex<Option<Live>>,
}

impl BrokerSession {
    /// Store the URL and attempt a first connection, bounded retries.
    pub async fn connect(url: &str) -> Result<Arc<Self>> {
        if url.is_empty() {
            bail!("amqp url is empty");
        }
        let session = Arc::new(Self {
            url: url.to_string(),
            state: Mutex::new(None),
        });
        let mut last_err = None;
        for attempt in 1..=INIT_ATTEMPTS {
            match session.ensure_channel().await {
                Ok(_) => return Ok(session),
                Err(e) => {
                    warn!("broker connect failed (try {attempt}): {e:#}");
                    last_err = Some(e);
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("broker connect failed")))
            .with_context(|| format!("amqp init failed after {INIT_ATTEMPTS} attempts"))
    }

    /// The live channel, dialing a fresh connection if the pair is dead.
    pub async fn ensure_channel(&self) -> Result<Channel> {
        let mut state = self.state.lock().await;
        if let Some(live) = state.as_ref() {
            if live.connection.status().connected() && live.channel.status().connected() {
                return Ok(live.channel.clone());
            }
        }
        *state = None;

        let connection = Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .context("amqp dial")?;
        let channel = connection.create_channel().await.context("amqp channel")?;
        // Confirms make unroutable mandatory publishes visible on the
        // confirmation instead of vanishing.
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .context("confirm select")?;
        declare_exchanges(&channel).await?;
        info!("broker session ready");

        let handle = channel.clone();
        *state = Some(Live {
            connection,
            channel,
        });
        Ok(handle)
    }

    /// Publish JSON to an exchange: `mandatory`, persistent, retried through
    /// a session reset on connection-class failures (3 tries, 2 s apart).
    /// Other errors return verbatim. An unroutable return is logged, never
    /// retried.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        opts: &PublishOpts,
    ) -> Result<()> {
        let mut last_err: Option<anyhow::Error> = None;
        for _ in 0..3 {
            let channel = match self.ensure_channel().await {
                Ok(c) => c,
                Err(e) => {
                    last_err = Some(e);
                    tokio::time::sleep(RETRY_DELAY).await;
                    continue;
                }
            };
            match publish_once(&channel, exchange, routing_key, body, opts).await {
                Ok(()) => return Ok(()),
                Err(e) if is_transient(&e) => {
                    last_err = Some(e.into());
                    self.reset().await;
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("publish to {exchange} rk={routing_key}"))
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("publish failed")))
            .with_context(|| format!("publish to {exchange} rk={routing_key}"))
    }

    /// Drop the live pair, closing both ends best-effort.
    pub async fn reset(&self) {
        let live = self.state.lock().await.take();
        if let Some(live) = live {
            let _ = live.channel.close(200, "reset").await;
            let _ = live.connection.close(200, "reset").await;
        }
    }

    /// Best-effort shutdown.
    pub async fn close(&self) {
        let live = self.state.lock().await.take();
        if let Some(live) = live {
            let _ = live.channel.close(200, "shutting down").await;
            let _ = live.connection.close(200, "shutting down").await;
        }
        info!("broker session closed");
    }
}

/// Declared durable, non-auto-delete, non-internal, no arguments, on every
/// (re)connection. Parameters must match the peers byte for byte; the broker
/// rejects a mismatch and we surface that instead of papering over it.
async fn declare_exchanges(channel: &Channel) -> Result<()> {
    let durable = ExchangeDeclareOptions {
        durable: true,
        ..Default::default()
    };
    for (name, kind) in [
        (JOBS_EXCHANGE, ExchangeKind::Direct),
        (TELEMETRY_EXCHANGE, ExchangeKind::Topic),
        (RESULTS_EXCHANGE, ExchangeKind::Topic),
    ] {
        channel
            .exchange_declare(name, kind, durable, FieldTable::default())
            .await
            .with_context(|| format!("declare exchange {name}"))?;
    }
    Ok(())
}

async fn publish_once(
    channel: &Channel,
    exchange: &str,
    routing_key: &str,
    body: &[u8],
    opts: &PublishOpts,
) -> Result<(), lapin::Error> {
    let mut props = BasicProperties::default()
        .with_content_type("application/json".into())
        .with_delivery_mode(2);
    if let Some(corr) = &opts.correlation_id {
        props = props.with_correlation_id(corr.as_str().into());
    }
    if !opts.headers.is_empty() {
        let mut table = FieldTable::default();
        for (key, value) in &opts.headers {
            table.insert(key.as_str().into(), AMQPValue::LongString(value.as_str().into()));
        }
        props = props.with_headers(table);
    }

    let confirm = channel
        .basic_publish(
            exchange,
            routing_key,
            BasicPublishOptions {
                mandatory: true,
                immediate: false,
            },
            body,
            props,
        )
        .await?
        .await?;

    match confirm {
        // The broker accepted the message but no queue was bound for it.
        Confirmation::Ack(Some(_)) | Confirmation::Nack(Some(_)) => {
            warn!(
                exchange,
                routing_key,
                correlation_id = opts.correlation_id.as_deref().unwrap_or(""),
                "unroutable publish returned by broker"
            );
        }
        Confirmation::Nack(None) => {
            warn!(exchange, routing_key, "publish nacked by broker");
        }
        _ => {}
    }
    Ok(())
}

/// Connection-class failures worth a reset + retry; everything else (notably
/// protocol errors such as a declare mismatch) goes back to the caller.
fn is_transient(err: &lapin::Error) -> bool {
    matches!(
        err,
        lapin::Error::IOError(_)
            | lapin::Error::InvalidChannelState(_)
            | lapin::Error::InvalidConnectionState(_)
    )
}

/// True when `err` carries an AMQP protocol error anywhere in its chain,
/// which during declaration means a peer declared different parameters.
pub fn is_fatal_declare(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<lapin::Error>(),
            Some(lapin::Error::ProtocolError(_))
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        let io = lapin::Error::IOError(Arc::new(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        )));
        assert!(is_transient(&io));
    }

    #[test]
    fn fatal_declare_requires_protocol_error() {
        let plain = anyhow!("script not found");
        assert!(!is_fatal_declare(&plain));

        let io: anyhow::Error = lapin::Error::IOError(Arc::new(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "pipe",
        )))
        .into();
        assert!(!is_fatal_declare(&io.context("declare exchange jobs")));
    }

    #[test]
    fn publish_opts_default_is_bare() {
        let opts = PublishOpts::default();
        assert!(opts.correlation_id.is_none());
        assert!(opts.headers.is_empty());
    }
}
