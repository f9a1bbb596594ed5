//! Agent entry point: flags, dry-run probes, and the wiring of the broker
//! session, task pipeline and telemetry tickers.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use openhvx_agent::actions::ActionInvoker;
use openhvx_agent::broker::{consumer::run_task_consumer, BrokerSession};
use openhvx_agent::config::Config;
use openhvx_agent::datadirs::DataDirs;
use openhvx_agent::runtime::RuntimeContext;
use openhvx_agent::tasks::{AfterResult, TaskPipeline};
use openhvx_agent::telemetry::{collect_inventory, heartbeat_envelope, Telemetry};

#[derive(Debug, Parser)]
#[command(name = "openhvx-agent", about = "OpenHVX Hyper-V host agent")]
struct Cli {
    /// Path to the agent configuration file.
    #[arg(long, default_value = "config.json")]
    config: PathBuf,

    /// Collect one probe locally, print it to stdout and exit. No broker
    /// connection is made.
    #[arg(long)]
    dry_run: bool,

    /// Which probe to run in dry-run mode.
    #[arg(long = "modules", value_enum, default_value = "inventory")]
    module: DryRunModule,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DryRunModule {
    Inventory,
    Heartbeat,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = Config::load(&cli.config)?;

    if cli.dry_run {
        return dry_run(&cfg, cli.module).await;
    }
    run(cfg).await
}

async fn run(cfg: Config) -> Result<()> {
    // Managed tree first: scripts receive its layout through __ctx from the
    // very first task.
    let ctx = Arc::new(build_runtime_context(&cfg, true)?);
    let host = hostname::get()
        .context("resolve hostname")?
        .to_string_lossy()
        .into_owned();

    let session = BrokerSession::connect(&cfg.rabbitmq_url)
        .await
        .context("amqp init failed")?;

    let invoker = ActionInvoker::new(&cfg.script_root);
    let telemetry = Arc::new(Telemetry::new(
        &cfg.agent_id,
        &host,
        cfg.capabilities.clone(),
        session.clone(),
        invoker.clone(),
        ctx.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(
        telemetry
            .clone()
            .run_heartbeat_ticker(cfg.heartbeat_interval(), shutdown_rx.clone()),
    );
    tokio::spawn(
        telemetry
            .clone()
            .run_inventory_ticker(cfg.inventory_interval(), shutdown_rx.clone()),
    );

    let after_result: AfterResult = {
        let telemetry = telemetry.clone();
        Arc::new(move |_task| telemetry.clone().spawn_light_refresh())
    };
    let pipeline = Arc::new(TaskPipeline::new(
        &cfg.agent_id,
        session.clone(),
        invoker,
        ctx,
        Some(after_result),
    ));
    let mut consumer = tokio::spawn(run_task_consumer(
        session.clone(),
        cfg.agent_id.clone(),
        pipeline,
        shutdown_rx,
    ));

    info!(
        "started | agentId={} rmq={} hb={}s inv={}s",
        cfg.agent_id, cfg.rabbitmq_url, cfg.heartbeat_interval_sec, cfg.inventory_interval_sec
    );

    tokio::select! {
        _ = shutdown_signal() => {
            info!("shutting down...");
        }
        joined = &mut consumer => {
            // The consumer only exits on its own for fatal broker errors.
            shutdown_tx.send(true).ok();
            session.close().await;
            match joined {
                Ok(Ok(())) => bail!("task consumer exited unexpectedly"),
                Ok(Err(e)) => return Err(e.context("task consumer failed")),
                Err(e) => return Err(e).context("task consumer panicked"),
            }
        }
    }

    shutdown_tx.send(true).ok();
    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), consumer).await;
    session.close().await;
    Ok(())
}

/// Probe mode for operators: run one collector locally and print its JSON.
async fn dry_run(cfg: &Config, module: DryRunModule) -> Result<()> {
    match module {
        DryRunModule::Inventory => {
            let ctx = build_runtime_context(cfg, false)?;
            let invoker = ActionInvoker::new(&cfg.script_root);
            let inventory = collect_inventory(&invoker, &ctx)
                .await
                .context("inventory collect error")?;
            match inventory {
                serde_json::Value::String(raw) => println!("{raw}"),
                value => println!("{}", serde_json::to_string(&value)?),
            }
        }
        DryRunModule::Heartbeat => {
            let host = hostname::get()
                .context("resolve hostname")?
                .to_string_lossy()
                .into_owned();
            let hb = heartbeat_envelope(&cfg.agent_id, &host, &cfg.capabilities);
            println!("{}", serde_json::to_string(&hb)?);
        }
    }
    Ok(())
}

/// Ensure the managed tree (when a base path is configured) and build the
/// runtime context. In normal mode a broken tree is fatal; dry-run degrades
/// to an empty context so the probe still prints something useful.
fn build_runtime_context(cfg: &Config, tree_required: bool) -> Result<RuntimeContext> {
    if cfg.base_path.is_empty() {
        warn!("no basePath configured; datastores will be empty in inventory");
        return Ok(RuntimeContext::without_tree(&cfg.agent_id));
    }
    match DataDirs::ensure(&cfg.base_path) {
        Ok(dirs) => {
            info!("datadirs ready | {}", dirs.summary());
            Ok(RuntimeContext::new(&cfg.agent_id, &cfg.base_path, &dirs))
        }
        Err(e) if tree_required => Err(e.context("ensure data dirs")),
        Err(e) => {
            warn!("ensure data dirs failed: {e:#}");
            Ok(RuntimeContext::without_tree(&cfg.agent_id))
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
