//! `jarvist-sync-agent` binary: a thin, illustrative consumer of the
//! in-process [`jarvist_sync_agent::AgentHandle`] control surface (§6).
//!
//! The real admin surface (HTTP API, desktop UI) is an external
//! collaborator and out of scope here; this CLI only demonstrates the
//! operations that surface would wrap.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use tokio_util::sync::CancellationToken;

use jarvist_sync_agent::broker::MqttBrokerClient;
use jarvist_sync_agent::config::{Config, ConfigOverrides};
use jarvist_sync_agent::ingest::{IdentityDefaults, IngestPipeline};
use jarvist_sync_agent::ledger::SqliteLedger;
use jarvist_sync_agent::{AgentHandle, PublishQueue, Repository};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "jarvist-sync-agent")]
#[command(version)]
#[command(about = "Edge-to-cloud spool ingest and durable publish queue")]
struct Cli {
    /// Override the spool root (also settable via JARVIST_SPOOL_ROOT).
    #[arg(long, global = true)]
    spool_root: Option<PathBuf>,

    /// Override the broker host (also settable via JARVIST_BROKER_HOST).
    #[arg(long, global = true)]
    broker_host: Option<String>,

    /// Override the broker port.
    #[arg(long, global = true)]
    broker_port: Option<u16>,

    /// Override the broker client id.
    #[arg(long, global = true)]
    broker_client_id: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent: watcher, rescan, watchdog, and publish queue
    /// workers, until interrupted.
    Run,
    /// Print a point-in-time status snapshot (§6 `status()`).
    Status,
    /// Re-derive the `synced_folder` summary for one date folder and
    /// nudge a pending scan (§6 `resyncFolder`).
    Resync {
        /// `YYYYMMDD` folder name.
        folder: String,
    },
    /// Publish a one-off diagnostic message, bypassing the durable queue
    /// (§6 `sendTestMessage`).
    SendTestMessage {
        #[arg(long, default_value = "jarvist/test")]
        topic: String,
        payload: String,
    },
}

fn overrides(cli: &Cli) -> ConfigOverrides {
    ConfigOverrides {
        spool_root: cli.spool_root.clone(),
        broker_host: cli.broker_host.clone(),
        broker_port: cli.broker_port,
        broker_client_id: cli.broker_client_id.clone(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = Config::load(overrides(&cli)).context("loading configuration")?;

    match cli.command {
        Commands::Run => run(config).await,
        Commands::Status => status(config).await,
        Commands::Resync { folder } => resync(config, &folder).await,
        Commands::SendTestMessage { topic, payload } => {
            send_test_message(config, &topic, payload.into_bytes()).await
        }
    }
}

/// Build the ledger, broker client, publish queue and ingest pipeline,
/// start every worker, and return a handle onto the running agent plus
/// its cancellation token (SPEC_FULL.md "Graceful shutdown").
async fn build_agent(config: &Config) -> Result<(Arc<AgentHandle>, Arc<PublishQueue>, CancellationToken)> {
    let shutdown = CancellationToken::new();

    let ledger_path = Config::config_dir()
        .context("resolving config directory")?
        .join("ledger.sqlite3");
    let ledger: Arc<dyn Repository> = Arc::new(
        SqliteLedger::open(&ledger_path)
            .await
            .context("opening ledger store")?,
    );

    // Recover leases stranded by a prior crash before anything else runs
    // (I2): a row left `processing = true` across a restart must not be
    // invisible to the pending scan.
    ledger
        .reset_processing()
        .await
        .context("resetting stranded processing leases")?;

    let broker = Arc::new(MqttBrokerClient::new(
        &config.broker_client_id,
        &config.broker_host,
        config.broker_port,
        config
            .broker_username
            .clone()
            .zip(config.broker_password.clone()),
        config.publish_timeout(),
        shutdown.clone(),
    ));

    let queue = PublishQueue::new(
        ledger.clone(),
        broker,
        config.base_topic.clone(),
        config.broker_client_id.clone(),
        shutdown.clone(),
    );
    queue.spawn_workers();

    let key = config
        .decoded_key()
        .ok_or_else(|| anyhow::anyhow!("decryption key failed to decode to 32 bytes"))?;

    let ingest = IngestPipeline::new(
        config.spool_root.clone(),
        key,
        ledger.clone(),
        queue.clone(),
        shutdown.clone(),
        config.sync_interval(),
        IdentityDefaults {
            tenant_id: config.tenant_id.clone(),
            site_id: config.site_id.clone(),
            client_id: config.broker_client_id.clone(),
        },
    );
    ingest.spawn().await.context("starting ingest pipeline")?;

    let handle = Arc::new(AgentHandle::new(ledger, queue.clone()));
    Ok((handle, queue, shutdown))
}

async fn run(config: Config) -> Result<()> {
    let (_handle, queue, shutdown) = build_agent(&config).await?;

    log::info!(
        "jarvist-sync-agent running: spool={:?} broker={}:{}",
        config.spool_root,
        config.broker_host,
        config.broker_port
    );

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;

    log::info!("shutdown requested, draining publish queue");
    queue.shutdown().await;
    shutdown.cancel();
    Ok(())
}

async fn status(config: Config) -> Result<()> {
    let (handle, queue, shutdown) = build_agent(&config).await?;
    // Give the connection monitor one tick to observe the broker before
    // reporting, so a fresh process doesn't always print `connected: false`.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let snapshot = handle.status().await;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);

    queue.shutdown().await;
    shutdown.cancel();
    Ok(())
}

async fn resync(config: Config, folder: &str) -> Result<()> {
    let (handle, queue, shutdown) = build_agent(&config).await?;
    handle
        .resync_folder(folder)
        .await
        .with_context(|| format!("resyncing folder {folder}"))?;
    println!("resync requested for {folder}");

    queue.shutdown().await;
    shutdown.cancel();
    Ok(())
}

async fn send_test_message(config: Config, topic: &str, payload: Vec<u8>) -> Result<()> {
    let (handle, queue, shutdown) = build_agent(&config).await?;
    // Best-effort: give the broker client a moment to connect before the
    // one-shot publish attempt.
    tokio::time::sleep(Duration::from_millis(200)).await;

    handle
        .send_test_message(topic, &payload)
        .await
        .context("sending test message")?;
    println!("test message sent to {topic}");

    queue.shutdown().await;
    shutdown.cancel();
    Ok(())
}
