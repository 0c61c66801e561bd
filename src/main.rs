// Copyright 2025 coScene
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use allspark_agent::config::{load_config_with_env, AgentConfig, ConfigLoader, LoggingConfig};
use allspark_agent::config_sync::{check_health, fetch_remote_config, ConfigSync};
use allspark_agent::connection::{client_display_name, ConnectionManager, ConnectionSettings};
use allspark_agent::control::ControlInterface;
use allspark_agent::discovery::Discovery;
use allspark_agent::recorder::{ChunkRecorder, RecorderOptions};
use allspark_agent::source::SyntheticSource;
use allspark_agent::storage::{ChunkStore, WriterFactory};
use allspark_agent::transport::WebSocketConnector;
use allspark_agent::upload::UploadQueue;

/// allspark agent - record media chunks and upload them to a coordinator
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/default.yaml")]
    config: PathBuf,

    /// Device ID (overrides config file)
    #[arg(short, long)]
    device_id: Option<String>,

    /// Coordinator host[:port] (overrides config file)
    #[arg(long)]
    host: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Record and upload until Ctrl+C (default)
    Run,
    /// Query the coordinator's health endpoint and exit
    Health,
}

fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    // RUST_LOG wins over the config file
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(logging.level.to_lowercase()))
        .context("Invalid log level")?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if logging.format == "json" {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {}", e))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Load configuration from file
    let mut config = load_config_with_env(&args.config)?;

    // Apply CLI overrides
    if let Some(device_id) = args.device_id {
        config.recorder.device_id = device_id;
    }
    if let Some(host) = args.host {
        config.connection.host = host;
    }
    ConfigLoader::validate(&config)?;

    init_tracing(&config.logging)?;

    info!("Loaded configuration from: {:?}", args.config);
    info!("Device ID: {}", config.recorder.device_id);

    match args.command.unwrap_or(Command::Run) {
        Command::Health => health(&config).await,
        Command::Run => run(config).await,
    }
}

async fn health(config: &AgentConfig) -> Result<()> {
    let report = check_health(
        &config.connection.host,
        config.connection.trust_policy(),
        config.connection.connect_timeout(),
    )
    .await?;
    info!(
        "Coordinator {} is {} over {} (uptime {:?}s, protocols {:?})",
        config.connection.host, report.status, report.scheme, report.uptime, report.protocols
    );
    Ok(())
}

async fn run(config: AgentConfig) -> Result<()> {
    info!("Starting allspark agent");
    info!("Coordinator: {}", config.connection.host);

    let config_sync = Arc::new(ConfigSync::new(config.client_defaults.to_client_config()));

    // Prime the client configuration; the channel will push one later anyway
    match fetch_remote_config(
        &config.connection.host,
        config.connection.trust_policy(),
        config.connection.connect_timeout(),
    )
    .await
    {
        Ok(patch) => {
            config_sync.apply(&patch);
        }
        Err(e) => warn!("Remote config unavailable, using defaults: {:#}", e),
    }

    // Create chunk storage
    let store = Arc::new(ChunkStore::new(
        &config.recorder.storage_dir,
        &config.recorder.device_id,
    ));
    store.initialize().await?;
    let factory = WriterFactory::create(&config.recorder);
    info!("Chunk writer: {}", factory.writer_type());

    // Control channel
    let device_name = config
        .connection
        .device_name
        .clone()
        .unwrap_or_else(|| config.recorder.device_id.clone());
    let settings = ConnectionSettings {
        host: config.connection.host.clone(),
        trust: config.connection.trust_policy(),
        client_name: client_display_name(config.connection.client_name.as_deref(), &device_name),
    };
    let connector = Arc::new(WebSocketConnector::new(config.connection.connect_timeout()));
    let (connection, commands) = ConnectionManager::new(
        connector,
        settings,
        config_sync.clone(),
        config.connection.reconnect_delay(),
    );

    let uploads = UploadQueue::spawn(connection.clone());

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let recorder = ChunkRecorder::spawn(
        RecorderOptions {
            source: config.recorder.source.clone(),
            sample_queue_capacity: config.recorder.sample_queue_capacity,
        },
        store.clone(),
        factory,
        config_sync.clone(),
        event_tx,
    );

    let control = ControlInterface::new(
        recorder.clone(),
        uploads,
        store,
        config_sync,
        config.recorder.auto_upload,
    );
    let control_task = {
        let control = control.clone();
        tokio::spawn(async move {
            if let Err(e) = control.run(event_rx, commands).await {
                error!("Control interface error: {:#}", e);
            }
        })
    };

    let discovery = if config.discovery.enabled {
        match Discovery::start(&config.discovery.service_type, connection.clone()) {
            Ok(discovery) => Some(discovery),
            Err(e) => {
                warn!("Discovery disabled: {:#}", e);
                None
            }
        }
    } else {
        None
    };

    let source = if config.source.enabled {
        Some(SyntheticSource::start(&config.source, recorder.sink())?)
    } else {
        info!("Synthetic source disabled, waiting for an external producer");
        None
    };

    {
        let connection = connection.clone();
        tokio::spawn(async move { connection.connect().await });
    }
    recorder.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down");

    // Cleanup
    if let Some(source) = source {
        tokio::task::spawn_blocking(move || source.stop()).await?;
    }
    if let Err(e) = recorder.stop().await {
        warn!("Failed to stop recorder: {:#}", e);
    }
    if let Some(discovery) = discovery {
        discovery.shutdown();
    }
    connection.disconnect().await;
    control_task.abort();

    let sink = recorder.sink().stats();
    let counters = recorder.counters();
    info!(
        "allspark agent shut down ({} samples submitted, {} dropped, {} written)",
        sink.submitted,
        sink.dropped_full + sink.dropped_closed,
        counters.accepted
    );
    debug!(
        "Recorder drops: idle={} no_chunk={} backpressure={} before_anchor={}",
        counters.dropped_idle,
        counters.dropped_no_chunk,
        counters.dropped_backpressure,
        counters.dropped_before_anchor
    );
    Ok(())
}
