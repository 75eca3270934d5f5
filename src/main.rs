//! # Caseflow: Test Orchestration Core
//!
//! Wires the whole platform together: the SQLite stores, the in-process
//! message broker, the dispatcher, the schedule engine, the heartbeat
//! monitor, and the HTTP/WebSocket gateway.
//!
//! Usage:
//!   caseflow                          # Start with ~/.caseflow/config.toml
//!   caseflow --port 8080              # Override the gateway port
//!   caseflow --config ./dev.toml -v   # Custom config, verbose logging

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use caseflow_core::config::CaseflowConfig;
use caseflow_core::types::CronjobKind;
use caseflow_dispatch::{AgentSelector, Dispatcher, RunRequest};
use caseflow_monitor::{HeartbeatMonitor, MarkerCache};
use caseflow_scheduler::{JobRunner, ScheduleEngine, ScheduledJob, SchedulerDb};
use caseflow_store::Store;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "caseflow",
    version,
    about = "Orchestration core for a distributed test-execution platform"
)]
struct Cli {
    /// Config file path (default: ~/.caseflow/config.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Gateway port override
    #[arg(short, long)]
    port: Option<u16>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn expand_path(p: &str) -> String {
    shellexpand::tilde(p).to_string()
}

/// Bridges the schedule engine to the dispatcher: a fired job becomes
/// a full task dispatch across all reachable agents.
struct JobDispatchRunner {
    store: Arc<Store>,
    dispatcher: Arc<Dispatcher>,
}

#[async_trait]
impl JobRunner for JobDispatchRunner {
    async fn run(&self, job: &ScheduledJob) -> caseflow_core::Result<()> {
        let def = self.store.get_job_def(job.id)?;
        if !def.enabled {
            tracing::debug!("job {} fired while disabled, skipping", job.id);
            return Ok(());
        }
        let req = RunRequest {
            env_id: def.env_id,
            username: def.username.clone(),
            selector: AgentSelector::Spread,
            debug: false,
            reset_cache: false,
            cronjob_type: CronjobKind::Recurring,
        };
        let receipt = self.dispatcher.dispatch_task(def.task_id, &req).await?;
        tracing::info!(
            "scheduled job {} ({}) dispatched task {} as record {:?}",
            job.id,
            job.name,
            def.task_id,
            receipt.task_record_id
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "caseflow=debug,tower_http=debug"
    } else {
        "caseflow=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let mut config = match &cli.config {
        Some(path) => CaseflowConfig::load_from(Path::new(&expand_path(path)))?,
        None => CaseflowConfig::load()?,
    };
    if let Some(port) = cli.port {
        config.gateway.port = port;
    }

    let store_path = expand_path(&config.store.db_path);
    let jobs_path = expand_path(&config.scheduler.db_path);

    let store = Arc::new(Store::open(Path::new(&store_path))?);
    tracing::info!("store opened at {store_path}");

    let broker = Arc::new(caseflow_bus::InProcBroker::new());
    let bus = Arc::new(caseflow_bus::TopicBus::new(config.relay.history_limit));
    let markers = Arc::new(MarkerCache::new(Duration::from_secs(
        config.heartbeat.marker_ttl_secs,
    )));

    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        broker.clone(),
        config.channel.publish_attempts,
        Duration::from_secs(config.channel.retry_delay_secs),
    ));

    let engine = Arc::new(ScheduleEngine::new(
        SchedulerDb::open(Path::new(&jobs_path))?,
        Arc::new(JobDispatchRunner { store: store.clone(), dispatcher: dispatcher.clone() }),
        config.scheduler.tick_secs,
        config.scheduler.misfire_grace_secs,
    ));
    engine.start()?;

    let monitor = Arc::new(HeartbeatMonitor::new(
        store.clone(),
        bus.clone(),
        markers.clone(),
        config.heartbeat.agent_port,
        Duration::from_secs(config.heartbeat.probe_timeout_secs),
        Duration::from_secs(config.heartbeat.check_interval_secs),
    ));
    tokio::spawn(monitor.run());

    let state = caseflow_gateway::AppState {
        config: config.gateway.clone(),
        store,
        engine: engine.clone(),
        dispatcher,
        channel: broker,
        bus,
        markers,
        start_time: std::time::Instant::now(),
    };

    let result = caseflow_gateway::server::start(state).await;
    engine.stop();
    result
}
