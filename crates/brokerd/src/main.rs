//! The broker daemon: spawns the configured workers, routes messages between them,
//! and keeps the fetch→store job pipeline alive across restarts.

mod config;

use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use broker_core::{Broker, BrokerError, Message, MessageType, RpcClient, PROCESS_EXITED_EVENT};
use clap::Parser;
use job_runner::{ExecutorConfig, JobExecutor, RunStore};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{Config, JobConfig};

#[derive(Debug, Parser)]
#[command(
    name = "brokerd",
    about = "Supervised multi-process RPC broker and job orchestrator"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "brokerd.toml")]
    config: PathBuf,

    /// Run-store location, overriding the config file.
    #[arg(long)]
    store: Option<PathBuf>,

    /// Identity this broker routes under.
    #[arg(long, env = "PROCESS_ID", default_value = "broker")]
    process_id: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;
    let store_path = cli.store.unwrap_or_else(|| config.store_path.clone());

    info!(broker = %cli.process_id, config = %cli.config.display(), "starting brokerd");
    let broker = Broker::new(cli.process_id);

    for child in &config.children {
        let spawned = match child.max_restarts {
            Some(budget) => {
                broker.spawn_with_restart(&child.id, &child.command, budget, &child.args)
            }
            None if child.rpc => broker.spawn_rpc(&child.id, &child.command, &child.args),
            None => broker.spawn(&child.id, &child.command, &child.args),
        };
        match spawned {
            Ok(snap) => info!(child = %snap.id, pid = ?snap.pid, "spawned configured child"),
            Err(err) => {
                // A missing worker binary should not take the whole broker down; the
                // operator can fix the config and respawn over RPC.
                error!(child = %child.id, error = %err, "failed to spawn configured child");
            }
        }
    }

    let store = Arc::new(
        RunStore::open(&store_path)
            .with_context(|| format!("failed to open run store at `{}`", store_path.display()))?,
    );
    let executor = JobExecutor::new(
        Arc::clone(&store),
        Arc::new(broker.rpc()),
        executor_config(&config.job),
    );

    let shutdown = CancellationToken::new();
    match executor.recover_runs(&shutdown) {
        Ok(Some(run_id)) => info!(run = %run_id, "recovered interrupted run"),
        Ok(None) => autostart(&executor, &config.job, &shutdown),
        Err(err) => error!(error = %err, "run recovery failed"),
    }

    let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("received SIGINT");
                break;
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM");
                break;
            }
            received = broker.receive_message(&shutdown) => match received {
                Ok(msg) => observe(&msg),
                Err(BrokerError::ShutDown) | Err(BrokerError::Cancelled) => break,
                Err(err) => {
                    warn!(error = %err, "receive failed");
                    break;
                }
            }
        }
    }

    shutdown.cancel();
    broker.shutdown().await;
    store.flush().context("failed to flush run store")?;
    info!("brokerd stopped");
    Ok(())
}

/// Starts a fresh run at boot when the config asks for one and nothing was recovered.
fn autostart(executor: &JobExecutor<RpcClient>, job: &JobConfig, cancel: &CancellationToken) {
    if !job.autostart {
        return;
    }
    let run_id = format!("{}-{}", job.data_type, chrono::Utc::now().timestamp());
    match executor.start(
        cancel,
        &run_id,
        job.start_index,
        job.results_per_batch,
        &job.data_type,
    ) {
        Ok(()) => info!(run = %run_id, "autostarted run"),
        Err(err) => error!(run = %run_id, error = %err, "autostart failed"),
    }
}

/// Inbound messages the broker did not consume itself; mostly lifecycle events.
fn observe(msg: &Message) {
    if msg.kind == MessageType::Event && msg.id == PROCESS_EXITED_EVENT {
        let payload = msg.payload.clone().unwrap_or_default();
        warn!(
            child = payload["id"].as_str().unwrap_or("?"),
            exit_code = payload["exit_code"].as_i64().unwrap_or(-1),
            status = payload["status"].as_str().unwrap_or("?"),
            "worker exited"
        );
    } else {
        debug!(kind = msg.kind.as_str(), id = %msg.id, "inbound message");
    }
}

fn executor_config(job: &JobConfig) -> ExecutorConfig {
    ExecutorConfig {
        remote_id: job.remote_id.clone(),
        local_id: job.local_id.clone(),
        ..ExecutorConfig::default()
    }
}
