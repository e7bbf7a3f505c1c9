use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tracerelay::api::ManagerClient;
use tracerelay::config::Config;
use tracerelay::control::connector::ControlConnector;
use tracerelay::control::worker::{AgentIdentity, ControlWorker, Reporter};
use tracerelay::session::SessionSettings;
use tracerelay::store::SessionStore;
use tracerelay::trace::testing;

#[derive(Parser)]
#[command(name = "tracerelay", about = "Trace relay agent")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Log level filter (e.g. info, debug, tracerelay=debug).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print the version and exit.
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = cli.command {
        println!("tracerelay {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&cli.log_level).context("parsing log level filter")?,
        )
        .init();

    let config = Config::load(&cli.config)?;
    info!(
        agent = %config.agent_id,
        manager = %config.manager_url,
        "starting trace relay agent",
    );

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    run(config, cancel).await
}

async fn run(config: Config, cancel: CancellationToken) -> Result<()> {
    let store = Arc::new(SessionStore::open(&config.data_dir).await?);

    let client = Arc::new(ManagerClient::new(
        &config.manager_url,
        &config.agent_id,
        config.request_timeout,
    )?);

    let (queue, connector_handle, connector_task) = ControlConnector::start(
        client.commands_url(),
        config.connector.clone(),
        &cancel,
    );

    // Certificate rotation changes the agent's outbound identity; bounce
    // the control stream so the next connection uses it.
    let (identity_tx, mut identity_rx) = tokio::sync::mpsc::unbounded_channel();
    let restart_handle = connector_handle.clone();
    tokio::spawn(async move {
        while identity_rx.recv().await.is_some() {
            restart_handle.restart();
        }
    });

    // The kernel trace provider lives outside this crate; the binary wires
    // the in-process loopback source. Handles are parked so the event
    // stream stays open for the lifetime of each session.
    let parked: Arc<Mutex<Vec<testing::LoopbackHandle>>> = Arc::new(Mutex::new(Vec::new()));
    let factory_parked = Arc::clone(&parked);
    let session_factory = Box::new(move || {
        let (session, handle) = testing::loopback(1024);
        factory_parked
            .lock()
            .expect("loopback handle lock")
            .push(handle);
        Ok(session)
    });

    let worker = ControlWorker::new(
        AgentIdentity {
            agent_id: config.agent_id.clone(),
            host_name: config.host_name.clone(),
        },
        store,
        Reporter::Http(client),
        SessionSettings {
            wal_dir: config.wal_dir(),
            channel_capacity: config.channel_capacity,
            retry: config.retry,
        },
        session_factory,
        &cancel,
    )
    .with_identity_events(identity_tx);

    worker.run(queue).await;

    cancel.cancel();
    if let Err(e) = connector_task.await {
        error!(error = %e, "control connector task panicked");
    }

    info!("agent stopped");
    Ok(())
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            let mut sigterm = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    error!(error = %e, "installing SIGTERM handler failed");
                    let _ = ctrl_c.await;
                    cancel.cancel();
                    return;
                }
            };

            tokio::select! {
                _ = ctrl_c => info!("received ctrl-c, shutting down"),
                _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
            }
        }

        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            info!("received ctrl-c, shutting down");
        }

        cancel.cancel();
    });
}
