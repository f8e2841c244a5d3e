//! Hyperlane control plane - main entry point.
//!
//! `hyperlane serve` runs the convergence loop and the report endpoint; the
//! other subcommands read and write the state store directly.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use hyperlane_control::config::AppConfig;
use hyperlane_control::logging::{init_tracing, OpTimer};
use hyperlane_control::{
    report, AgentClient, GrpcAgentClient, RecordSet, Reconciler, SqliteStateStore, StateStore,
    StoreError, VmRecord, VmState,
};

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "hyperlane")]
#[command(about = "Hyperlane - declarative VM control plane")]
#[command(version)]
struct Args {
    /// Config file path (defaults to config/hyperlane.*).
    #[arg(short, long, env = "HYPERLANE_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the reconciler loop and the report endpoint until interrupted.
    Serve,
    /// Declare the desired state of a VM.
    Apply {
        #[arg(long)]
        name: String,
        /// Virtual cores.
        #[arg(long, default_value_t = 1)]
        cpu: u32,
        /// Memory in MiB.
        #[arg(long, default_value_t = 1024)]
        ram: u32,
        #[arg(long)]
        image: String,
        #[arg(long, default_value = "running")]
        state: VmState,
    },
    /// List VM records.
    List {
        #[arg(long, default_value = "observed")]
        set: RecordSet,
    },
    /// Print one VM record as JSON.
    Get {
        name: String,
        #[arg(long, default_value = "observed")]
        set: RecordSet,
    },
    /// Mark a VM for destruction.
    Destroy { name: String },
    /// Forget a destroyed VM so its name can be reused.
    Prune { name: String },
    /// Run a single reconciliation tick and print what it did.
    ReconcileOnce,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = AppConfig::load(args.config.as_deref())?;
    init_tracing(&config.logging)?;

    let store = open_store(&config).await?;

    match args.command {
        Command::Serve => serve(config, store).await,
        Command::Apply {
            name,
            cpu,
            ram,
            image,
            state,
        } => {
            if state.target().is_none() {
                bail!("'{state}' describes an outcome, not intent; use running, stopped or destroyed");
            }
            let stored = store
                .put(RecordSet::Desired, VmRecord::new(name, cpu, ram, image, state))
                .await?;
            println!("desired {} -> {}", stored.name, stored.state);
            Ok(())
        }
        Command::List { set } => {
            let mut records = store.list(set, &CancellationToken::new()).await?;
            records.sort_by(|a, b| a.name.cmp(&b.name));
            print_table(&records);
            Ok(())
        }
        Command::Get { name, set } => {
            let record = store.get(set, &name, &CancellationToken::new()).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
        Command::Destroy { name } => {
            let mut record = store
                .get(RecordSet::Desired, &name, &CancellationToken::new())
                .await?;
            record.state = VmState::Destroyed;
            store.put(RecordSet::Desired, record).await?;
            println!("desired {name} -> destroyed");
            Ok(())
        }
        Command::Prune { name } => prune(store.as_ref(), &name).await,
        Command::ReconcileOnce => {
            let agent: Arc<dyn AgentClient> = Arc::new(GrpcAgentClient::new(&config.agent)?);
            let reconciler =
                Reconciler::new(store, agent, config.reconciler.to_reconciler_config());
            let report = reconciler.tick(&CancellationToken::new()).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

/// Open the state store. Failure here is fatal.
async fn open_store(config: &AppConfig) -> anyhow::Result<Arc<dyn StateStore>> {
    let timer = OpTimer::new("store", "open");
    let store = SqliteStateStore::open(config.store.path.clone(), config.store.busy_timeout()).await;
    timer.finish_with_result(store.as_ref());
    let store = store
        .with_context(|| format!("opening state store {}", config.store.path.display()))?;
    Ok(Arc::new(store))
}

async fn serve(config: AppConfig, store: Arc<dyn StateStore>) -> anyhow::Result<()> {
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        agent = %config.agent.endpoint,
        "Starting Hyperlane control plane"
    );

    let cancel = CancellationToken::new();
    let agent: Arc<dyn AgentClient> = Arc::new(GrpcAgentClient::new(&config.agent)?);
    let reconciler = Arc::new(Reconciler::new(
        Arc::clone(&store),
        agent,
        config.reconciler.to_reconciler_config(),
    ));
    let reconciler_task = reconciler.spawn(cancel.clone());

    let report_task = config.report.enabled.then(|| {
        let store = Arc::clone(&store);
        let report_config = config.report.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = report::serve(store, &report_config, cancel.clone()).await {
                tracing::error!(error = ?e, "Report endpoint failed; shutting down");
                cancel.cancel();
            }
        })
    });

    tokio::select! {
        () = shutdown_signal() => {}
        () = cancel.cancelled() => {}
    }
    cancel.cancel();

    reconciler_task.await.context("reconciler task panicked")?;
    if let Some(task) = report_task {
        task.await.context("report task panicked")?;
    }

    tracing::info!("Control plane shut down gracefully");
    Ok(())
}

async fn prune(store: &dyn StateStore, name: &str) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    match store.get(RecordSet::Observed, name, &cancel).await {
        Ok(observed) if observed.state != VmState::Destroyed => {
            bail!(
                "VM '{name}' is {} and cannot be pruned; run `hyperlane destroy {name}` and wait for it to converge",
                observed.state
            );
        }
        Ok(_) | Err(StoreError::NotFound { .. }) => {}
        Err(e) => return Err(e.into()),
    }

    let observed = store.delete(RecordSet::Observed, name).await?;
    let desired = store.delete(RecordSet::Desired, name).await?;
    if !observed && !desired {
        bail!("VM '{name}' not found");
    }
    println!("pruned {name}");
    Ok(())
}

fn print_table(records: &[VmRecord]) {
    println!(
        "{:<20} {:<13} {:>4} {:>8} {:<20} {:<25} ERROR",
        "NAME", "STATE", "CPU", "RAM", "IMAGE", "UPDATED"
    );
    for r in records {
        println!(
            "{:<20} {:<13} {:>4} {:>8} {:<20} {:<25} {}",
            r.name,
            r.state,
            r.cpu,
            r.ram,
            r.image,
            r.updated_at.format("%Y-%m-%d %H:%M:%S UTC"),
            r.last_error.as_deref().unwrap_or("-")
        );
    }
}

/// Graceful shutdown signal handler.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down...");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, shutting down...");
        }
    }
}
