use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use duplicati_monitor::api::{ApiClient, BackupApi};
use duplicati_monitor::config::{AppConfig, DEFAULT_CONFIG_PATH, ServerConfig};
use duplicati_monitor::core::{StatusSnapshot, create_notifier};
use duplicati_monitor::registry::{Backend, BackendRegistry};
use duplicati_monitor::{context, logging, web};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "dupmon")]
#[command(about = "Monitor Duplicati backup jobs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Monitor every configured job until interrupted
    Monitor(MonitorArgs),
    /// List the jobs defined on a server
    Jobs(ServerArgs),
    /// Fetch and print one job's status
    Status(JobArgs),
    /// Start a job and wait for it to finish
    Run(JobArgs),
    /// Write an example configuration file
    InitConfig,
}

#[derive(Args, Serialize)]
struct MonitorArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    http_bind: Option<SocketAddr>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    json_logs: Option<bool>,
}

#[derive(Args)]
struct ServerArgs {
    /// Server as host:port or URL; optional with a single server configured
    #[arg(long)]
    server: Option<String>,
}

#[derive(Args)]
struct JobArgs {
    job_id: String,

    #[command(flatten)]
    server: ServerArgs,
}

/// Command-line values layered over the file and environment.
#[derive(Serialize, Default)]
struct Overrides<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    verbose: Option<bool>,
    #[serde(flatten)]
    monitor: Option<&'a MonitorArgs>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::InitConfig = cli.command {
        AppConfig::write_default(&cli.config)?;
        println!("Wrote {}", cli.config.display());
        return Ok(());
    }

    let overrides = Overrides {
        verbose: cli.verbose.then_some(true),
        monitor: match &cli.command {
            Commands::Monitor(args) => Some(args),
            _ => None,
        },
    };
    let config = AppConfig::load(&cli.config, &overrides)?;
    logging::init(logging::LogConfig::from(&config));

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_ctrl_c(shutdown.clone()));

    match &cli.command {
        Commands::Monitor(_) => run_monitor(config, shutdown)
            .await
            .context("Monitor stopped with an error")?,
        Commands::Jobs(args) => list_jobs(config.server(args.server.as_deref())?)
            .await
            .context("Failed to list jobs")?,
        Commands::Status(args) => show_status(&config, args)
            .await
            .context("Failed to fetch job status")?,
        Commands::Run(args) => run_job(&config, args, shutdown)
            .await
            .context("Backup run failed")?,
        Commands::InitConfig => {}
    }

    Ok(())
}

async fn cancel_on_ctrl_c(token: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!("Received Ctrl+C, shutting down");
        token.cancel();
    }
}

async fn run_monitor(config: AppConfig, shutdown: CancellationToken) -> Result<()> {
    let registry = BackendRegistry::connect_all(&config).await?;
    tracing::info!(backends = registry.len(), "Monitoring started");

    let bind = config.http_bind;
    let ctx = context::AppContext::new(config, registry);

    let server = bind.map(|addr| Arc::new(web::WebServer::new(ctx.clone(), addr)));
    let server_task = server.clone().map(|server| {
        tokio::spawn(async move {
            if let Err(e) = server.start().await {
                tracing::error!(error = %e, "Status API stopped");
            }
        })
    });

    shutdown.cancelled().await;

    if let Some(server) = &server {
        server.shutdown();
    }
    if let Some(task) = server_task {
        let _ = task.await;
    }
    ctx.registry.unload_all().await;
    Ok(())
}

async fn list_jobs(server: &ServerConfig) -> Result<()> {
    let client = ApiClient::from_config(server)?;
    let jobs = client.list_jobs().await?.into_result()?;

    if jobs.is_empty() {
        println!("No jobs defined on {}", client.host());
        return Ok(());
    }

    println!("{:<6} {:<32} {:<22} LAST RUN", "ID", "NAME", "NEXT RUN");
    for job in jobs {
        let next = job
            .next_run_time()
            .map(|at| at.format("%Y-%m-%d %H:%M UTC").to_string())
            .unwrap_or_else(|| "-".to_string());
        let last = if job.metadata().last_run_failed() {
            "failed"
        } else if job.metadata().last_run_finished.is_some() {
            "ok"
        } else {
            "never"
        };
        println!("{:<6} {:<32} {:<22} {}", job.id(), job.name(), next, last);
    }
    Ok(())
}

/// Connect a backend that monitors just `job_id` on the selected server.
async fn connect_single(config: &AppConfig, args: &JobArgs) -> Result<Backend> {
    let mut server = config.server(args.server.server.as_deref())?.clone();
    server.jobs = vec![args.job_id.clone()];
    Backend::connect(
        &server,
        &config.monitoring,
        create_notifier(&config.notifications),
    )
    .await
}

async fn show_status(config: &AppConfig, args: &JobArgs) -> Result<()> {
    let backend = connect_single(config, args).await?;
    let service = backend.service();
    let latest = service
        .coordinator(&args.job_id)
        .and_then(|coordinator| coordinator.latest());

    let snapshot = match latest {
        Some(snapshot) => snapshot,
        None => service.refresh(&args.job_id).await?,
    };
    print_snapshot(&snapshot)?;
    backend.unload().await;
    Ok(())
}

async fn run_job(config: &AppConfig, args: &JobArgs, shutdown: CancellationToken) -> Result<()> {
    let backend = connect_single(config, args).await?;

    let result = tokio::select! {
        result = backend.service().start_backup(&args.job_id) => Some(result),
        _ = shutdown.cancelled() => None,
    };
    backend.unload().await;

    match result {
        Some(result) => {
            let snapshot = result?;
            print_snapshot(&snapshot)
        }
        None => {
            println!("Stopped waiting; the backup keeps running on the server");
            Ok(())
        }
    }
}

fn print_snapshot(snapshot: &StatusSnapshot) -> Result<()> {
    let json = serde_json::to_string_pretty(snapshot).context("Failed to format status")?;
    println!("{json}");
    Ok(())
}
