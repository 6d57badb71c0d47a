use anyhow::{Context, Result};
use clap::Parser;
use futures::FutureExt;
use std::fs;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{debug, error, info, warn};

use stagecoach_config::{ConfigLoader, StagecoachConfig};
use stagecoach_core::{GenerationToken, WorkerIdentity};
use stagecoach_execution::{
    builtin_registry, Benchmark, BenchmarkReport, LocalConnections, RemoteConnections,
    RemoteConnectionsConfig, WorkerConnections, WorkerExit, WorkerRuntime, GENERIC_ERROR_EXIT_CODE,
};
use stagecoach_ipc::{HandshakeRequest, TcpWorkerTransport};
use stagecoach_logging::{init_logging_from_config, init_simple_tracing, init_worker_tracing};
use uuid::Uuid;

mod cli;
mod restart;

use cli::{Cli, Commands, ConfigCommands};
use restart::ProcessRestarter;

/// Exit code after Ctrl-C
const INTERRUPTED_EXIT_CODE: i32 = 130;

/// Load configuration from file or use defaults
fn load_config(config_path: Option<&PathBuf>) -> Result<StagecoachConfig> {
    let loader = ConfigLoader::new();

    match config_path {
        Some(path) => {
            if path.exists() {
                loader
                    .from_file(path)
                    .context(format!("Failed to load configuration from {:?}", path))
            } else {
                warn!("Configuration file not found: {:?}. Using defaults.", path);
                loader
                    .from_env()
                    .context("Failed to load configuration from environment")
            }
        }
        None => loader
            .from_env()
            .context("Failed to load configuration from environment"),
    }
}

fn build_benchmark(config: &StagecoachConfig) -> Result<Benchmark> {
    if !config.benchmark.is_defined() {
        return Err(anyhow::anyhow!("The configuration does not define a benchmark"));
    }

    let program = config
        .benchmark
        .build_program()
        .context("Failed to build the stage program")?;
    Benchmark::new(
        program,
        config.benchmark.configurations(),
        config.benchmark.clusters(),
        Arc::new(builtin_registry()),
    )
    .context("Invalid benchmark definition")
}

/// Run the benchmark until it finishes or Ctrl-C arrives
async fn run_benchmark(
    benchmark: &Benchmark,
    connections: &mut dyn WorkerConnections,
    report_path: Option<&PathBuf>,
) -> Result<i32> {
    let interrupted = async {
        // Without a signal handler the run simply cannot be interrupted
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let report = tokio::select! {
        report = benchmark.run(connections) => Some(report),
        _ = interrupted => None,
    };

    let Some(report) = report else {
        warn!("Interrupted, releasing workers");
        if let Err(e) = connections.release().await {
            debug!("Release after interrupt failed: {}", e);
        }
        return Ok(INTERRUPTED_EXIT_CODE);
    };

    if let Some(path) = report_path {
        write_report(&report, path)?;
    }

    let failed_runs = report.runs.iter().filter(|run| run.failed).count();
    println!(
        "{} cluster runs, {} failed, exit code {}",
        report.runs.len(),
        failed_runs,
        report.exit_code
    );
    if let Some(e) = &report.error {
        println!(
            "Aborted by {}: {}",
            report.failure_kind.as_deref().unwrap_or("error"),
            e
        );
    }
    Ok(report.exit_code)
}

fn write_report(report: &BenchmarkReport, path: &PathBuf) -> Result<()> {
    let json = serde_json::to_string_pretty(report).context("Failed to serialize benchmark report")?;
    fs::write(path, json).context(format!("Failed to write report to {:?}", path))?;
    println!("Benchmark report written to: {:?}", path);
    Ok(())
}

async fn coordinator_command(
    config: &StagecoachConfig,
    port: Option<u16>,
    report: Option<&PathBuf>,
) -> Result<i32> {
    let benchmark = build_benchmark(config)?;
    let expected_workers = benchmark.max_cluster_size();

    let mut connections = RemoteConnections::bind(RemoteConnectionsConfig {
        bind_address: config.coordinator.bind_address.clone(),
        port: port.unwrap_or(config.coordinator.port),
        expected_workers,
        discovery_timeout: config.coordinator.discovery_timeout,
        reconnect_timeout: config.coordinator.reconnect_timeout,
        handshake_timeout: config.coordinator.handshake_timeout,
        max_payload_len: config.coordinator.max_frame_length,
    })
    .await
    .context("Failed to start coordinator")?;

    info!(
        "Coordinator listening on {}, waiting for {} workers",
        connections.local_addr(),
        expected_workers
    );

    run_benchmark(&benchmark, &mut connections, report).await
}

async fn local_command(config: &StagecoachConfig, report: Option<&PathBuf>) -> Result<i32> {
    let benchmark = build_benchmark(config)?;
    let mut connections = LocalConnections::new(benchmark.registry().clone());
    info!("Running benchmark with an in-process worker");
    run_benchmark(&benchmark, &mut connections, report).await
}

async fn worker_command(
    config: &StagecoachConfig,
    cli: &Cli,
    host: Option<&String>,
    port: Option<u16>,
    index: Option<usize>,
    generation: Option<Uuid>,
) -> Result<i32> {
    let host = host.cloned().unwrap_or_else(|| config.worker.coordinator_host.clone());
    let port = port.unwrap_or(config.worker.coordinator_port);
    let generation = generation.map(GenerationToken::from).unwrap_or_else(GenerationToken::first);

    info!("Connecting to coordinator at {}:{}", host, port);
    let (transport, response) = TcpWorkerTransport::connect(
        format!("{}:{}", host, port),
        HandshakeRequest::new(index, generation),
        config.worker.connect_attempts,
        config.worker.connect_retry_interval,
        config.coordinator.max_frame_length,
    )
    .await
    .context("Failed to join the coordinator")?;

    let identity = WorkerIdentity::new(response.assigned_index, generation);
    info!(
        "Joined as {} of {} workers",
        identity, response.total_workers
    );

    let restarter = ProcessRestarter::new(host, port, cli.config.clone(), cli.log_level.clone());
    let exit = WorkerRuntime::new(transport, identity, Arc::new(builtin_registry()))
        .with_restarter(Arc::new(restarter))
        .run()
        .await
        .context("Worker stage loop failed")?;

    match exit {
        WorkerExit::Terminated => info!("{} finished", identity),
        WorkerExit::Restarting { generation } => {
            info!("{} handed over to generation {}", identity, generation)
        }
    }
    Ok(0)
}

/// Handle configuration validation
fn handle_config_validate(config_file: &PathBuf) -> Result<i32> {
    info!("Validating configuration file: {:?}", config_file);

    if !config_file.exists() {
        return Err(anyhow::anyhow!(
            "Configuration file not found: {:?}",
            config_file
        ));
    }

    let config = ConfigLoader::new()
        .from_file(config_file)
        .context("Configuration validation failed")?;
    if config.benchmark.is_defined() {
        build_benchmark(&config)?;
    }

    println!("Configuration file is valid");
    Ok(0)
}

/// Handle configuration generation
fn handle_config_generate(output: &PathBuf, force: bool) -> Result<i32> {
    if output.exists() && !force {
        return Err(anyhow::anyhow!(
            "Output file already exists: {:?}. Use --force to overwrite.",
            output
        ));
    }

    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent).context("Failed to create output directory")?;
    }

    fs::write(output, StagecoachConfig::generate_sample())
        .context("Failed to write configuration file")?;

    println!("Sample configuration generated at: {:?}", output);
    println!(
        "Validate with: stagecoach config validate --config-file {:?}",
        output
    );
    Ok(0)
}

async fn run(cli: Cli) -> Result<i32> {
    if let Commands::Config { config_cmd } = &cli.command {
        init_simple_tracing(cli.log_level.as_deref().unwrap_or("info"))?;
        return match config_cmd {
            ConfigCommands::Validate { config_file } => handle_config_validate(config_file),
            ConfigCommands::Generate { output, force } => handle_config_generate(output, *force),
        };
    }

    let config = load_config(cli.config.as_ref())?;

    match &cli.command {
        Commands::Worker {
            host,
            port,
            index,
            generation,
        } => {
            // Workers log to stderr
            let level = cli
                .log_level
                .clone()
                .unwrap_or_else(|| config.logging.effective_worker_level().to_string());
            init_worker_tracing(&level)?;
            worker_command(&config, &cli, host.as_ref(), *port, *index, *generation).await
        }
        Commands::Coordinator { port, report } => {
            init_logging_from_config(&config.logging, cli.log_level.as_deref())?;
            info!("Stagecoach coordinator starting");
            coordinator_command(&config, *port, report.as_ref()).await
        }
        Commands::Local { report } => {
            init_logging_from_config(&config.logging, cli.log_level.as_deref())?;
            local_command(&config, report.as_ref()).await
        }
        Commands::Config { .. } => Ok(0),
    }
}

fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        error!("Panic: {}", info);
        default_hook(info);
    }));
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    install_panic_hook();

    let code = match AssertUnwindSafe(run(cli)).catch_unwind().await {
        Ok(Ok(code)) => code,
        Ok(Err(e)) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            GENERIC_ERROR_EXIT_CODE
        }
        Err(_) => GENERIC_ERROR_EXIT_CODE,
    };

    std::process::exit(code);
}
