// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::info;
use mapdl_launcher::{
    EnvironmentProber, LaunchConfiguration, LaunchMode, Launcher, SolverVersion, load_config,
};
use serde_json::json;

#[derive(Parser, Debug)]
#[command(name = "mapdl-launch")]
#[command(about = "Start MAPDL solver servers or connect to running ones", long_about = None)]
struct Cli {
    /// Log level: error, warn, info, debug or trace
    #[arg(long, default_value = "info", global = true)]
    log_level: log::LevelFilter,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Launch a server, print where it listens, and keep it up until interrupted
    Start(ConfigArgs),
    /// Print the launch plan without starting anything
    Resolve(ConfigArgs),
    /// List installations and the batch scheduler visible from here
    Probe,
}

#[derive(Args, Debug)]
struct ConfigArgs {
    /// YAML launch configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// local-grpc, local-console, remote, hpc or delegated
    #[arg(long)]
    mode: Option<LaunchMode>,

    #[arg(long)]
    exec_path: Option<PathBuf>,

    /// e.g. 242, 24.2 or 2024R2
    #[arg(long)]
    version: Option<SolverVersion>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    port: Option<u32>,

    #[arg(long)]
    nproc: Option<u32>,

    /// Seconds to wait for the server
    #[arg(long)]
    timeout: Option<f64>,
}

impl ConfigArgs {
    fn configuration(&self) -> Result<LaunchConfiguration> {
        let mut config = match &self.config {
            Some(path) => load_config(path)?,
            None => LaunchConfiguration::default(),
        };
        if let Some(mode) = self.mode {
            config.mode = Some(mode);
        }
        if let Some(path) = &self.exec_path {
            config.exec_path = Some(path.clone());
        }
        if let Some(version) = self.version {
            config.version = Some(version);
        }
        if let Some(host) = &self.host {
            config.host = Some(host.clone());
        }
        if let Some(port) = self.port {
            config.port = Some(port);
        }
        if let Some(nproc) = self.nproc {
            config.nproc = Some(nproc);
        }
        if let Some(secs) = self.timeout {
            config.timeout = Some(
                Duration::try_from_secs_f64(secs)
                    .with_context(|| format!("invalid timeout {secs}"))?,
            );
        }
        Ok(config)
    }
}

#[cfg(unix)]
async fn wait_for_shutdown() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("received Ctrl-C");
    Ok(())
}

#[allow(clippy::print_stdout)]
async fn start(launcher: &Launcher, args: &ConfigArgs) -> Result<()> {
    let config = args.configuration()?;
    let mut handle = launcher.launch(&config).await?;
    println!(
        "{}",
        json!({
            "address": handle.address(),
            "mode": handle.mode.as_str(),
            "started_locally": handle.started_locally,
            "pid": handle.pid(),
            "job_id": handle.job_id().map(|j| j.to_string()),
        })
    );

    wait_for_shutdown().await?;
    handle.stop(false).await?;
    Ok(())
}

#[allow(clippy::print_stdout)]
fn resolve(launcher: &Launcher, args: &ConfigArgs) -> Result<()> {
    let plan = launcher.resolve(&args.configuration()?)?;
    let plan = json!({
        "mode": plan.mode.as_str(),
        "command": plan.command(plan.port),
        "host": plan.host,
        "port": plan.port,
        "version": plan.version.map(|v| v.to_string()),
        "working_dir": plan.working_dir,
        "nproc": plan.nproc,
        "timeout_secs": plan.timeout.as_secs_f64(),
    });
    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(())
}

#[allow(clippy::print_stdout)]
fn probe(prober: &EnvironmentProber) -> Result<()> {
    let installations: Vec<_> = prober
        .discover_installations()
        .iter()
        .map(|i| {
            json!({
                "version": i.version.to_string(),
                "student": i.student,
                "path": i.path,
            })
        })
        .collect();
    let scheduler = prober.detect_scheduler_environment().map(|s| {
        json!({
            "bin_dir": s.bin_dir,
            "job_id": s.allocation.job_id,
            "cores": s.allocation.cores,
            "mem_mb": s.allocation.mem_mb,
        })
    });
    let report = json!({
        "installations": installations,
        "scheduler": scheduler,
        "provisioning_config": prober.provisioning_config(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = cli.log_level.to_level().unwrap_or(log::Level::Error);
    simple_logger::init_with_level(level)?;
    info!(
        "mapdl-launch starting (version {})",
        env!("CARGO_PKG_VERSION")
    );

    let launcher = Launcher::from_process_env();
    match &cli.command {
        Command::Start(args) => start(&launcher, args).await,
        Command::Resolve(args) => resolve(&launcher, args),
        Command::Probe => probe(launcher.prober()),
    }
}
