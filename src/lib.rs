// src/lib.rs

pub mod api;
pub mod app;
pub mod cli;
pub mod config;
pub mod dag;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod log;
pub mod logging;
pub mod store;
pub mod types;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::info;

use crate::api::{CoreClient, RemoteRunnerClient};
use crate::app::App;
use crate::cli::{CliArgs, Command};
use crate::config::{load_and_validate, load_build_definition, BuildDefinition};
use crate::dag::JobGraph;
use crate::engine::Credentials;
use crate::exec::{Runner, RunnerOptions, ShellExecutor};
use crate::log::LogKind;
use crate::types::{parse_duration, BuildId, JobId};

/// High-level entry point used by `main.rs`.
pub async fn run(args: CliArgs) -> Result<()> {
    match args.command {
        Command::Serve { config } => serve(&config).await,
        Command::Runner {
            server,
            name,
            token,
            workdir,
            poll_interval,
            heartbeat_interval,
        } => {
            let options = RunnerOptions {
                poll_interval: parse_duration(&poll_interval)
                    .map_err(|e| anyhow::anyhow!("--poll-interval: {e}"))?,
                heartbeat_interval: parse_duration(&heartbeat_interval)
                    .map_err(|e| anyhow::anyhow!("--heartbeat-interval: {e}"))?,
            };
            let executor = match workdir {
                Some(dir) => ShellExecutor::with_workdir(dir),
                None => ShellExecutor::new(),
            };
            run_runner(&server, Credentials { name, token }, executor, options).await
        }
        Command::Check { build_file } => {
            let def = load_build_definition(&build_file)
                .with_context(|| format!("checking {}", build_file.display()))?;
            print_check(&def)?;
            Ok(())
        }
        Command::Submit { server, build_file } => {
            let def = load_build_definition(&build_file)
                .with_context(|| format!("loading {}", build_file.display()))?;
            let id = CoreClient::new(server).submit_build(&def).await?;
            println!("{id}");
            Ok(())
        }
        Command::Status { server, build_id } => {
            let snapshot = CoreClient::new(server).build(&BuildId::from(build_id)).await?;
            println!("{} {} {}", snapshot.build.id, snapshot.build.name, snapshot.status);
            if let Some(err) = &snapshot.build.error {
                println!("  error: {err}");
            }
            for job in &snapshot.jobs {
                println!("  {:<24} {:<10} {}", job.name, job.status.to_string(), job.id);
            }
            Ok(())
        }
        Command::Cancel { server, build_id } => {
            let status = CoreClient::new(server).cancel_build(&BuildId::from(build_id)).await?;
            println!("{status}");
            Ok(())
        }
        Command::Logs { server, job_id } => print_logs(&CoreClient::new(server), &JobId::from(job_id)).await,
    }
}

async fn serve(config_path: &Path) -> Result<()> {
    let cfg = load_and_validate(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let app = App::start(cfg).await?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;
    info!("shutdown requested");

    app.stop().await?;
    Ok(())
}

async fn run_runner(
    server: &str,
    creds: Credentials,
    executor: ShellExecutor,
    options: RunnerOptions,
) -> Result<()> {
    let client = Arc::new(RemoteRunnerClient::new(server));
    let runner = Runner::new(creds, client, Arc::new(executor), options);

    let (shutdown, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            eprintln!("failed to listen for Ctrl+C: {e}");
            return;
        }
        let _ = shutdown.send(true);
    });

    runner.run(shutdown_rx).await?;
    Ok(())
}

/// Print the validated graph: jobs in display order with their depth and
/// direct (non-transitive) dependencies.
fn print_check(def: &BuildDefinition) -> Result<()> {
    let jobs = dag::decompose(def, &BuildId::from("check"), chrono::Utc::now())?;
    let graph = JobGraph::new(jobs);
    let view = graph.indirected_view();

    let names: HashMap<&JobId, &str> = graph
        .jobs()
        .iter()
        .map(|j| (&j.id, j.name.as_str()))
        .collect();
    let name_of = |id: &JobId| names.get(id).copied().unwrap_or("?");

    println!("build {} ({} jobs)", def.name, graph.jobs().len());
    for id in &view.order {
        let depth = view.depth.get(id).copied().unwrap_or(0);
        let deps: Vec<&str> = view
            .edges
            .iter()
            .filter(|(_, to)| to == id)
            .map(|(from, _)| name_of(from))
            .collect();
        let indent = "  ".repeat(depth + 1);
        if deps.is_empty() {
            println!("{indent}{}", name_of(id));
        } else {
            println!("{indent}{}  <- {}", name_of(id), deps.join(", "));
        }
    }
    Ok(())
}

async fn print_logs(client: &CoreClient, job_id: &JobId) -> Result<()> {
    let mut after = 0;
    loop {
        let lines = client.log_lines(job_id, after, Some(500)).await?;
        let Some(last) = lines.last() else {
            break;
        };
        after = last.seq_no;
        for line in &lines {
            match &line.kind {
                LogKind::Line => println!("{}", line.text),
                LogKind::Error => eprintln!("{}", line.text),
                LogKind::BlockStart { name } => println!("==> {name}"),
                LogKind::BlockEnd => {}
                LogKind::Discontinuity => println!("[... {} ...]", line.text),
                LogKind::End => return Ok(()),
            }
        }
    }
    Ok(())
}
