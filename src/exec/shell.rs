// src/exec/shell.rs

//! Runs a job's commands through the system shell.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

use crate::exec::backend::{ExecutionResult, JobExecutor, LogSink};
use crate::store::Job;

/// Executes each command with `sh -c` (`cmd /C` on Windows), in order,
/// stopping at the first failure. Each command gets its own log block;
/// stdout lines are logged as ordinary lines and stderr lines as errors.
#[derive(Debug, Clone, Default)]
pub struct ShellExecutor {
    workdir: Option<PathBuf>,
}

impl ShellExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workdir(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: Some(workdir.into()),
        }
    }
}

impl JobExecutor for ShellExecutor {
    fn execute<'a>(
        &'a self,
        job: &'a Job,
        log: LogSink,
    ) -> Pin<Box<dyn Future<Output = ExecutionResult> + Send + 'a>> {
        Box::pin(async move {
            for command in &job.commands {
                log.block(command.clone());
                match self.run_command(job, command, &log).await {
                    Ok(0) => log.end_block(),
                    Ok(code) => {
                        let reason = format!("command `{command}` exited with status {code}");
                        log.error(reason.clone());
                        return ExecutionResult::failed(reason);
                    }
                    Err(err) => {
                        let reason = format!("{err:#}");
                        log.error(reason.clone());
                        return ExecutionResult::failed(reason);
                    }
                }
            }
            ExecutionResult::succeeded()
        })
    }
}

impl ShellExecutor {
    async fn run_command(&self, job: &Job, command: &str, log: &LogSink) -> Result<i32> {
        info!(job = %job.id, name = %job.name, cmd = %command, "starting job command");

        let mut cmd = if cfg!(windows) {
            let mut c = Command::new("cmd");
            c.arg("/C").arg(command);
            c
        } else {
            let mut c = Command::new("sh");
            c.arg("-c").arg(command);
            c
        };

        cmd.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("CINDER_BUILD_ID", job.build_id.as_str())
            .env("CINDER_JOB_ID", job.id.as_str())
            .env("CINDER_JOB_NAME", &job.name)
            .kill_on_drop(true);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning `{command}` for job '{}'", job.name))?;

        let stdout = child.stdout.take().map(|out| {
            let log = log.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(out).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    log.line(line);
                }
            })
        });
        let stderr = child.stderr.take().map(|err| {
            let log = log.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(err).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    log.error(line);
                }
            })
        });

        let status = child
            .wait()
            .await
            .with_context(|| format!("waiting for `{command}` of job '{}'", job.name))?;

        // Drain the readers so every line lands before the block closes.
        for reader in [stdout, stderr].into_iter().flatten() {
            let _ = reader.await;
        }

        let code = status.code().unwrap_or(-1);
        debug!(job = %job.id, cmd = %command, exit_code = code, "job command exited");
        Ok(code)
    }
}
