// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::config::model::{DEFAULT_CORE_API_ADDR, DEFAULT_RUNNER_API_ADDR};

/// Command-line arguments for `cinder`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "cinder",
    version,
    about = "Self-hosted build orchestration: DAG scheduling, leased work, streamed logs.",
    long_about = None
)]
pub struct CliArgs {
    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `CINDER_LOG` or a default level will be used.
    #[arg(long, global = true, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Run the orchestration server.
    Serve {
        /// Path to the server config file (TOML).
        #[arg(long, value_name = "PATH", default_value = "Cinder.toml")]
        config: PathBuf,
    },

    /// Run an external runner against a server's runner API.
    Runner {
        #[arg(long, value_name = "ADDR", default_value = DEFAULT_RUNNER_API_ADDR)]
        server: String,

        #[arg(long)]
        name: String,

        #[arg(long)]
        token: String,

        /// Working directory for job commands.
        #[arg(long, value_name = "DIR")]
        workdir: Option<PathBuf>,

        #[arg(long, value_name = "DURATION", default_value = "500ms")]
        poll_interval: String,

        #[arg(long, value_name = "DURATION", default_value = "5s")]
        heartbeat_interval: String,
    },

    /// Validate a build definition and print its job graph. Nothing runs.
    Check {
        #[arg(value_name = "BUILD_FILE")]
        build_file: PathBuf,
    },

    /// Submit a build definition.
    Submit {
        #[arg(long, value_name = "ADDR", default_value = DEFAULT_CORE_API_ADDR)]
        server: String,

        #[arg(value_name = "BUILD_FILE")]
        build_file: PathBuf,
    },

    /// Print a build's status and jobs.
    Status {
        #[arg(long, value_name = "ADDR", default_value = DEFAULT_CORE_API_ADDR)]
        server: String,

        build_id: String,
    },

    /// Cancel every unfinished job of a build.
    Cancel {
        #[arg(long, value_name = "ADDR", default_value = DEFAULT_CORE_API_ADDR)]
        server: String,

        build_id: String,
    },

    /// Print a job's log.
    Logs {
        #[arg(long, value_name = "ADDR", default_value = DEFAULT_CORE_API_ADDR)]
        server: String,

        job_id: String,
    },
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runner_subcommand_parses() {
        let args = CliArgs::try_parse_from([
            "cinder", "--log-level", "debug", "runner", "--name", "r1", "--token", "t",
        ])
        .unwrap();
        match args.command {
            Command::Runner { server, name, .. } => {
                assert_eq!(server, DEFAULT_RUNNER_API_ADDR);
                assert_eq!(name, "r1");
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert!(matches!(args.log_level, Some(LogLevel::Debug)));
    }

    #[test]
    fn check_requires_a_file() {
        assert!(CliArgs::try_parse_from(["cinder", "check"]).is_err());
    }
}
