// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::config::default_plan_path;

/// Command-line arguments for `protorun`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "protorun",
    version,
    about = "Execute a protocol plan: a DAG of steps with quality gates and feedback policies.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the plan file (TOML).
    ///
    /// Default: `Protorun.toml` in the current working directory.
    #[arg(long, value_name = "PATH", default_value_os_t = default_plan_path())]
    pub plan: PathBuf,

    /// Override `[run].capacity` from the plan file.
    #[arg(long, value_name = "N")]
    pub capacity: Option<usize>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `PROTORUN_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Parse + validate, print groups and policies, but don't execute anything.
    #[arg(long)]
    pub dry_run: bool,

    /// Write the final run snapshot as JSON to this path.
    #[arg(long, value_name = "PATH")]
    pub state_out: Option<PathBuf>,

    /// Write every run event as a JSON line to this path.
    #[arg(long, value_name = "PATH")]
    pub events_out: Option<PathBuf>,
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
    fn defaults() {
        let args = CliArgs::try_parse_from(["protorun"]).unwrap();
        assert_eq!(args.plan, default_plan_path());
        assert_eq!(args.plan, PathBuf::from("Protorun.toml"));
        assert!(args.capacity.is_none());
        assert!(!args.dry_run);
    }

    #[test]
    fn overrides() {
        let args = CliArgs::try_parse_from([
            "protorun",
            "--plan",
            "plans/p.toml",
            "--capacity",
            "4",
            "--log-level",
            "debug",
            "--events-out",
            "events.jsonl",
        ])
        .unwrap();
        assert_eq!(args.plan, PathBuf::from("plans/p.toml"));
        assert_eq!(args.capacity, Some(4));
        assert!(matches!(args.log_level, Some(LogLevel::Debug)));
        assert_eq!(args.events_out, Some(PathBuf::from("events.jsonl")));
    }
}
