//! WebBench CLI - Main Entry Point
//!
//! Runs resumable benchmark suites against supervised HTTP framework
//! servers and reports on their progress.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod output;

use commands::{run, status};

/// WebBench - HTTP framework benchmarking harness
#[derive(Parser)]
#[command(name = "webbench")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file
    #[arg(long, env = "WEBBENCH_CONFIG", default_value = webbench_common::DEFAULT_CONFIG_FILE, global = true)]
    config: PathBuf,

    /// Override the results root directory
    #[arg(long, global = true)]
    results_dir: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "table", global = true)]
    format: output::OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the benchmark suite, resuming an interrupted run of today
    Run(run::RunArgs),

    /// Show progress of a run
    Status(status::StatusArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .init();

    let ctx = commands::Context {
        config: cli.config,
        results_dir: cli.results_dir,
        format: cli.format,
    };

    match cli.command {
        Commands::Run(args) => run::execute(args, &ctx).await?,
        Commands::Status(args) => status::execute(args, &ctx)?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_overrides() {
        let cli = Cli::try_parse_from([
            "webbench",
            "--config",
            "bench.yaml",
            "run",
            "-n",
            "50000",
            "-c",
            "128",
            "-t",
            "ab",
            "-f",
            "gin,echo",
            "--retries",
            "5",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("bench.yaml"));

        let Commands::Run(args) = cli.command else {
            panic!("expected run command");
        };
        let overrides = args.overrides(None);
        assert_eq!(overrides.requests, Some(50000));
        assert_eq!(overrides.connections, Some(128));
        assert_eq!(overrides.tool, Some(webbench_common::ToolKind::Ab));
        assert_eq!(overrides.retries, Some(5));
        assert_eq!(overrides.frameworks, vec!["gin", "echo"]);
        assert!(overrides.scenarios.is_empty());
    }

    #[test]
    fn test_rejects_unknown_tool() {
        assert!(Cli::try_parse_from(["webbench", "run", "-t", "siege"]).is_err());
    }
}
