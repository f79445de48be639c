mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "crucible",
    version,
    about = "Sandboxed execution of learner code submissions"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a Python file in a sandbox, optionally against test cases
    Run {
        /// Path to the Python source file
        file: PathBuf,
        /// JSON file with test cases:
        /// [{"name", "test_code", "expected_output"}, ...]
        #[arg(long)]
        tests: Option<PathBuf>,
        /// Wall-clock limit in seconds
        #[arg(long)]
        time_limit: Option<u64>,
        /// Memory ceiling in megabytes
        #[arg(long)]
        memory_limit_mb: Option<u64>,
        /// Bypass the result cache for this run
        #[arg(long)]
        no_cache: bool,
        /// Sandbox base image
        #[arg(long)]
        image: Option<String>,
        /// Print the raw report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Statically validate a file without executing anything
    Check {
        file: PathBuf,
        /// Print the verdict as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show engine configuration and runtime availability
    Status {
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            file,
            tests,
            time_limit,
            memory_limit_mb,
            no_cache,
            image,
            json,
        } => {
            commands::run(
                &file,
                tests.as_deref(),
                time_limit,
                memory_limit_mb,
                no_cache,
                image,
                json,
            )
            .await
        }
        Commands::Check { file, json } => commands::check(&file, json),
        Commands::Status { json } => commands::status(json).await,
    }
}
