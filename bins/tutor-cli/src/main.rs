mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "tutor-cli")]
#[command(about = "Tutor CLI - Grade exercises and run programs in the sandbox", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Grade every exercise's reference solution against its test cases
    Grade {
        /// Exercise file (JSON list of exercises)
        #[arg(short, long)]
        exercises: PathBuf,

        /// Per-run timeout in seconds (defaults to SANDBOX_TIMEOUT_SECS)
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Test cases run in parallel per exercise
        #[arg(short, long)]
        concurrency: Option<usize>,
    },

    /// Run a single program in the sandbox
    Run {
        /// Program file
        #[arg(short, long)]
        file: PathBuf,

        /// Runtime to use
        #[arg(short, long, default_value = "python")]
        language: String,

        /// Timeout in seconds (defaults to SANDBOX_TIMEOUT_SECS)
        #[arg(short, long)]
        timeout: Option<u64>,
    },

    /// Queue a job payload for the worker
    Submit {
        /// Job payload file (JSON)
        #[arg(short, long)]
        job: PathBuf,

        /// Per-run timeout override in seconds
        #[arg(short, long)]
        timeout: Option<u64>,

        #[arg(long, default_value = "redis://127.0.0.1:6379")]
        redis_url: String,
    },

    /// Fetch the stored result of a job
    Result {
        /// Job id printed by `submit`
        job_id: Uuid,

        #[arg(long, default_value = "redis://127.0.0.1:6379")]
        redis_url: String,
    },

    /// List configured runtimes
    Languages,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Grade {
            exercises,
            timeout,
            concurrency,
        } => {
            commands::grade_exercises(&exercises, timeout, concurrency).await?;
        }
        Commands::Run { file, language, timeout } => {
            commands::run_file(&file, &language, timeout).await?;
        }
        Commands::Submit { job, timeout, redis_url } => {
            commands::submit_job(&job, &redis_url, timeout).await?;
        }
        Commands::Result { job_id, redis_url } => {
            commands::fetch_result(job_id, &redis_url).await?;
        }
        Commands::Languages => {
            commands::list_languages()?;
        }
    }

    Ok(())
}
