mod commands;

use anyhow::Result;
use arbiter_common::config::{DEFAULT_QUEUE, DEFAULT_REDIS_URL};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "arbiter-cli")]
#[command(about = "Arbiter CLI - Prepare judge directories and submit jobs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the code, scripts and test-case directories a worker expects
    Init {
        /// Project path
        #[arg(short, long, default_value = ".")]
        path: PathBuf,
    },

    /// Submit a job file and wait for its verdict
    Submit {
        /// JSON file with `problem_data` and `submission_data`
        #[arg(short, long)]
        job: PathBuf,

        /// Redis connection string
        #[arg(long, env = "REDIS_URL", default_value = DEFAULT_REDIS_URL)]
        redis_url: String,

        /// Inbound job queue
        #[arg(short, long, env = "ARBITER_QUEUE", default_value = DEFAULT_QUEUE)]
        queue: String,

        /// Seconds to wait for the reply
        #[arg(short, long, default_value = "120")]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init { path } => {
            commands::init_project(&path)?;
        }
        Commands::Submit {
            job,
            redis_url,
            queue,
            timeout,
        } => {
            commands::submit_job(&job, &redis_url, &queue, timeout).await?;
        }
    }

    Ok(())
}
