mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "gauntlet")]
#[command(about = "Gauntlet - Run and grade code submissions locally", long_about = None)]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true, default_value = "false")]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Grade one execution request (JSON file)
    Run {
        /// Path to the request JSON
        #[arg(short, long)]
        request: PathBuf,

        /// Bypass admission control and call the orchestrator directly
        #[arg(long, default_value = "false")]
        direct: bool,
    },

    /// Grade a JSON array of requests concurrently through the queue
    Batch {
        /// Path to a JSON array of requests
        #[arg(short, long)]
        requests: PathBuf,
    },

    /// Run the security scanner over a source file
    Scan {
        /// Source file to scan
        #[arg(short, long)]
        file: PathBuf,

        /// Submission language (javascript, typescript, python, sql, java, ...)
        #[arg(short, long)]
        language: String,
    },

    /// Grade fill-in-blank answers against a blank configuration
    Blanks {
        /// JSON array of blank configurations
        #[arg(short, long)]
        config: PathBuf,

        /// JSON object mapping blank id to answer
        #[arg(short, long)]
        answers: PathBuf,
    },

    /// List submission languages and the runtime that executes each
    Languages,
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.json);

    match cli.command {
        Commands::Run { request, direct } => {
            commands::run_request(&request, direct).await?;
        }
        Commands::Batch { requests } => {
            commands::run_batch(&requests).await?;
        }
        Commands::Scan { file, language } => {
            commands::scan_file(&file, &language)?;
        }
        Commands::Blanks { config, answers } => {
            commands::grade_blanks(&config, &answers)?;
        }
        Commands::Languages => {
            commands::list_languages()?;
        }
    }

    Ok(())
}
