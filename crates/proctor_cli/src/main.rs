//! Proctor CLI - drive and inspect assessment delivery sessions.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(name = "proctor")]
#[command(about = "Assessment delivery session runner", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a test document and print its flattened plan
    Validate {
        /// Path to the test document (JSON)
        test: PathBuf,
    },
    /// Run a scripted candidate session against a test document
    Simulate {
        /// Path to the test document (JSON)
        test: PathBuf,
        /// Path to the session script (JSON)
        script: PathBuf,
        /// Write the final session snapshot to this file
        #[arg(long)]
        snapshot: Option<PathBuf>,
    },
    /// Print the lifecycle state stored in a session snapshot
    Inspect {
        /// Path to a session snapshot (JSON)
        snapshot: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Validate { test } => commands::validate::run(&test),
        Commands::Simulate {
            test,
            script,
            snapshot,
        } => commands::simulate::run(&test, &script, snapshot.as_deref()),
        Commands::Inspect { snapshot } => commands::inspect::run(&snapshot),
    }
}
