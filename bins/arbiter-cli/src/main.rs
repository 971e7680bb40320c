mod commands;

use anyhow::Result;
use arbiter_common::Config;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "arbiter-cli")]
#[command(
    about = "Arbiter CLI - Inspect the judging fleet and speak the sandbox protocol",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register this host as a runner and print its RUNNER_ID and RUNNER_KEY
    Register {
        /// Runner name shown by the backend
        #[arg(long)]
        name: String,

        /// Runner label; repeat for several
        #[arg(long = "label")]
        labels: Vec<String>,

        /// Registration token issued by the backend
        #[arg(long)]
        token: String,
    },

    /// Poll the grading backend once and print the task, if any
    Poll,

    /// Show fleet-wide slot usage
    Slots {
        /// Zero the used-slot counter (only when no worker is running)
        #[arg(long)]
        reset: bool,
    },

    /// List session heartbeats with their age
    Sessions,

    /// Print one progress protocol line, for use from sandbox scripts
    Emit {
        #[command(subcommand)]
        action: commands::EmitAction,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Commands::Register {
            name,
            labels,
            token,
        } => {
            commands::register(&Config::from_env()?, name, labels, token).await?;
        }
        Commands::Poll => {
            commands::poll_once(&Config::from_env()?).await?;
        }
        Commands::Slots { reset } => {
            commands::show_slots(&Config::from_env()?, reset).await?;
        }
        Commands::Sessions => {
            commands::list_sessions(&Config::from_env()?).await?;
        }
        Commands::Emit { action } => {
            println!("{}", commands::emit(action)?);
        }
    }

    Ok(())
}
