use clawd::cli;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "clawd", version, about = "Chat-platform router with per-conversation run queues")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the daemon (gateway, scheduler, Discord bot)
    Start,
    /// Chat with the agent on stdin/stdout
    Console,
    /// Inspect or cancel scheduled jobs
    Jobs {
        #[command(subcommand)]
        action: JobsAction,
    },
    /// Check if the daemon is running
    Status,
}

#[derive(Subcommand, Debug)]
enum JobsAction {
    /// List persisted jobs
    List,
    /// Remove a job from the job file
    Cancel {
        /// Job identifier
        id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();
    let config_path = cli
        .config
        .unwrap_or_else(|| clawd::clawd_home().join("config.yaml"));
    let cfg = cli::load_config(&config_path).await?;

    match cli.command.unwrap_or(Command::Start) {
        Command::Start => cli::run_daemon(cfg).await,
        Command::Console => cli::run_console(cfg).await,
        Command::Jobs { action } => match action {
            JobsAction::List => cli::list_jobs(&cfg).await,
            JobsAction::Cancel { id } => cli::cancel_job(&cfg, &id).await,
        },
        Command::Status => cli::check_status(&cfg).await,
    }
}
