mod commands;

use clap::{Parser, Subcommand};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const DEFAULT_API_URL: &str = "http://127.0.0.1:9090";

/// ff -- drive the roadmap agent orchestrator from the terminal.
#[derive(Parser)]
#[command(name = "ff", version, about)]
struct Cli {
    /// Base URL of the ff-daemon API.
    #[arg(long, global = true, env = "FF_API_URL", default_value = DEFAULT_API_URL)]
    api_url: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show progress and agent status (default when no subcommand is given).
    Status,

    /// List tasks.
    Tasks {
        /// Only tasks in this status (pending, in_progress, completed, failed, blocked).
        #[arg(long)]
        status: Option<String>,
        /// Only tasks of this phase.
        #[arg(long)]
        phase: Option<u32>,
    },

    /// List agents.
    Agents,

    /// Show the execution log, oldest first.
    Logs {
        #[arg(long)]
        task: Option<String>,
        #[arg(long)]
        agent: Option<String>,
        #[arg(short = 'n', long, default_value_t = 50)]
        limit: usize,
    },

    /// Start a task now instead of waiting for the next tick.
    Run {
        /// Task ID.
        task: String,
    },

    /// Override a task's status (e.g. reset a failed task to pending).
    SetStatus {
        task: String,
        status: String,
    },

    /// Run a read-only SQL query against the state database.
    Query {
        sql: String,
    },

    /// Parse a ROADMAP.md checklist and create its tasks.
    Ingest {
        /// Path to the roadmap file.
        path: String,
        /// Print the parsed tasks without creating them.
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let api_url = cli.api_url.trim_end_matches('/');

    match cli.command {
        None | Some(Commands::Status) => commands::status::run(api_url).await?,
        Some(Commands::Tasks { status, phase }) => {
            commands::tasks::run(api_url, status.as_deref(), phase).await?
        }
        Some(Commands::Agents) => commands::agents::run(api_url).await?,
        Some(Commands::Logs { task, agent, limit }) => {
            commands::logs::run(api_url, task.as_deref(), agent.as_deref(), limit).await?
        }
        Some(Commands::Run { task }) => commands::run::run(api_url, &task).await?,
        Some(Commands::SetStatus { task, status }) => {
            commands::set_status::run(api_url, &task, &status).await?
        }
        Some(Commands::Query { sql }) => commands::query::run(api_url, &sql).await?,
        Some(Commands::Ingest { path, dry_run }) => {
            commands::ingest::run(api_url, &path, dry_run).await?
        }
    }

    Ok(())
}
