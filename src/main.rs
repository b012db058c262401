//! # codelore CLI (`lore`)
//!
//! ```bash
//! lore --config ./config/lore.toml <command>
//! ```
//!
//! | Command | Description |
//! |---------|-------------|
//! | `lore init` | Create the SQLite database and run schema migrations |
//! | `lore project add <url>` | Register a project |
//! | `lore project list` | List registered projects |
//! | `lore poll <id>` | Ingest the project's newest commits |
//! | `lore commits <id>` | Print the commit log with summaries |
//! | `lore ask <id> "<question>"` | Stream an answer grounded on indexed files |
//! | `lore index put <id> <path> --summary <text>` | Index one source file |
//! | `lore usage <id>` | Questions asked in the last N days |
//! | `lore serve` | Start the HTTP server |
//!
//! Logs go to stderr; set `RUST_LOG` (default `info`) to adjust.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use codelore::{answer, config, indexer, ingest, migrate, project, server};

/// codelore: commit summaries and code Q&A for git repositories.
#[derive(Parser)]
#[command(name = "lore", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/lore.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Manage projects.
    Project {
        #[command(subcommand)]
        action: ProjectAction,
    },

    /// Ingest the newest unprocessed commits of a project.
    Poll {
        project_id: String,
    },

    /// Print a project's commit log, newest first.
    Commits {
        project_id: String,

        /// Maximum number of commits to print.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Ask a question about a project's code.
    ///
    /// The answer streams to stdout, followed by the files it was grounded on.
    Ask {
        project_id: String,
        question: String,
    },

    /// Manage the semantic index.
    Index {
        #[command(subcommand)]
        action: IndexAction,
    },

    /// Show how many questions a project received.
    Usage {
        project_id: String,

        /// Window size in days.
        #[arg(long, default_value_t = project::USAGE_WINDOW_DAYS)]
        days: i64,
    },

    /// Start the HTTP server on `[server].bind`.
    Serve,
}

#[derive(Subcommand)]
enum ProjectAction {
    /// Register a repository and print the new project id.
    Add {
        /// Repository URL, e.g. https://github.com/owner/repo
        url: String,

        /// Display name (defaults to the repository name).
        #[arg(long)]
        name: Option<String>,
    },
    /// List registered projects.
    List,
}

#[derive(Subcommand)]
enum IndexAction {
    /// Embed a summary and store it with the file's content.
    Put {
        project_id: String,
        path: PathBuf,

        /// Summary text; this is what questions are matched against.
        #[arg(long)]
        summary: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Project { action } => match action {
            ProjectAction::Add { url, name } => {
                project::run_project_add(&cfg, &url, name.as_deref()).await?;
            }
            ProjectAction::List => {
                project::run_project_list(&cfg).await?;
            }
        },
        Commands::Poll { project_id } => {
            ingest::run_poll(&cfg, &project_id).await?;
        }
        Commands::Commits { project_id, limit } => {
            project::run_commits(&cfg, &project_id, limit).await?;
        }
        Commands::Ask {
            project_id,
            question,
        } => {
            answer::run_ask(&cfg, &project_id, &question).await?;
        }
        Commands::Index { action } => match action {
            IndexAction::Put {
                project_id,
                path,
                summary,
            } => {
                indexer::run_index_put(&cfg, &project_id, &path, &summary).await?;
            }
        },
        Commands::Usage { project_id, days } => {
            project::run_usage(&cfg, &project_id, days).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
