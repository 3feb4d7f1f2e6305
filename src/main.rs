//! # Chat Harvest CLI (`harvest`)
//!
//! ## Usage
//!
//! ```bash
//! harvest --config ./config/harvest.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `harvest init` | Create the SQLite store and run schema migrations |
//! | `harvest sources` | List workspace containers and their session files |
//! | `harvest sync` | Back up new and changed sessions |
//! | `harvest stats` | Summarize the store |
//! | `harvest export` | Write indexer units as JSON |

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use chat_harvest::progress::ProgressMode;
use chat_harvest::sync::{self, SyncOptions};
use chat_harvest::{config, export, migrate, sources, stats};

/// Chat Harvest: incremental backup of IDE chat sessions into SQLite.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/harvest.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "harvest",
    about = "Chat Harvest: incremental backup of IDE chat sessions into SQLite",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/harvest.toml")]
    config: PathBuf,

    /// Log run progress at info level (overridden by RUST_LOG).
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the store schema.
    ///
    /// Idempotent: running it multiple times is safe.
    Init,

    /// List workspace containers under the storage root.
    Sources {
        /// Storage root, overriding `source.root`.
        #[arg(long)]
        root: Option<PathBuf>,
    },

    /// Back up chat sessions.
    ///
    /// Reads every workspace container, classifies each session and writes
    /// only new or changed ones, all in a single transaction. Fails fast
    /// if another run holds the store.
    Sync {
        /// Storage root, overriding `source.root`.
        #[arg(long)]
        root: Option<PathBuf>,

        /// Rewrite every session and rebuild all aggregates.
        #[arg(long)]
        full: bool,

        /// Show what would change without writing to the store.
        #[arg(long)]
        dry_run: bool,

        /// Progress on stderr: `human`, `json` or `off`. Defaults to human
        /// when stderr is a terminal.
        #[arg(long)]
        progress: Option<String>,
    },

    /// Show store statistics.
    Stats,

    /// Export one text unit per session as JSON for a search indexer.
    Export {
        /// Write to this file instead of stdout.
        #[arg(long, short)]
        output: Option<PathBuf>,

        /// Only export sessions from this workspace.
        #[arg(long)]
        workspace: Option<String>,
    },
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "info" } else { "warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .compact()
        .try_init();
}

fn parse_progress(value: Option<&str>) -> anyhow::Result<ProgressMode> {
    match value {
        None => Ok(ProgressMode::default_for_tty()),
        Some("human") => Ok(ProgressMode::Human),
        Some("json") => Ok(ProgressMode::Json),
        Some("off") => Ok(ProgressMode::Off),
        Some(other) => anyhow::bail!(
            "Unknown progress mode: '{}'. Available: human, json, off",
            other
        ),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Sources { root } => {
            sources::list_sources(&cfg, root)?;
        }
        Commands::Sync {
            root,
            full,
            dry_run,
            progress,
        } => {
            let reporter = parse_progress(progress.as_deref())?.reporter();
            let options = SyncOptions {
                root,
                full,
                dry_run,
            };
            let summary = sync::run_sync(&cfg, &options, reporter.as_ref())
                .await
                .context("backup run failed")?;

            println!("sync{}", if dry_run { " (dry-run)" } else { "" });
            println!("  run: {}", summary.run_id);
            println!("  seen: {} sessions", summary.sessions_seen);
            println!("  new: {}", summary.sessions_new);
            println!("  updated: {}", summary.sessions_updated);
            println!("  unchanged: {}", summary.sessions_unchanged);
            println!("  messages: {}", summary.total_messages);
            println!("  workspaces: {}", summary.total_workspaces);
            println!(
                "  types: {} conversation / {} code_edit / {} mixed",
                summary.conversation_sessions, summary.code_edit_sessions, summary.mixed_sessions
            );
            println!("  issues: {}", summary.errors());
            for issue in &summary.issues {
                println!("    {}", issue);
            }
            println!("ok");
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Export { output, workspace } => {
            export::run_export(&cfg, output.as_deref(), workspace.as_deref()).await?;
        }
    }

    Ok(())
}
