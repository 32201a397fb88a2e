//! # scoreport CLI
//!
//! The `scoreport` binary drives imports, orphan reconciliation, and lock
//! maintenance against a SQLite database.
//!
//! ## Usage
//!
//! ```bash
//! scoreport --config ./config/scoreport.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `scoreport init` | Create the SQLite database and run schema migrations |
//! | `scoreport import <type> <file> --user <id>` | Run one import |
//! | `scoreport imports show <id>` | Print a stored import run |
//! | `scoreport orphans list` | List orphaned records |
//! | `scoreport orphans reconcile` | Retry orphans once |
//! | `scoreport orphans watch` | Retry orphans on an interval |
//! | `scoreport orphans purge --exhausted` | Delete exhausted orphans |
//! | `scoreport blacklist add <score-id> --user <id>` | Never commit a dedup key |
//! | `scoreport locks sweep [--all]` | Delete expired (or all) locks |
//! | `scoreport stats` | Database statistics |

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use scoreport::config;
use scoreport::db;
use scoreport::ingest::{self, ImportRequest};
use scoreport::logging;
use scoreport::migrate;
use scoreport::progress::ProgressMode;
use scoreport::reconcile_cmd;
use scoreport::stats;
use scoreport_core::progress::RunStatus;

/// scoreport: score normalization and orphan retry for rhythm-game
/// score imports.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file.
#[derive(Parser)]
#[command(
    name = "scoreport",
    about = "Score normalization and orphan retry for rhythm-game score imports",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/scoreport.toml")]
    config: PathBuf,

    /// Emit progress as JSON lines on stderr instead of human-readable text.
    #[arg(long, global = true)]
    json_progress: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent: running it multiple times is safe.
    Init,

    /// Import a file of raw records for one user.
    ///
    /// The file holds a JSON array of records or one record per line.
    Import {
        /// Import type, e.g. `ir/fervidex` or `file/mer-iidx`.
        import_type: String,
        /// Path to the record file.
        file: PathBuf,
        #[arg(long)]
        user: i64,
        /// Import context as a JSON object.
        #[arg(long, default_value = "{}")]
        context: String,
        /// Print the import ID once the run is registered, then run it
        /// without progress output. Overrides `import.background`.
        #[arg(long)]
        background: bool,
    },

    /// Inspect import runs.
    Imports {
        #[command(subcommand)]
        action: ImportsAction,
    },

    /// Inspect and retry orphaned records.
    Orphans {
        #[command(subcommand)]
        action: OrphansAction,
    },

    /// Manage the score blacklist.
    Blacklist {
        #[command(subcommand)]
        action: BlacklistAction,
    },

    /// Per-user lock recovery.
    Locks {
        #[command(subcommand)]
        action: LocksAction,
    },

    /// Show database statistics.
    Stats,
}

#[derive(Subcommand)]
enum ImportsAction {
    /// Print a stored import run.
    Show { import_id: String },
}

#[derive(Subcommand)]
enum OrphansAction {
    /// List orphans, oldest first.
    List {
        #[arg(long)]
        user: Option<i64>,
    },
    /// Retry orphans once, for one user or for everyone.
    Reconcile {
        #[arg(long)]
        user: Option<i64>,
    },
    /// Retry every user's orphans every `orphans.sweep_interval_secs`.
    Watch,
    /// Delete orphans that reached the retry ceiling.
    Purge {
        /// Required: only exhausted orphans can be purged.
        #[arg(long)]
        exhausted: bool,
        #[arg(long)]
        user: Option<i64>,
    },
}

#[derive(Subcommand)]
enum BlacklistAction {
    /// Blacklist a dedup key so it is never committed.
    Add {
        score_id: String,
        #[arg(long)]
        user: i64,
    },
}

#[derive(Subcommand)]
enum LocksAction {
    /// Delete expired locks.
    Sweep {
        /// Delete every lock, live or not. Only safe when nothing is running.
        #[arg(long)]
        all: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    logging::init(&cfg.logging)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Import {
            import_type,
            file,
            user,
            context,
            background,
        } => {
            let context: serde_json::Value =
                serde_json::from_str(&context).context("--context must be valid JSON")?;
            let request = ImportRequest {
                user_id: user,
                import_type,
                path: file,
                context,
            };

            if background || cfg.import.background {
                let pool = db::connect(&cfg).await?;
                let (import_id, handle) = ingest::spawn_import(
                    pool.clone(),
                    cfg.clone(),
                    request,
                    ProgressMode::Off.reporter(),
                )
                .await?;
                println!("{}", import_id);
                // The task dies with the process, so wait for it here.
                handle.await??;
                pool.close().await;
            } else {
                let mode = if cli.json_progress {
                    ProgressMode::Json
                } else {
                    ProgressMode::default_for_tty()
                };
                let reporter = mode.reporter();
                let run = ingest::run_import(&cfg, &request, reporter.as_ref()).await?;
                ingest::print_run(&run);
                if run.status == RunStatus::Failed {
                    bail!("import {} failed", run.import_id);
                }
                println!("ok");
            }
        }
        Commands::Imports {
            action: ImportsAction::Show { import_id },
        } => {
            let pool = db::connect(&cfg).await?;
            let run = ingest::poll_import(&pool, &import_id).await?;
            pool.close().await;
            match run {
                Some(run) => ingest::print_run(&run),
                None => bail!("No import with id {}", import_id),
            }
        }
        Commands::Orphans { action } => match action {
            OrphansAction::List { user } => reconcile_cmd::list_orphans(&cfg, user).await?,
            OrphansAction::Reconcile { user } => reconcile_cmd::run_reconcile(&cfg, user).await?,
            OrphansAction::Watch => reconcile_cmd::run_watch(&cfg).await?,
            OrphansAction::Purge { exhausted, user } => {
                if !exhausted {
                    bail!("orphans purge only deletes exhausted orphans; pass --exhausted");
                }
                reconcile_cmd::run_purge(&cfg, user).await?;
            }
        },
        Commands::Blacklist {
            action: BlacklistAction::Add { score_id, user },
        } => {
            reconcile_cmd::run_blacklist_add(&cfg, &score_id, user).await?;
        }
        Commands::Locks {
            action: LocksAction::Sweep { all },
        } => {
            reconcile_cmd::run_lock_sweep(&cfg, all).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
    }

    Ok(())
}
