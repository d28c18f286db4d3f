//! # Reprise CLI (`rpr`)
//!
//! The `rpr` binary is the primary interface for Reprise. It provides
//! commands for database initialization, thread and post management,
//! continuity queries, integrity sweeps, and starting the HTTP server.
//!
//! ## Usage
//!
//! ```bash
//! rpr --config ./config/reprise.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `rpr init` | Create the SQLite database and run schema migrations |
//! | `rpr thread new --title <t>` | Create a thread |
//! | `rpr thread list` | List threads, newest first |
//! | `rpr thread show <id>` | Show a thread with its posts and assets |
//! | `rpr thread promote <id>` | Mark a thread curated |
//! | `rpr thread delete <id>` | Delete a thread and everything it owns |
//! | `rpr post <thread-id> --author <a> --image <path>` | Add a post with images |
//! | `rpr continuity <thread-id>` | Cross-thread chains for a thread's assets |
//! | `rpr verify` | Integrity sweep over the database and media root |
//! | `rpr serve` | Start the HTTP server |
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the database
//! rpr init --config ./config/reprise.toml
//!
//! # Create a thread and post two scans to it
//! rpr thread new --title "Kornmarkt, market day" --year 1925
//! rpr post <thread-id> --author otto --text "from the family album" \
//!     --image scan1.jpg --image scan2.png
//!
//! # Where else do these photos appear?
//! rpr continuity <thread-id>
//!
//! # Start the HTTP server
//! rpr serve
//! ```

use anyhow::Context as _;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

use reprise::config;
use reprise::engine::Engine;
use reprise::migrate;
use reprise::models::{ContinuityReport, MatchKind, NewPost, NewThread, ThreadDetail};
use reprise::phash;
use reprise::server;
use reprise::verify;

/// Reprise CLI — an asset continuity engine for recurring archive photos.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/reprise.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "rpr",
    about = "Reprise — an asset continuity engine for recurring archive photos",
    version,
    long_about = "Reprise ingests scanned photographs into threads, normalizes and \
    fingerprints every image (SHA-256 of the normalized bytes plus a 64-bit perceptual \
    hash), and answers continuity queries: every other thread where the same or a \
    visually near-identical photo appears, ordered oldest first."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/reprise.toml`. Database, media, fingerprint,
    /// matching, and server settings are read from this file.
    #[arg(long, global = true, default_value = "./config/reprise.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables (threads,
    /// posts, assets). This command is idempotent — running it multiple
    /// times is safe.
    Init,

    /// Manage threads.
    Thread {
        #[command(subcommand)]
        action: ThreadAction,
    },

    /// Add a post with images to a thread.
    ///
    /// Every image is decoded, normalized, and fingerprinted before
    /// anything is stored; one bad file fails the whole post and nothing
    /// is written.
    Post {
        /// Thread id receiving the post.
        thread_id: String,

        /// Post author.
        #[arg(long)]
        author: String,

        /// Post body text.
        #[arg(long, default_value = "")]
        text: String,

        /// Image file to attach. Repeat for multiple images.
        #[arg(long = "image")]
        images: Vec<PathBuf>,
    },

    /// Show cross-thread continuity for a thread's assets.
    ///
    /// Prints every chain: other threads carrying the same photo (exact,
    /// by content hash) or a visually near-identical one (by perceptual
    /// hash distance), oldest thread first.
    Continuity {
        /// Thread id to query.
        thread_id: String,

        /// Near-match Hamming radius (defaults to `[matching].max_distance`).
        #[arg(long)]
        max_distance: Option<u32>,

        /// Print the raw JSON report instead of the table.
        #[arg(long)]
        json: bool,
    },

    /// Sweep the database and media root for damage.
    ///
    /// Re-hashes every stored rendition and checks ownership edges.
    /// Exits non-zero if anything is damaged.
    Verify,

    /// Start the HTTP server.
    ///
    /// Binds to the address configured in `[server].bind` and serves the
    /// JSON API plus the stored renditions.
    Serve,

    /// Generate shell completions to stdout.
    Completions {
        /// Target shell.
        shell: Shell,
    },
}

/// Thread management subcommands.
#[derive(Subcommand)]
enum ThreadAction {
    /// Create a thread.
    New {
        /// Thread title.
        #[arg(long)]
        title: String,

        /// Where the photos were taken.
        #[arg(long)]
        location: Option<String>,

        /// Year the photos are believed to be from.
        #[arg(long)]
        year: Option<i32>,

        /// Free-form curator notes.
        #[arg(long)]
        notes: Option<String>,
    },

    /// List all threads, newest first.
    List,

    /// Show one thread with its posts and assets.
    Show {
        /// Thread id.
        id: String,
    },

    /// Mark a thread as curated. Idempotent.
    Promote {
        /// Thread id.
        id: String,
    },

    /// Delete a thread and everything it owns.
    Delete {
        /// Thread id.
        id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Completions don't need a config file
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        let name = cmd.get_name().to_string();
        clap_complete::generate(*shell, &mut cmd, name, &mut std::io::stdout());
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Thread { action } => match action {
            ThreadAction::New {
                title,
                location,
                year,
                notes,
            } => {
                let engine = Engine::open(&cfg).await?;
                let thread = engine
                    .create_thread(&NewThread {
                        title,
                        location,
                        year,
                        notes,
                    })
                    .await?;
                println!("Created thread {}", thread.id);
            }
            ThreadAction::List => {
                let engine = Engine::open(&cfg).await?;
                let threads = engine.list_threads().await?;
                if threads.is_empty() {
                    println!("No threads yet.");
                } else {
                    println!("{:<36}  {:<16}  {:<8}  TITLE", "ID", "CREATED", "PROMOTED");
                    for t in &threads {
                        println!(
                            "{:<36}  {:<16}  {:<8}  {}",
                            t.id,
                            format_ts(t.created_at),
                            if t.promoted { "yes" } else { "" },
                            t.title
                        );
                    }
                }
            }
            ThreadAction::Show { id } => {
                let engine = Engine::open(&cfg).await?;
                let detail = engine.get_thread(&id).await?;
                print_thread_detail(&detail);
            }
            ThreadAction::Promote { id } => {
                let engine = Engine::open(&cfg).await?;
                engine.promote(&id).await?;
                println!("Promoted thread {}", id);
            }
            ThreadAction::Delete { id } => {
                let engine = Engine::open(&cfg).await?;
                let removed = engine.delete_thread(&id).await?;
                println!("Deleted thread {} ({} asset(s) removed)", id, removed);
            }
        },
        Commands::Post {
            thread_id,
            author,
            text,
            images,
        } => {
            let mut raw = Vec::with_capacity(images.len());
            for path in &images {
                let bytes = std::fs::read(path)
                    .with_context(|| format!("Failed to read image: {}", path.display()))?;
                raw.push(bytes);
            }

            let engine = Engine::open(&cfg).await?;
            let (post, assets) = engine
                .add_post(&thread_id, &NewPost { author, body: text }, &raw)
                .await?;
            println!("Created post {} with {} asset(s)", post.id, assets.len());
            for asset in &assets {
                println!("  {}  {}", asset.id, asset.url);
            }
        }
        Commands::Continuity {
            thread_id,
            max_distance,
            json,
        } => {
            if let Some(d) = max_distance {
                if d > phash::HASH_BITS {
                    anyhow::bail!("--max-distance must be <= {}", phash::HASH_BITS);
                }
            }
            let engine = Engine::open(&cfg).await?;
            let report = engine.continuity(&thread_id, max_distance).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
        }
        Commands::Verify => {
            verify::run_verify(&cfg).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Completions { .. } => {
            // Handled above (before config loading)
            unreachable!()
        }
    }

    Ok(())
}

/// Print a thread with its posts and assets in `thread show` layout.
fn print_thread_detail(detail: &ThreadDetail) {
    let t = &detail.thread;
    println!("Thread:   {}", t.id);
    println!("Title:    {}", t.title);
    if let Some(location) = &t.location {
        println!("Location: {}", location);
    }
    if let Some(year) = t.year {
        println!("Year:     {}", year);
    }
    if let Some(notes) = &t.notes {
        println!("Notes:    {}", notes);
    }
    println!("Created:  {}", format_ts(t.created_at));
    println!("Promoted: {}", if t.promoted { "yes" } else { "no" });

    for pd in &detail.posts {
        println!();
        println!(
            "  Post {} by {} ({})",
            pd.post.id,
            pd.post.author,
            format_ts(pd.post.created_at)
        );
        if !pd.post.body.is_empty() {
            println!("    {}", pd.post.body);
        }
        for asset in &pd.assets {
            println!(
                "    Asset {}  {}  phash {}",
                asset.id, asset.url, asset.perceptual_hash
            );
        }
    }
}

/// Print a continuity report in `continuity` table layout.
fn print_report(report: &ContinuityReport) {
    println!(
        "Checked {} fingerprint(s) for thread {}",
        report.fingerprints_checked, report.thread_id
    );
    if report.chains.is_empty() {
        println!("No continuity found.");
        return;
    }

    for chain in &report.chains {
        println!();
        println!(
            "Chain {} ({} occurrence(s))",
            chain.matched_hash,
            chain.occurrences.len()
        );
        for occ in &chain.occurrences {
            let kind = match occ.match_kind {
                MatchKind::Exact => "exact".to_string(),
                MatchKind::Near => format!("near d={}", occ.distance),
            };
            println!(
                "  {}  {:<10}  {}  \"{}\"",
                format_ts(occ.thread_created_at),
                kind,
                occ.thread_id,
                occ.thread_title
            );
        }
    }
}

/// Format a Unix timestamp for table output.
fn format_ts(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
