//! # Site Chat CLI (`sitechat`)
//!
//! The `sitechat` binary crawls websites into chat sessions, answers
//! questions about them, and serves the HTTP API.
//!
//! ## Usage
//!
//! ```bash
//! sitechat --config ./config/sitechat.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `sitechat init` | Create the SQLite database and run schema migrations |
//! | `sitechat crawl <url>` | Crawl a site and index it into a new session |
//! | `sitechat ask <session> "<question>"` | Ask a question about a crawled site |
//! | `sitechat sessions` | List recent sessions |
//! | `sitechat show <session>` | Show a session and its conversation |
//! | `sitechat delete <session>` | Delete a session |
//! | `sitechat search <session> "<query>"` | Retrieve matching chunks |
//! | `sitechat embed pending` | Backfill missing or stale embeddings |
//! | `sitechat embed rebuild` | Delete and regenerate all embeddings |
//! | `sitechat export <session>` | Export the site's cleaned text as JSON |
//! | `sitechat serve` | Start the HTTP API |

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use site_chat::logging::{self, LogFormat};
use site_chat::progress::ProgressMode;
use site_chat::{config, export, index, ingest, migrate, rag, search, server, session};

/// Site Chat CLI: crawl a website and chat with its content.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/sitechat.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "sitechat",
    about = "Site Chat: crawl a website and chat with its content",
    version,
    long_about = "Site Chat crawls a website, indexes its text for keyword and semantic \
    retrieval, and answers questions about it with a chat model. Conversations are kept \
    per session and served over a CLI and an HTTP API."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/sitechat.toml`.
    #[arg(long, global = true, default_value = "./config/sitechat.toml")]
    config: PathBuf,

    /// Increase log verbosity (repeatable).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Log line format on stderr: `text` or `json`.
    #[arg(long, global = true, default_value = "text")]
    log_format: String,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables.
    /// Running it more than once is safe.
    Init,

    /// Crawl a website and index it into a new session.
    ///
    /// Prints the session id on success. Pages of a previously crawled
    /// site are reused from the cache unless `--refresh` is given.
    Crawl {
        /// Start URL (http or https).
        url: String,

        /// Ignore cached pages and crawl again.
        #[arg(long)]
        refresh: bool,

        /// Progress output on stderr: `human`, `json`, or `off`.
        /// Defaults to `human` on a terminal, otherwise `off`.
        #[arg(long)]
        progress: Option<String>,
    },

    /// Ask a question about a crawled site.
    ///
    /// Earlier questions in the same session are used as context.
    Ask {
        /// Session id printed by `crawl`.
        session: String,

        /// The question.
        question: String,
    },

    /// List recent sessions, newest first.
    Sessions,

    /// Show a session and its conversation.
    Show {
        /// Session id.
        session: String,
    },

    /// Delete a session and its chunks and conversation.
    Delete {
        /// Session id.
        session: String,
    },

    /// Retrieve the chunks of a session that best match a query.
    Search {
        /// Session id.
        session: String,

        /// The search query string.
        query: String,

        /// Retrieval mode: `keyword`, `semantic`, or `hybrid`.
        /// Defaults to `[retrieval].mode`.
        #[arg(long)]
        mode: Option<String>,

        /// Maximum number of results to return.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Manage embedding vectors.
    Embed {
        #[command(subcommand)]
        action: EmbedAction,
    },

    /// Export the cleaned text of a session's site as JSON.
    Export {
        /// Session id.
        session: String,

        /// Output file. Writes to stdout when omitted.
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Start the HTTP API.
    ///
    /// Binds to the address configured in `[server].bind`.
    Serve,
}

/// Embedding management subcommands.
#[derive(Subcommand)]
enum EmbedAction {
    /// Embed chunks that are missing or have stale embeddings.
    Pending {
        /// Only embed chunks of this session.
        #[arg(long)]
        session: Option<String>,

        /// Maximum number of chunks to embed in this run.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Delete and regenerate all embeddings.
    ///
    /// Useful when switching embedding models or dimensions.
    Rebuild,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let format = match cli.log_format.as_str() {
        "json" => LogFormat::Json,
        "text" => LogFormat::Text,
        other => anyhow::bail!("Unknown log format: {} (expected text or json)", other),
    };
    let default_level = match cli.command {
        Commands::Serve => "info",
        _ => "warn",
    };
    logging::init(default_level, cli.verbose, format);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_init(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Crawl {
            url,
            refresh,
            progress,
        } => {
            let mode = match progress.as_deref() {
                None => ProgressMode::default_for_tty(),
                Some(s) => ProgressMode::parse(s).ok_or_else(|| {
                    anyhow::anyhow!("Unknown progress mode: {} (expected human, json or off)", s)
                })?,
            };
            ingest::run_crawl(&cfg, &url, refresh, mode).await?;
        }
        Commands::Ask { session, question } => {
            rag::run_ask(&cfg, &session, &question).await?;
        }
        Commands::Sessions => {
            session::run_sessions(&cfg).await?;
        }
        Commands::Show { session } => {
            session::run_show(&cfg, &session).await?;
        }
        Commands::Delete { session } => {
            session::run_delete(&cfg, &session).await?;
        }
        Commands::Search {
            session,
            query,
            mode,
            limit,
        } => {
            search::run_search(&cfg, &session, &query, mode.as_deref(), limit).await?;
        }
        Commands::Embed { action } => match action {
            EmbedAction::Pending { session, limit } => {
                index::run_embed_pending(&cfg, session.as_deref(), limit).await?;
            }
            EmbedAction::Rebuild => {
                index::run_embed_rebuild(&cfg).await?;
            }
        },
        Commands::Export { session, output } => {
            export::run_export(&cfg, &session, output.as_deref()).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
