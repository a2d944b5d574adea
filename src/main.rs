//! # ReplyHub CLI (`replyhub`)
//!
//! ## Usage
//!
//! ```bash
//! replyhub --config ./config/replyhub.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `replyhub init` | Create the SQLite database and run schema migrations |
//! | `replyhub serve` | Start the HTTP and WebSocket server |
//! | `replyhub context "<query>"` | Print the context block retrieval would build |
//! | `replyhub ingest file <path>` | Split, embed and store a local text file |
//! | `replyhub ingest url <url>` | Fetch a page and store it keyed by URL |
//! | `replyhub customers` | List customer states for a tenant |
//!
//! ## Examples
//!
//! ```bash
//! replyhub init
//! replyhub ingest file ./faq.md --tenant acme --page 1001
//! replyhub context "what are your opening hours" --tenant acme --page 1001
//! replyhub customers --tenant acme --mode human_requested
//! replyhub serve
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use replyhub::config::{self, Config};
use replyhub::engine::{RetrievalEngine, RetrievalRequest};
use replyhub::ingest::{ingest_file, ingest_url, IngestReport, IngestTarget};
use replyhub::sqlite_store::SqliteStore;
use replyhub::{db, embedding, migrate, server};
use replyhub_core::handoff::HandoffCoordinator;
use replyhub_core::models::{Channel, ChannelSet, ConversationMode};
use tokio_util::sync::CancellationToken;

/// ReplyHub: retrieval-grounded replies with human handoff for page-based
/// customer support.
#[derive(Parser)]
#[command(name = "replyhub", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/replyhub.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent; running it multiple times is safe.
    Init,

    /// Start the HTTP and WebSocket server on `[server].bind`.
    Serve,

    /// Retrieve the context block for a query.
    Context {
        query: String,

        #[arg(long)]
        tenant: String,

        #[arg(long)]
        page: String,

        /// Only consider chunks enabled on this channel.
        #[arg(long)]
        channel: Option<Channel>,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// Ingest knowledge for a page.
    Ingest {
        #[command(subcommand)]
        action: IngestAction,
    },

    /// List customer states for a tenant, most recently updated first.
    Customers {
        #[arg(long)]
        tenant: String,

        /// `bot` or `human_requested`.
        #[arg(long)]
        mode: Option<ConversationMode>,
    },
}

#[derive(Subcommand)]
enum IngestAction {
    /// Ingest a local text file as uploaded knowledge.
    File {
        path: PathBuf,
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        page: String,
        /// Restrict the pieces to one channel (default: all channels).
        #[arg(long)]
        only: Option<Channel>,
    },
    /// Fetch a URL and ingest its body keyed by the URL.
    Url {
        url: String,
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        page: String,
        /// Source label stored on each piece.
        #[arg(long, default_value = "crm")]
        source: String,
        #[arg(long)]
        only: Option<Channel>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    init_tracing(&cfg.logging.level);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Context {
            query,
            tenant,
            page,
            channel,
            limit,
        } => {
            let store = open_store(&cfg).await?;
            let embedder = embedding::create_provider(&cfg.embedding)?;
            let engine = RetrievalEngine::new(Arc::new(store), embedder, &cfg.retrieval);
            let request = RetrievalRequest {
                limit,
                ..RetrievalRequest::new(&tenant, &page, &query).channel(channel)
            };
            let outcome = engine.retrieve(&request, &CancellationToken::new()).await;
            for reason in &outcome.degraded {
                eprintln!("degraded: {:?}", reason);
            }
            if outcome.context.is_empty() {
                println!("No relevant knowledge found.");
            } else {
                println!("{}", outcome.context);
            }
        }
        Commands::Ingest { action } => {
            let store = open_store(&cfg).await?;
            let embedder = embedding::create_provider(&cfg.embedding)?;
            let report = match action {
                IngestAction::File {
                    path,
                    tenant,
                    page,
                    only,
                } => {
                    let target = ingest_target(&cfg, &tenant, &page, only);
                    ingest_file(&store, embedder.as_ref(), &target, &path).await?
                }
                IngestAction::Url {
                    url,
                    tenant,
                    page,
                    source,
                    only,
                } => {
                    let target = ingest_target(&cfg, &tenant, &page, only);
                    ingest_url(&store, embedder.as_ref(), &target, &url, &source).await?
                }
            };
            print_report(&report);
        }
        Commands::Customers { tenant, mode } => {
            let store = open_store(&cfg).await?;
            let coordinator = HandoffCoordinator::new(Arc::new(store));
            let states = coordinator.list(&tenant, mode).await?;
            if states.is_empty() {
                println!("No customers.");
            }
            for s in states {
                let agent = s
                    .assigned_agent
                    .as_ref()
                    .map(|a| a.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<20} {:<20} {:<16} v{:<4} {}",
                    s.key.page_id,
                    s.key.customer_id,
                    s.mode.as_str(),
                    s.version,
                    agent
                );
            }
        }
    }

    Ok(())
}

async fn open_store(cfg: &Config) -> anyhow::Result<SqliteStore> {
    let pool = db::connect(cfg).await?;
    migrate::apply(&pool).await?;
    Ok(SqliteStore::new(pool))
}

fn ingest_target<'a>(
    cfg: &Config,
    tenant: &'a str,
    page: &'a str,
    only: Option<Channel>,
) -> IngestTarget<'a> {
    IngestTarget {
        tenant_id: tenant,
        page_id: page,
        channels: only.map(ChannelSet::only).unwrap_or_default(),
        max_tokens: cfg.chunking.max_tokens,
    }
}

fn print_report(report: &IngestReport) {
    println!(
        "Ingested {} pieces ({} new, {} updated, {} without embedding).",
        report.total(),
        report.inserted,
        report.updated,
        report.unembedded
    );
}

/// Logs go to stderr so command output stays pipeable.
fn init_tracing(log_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "replyhub={log_level},replyhub_core={log_level},warn"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();
}
