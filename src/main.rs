//! # vault-rag CLI (`vrag`)
//!
//! Question answering over a personal Markdown vault.
//!
//! ## Usage
//!
//! ```bash
//! vrag --config ./config/vrag.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `vrag init` | Create the SQLite database and run schema migrations |
//! | `vrag ingest` | Scan the vault, chunk, embed and index every note |
//! | `vrag search "<query>"` | Ranked hybrid retrieval with score breakdown |
//! | `vrag ask "<question>"` | Streamed answer with citations |
//! | `vrag stats` | Index counts by category and book |
//! | `vrag serve` | Start the HTTP API |
//! | `vrag completions <shell>` | Print shell completions |

use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

use vault_rag::orchestrator::ChatRequest;
use vault_rag::{ask, config, ingest, logging, migrate, search, server, stats};

/// vault-rag — grounded answers from your notes.
///
/// All commands except `completions` read a TOML configuration file given
/// by `--config`.
#[derive(Parser)]
#[command(name = "vrag", version, about = "Retrieval-augmented answers over a Markdown vault")]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/vrag.toml")]
    config: PathBuf,

    /// Debug-level logging (overridden by VRAG_LOG).
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Index the vault.
    ///
    /// Every note is re-chunked and replaced atomically, so searches running
    /// during ingestion see either the old or the new version of a note.
    Ingest {
        /// Delete indexed notes that no longer exist in the vault.
        #[arg(long)]
        prune: bool,

        /// Show note and chunk counts without writing to the database.
        #[arg(long)]
        dry_run: bool,

        /// Maximum number of notes to process. Disables pruning.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Search the index without generating an answer.
    Search {
        query: String,

        #[arg(long)]
        category: Option<String>,

        #[arg(long)]
        book: Option<String>,

        /// Number of results (default: `[retrieval] top_k`).
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Ask a question and stream the answer.
    Ask {
        question: String,

        /// Restrict context to one category.
        #[arg(long)]
        category: Option<String>,

        /// Generation provider for this question (disabled, openai, ollama).
        #[arg(long)]
        provider: Option<String>,

        /// Generation model for this question.
        #[arg(long)]
        model: Option<String>,
    },

    /// Show what's indexed.
    Stats,

    /// Start the HTTP server on `[server] bind`.
    Serve,

    /// Print a shell completion script.
    Completions { shell: Shell },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    if let Commands::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "vrag", &mut std::io::stdout());
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest {
            prune,
            dry_run,
            limit,
        } => {
            ingest::run_ingest(&cfg, prune, dry_run, limit).await?;
        }
        Commands::Search {
            query,
            category,
            book,
            limit,
        } => {
            search::run_search(&cfg, &query, category, book, limit).await?;
        }
        Commands::Ask {
            question,
            category,
            provider,
            model,
        } => {
            let request = ChatRequest {
                category,
                provider,
                model,
                ..ChatRequest::new(question)
            };
            ask::run_ask(&cfg, request).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}
