//! # notebook-rag CLI (`nbrag`)
//!
//! Ingest study sources into notes and ask questions answered only from each
//! note's own content.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `nbrag init` | Create the SQLite database and run schema migrations |
//! | `nbrag ingest <note> --file <path>` | Ingest a txt, md, pdf, or docx file |
//! | `nbrag ingest <note> --label <l> --text "<text>"` | Ingest inline text |
//! | `nbrag ask <note> "<question>"` | Stream a grounded answer and its sources |
//! | `nbrag search <note> "<query>"` | Show the passages retrieval would use |
//! | `nbrag sources <note>` | List a note's ingested sources |
//! | `nbrag materials <note> --file <path>` | Generate summary, quiz, and flashcards |
//! | `nbrag drop <note>` | Delete a note's index |
//! | `nbrag serve` | Start the HTTP server |
//!
//! ## Examples
//!
//! ```bash
//! nbrag init --config ./config/nbrag.toml
//! nbrag ingest 1 --file lecture-03.pdf
//! nbrag ask 1 "What does the lecture say about photosynthesis?"
//! RUST_LOG=notebook_rag=debug nbrag serve
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use notebook_rag::commands;
use notebook_rag::config;
use notebook_rag::migrate;
use notebook_rag::models::NoteId;
use notebook_rag::server;

/// notebook-rag: per-note retrieval-augmented question answering.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/nbrag.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "nbrag",
    about = "Per-note retrieval-augmented question answering over ingested study sources",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/nbrag.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent: running it multiple times is safe.
    Init,

    /// Chunk, embed, and index one source into a note.
    ///
    /// Re-ingesting the same source appends new passages; use `drop` to
    /// start a note over.
    Ingest {
        /// Note identity.
        note: String,

        /// Citation label. Defaults to the file name with `--file`.
        #[arg(long)]
        label: Option<String>,

        /// Document to ingest (txt, md, pdf, docx).
        #[arg(long, conflicts_with = "text")]
        file: Option<PathBuf>,

        /// Inline text to ingest.
        #[arg(long)]
        text: Option<String>,
    },

    /// Ask a question answered from the note's sources.
    Ask {
        note: String,
        question: String,
    },

    /// Show the passages that would ground an answer.
    Search {
        note: String,
        query: String,

        /// Number of passages (defaults to `retrieval.top_k`).
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Generate a summary, key topics, a quiz, and flashcards from a source.
    Materials {
        note: String,

        /// Document to study (txt, md, pdf, docx).
        #[arg(long, conflicts_with = "text")]
        file: Option<PathBuf>,

        /// Inline text to study.
        #[arg(long)]
        text: Option<String>,

        /// Print the material as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List a note's ingested sources.
    Sources { note: String },

    /// Delete a note's index, its sources, and all passages.
    Drop { note: String },

    /// Start the HTTP server on `[server].bind`.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
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
        Commands::Ingest {
            note,
            label,
            file,
            text,
        } => {
            commands::run_ingest(&cfg, &NoteId::from(note), label, file.as_deref(), text).await?;
        }
        Commands::Ask { note, question } => {
            commands::run_ask(&cfg, &NoteId::from(note), &question).await?;
        }
        Commands::Search { note, query, limit } => {
            commands::run_search(&cfg, &NoteId::from(note), &query, limit).await?;
        }
        Commands::Materials {
            note,
            file,
            text,
            json,
        } => {
            commands::run_materials(&cfg, &NoteId::from(note), file.as_deref(), text, json).await?;
        }
        Commands::Sources { note } => {
            commands::run_sources(&cfg, &NoteId::from(note)).await?;
        }
        Commands::Drop { note } => {
            commands::run_drop(&cfg, &NoteId::from(note)).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
