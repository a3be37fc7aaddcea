//! # notebook-rag
//!
//! Retrieval-augmented question answering scoped to a single note.
//!
//! Sources (documents, web pages, transcripts) are chunked, embedded, and
//! appended to the note's own vector collection. Questions are answered by
//! retrieving the most similar passages from that collection and streaming
//! a grounded answer followed by the passages it was grounded on.
//!
//! ## Architecture
//!
//! ```text
//!            write path                         read path
//! ┌────────┐   ┌─────────┐   ┌──────────┐   ┌───────────┐   ┌─────────────┐
//! │ text   │──▶│ chunker │──▶│ embedder │   │ retriever │──▶│ synthesizer │──▶ token… source
//! └────────┘   └─────────┘   └────┬─────┘   └─────┬─────┘   └─────────────┘
//!                                 ▼               │
//!                         ┌──────────────────┐    │
//!                         │ per-note index   │◀───┘
//!                         │ (SQLite, WAL)    │
//!                         └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | [`RagError`](error::RagError) taxonomy and wire codes |
//! | [`models`] | Core data types |
//! | [`chunk`] | Overlapping boundary-aware chunker |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`generation`] | Streaming generation providers |
//! | [`store`] | Per-note vector index (SQLite and in-memory) |
//! | [`retrieve`] | Question → ranked passages |
//! | [`answer`] | Prompt building and the answer event stream |
//! | [`ingest`] | Write-path pipeline |
//! | [`query`] | Read-path pipeline |
//! | [`materials`] | Summary, quiz, and flashcard generation |
//! | [`rag`] | Facade wiring the collaborators together |
//! | [`extract`] | Plain-text extraction from txt/md/pdf/docx |
//! | [`server`] | HTTP server |
//! | [`commands`] | CLI subcommand implementations |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod answer;
pub mod chunk;
pub mod commands;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod generation;
pub mod ingest;
pub mod materials;
pub mod migrate;
pub mod models;
pub mod query;
pub mod rag;
pub mod retrieve;
pub mod server;
pub mod store;
