//! Implementations of the `nbrag` subcommands.
//!
//! Each `run_*` function opens the configured index, performs one
//! operation, and prints a human-readable summary to stdout. Diagnostics go
//! through `tracing` to stderr.

use anyhow::{bail, Context, Result};
use std::io::Write;
use std::path::Path;

use crate::answer::StreamEvent;
use crate::config::Config;
use crate::extract::{extract_format, Format};
use crate::ingest::IngestOutcome;
use crate::models::NoteId;
use crate::rag::Rag;
use crate::retrieve::Retrieval;

/// Ingest a file or inline text into a note.
pub async fn run_ingest(
    config: &Config,
    note: &NoteId,
    label: Option<String>,
    file: Option<&Path>,
    text: Option<String>,
) -> Result<()> {
    let (label, text) = match (file, text) {
        (Some(path), None) => {
            let text = read_document(path)?;
            let label = label.unwrap_or_else(|| {
                path.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.display().to_string())
            });
            (label, text)
        }
        (None, Some(text)) => {
            let Some(label) = label else {
                bail!("--label is required with --text");
            };
            (label, text)
        }
        _ => bail!("exactly one of --file or --text is required"),
    };

    let rag = Rag::from_config(config).await?;
    match rag.ingest(note, &label, &text).await? {
        IngestOutcome::Ingested { passages } => {
            println!("Ingested '{}' into note {}: {} passages.", label, note, passages);
        }
        IngestOutcome::Empty => {
            println!("Nothing to ingest: '{}' has no text content.", label);
        }
        IngestOutcome::Degraded { reason } => {
            println!("RAG disabled, '{}' was not indexed: {}", label, reason);
        }
    }
    Ok(())
}

/// Read a txt, md, pdf, or docx file as plain text.
fn read_document(path: &Path) -> Result<String> {
    let format = Format::from_path(path).unwrap_or(Format::Text);
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(extract_format(&bytes, format)?)
}

/// Generate study material for a file or inline text and print it.
pub async fn run_materials(
    config: &Config,
    note: &NoteId,
    file: Option<&Path>,
    text: Option<String>,
    json: bool,
) -> Result<()> {
    let text = match (file, text) {
        (Some(path), None) => read_document(path)?,
        (None, Some(text)) => text,
        _ => bail!("exactly one of --file or --text is required"),
    };

    let rag = Rag::from_config(config).await?;
    let material = rag.generate_materials(note, &text).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&material)?);
        return Ok(());
    }

    println!("Summary:\n  {}\n", material.summary);
    if !material.key_topics.is_empty() {
        println!("Key topics: {}\n", material.key_topics.join(", "));
    }
    if !material.quiz.is_empty() {
        println!("Quiz:");
        for (i, q) in material.quiz.iter().enumerate() {
            println!("  {}. {}", i + 1, q.question);
            for (letter, option) in ('a'..='z').zip(&q.options) {
                let mark = if option.trim() == q.answer.trim() { " *" } else { "" };
                println!("     {}) {}{}", letter, option, mark);
            }
        }
        println!();
    }
    if !material.flashcards.is_empty() {
        println!("Flashcards:");
        for card in &material.flashcards {
            println!("  {}: {}", card.term, card.definition);
        }
    }
    Ok(())
}

/// Ask a question, printing tokens as they arrive and the cited sources last.
pub async fn run_ask(config: &Config, note: &NoteId, question: &str) -> Result<()> {
    let rag = Rag::from_config(config).await?;
    let mut stream = rag.ask(note, question).await;
    let mut stdout = std::io::stdout();

    let mut failed = None;
    while let Some(event) = stream.next_event().await {
        match event {
            StreamEvent::Token { text } => {
                write!(stdout, "{}", text)?;
                stdout.flush()?;
            }
            StreamEvent::Source { sources } => {
                writeln!(stdout)?;
                writeln!(stdout)?;
                writeln!(stdout, "sources:")?;
                for (i, c) in sources.iter().enumerate() {
                    writeln!(
                        stdout,
                        "{}. [{:.2}] {} (chunk {})",
                        i + 1,
                        c.score,
                        c.label,
                        c.chunk_index
                    )?;
                }
            }
            StreamEvent::Error { code, message } => failed = Some((code, message)),
        }
    }
    writeln!(stdout)?;

    if let Some((code, message)) = failed {
        bail!("{} ({})", message, code);
    }
    Ok(())
}

/// Print the passages a question would be grounded on.
pub async fn run_search(config: &Config, note: &NoteId, query: &str, limit: Option<usize>) -> Result<()> {
    let rag = Rag::from_config(config).await?;
    let k = limit.unwrap_or(config.retrieval.top_k);

    let passages = match rag.retrieve(note, query, k).await? {
        Retrieval::Passages(p) => p,
        Retrieval::Unavailable(e) => bail!("retrieval unavailable: {}", e),
    };

    if passages.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, p) in passages.iter().enumerate() {
        println!(
            "{}. [{:.2}] {} / chunk {}",
            i + 1,
            p.score,
            p.passage.source_label,
            p.passage.chunk_index
        );
        println!(
            "    excerpt: \"{}\"",
            p.passage.text.replace('\n', " ").trim()
        );
        println!("    seq: {}", p.passage.seq);
        println!();
    }
    Ok(())
}

/// List the note's ingested sources.
pub async fn run_sources(config: &Config, note: &NoteId) -> Result<()> {
    let rag = Rag::from_config(config).await?;
    let sources = rag.sources(note).await?;

    if sources.is_empty() {
        println!("Note {} has no sources.", note);
        return Ok(());
    }

    println!("{:<24} {:>8}  {:<10}  PREVIEW", "LABEL", "PASSAGES", "ADDED");
    for s in &sources {
        let date = chrono::DateTime::from_timestamp(s.created_at, 0)
            .map(|dt| dt.format("%Y-%m-%d").to_string())
            .unwrap_or_default();
        let preview: String = s.preview.chars().take(40).collect();
        println!(
            "{:<24} {:>8}  {:<10}  {}",
            s.label, s.passage_count, date, preview
        );
    }
    Ok(())
}

/// Delete a note's whole index.
pub async fn run_drop(config: &Config, note: &NoteId) -> Result<()> {
    let rag = Rag::from_config(config).await?;
    if rag.delete_note(note).await? {
        println!("Dropped index for note {}.", note);
    } else {
        println!("Note {} had no index.", note);
    }
    Ok(())
}
