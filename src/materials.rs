//! Structured study material generated from a source's text.
//!
//! [`MaterialsGenerator::generate`] asks the [`Generator`] for a JSON
//! document with a summary, key topics, a short multiple-choice quiz, and
//! flashcards, then parses and validates the collected reply.
//!
//! ```json
//! {
//!   "summary": "Photosynthesis turns light into chemical energy.",
//!   "key_topics": ["photosynthesis", "chlorophyll"],
//!   "quiz": [{ "question": "...", "options": ["a", "b", "c", "d"], "answer": "b" }],
//!   "flashcards": [{ "term": "chlorophyll", "definition": "..." }]
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::answer::{run_generation, StreamEvent, STREAM_BUFFER};
use crate::error::{RagError, Result};
use crate::generation::{Generator, TokenSink};

/// Quiz questions requested per source.
pub const QUIZ_QUESTIONS: usize = 2;
/// Options offered per quiz question.
pub const QUIZ_OPTIONS: usize = 4;
/// Flashcards requested per source.
pub const FLASHCARDS: usize = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyMaterial {
    pub summary: String,
    #[serde(default)]
    pub key_topics: Vec<String>,
    #[serde(default)]
    pub quiz: Vec<QuizItem>,
    #[serde(default)]
    pub flashcards: Vec<Flashcard>,
}

/// A multiple-choice question whose `answer` is the text of one option.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuizItem {
    pub question: String,
    pub options: Vec<String>,
    pub answer: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flashcard {
    pub term: String,
    pub definition: String,
}

/// Fill the study-material template for `text`.
pub fn build_materials_prompt(text: &str) -> String {
    format!(
        "Analyze the text below and create micro-learning study material.\n\
         Reply with a single JSON object and nothing else, using exactly these fields:\n\
         - summary: one paragraph summarizing the key content of the text.\n\
         - key_topics: an array of strings naming the main topics or keywords.\n\
         - quiz: {quiz} multiple-choice questions about the text. Each has a \
         \"question\", \"options\" with exactly {options} choices, and an \"answer\" \
         that is the exact text of the correct option.\n\
         - flashcards: {cards} cards, each with a \"term\" from the text and its \"definition\".\n\
         Write in the same language as the text.\n\
         \n\
         Text:\n\
         {text}\n\
         \n\
         JSON:",
        quiz = QUIZ_QUESTIONS,
        options = QUIZ_OPTIONS,
        cards = FLASHCARDS,
        text = text.trim()
    )
}

/// Parse a model reply into [`StudyMaterial`].
///
/// Accepts the object wrapped in a Markdown code fence or surrounded by
/// prose. Quiz items whose answer is not one of their options, and empty
/// flashcards, are dropped.
///
/// # Errors
///
/// [`RagError::GenerationFailed`] when no JSON object can be parsed or the
/// summary is empty.
pub fn parse_materials(reply: &str) -> Result<StudyMaterial> {
    let start = reply.find('{');
    let end = reply.rfind('}');
    let json = match (start, end) {
        (Some(start), Some(end)) if start < end => &reply[start..=end],
        _ => {
            return Err(RagError::GenerationFailed(
                "study material reply contains no JSON object".to_string(),
            ))
        }
    };

    let mut material: StudyMaterial = serde_json::from_str(json)
        .map_err(|e| RagError::GenerationFailed(format!("malformed study material: {}", e)))?;

    material.summary = material.summary.trim().to_string();
    if material.summary.is_empty() {
        return Err(RagError::GenerationFailed(
            "study material has an empty summary".to_string(),
        ));
    }

    material.key_topics.retain(|t| !t.trim().is_empty());
    material.quiz.retain(|q| {
        let valid = !q.question.trim().is_empty()
            && q.options.iter().any(|o| o.trim() == q.answer.trim());
        if !valid {
            tracing::warn!(question = %q.question, "dropping quiz item without a matching answer");
        }
        valid
    });
    material
        .flashcards
        .retain(|c| !c.term.trim().is_empty() && !c.definition.trim().is_empty());

    Ok(material)
}

/// Generates [`StudyMaterial`] with a [`Generator`].
pub struct MaterialsGenerator {
    generator: Arc<dyn Generator>,
    timeout: Duration,
}

impl MaterialsGenerator {
    pub fn new(generator: Arc<dyn Generator>, timeout: Duration) -> Self {
        Self { generator, timeout }
    }

    /// Build study material for one source's text.
    ///
    /// # Errors
    ///
    /// [`RagError::EmptyInput`] for blank text,
    /// [`RagError::ConfigurationMissing`] when no generator is configured,
    /// and the generation failures of [`parse_materials`] and the provider.
    pub async fn generate(&self, text: &str) -> Result<StudyMaterial> {
        if text.trim().is_empty() {
            return Err(RagError::EmptyInput);
        }

        let prompt = build_materials_prompt(text);
        let (sink, mut rx) = TokenSink::channel(STREAM_BUFFER);
        let generator = self.generator.as_ref();
        let timeout = self.timeout;

        let generation = async move {
            let outcome = run_generation(generator, &prompt, &sink, timeout).await;
            drop(sink);
            outcome
        };
        let collect = async {
            let mut reply = String::new();
            while let Some(event) = rx.recv().await {
                if let StreamEvent::Token { text } = event {
                    reply.push_str(&text);
                }
            }
            reply
        };

        let (outcome, reply) = tokio::join!(generation, collect);
        outcome?;
        let material = parse_materials(&reply)?;
        tracing::info!(
            model = self.generator.model_name(),
            topics = material.key_topics.len(),
            quiz = material.quiz.len(),
            flashcards = material.flashcards.len(),
            "generated study material"
        );
        Ok(material)
    }
}
