use std::{sync::Arc, time::Duration};

use serde::Deserialize;

use crate::error::{AgentError, AgentResult};
use crate::llm::{complete_within, extract_json_block, CompletionOptions, LanguageModel};
use crate::model::{Query, QueryCategory, QueryClassification};

/// Classification plus any notes for the session's reason trail.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifierOutcome {
    /// Always one of the two categories.
    pub classification: QueryClassification,
    /// Recovered conditions (ambiguity, model failure) worth recording.
    pub notes: Vec<String>,
}

#[derive(Deserialize)]
struct LabelPayload {
    category: String,
    #[serde(default)]
    confidence: Option<f32>,
}

/// Routes queries to `research` or `general` with one model call, one retry.
#[derive(Clone)]
pub struct QueryClassifier {
    model: Arc<dyn LanguageModel>,
    deadline: Duration,
}

impl std::fmt::Debug for QueryClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryClassifier")
            .field("deadline", &self.deadline)
            .finish()
    }
}

impl QueryClassifier {
    /// Creates a classifier.
    pub fn new(model: Arc<dyn LanguageModel>, deadline: Duration) -> Self {
        Self { model, deadline }
    }

    /// Classifies `query`. Only an empty query is an error; undecodable answers
    /// and model failures fall back to [`QueryCategory::General`].
    pub async fn classify(&self, query: &Query) -> AgentResult<ClassifierOutcome> {
        if query.is_blank() {
            return Err(AgentError::InvalidQuery);
        }
        let mut notes = Vec::new();
        for prompt in [classify_prompt(query.text()), strict_prompt(query.text())] {
            match complete_within(
                self.model.as_ref(),
                &prompt,
                CompletionOptions::deterministic(32),
                self.deadline,
            )
            .await
            {
                Ok(reply) => match decode_label(&reply) {
                    Some(classification) => {
                        return Ok(ClassifierOutcome {
                            classification,
                            notes,
                        })
                    }
                    None => notes.push(
                        AgentError::ClassificationAmbiguous(truncate(&reply, 80)).to_string(),
                    ),
                },
                Err(err) => notes.push(AgentError::from(err).to_string()),
            }
        }
        notes.push("classifier fell back to general".into());
        Ok(ClassifierOutcome {
            classification: QueryClassification::fallback(),
            notes,
        })
    }
}

fn classify_prompt(query: &str) -> String {
    format!(
        r#"You are deciding how to search for medical information.

Classify this query:
"{query}"

Output exactly one label:
- research: it asks about studies, evidence, molecules, or clinical trials.
- general: it asks about treatment options, symptoms, or patient-friendly info.

Answer as JSON: {{"category": "research" | "general", "confidence": <0.0-1.0>}}"#
    )
}

fn strict_prompt(query: &str) -> String {
    format!(
        r#"Your previous answer could not be read.
Classify the medical query below. Reply with exactly one lowercase word, either research or general, and nothing else.

Query: "{query}""#
    )
}

/// Strict decode: a JSON payload naming one category, or free text whose words
/// mention exactly one of the two labels.
fn decode_label(reply: &str) -> Option<QueryClassification> {
    if let Some(block) = extract_json_block(reply) {
        if let Ok(payload) = serde_json::from_str::<LabelPayload>(block) {
            let confidence = payload
                .confidence
                .filter(|c| c.is_finite())
                .map(|c| c.clamp(0.0, 1.0));
            return QueryCategory::from_label(&payload.category)
                .map(|category| QueryClassification::decoded(category, confidence));
        }
    }
    let lowered = reply.to_lowercase();
    let words: Vec<&str> = lowered
        .split(|c: char| !c.is_ascii_alphabetic())
        .filter(|w| !w.is_empty())
        .collect();
    let research = words.iter().any(|w| *w == "research");
    let general = words.iter().any(|w| *w == "general");
    match (research, general) {
        (true, false) => Some(QueryClassification::decoded(QueryCategory::Research, None)),
        (false, true) => Some(QueryClassification::decoded(QueryCategory::General, None)),
        _ => None,
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max_chars {
        trimmed.to_string()
    } else {
        let head: String = trimmed.chars().take(max_chars).collect();
        format!("{head}…")
    }
}
