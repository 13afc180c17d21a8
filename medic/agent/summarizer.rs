use std::{collections::BTreeSet, sync::Arc, sync::OnceLock, time::Duration};

use regex::Regex;

use crate::error::{AgentError, AgentResult};
use crate::llm::{complete_within, CompletionOptions, LanguageModel};
use crate::model::{EvidenceSet, Query, Summary};

/// Safety notice attached to every answer. Never model-generated.
pub const DISCLAIMER: &str = "Disclaimer: This summary is for informational purposes only and is not professional medical advice, diagnosis, or treatment. Always consult a qualified healthcare provider about your own situation.";

const SNIPPET_PROMPT_CHARS: usize = 1_200;

fn marker_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\[(\d+(?:\s*[,–-]\s*\d+)*)\]").expect("marker pattern is valid")
    })
}

/// Composes the cited answer from accepted evidence.
#[derive(Clone)]
pub struct Summarizer {
    model: Arc<dyn LanguageModel>,
    deadline: Duration,
}

impl std::fmt::Debug for Summarizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Summarizer")
            .field("deadline", &self.deadline)
            .finish()
    }
}

impl Summarizer {
    /// Creates a summarizer.
    pub fn new(model: Arc<dyn LanguageModel>, deadline: Duration) -> Self {
        Self { model, deadline }
    }

    /// Summarizes `evidence` for `query`. Citations follow evidence order.
    pub async fn summarize(&self, query: &Query, evidence: &EvidenceSet) -> AgentResult<Summary> {
        let prompt = summary_prompt(query.text(), evidence);
        let reply = complete_within(
            self.model.as_ref(),
            &prompt,
            CompletionOptions {
                max_tokens: 700,
                temperature: 0.2,
            },
            self.deadline,
        )
        .await?;
        let text = reply.trim().to_string();
        if text.is_empty() {
            return Err(AgentError::ModelUnavailable("empty summary".into()));
        }
        let citations = cited_identifiers(&text, evidence);
        Ok(Summary {
            text,
            citations,
            disclaimer: DISCLAIMER.to_string(),
        })
    }
}

fn summary_prompt(query: &str, evidence: &EvidenceSet) -> String {
    let source = evidence
        .iter()
        .next()
        .map_or("search", |item| item.source.display_name());
    let mut listing = String::new();
    for (idx, item) in evidence.iter().enumerate() {
        let snippet: String = item.snippet.chars().take(SNIPPET_PROMPT_CHARS).collect();
        listing.push_str(&format!(
            "[{}] {}\nIdentifier: {}\n{}\n\n",
            idx + 1,
            item.title,
            item.identifier,
            snippet
        ));
    }
    format!(
        r#"You are a medical information assistant.

Summarize the following search results for the query:
"{query}"

Use a professional, factual tone. Cite results inline with their bracketed numbers, e.g. [1].
Only use the results below. Do not add a disclaimer; one is appended automatically.

Results ({source}):
{listing}"#
    )
}

/// Identifiers referenced by `[n]` markers, in evidence order. Every supplied
/// item is cited when the narrative carries no usable marker.
fn cited_identifiers(text: &str, evidence: &EvidenceSet) -> Vec<String> {
    let mut referenced = BTreeSet::new();
    for capture in marker_pattern().captures_iter(text) {
        for part in capture[1].split(',') {
            let mut bounds = part
                .split(['-', '–'])
                .filter_map(|n| n.trim().parse::<usize>().ok());
            let Some(first) = bounds.next() else {
                continue;
            };
            let last = bounds.next().unwrap_or(first).min(evidence.len());
            for n in first.max(1)..=last {
                referenced.insert(n - 1);
            }
        }
    }
    if referenced.is_empty() {
        return evidence.identifiers();
    }
    evidence
        .iter()
        .enumerate()
        .filter(|(idx, _)| referenced.contains(idx))
        .map(|(_, item)| item.identifier.clone())
        .collect()
}
