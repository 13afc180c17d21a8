//! Quality gate: deterministic evidence checks, then an LLM relevance judgment.

use std::{collections::HashSet, sync::Arc, sync::OnceLock, time::Duration};

use regex::Regex;
use serde::Deserialize;

use crate::config::GateConfig;
use crate::llm::{complete_within, extract_json_block, CompletionOptions, LanguageModel};
use crate::model::{EvidenceItem, EvidenceSet, Query, QualityVerdict};

const SNIPPET_PROMPT_CHARS: usize = 400;

const STOPWORDS: &[&str] = &[
    "about", "after", "also", "and", "any", "are", "because", "been", "before", "being", "best",
    "between", "both", "but", "can", "could", "did", "does", "during", "each", "for",
    "from", "had", "has", "have", "how", "into", "its", "latest", "more", "most", "new", "not",
    "other", "over", "should", "some", "such", "than", "that", "the", "their", "them", "then",
    "there", "these", "they", "this", "those", "through", "under", "use", "was", "were", "what",
    "when", "where", "which", "while", "who", "why", "will", "with", "would", "you", "your",
];

fn term_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[a-z0-9]+").expect("term pattern is valid"))
}

/// Content terms of `text`: lower-cased, stopwords and short tokens removed,
/// trailing plural `s` folded.
#[must_use]
pub fn content_terms(text: &str) -> HashSet<String> {
    let lowered = text.to_lowercase();
    term_pattern()
        .find_iter(&lowered)
        .map(|m| fold_plural(m.as_str()))
        .filter(|term| term.len() >= 3 && !STOPWORDS.contains(&term.as_str()))
        .collect()
}

fn fold_plural(term: &str) -> String {
    if term.len() > 4 && term.ends_with('s') && !term.ends_with("ss") {
        term[..term.len() - 1].to_string()
    } else {
        term.to_string()
    }
}

/// Share of `query_terms` that appear in the item's title or snippet.
#[must_use]
pub fn overlap_ratio(query_terms: &HashSet<String>, item: &EvidenceItem) -> f32 {
    if query_terms.is_empty() {
        return 0.0;
    }
    let item_terms = content_terms(&format!("{} {}", item.title, item.snippet));
    let shared = query_terms.intersection(&item_terms).count();
    #[allow(clippy::cast_precision_loss)]
    let ratio = shared as f32 / query_terms.len() as f32;
    ratio
}

#[derive(Deserialize)]
struct JudgmentPayload {
    decision: String,
    #[serde(default)]
    reason: Option<String>,
}

/// Decides whether evidence is good enough to summarize. Never returns `fail`.
#[derive(Clone)]
pub struct QualityGate {
    model: Arc<dyn LanguageModel>,
    thresholds: GateConfig,
    deadline: Duration,
}

impl std::fmt::Debug for QualityGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QualityGate")
            .field("thresholds", &self.thresholds)
            .field("deadline", &self.deadline)
            .finish()
    }
}

impl QualityGate {
    /// Creates a gate.
    pub fn new(model: Arc<dyn LanguageModel>, thresholds: GateConfig, deadline: Duration) -> Self {
        Self {
            model,
            thresholds,
            deadline,
        }
    }

    /// Deterministic checks only; `None` means the set passed them.
    #[must_use]
    pub fn precheck(&self, query: &Query, evidence: &EvidenceSet) -> Option<QualityVerdict> {
        if evidence.is_empty() {
            return Some(QualityVerdict::refine("no evidence returned"));
        }
        let chars = evidence.total_snippet_chars();
        if chars < self.thresholds.min_evidence_chars {
            return Some(QualityVerdict::refine(format!(
                "evidence too thin ({chars} characters of snippets)"
            )));
        }
        let terms = content_terms(query.text());
        if terms.is_empty() {
            return None;
        }
        let best = evidence
            .iter()
            .map(|item| overlap_ratio(&terms, item))
            .fold(0.0_f32, f32::max);
        if best < self.thresholds.min_overlap {
            return Some(QualityVerdict::refine(format!(
                "results do not mention the query terms (best overlap {best:.2})"
            )));
        }
        None
    }

    /// Evaluates `evidence` for `query`.
    pub async fn evaluate(&self, query: &Query, evidence: &EvidenceSet) -> QualityVerdict {
        if let Some(verdict) = self.precheck(query, evidence) {
            return verdict;
        }
        let prompt = judgment_prompt(query.text(), evidence);
        match complete_within(
            self.model.as_ref(),
            &prompt,
            CompletionOptions::deterministic(160),
            self.deadline,
        )
        .await
        {
            Ok(reply) => decode_judgment(&reply).unwrap_or_else(|| {
                QualityVerdict::refine("relevance judgment could not be read")
            }),
            Err(err) => QualityVerdict::refine(format!("relevance judgment unavailable: {err}")),
        }
    }
}

fn judgment_prompt(query: &str, evidence: &EvidenceSet) -> String {
    let mut listing = String::new();
    for (idx, item) in evidence.iter().enumerate() {
        let snippet: String = item.snippet.chars().take(SNIPPET_PROMPT_CHARS).collect();
        listing.push_str(&format!(
            "[{}] {} ({})\n{}\n\n",
            idx + 1,
            item.title,
            item.identifier,
            snippet
        ));
    }
    format!(
        r#"You review search results for a medical question.

Question: "{query}"

Results:
{listing}Judge whether these results contain enough relevant, specific information to answer the question.
Answer as JSON: {{"decision": "accept" | "refine", "reason": "<one sentence>"}}"#
    )
}

fn decode_judgment(reply: &str) -> Option<QualityVerdict> {
    if let Some(block) = extract_json_block(reply) {
        if let Ok(payload) = serde_json::from_str::<JudgmentPayload>(block) {
            let reason = payload
                .reason
                .map(|r| r.trim().to_string())
                .filter(|r| !r.is_empty());
            return match payload.decision.trim().to_ascii_lowercase().as_str() {
                "accept" => Some(QualityVerdict::accept(
                    reason.unwrap_or_else(|| "evidence judged relevant".into()),
                )),
                "refine" => Some(QualityVerdict::refine(
                    reason.unwrap_or_else(|| "evidence judged insufficient".into()),
                )),
                _ => None,
            };
        }
    }
    let lowered = reply.to_lowercase();
    let words: HashSet<&str> = lowered
        .split(|c: char| !c.is_ascii_alphabetic())
        .filter(|w| !w.is_empty())
        .collect();
    match (words.contains("accept"), words.contains("refine")) {
        (true, false) => Some(QualityVerdict::accept("evidence judged relevant")),
        (false, true) => Some(QualityVerdict::refine("evidence judged insufficient")),
        _ => None,
    }
}
