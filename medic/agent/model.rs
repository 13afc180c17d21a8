use std::fmt;

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

/// Who produced a query.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QueryOrigin {
    /// Typed by the user.
    User,
    /// Rewritten by the refiner.
    Refined,
}

/// Immutable query value. Refinement produces a new query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Query {
    text: String,
    origin: QueryOrigin,
    attempt: u32,
}

impl Query {
    /// A user query at attempt 0. Surrounding whitespace is trimmed.
    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            text: text.into().trim().to_string(),
            origin: QueryOrigin::User,
            attempt: 0,
        }
    }

    /// Follow-up query derived from `previous`, one attempt later.
    #[must_use]
    pub fn refined_from(previous: &Self, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            origin: QueryOrigin::Refined,
            attempt: previous.attempt + 1,
        }
    }

    /// Query text.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Query origin.
    #[must_use]
    pub const fn origin(&self) -> QueryOrigin {
        self.origin
    }

    /// Zero-based attempt index.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// True when the text has no visible characters.
    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// Which evidence source a query is routed to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum QueryCategory {
    /// Studies, trials, molecules: literature search.
    Research,
    /// Symptoms, treatments, patient-facing info: web search.
    General,
}

impl QueryCategory {
    /// Lower-case label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Research => "research",
            Self::General => "general",
        }
    }

    /// Parses an exact label (case-insensitive).
    #[must_use]
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "research" => Some(Self::Research),
            "general" => Some(Self::General),
            _ => None,
        }
    }

    /// Backend serving this category.
    #[must_use]
    pub const fn source(self) -> EvidenceSource {
        match self {
            Self::Research => EvidenceSource::PubMed,
            Self::General => EvidenceSource::Tavily,
        }
    }
}

impl fmt::Display for QueryCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Classifier output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryClassification {
    /// Routed category.
    pub category: QueryCategory,
    /// Model-reported confidence, when it gave one.
    pub confidence: Option<f32>,
    /// Set when the category is the ambiguity fallback rather than a decoded answer.
    #[serde(default)]
    pub fallback: bool,
}

impl QueryClassification {
    /// A decoded classification.
    #[must_use]
    pub const fn decoded(category: QueryCategory, confidence: Option<f32>) -> Self {
        Self {
            category,
            confidence,
            fallback: false,
        }
    }

    /// The fallback classification used when the model answer cannot be decoded.
    #[must_use]
    pub const fn fallback() -> Self {
        Self {
            category: QueryCategory::General,
            confidence: None,
            fallback: true,
        }
    }
}

/// Backend identity of an evidence item.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EvidenceSource {
    /// Literature search (PMID identifiers).
    PubMed,
    /// Web search (URL identifiers).
    Tavily,
}

impl EvidenceSource {
    /// Lower-case label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::PubMed => "pubmed",
            Self::Tavily => "tavily",
        }
    }

    /// Display name used in progress output.
    #[must_use]
    pub const fn display_name(self) -> &'static str {
        match self {
            Self::PubMed => "PubMed",
            Self::Tavily => "Tavily",
        }
    }
}

impl fmt::Display for EvidenceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One search hit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EvidenceItem {
    /// PMID or URL.
    pub identifier: String,
    /// Title.
    pub title: String,
    /// Snippet or abstract excerpt.
    pub snippet: String,
    /// Backend that returned the item.
    pub source: EvidenceSource,
}

impl EvidenceItem {
    /// Creates an item.
    #[must_use]
    pub fn new(
        identifier: impl Into<String>,
        title: impl Into<String>,
        snippet: impl Into<String>,
        source: EvidenceSource,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            title: title.into(),
            snippet: snippet.into(),
            source,
        }
    }
}

/// Evidence in backend rank order, unique by identifier.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EvidenceSet {
    items: Vec<EvidenceItem>,
}

impl EvidenceSet {
    /// Builds a set, dropping later duplicates of an identifier.
    #[must_use]
    pub fn from_ranked(items: impl IntoIterator<Item = EvidenceItem>) -> Self {
        let mut seen = IndexSet::new();
        let items = items
            .into_iter()
            .filter(|item| seen.insert(item.identifier.clone()))
            .collect();
        Self { items }
    }

    /// Empty set.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Number of items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True when the backend returned nothing usable.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Items in rank order.
    pub fn iter(&self) -> impl Iterator<Item = &EvidenceItem> {
        self.items.iter()
    }

    /// Items as a slice.
    #[must_use]
    pub fn items(&self) -> &[EvidenceItem] {
        &self.items
    }

    /// Identifiers in rank order.
    #[must_use]
    pub fn identifiers(&self) -> Vec<String> {
        self.items.iter().map(|item| item.identifier.clone()).collect()
    }

    /// Sum of snippet lengths in characters.
    #[must_use]
    pub fn total_snippet_chars(&self) -> usize {
        self.items.iter().map(|item| item.snippet.chars().count()).sum()
    }
}

impl<'a> IntoIterator for &'a EvidenceSet {
    type Item = &'a EvidenceItem;
    type IntoIter = std::slice::Iter<'a, EvidenceItem>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

/// Gate decision.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    /// Evidence is good enough to summarize.
    Accept,
    /// Search again with a refined query.
    Refine,
    /// Terminal; only the orchestrator records this.
    Fail,
}

impl Decision {
    /// Lower-case label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Refine => "refine",
            Self::Fail => "fail",
        }
    }
}

/// Decision plus the reason behind it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QualityVerdict {
    /// Decision.
    pub decision: Decision,
    /// Human-readable reason, fed to the refiner.
    pub reason: String,
}

impl QualityVerdict {
    /// Accept verdict.
    #[must_use]
    pub fn accept(reason: impl Into<String>) -> Self {
        Self {
            decision: Decision::Accept,
            reason: reason.into(),
        }
    }

    /// Refine verdict.
    #[must_use]
    pub fn refine(reason: impl Into<String>) -> Self {
        Self {
            decision: Decision::Refine,
            reason: reason.into(),
        }
    }

    /// Fail verdict.
    #[must_use]
    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            decision: Decision::Fail,
            reason: reason.into(),
        }
    }
}

/// Final cited answer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Summary {
    /// Narrative.
    pub text: String,
    /// Cited identifiers in evidence order.
    pub citations: Vec<String>,
    /// Fixed safety notice.
    pub disclaimer: String,
}
