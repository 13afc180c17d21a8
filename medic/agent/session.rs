//! Per-request session state, owned by exactly one orchestrator run.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AgentError, AgentResult};
use crate::model::{EvidenceSet, QualityVerdict, Query, QueryCategory, QueryClassification, Summary};

/// Opaque key under which a session is checkpointed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionKey(String);

impl SessionKey {
    /// Wraps a caller-chosen key.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Fresh random key.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("session-{}", Uuid::new_v4()))
    }

    /// Key text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Orchestrator states.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgentStage {
    /// Deciding research vs general.
    Classifying,
    /// Waiting on a backend.
    Searching,
    /// Running the quality gate.
    Evaluating,
    /// Rewriting the query.
    Refining,
    /// Composing the answer.
    Summarizing,
    /// Terminal success.
    Done,
    /// Terminal failure.
    FailedTerminal,
}

impl AgentStage {
    /// Snake-case label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Classifying => "classifying",
            Self::Searching => "searching",
            Self::Evaluating => "evaluating",
            Self::Refining => "refining",
            Self::Summarizing => "summarizing",
            Self::Done => "done",
            Self::FailedTerminal => "failed_terminal",
        }
    }

    /// True for `Done` and `FailedTerminal`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::FailedTerminal)
    }
}

impl fmt::Display for AgentStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Why a request ended in `FailedTerminal`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    /// Empty query text.
    InvalidQuery,
    /// Attempt budget spent without acceptable evidence.
    EvidenceExhausted,
    /// Refiner produced nothing new.
    RefinementDegenerate,
    /// Summarizer model failed.
    SummaryUnavailable,
    /// Caller cancelled.
    Cancelled,
    /// Another request holds the session key.
    SessionBusy,
    /// Collaborator failure outside the modelled cases.
    Unexpected(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidQuery => f.write_str("invalid query"),
            Self::EvidenceExhausted => f.write_str("evidence exhausted"),
            Self::RefinementDegenerate => f.write_str("refinement degenerate"),
            Self::SummaryUnavailable => f.write_str("summary unavailable"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::SessionBusy => f.write_str("session busy"),
            Self::Unexpected(detail) => write!(f, "unexpected failure: {detail}"),
        }
    }
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SessionStatus {
    /// Request in flight.
    Active,
    /// Finished with a summary.
    Done,
    /// Finished without one.
    Failed {
        /// Failure reason.
        reason: FailureReason,
    },
}

/// One reason-trail line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrailEntry {
    /// Stage that recorded the note.
    pub stage: AgentStage,
    /// Note text.
    pub note: String,
    /// When it was recorded.
    pub at: DateTime<Utc>,
}

/// Result of an earlier turn in the same session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TurnRecord {
    /// Turn number, starting at 1.
    pub turn: u32,
    /// The user's question.
    pub query: String,
    /// `done` or the failure reason.
    pub outcome: String,
    /// Identifiers cited by the answer.
    #[serde(default)]
    pub citations: Vec<String>,
}

/// Working state of one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    key: SessionKey,
    turn: u32,
    original: Query,
    query: Query,
    classification: Option<QueryClassification>,
    attempts: u32,
    max_attempts: u32,
    evidence: EvidenceSet,
    last_non_empty: Option<EvidenceSet>,
    verdicts: Vec<QualityVerdict>,
    searched: Vec<String>,
    trail: Vec<TrailEntry>,
    stage: AgentStage,
    status: SessionStatus,
    summary: Option<Summary>,
    transcript: Vec<TurnRecord>,
}

impl SessionState {
    /// Fresh first-turn session for `query`.
    #[must_use]
    pub fn new(key: SessionKey, query: Query, max_attempts: u32) -> Self {
        Self {
            key,
            turn: 1,
            original: query.clone(),
            query,
            classification: None,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            evidence: EvidenceSet::empty(),
            last_non_empty: None,
            verdicts: Vec::new(),
            searched: Vec::new(),
            trail: Vec::new(),
            stage: AgentStage::Classifying,
            status: SessionStatus::Active,
            summary: None,
            transcript: Vec::new(),
        }
    }

    /// Next turn of a checkpointed session; only the transcript carries over.
    #[must_use]
    pub fn resume(prior: Self, query: Query, max_attempts: u32) -> Self {
        let finished = prior.status_is_terminal();
        let mut transcript = prior.transcript;
        if !finished {
            transcript.push(TurnRecord {
                turn: prior.turn,
                query: prior.original.text().to_string(),
                outcome: "abandoned".into(),
                citations: Vec::new(),
            });
        }
        let mut next = Self::new(prior.key, query, max_attempts);
        next.turn = prior.turn + 1;
        next.transcript = transcript;
        next
    }

    /// Session key.
    #[must_use]
    pub const fn key(&self) -> &SessionKey {
        &self.key
    }

    /// Turn number (1-based).
    #[must_use]
    pub const fn turn(&self) -> u32 {
        self.turn
    }

    /// The user's query for this turn.
    #[must_use]
    pub const fn original_query(&self) -> &Query {
        &self.original
    }

    /// Query currently being searched.
    #[must_use]
    pub const fn query(&self) -> &Query {
        &self.query
    }

    /// Classification, once made.
    #[must_use]
    pub const fn classification(&self) -> Option<&QueryClassification> {
        self.classification.as_ref()
    }

    /// Category fixed by the first classification.
    #[must_use]
    pub fn category(&self) -> Option<QueryCategory> {
        self.classification.as_ref().map(|c| c.category)
    }

    /// Attempts consumed.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Attempt budget.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether another attempt may be spent.
    #[must_use]
    pub const fn has_budget(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Latest evidence (not merged across attempts).
    #[must_use]
    pub const fn evidence(&self) -> &EvidenceSet {
        &self.evidence
    }

    /// Most recent non-empty evidence, if any attempt found some.
    #[must_use]
    pub const fn last_non_empty_evidence(&self) -> Option<&EvidenceSet> {
        self.last_non_empty.as_ref()
    }

    /// Gate verdicts in order.
    #[must_use]
    pub fn verdicts(&self) -> &[QualityVerdict] {
        &self.verdicts
    }

    /// Query texts already sent to a backend.
    #[must_use]
    pub fn searched_queries(&self) -> &[String] {
        &self.searched
    }

    /// Whether `text` was already searched in this request.
    #[must_use]
    pub fn was_searched(&self, text: &str) -> bool {
        self.searched.iter().any(|s| s == text)
    }

    /// Reason trail.
    #[must_use]
    pub fn trail(&self) -> &[TrailEntry] {
        &self.trail
    }

    /// Current stage.
    #[must_use]
    pub const fn stage(&self) -> AgentStage {
        self.stage
    }

    /// Lifecycle status.
    #[must_use]
    pub const fn status(&self) -> &SessionStatus {
        &self.status
    }

    /// Summary on success.
    #[must_use]
    pub const fn summary(&self) -> Option<&Summary> {
        self.summary.as_ref()
    }

    /// Earlier turns of this session.
    #[must_use]
    pub fn transcript(&self) -> &[TurnRecord] {
        &self.transcript
    }

    /// True once `Done` or `FailedTerminal` was reached.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status_is_terminal()
    }

    fn status_is_terminal(&self) -> bool {
        !matches!(self.status, SessionStatus::Active)
    }

    fn ensure_active(&self) -> AgentResult<()> {
        if self.is_terminal() {
            Err(AgentError::SessionTerminal)
        } else {
            Ok(())
        }
    }

    /// Moves to `stage`.
    pub fn enter(&mut self, stage: AgentStage) -> AgentResult<()> {
        self.ensure_active()?;
        self.stage = stage;
        Ok(())
    }

    /// Appends a reason-trail note at the current stage.
    pub fn note(&mut self, note: impl Into<String>) -> AgentResult<()> {
        self.ensure_active()?;
        self.trail.push(TrailEntry {
            stage: self.stage,
            note: note.into(),
            at: Utc::now(),
        });
        Ok(())
    }

    /// Stores the classification. The first one wins for the whole request.
    pub fn set_classification(&mut self, classification: QueryClassification) -> AgentResult<()> {
        self.ensure_active()?;
        if self.classification.is_none() {
            self.classification = Some(classification);
        }
        Ok(())
    }

    /// Records one search: consumes an attempt and replaces the evidence.
    pub fn record_search(&mut self, evidence: EvidenceSet) -> AgentResult<()> {
        self.ensure_active()?;
        if !self.has_budget() {
            return Err(AgentError::SessionTerminal);
        }
        self.attempts += 1;
        self.searched.push(self.query.text().to_string());
        if !evidence.is_empty() {
            self.last_non_empty = Some(evidence.clone());
        }
        self.evidence = evidence;
        Ok(())
    }

    /// Consumes an attempt without searching (failed refinement).
    pub fn consume_attempt(&mut self) -> AgentResult<()> {
        self.ensure_active()?;
        self.attempts = (self.attempts + 1).min(self.max_attempts);
        Ok(())
    }

    /// Appends a gate verdict.
    pub fn record_verdict(&mut self, verdict: QualityVerdict) -> AgentResult<()> {
        self.ensure_active()?;
        self.verdicts.push(verdict);
        Ok(())
    }

    /// Replaces the current query with a refined one.
    pub fn advance_query(&mut self, query: Query) -> AgentResult<()> {
        self.ensure_active()?;
        self.query = query;
        Ok(())
    }

    /// Terminal success. Freezes the session.
    pub fn complete(&mut self, summary: Summary) -> AgentResult<()> {
        self.ensure_active()?;
        self.transcript.push(TurnRecord {
            turn: self.turn,
            query: self.original.text().to_string(),
            outcome: "done".into(),
            citations: summary.citations.clone(),
        });
        self.summary = Some(summary);
        self.stage = AgentStage::Done;
        self.status = SessionStatus::Done;
        Ok(())
    }

    /// Terminal failure. Freezes the session; cancellation discards evidence.
    pub fn fail(&mut self, reason: FailureReason) -> AgentResult<()> {
        self.ensure_active()?;
        if reason == FailureReason::Cancelled {
            self.evidence = EvidenceSet::empty();
            self.last_non_empty = None;
        }
        if matches!(
            reason,
            FailureReason::EvidenceExhausted | FailureReason::RefinementDegenerate
        ) {
            self.verdicts.push(QualityVerdict::fail(reason.to_string()));
        }
        self.transcript.push(TurnRecord {
            turn: self.turn,
            query: self.original.text().to_string(),
            outcome: reason.to_string(),
            citations: Vec::new(),
        });
        self.stage = AgentStage::FailedTerminal;
        self.status = SessionStatus::Failed { reason };
        Ok(())
    }
}
