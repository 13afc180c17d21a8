//! Explicit state machine driving one request from classification to a
//! terminal outcome.

use std::future::Future;

use serde_json::json;
use shared_logging::LogLevel;
use tokio_util::sync::CancellationToken;

use crate::classifier::QueryClassifier;
use crate::error::{AgentError, AgentResult};
use crate::gate::QualityGate;
use crate::model::{Decision, EvidenceSet, QualityVerdict, QueryCategory, Summary};
use crate::refiner::QueryRefiner;
use crate::session::{AgentStage, FailureReason, SessionState};
use crate::sources::EvidenceSourceAdapter;
use crate::summarizer::Summarizer;
use crate::telemetry::AgentTelemetry;

/// Collaborators shared by every request.
#[derive(Debug, Clone)]
pub struct AgentComponents {
    /// Research/general router.
    pub classifier: QueryClassifier,
    /// Backend dispatch.
    pub sources: EvidenceSourceAdapter,
    /// Evidence judge.
    pub gate: QualityGate,
    /// Query rewriter.
    pub refiner: QueryRefiner,
    /// Answer writer.
    pub summarizer: Summarizer,
}

/// What the caller sees when a request did not produce a summary.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureReport {
    /// Why the request failed.
    pub reason: FailureReason,
    /// Apology shown to the user.
    pub message: String,
    /// Unvalidated results from the last attempt that found any.
    pub partial_evidence: Option<EvidenceSet>,
}

impl FailureReport {
    /// Builds the report and its user-facing message.
    #[must_use]
    pub fn new(reason: FailureReason, partial_evidence: Option<EvidenceSet>) -> Self {
        let message = apology(&reason, partial_evidence.is_some()).to_string();
        Self {
            reason,
            message,
            partial_evidence,
        }
    }
}

fn apology(reason: &FailureReason, has_partial: bool) -> &'static str {
    match reason {
        FailureReason::InvalidQuery => "Please enter a medical question.",
        FailureReason::Cancelled => "The request was cancelled before an answer was ready.",
        FailureReason::SessionBusy => {
            "This session is already answering another question. Please try again shortly."
        }
        FailureReason::SummaryUnavailable => {
            "Sorry, I could not compose a summary right now. Please try again later."
        }
        _ if has_partial => {
            "Sorry, I could not find results that fully answer your question. \
             These are the closest matches found; they have not been validated."
        }
        _ => "Sorry, I could not find reliable information for your question. Please try rephrasing it.",
    }
}

/// Terminal result of a request.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentOutcome {
    /// Validated, cited answer.
    Done {
        /// The answer.
        summary: Summary,
    },
    /// No answer; apology and any partial evidence.
    Failed(FailureReport),
}

impl AgentOutcome {
    /// True for [`AgentOutcome::Done`].
    #[must_use]
    pub const fn is_done(&self) -> bool {
        matches!(self, Self::Done { .. })
    }

    /// Summary on success.
    #[must_use]
    pub const fn summary(&self) -> Option<&Summary> {
        match self {
            Self::Done { summary } => Some(summary),
            Self::Failed(_) => None,
        }
    }

    /// Failure report otherwise.
    #[must_use]
    pub const fn failure(&self) -> Option<&FailureReport> {
        match self {
            Self::Done { .. } => None,
            Self::Failed(report) => Some(report),
        }
    }
}

enum Step {
    Classify,
    Search,
    Evaluate,
    Refine(QualityVerdict),
    Summarize,
    Finish(Summary),
    Abort(FailureReason),
}

impl Step {
    const fn stage(&self) -> AgentStage {
        match self {
            Self::Classify => AgentStage::Classifying,
            Self::Search => AgentStage::Searching,
            Self::Evaluate => AgentStage::Evaluating,
            Self::Refine(_) => AgentStage::Refining,
            Self::Summarize => AgentStage::Summarizing,
            Self::Finish(_) => AgentStage::Done,
            Self::Abort(_) => AgentStage::FailedTerminal,
        }
    }
}

/// Runs one request against an owned [`SessionState`].
pub struct Orchestrator<'a> {
    components: &'a AgentComponents,
    telemetry: &'a AgentTelemetry,
    cancel: CancellationToken,
}

impl<'a> Orchestrator<'a> {
    /// Creates an orchestrator for a single request.
    #[must_use]
    pub const fn new(
        components: &'a AgentComponents,
        telemetry: &'a AgentTelemetry,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            components,
            telemetry,
            cancel,
        }
    }

    /// Drives `session` to `Done` or `FailedTerminal`.
    pub async fn run(&self, session: &mut SessionState) -> AgentOutcome {
        let mut step = Step::Classify;
        let mut from = None;
        loop {
            step = match step {
                Step::Finish(summary) => return self.succeed(session, from, summary).await,
                Step::Abort(reason) => return self.abandon(session, from, reason).await,
                _ if self.cancel.is_cancelled() => Step::Abort(FailureReason::Cancelled),
                active => match self.advance(session, from, active).await {
                    Ok(next) => next,
                    Err(AgentError::Cancelled) => Step::Abort(FailureReason::Cancelled),
                    Err(err) => Step::Abort(FailureReason::Unexpected(err.to_string())),
                },
            };
            from = Some(session.stage());
        }
    }

    async fn advance(
        &self,
        session: &mut SessionState,
        from: Option<AgentStage>,
        step: Step,
    ) -> AgentResult<Step> {
        let to = step.stage();
        session.enter(to)?;
        self.announce(session, from, to).await;
        match step {
            Step::Classify => self.classify(session).await,
            Step::Search => self.search(session).await,
            Step::Evaluate => self.evaluate(session).await,
            Step::Refine(verdict) => self.refine(session, verdict).await,
            Step::Summarize => self.summarize(session).await,
            terminal @ (Step::Finish(_) | Step::Abort(_)) => Ok(terminal),
        }
    }

    /// Races `fut` against cancellation; the call is dropped when cancelled.
    async fn guarded<F: Future>(&self, fut: F) -> AgentResult<F::Output> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(AgentError::Cancelled),
            out = fut => Ok(out),
        }
    }

    async fn classify(&self, session: &mut SessionState) -> AgentResult<Step> {
        let query = session.query().clone();
        let outcome = match self.guarded(self.components.classifier.classify(&query)).await? {
            Ok(outcome) => outcome,
            Err(AgentError::InvalidQuery) => {
                self.note(session, "query text is empty".into())?;
                return Ok(Step::Abort(FailureReason::InvalidQuery));
            }
            Err(err) => return Err(err),
        };
        for note in outcome.notes {
            self.note(session, note)?;
        }
        let category = outcome.classification.category;
        session.set_classification(outcome.classification)?;
        self.note(
            session,
            format!("routed to {category} ({})", category.source().display_name()),
        )?;
        Ok(Step::Search)
    }

    async fn search(&self, session: &mut SessionState) -> AgentResult<Step> {
        let category = session.category().unwrap_or(QueryCategory::General);
        let query = session.query().clone();
        let evidence = match self
            .guarded(self.components.sources.search(&query, category))
            .await?
        {
            Ok(set) => set,
            Err(err @ AgentError::SourceUnavailable { .. }) => {
                self.note(session, err.to_string())?;
                EvidenceSet::empty()
            }
            Err(err) => return Err(err),
        };
        let found = evidence.len();
        session.record_search(evidence)?;
        let note = format!(
            "attempt {}/{}: {found} results for \"{}\"",
            session.attempts(),
            session.max_attempts(),
            query.text()
        );
        self.note(session, note)?;
        Ok(Step::Evaluate)
    }

    async fn evaluate(&self, session: &mut SessionState) -> AgentResult<Step> {
        let verdict = self
            .guarded(
                self.components
                    .gate
                    .evaluate(session.query(), session.evidence()),
            )
            .await?;
        self.note(
            session,
            format!("gate: {} ({})", verdict.decision.label(), verdict.reason),
        )?;
        session.record_verdict(verdict.clone())?;
        Ok(match verdict.decision {
            Decision::Accept => Step::Summarize,
            Decision::Refine if session.has_budget() => Step::Refine(verdict),
            Decision::Refine | Decision::Fail => Step::Abort(FailureReason::EvidenceExhausted),
        })
    }

    async fn refine(&self, session: &mut SessionState, verdict: QualityVerdict) -> AgentResult<Step> {
        let query = session.query().clone();
        match self
            .guarded(self.components.refiner.refine(&query, &verdict))
            .await?
        {
            Ok(next) if session.was_searched(next.text()) => {
                self.note(session, format!("refinement repeats \"{}\"", next.text()))?;
                Ok(Step::Abort(FailureReason::RefinementDegenerate))
            }
            Ok(next) => {
                self.note(session, format!("refined query: {}", next.text()))?;
                session.advance_query(next)?;
                Ok(Step::Search)
            }
            Err(AgentError::RefinementDegenerate(detail)) => {
                self.note(session, detail)?;
                Ok(Step::Abort(FailureReason::RefinementDegenerate))
            }
            Err(err) if err.is_model_failure() => {
                self.note(session, err.to_string())?;
                session.consume_attempt()?;
                Ok(if session.has_budget() {
                    Step::Refine(verdict)
                } else {
                    Step::Abort(FailureReason::EvidenceExhausted)
                })
            }
            Err(err) => Err(err),
        }
    }

    async fn summarize(&self, session: &mut SessionState) -> AgentResult<Step> {
        let result = self
            .guarded(
                self.components
                    .summarizer
                    .summarize(session.original_query(), session.evidence()),
            )
            .await?;
        match result {
            Ok(summary) => Ok(Step::Finish(summary)),
            Err(err) if err.is_model_failure() => {
                self.note(session, err.to_string())?;
                Ok(Step::Abort(FailureReason::SummaryUnavailable))
            }
            Err(err) => Err(err),
        }
    }

    async fn succeed(
        &self,
        session: &mut SessionState,
        from: Option<AgentStage>,
        summary: Summary,
    ) -> AgentOutcome {
        if let Err(err) = session.complete(summary.clone()) {
            // Only reachable if the session was already terminal.
            return self
                .abandon(session, from, FailureReason::Unexpected(err.to_string()))
                .await;
        }
        self.announce(session, from, AgentStage::Done).await;
        self.report(session, "done", summary.citations.len()).await;
        AgentOutcome::Done { summary }
    }

    async fn abandon(
        &self,
        session: &mut SessionState,
        from: Option<AgentStage>,
        reason: FailureReason,
    ) -> AgentOutcome {
        if let Err(err) = session.fail(reason.clone()) {
            let _ = self.telemetry.log(
                LogLevel::Warn,
                "agent.fail_rejected",
                json!({ "session": session.key().as_str(), "error": err.to_string() }),
            );
        }
        self.announce(session, from, AgentStage::FailedTerminal).await;
        let partial = match reason {
            FailureReason::InvalidQuery | FailureReason::Cancelled => None,
            _ => session.last_non_empty_evidence().cloned(),
        };
        self.report(session, &reason.to_string(), 0).await;
        AgentOutcome::Failed(FailureReport::new(reason, partial))
    }

    fn note(&self, session: &mut SessionState, note: String) -> AgentResult<()> {
        let _ = self.telemetry.log(
            LogLevel::Debug,
            "agent.note",
            json!({
                "session": session.key().as_str(),
                "stage": session.stage().label(),
                "note": &note,
            }),
        );
        session.note(note)
    }

    async fn announce(&self, session: &SessionState, from: Option<AgentStage>, to: AgentStage) {
        let payload = json!({
            "session": session.key().as_str(),
            "turn": session.turn(),
            "from": from.map(AgentStage::label),
            "to": to.label(),
            "attempt": session.attempts(),
            "max_attempts": session.max_attempts(),
            "query": session.query().text(),
            "origin": session.query().origin(),
            "source": session.category().map(|c| c.source().display_name()),
        });
        self.telemetry
            .emit(LogLevel::Info, "agent.transition", payload)
            .await;
    }

    async fn report(&self, session: &SessionState, outcome: &str, citations: usize) {
        let level = if outcome == "done" {
            LogLevel::Info
        } else {
            LogLevel::Warn
        };
        let payload = json!({
            "session": session.key().as_str(),
            "turn": session.turn(),
            "outcome": outcome,
            "attempts": session.attempts(),
            "citations": citations,
        });
        self.telemetry.emit(level, "agent.outcome", payload).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, time::Duration};

    use shared_event_bus::MemoryEventBus;

    use crate::config::GateConfig;
    use crate::error::ModelError;
    use crate::llm::ScriptedLanguageModel;
    use crate::model::Query;
    use crate::session::SessionKey;
    use crate::sources::{SearchHit, StaticSearchBackend};

    const LONG_SNIPPET: &str = "Influenza symptoms include fever, cough, sore throat, muscle aches \
        and fatigue; most adults recover from influenza within one to two weeks.";

    fn flu_hits() -> Vec<SearchHit> {
        vec![
            SearchHit::new("https://cdc.gov/flu", "Influenza symptoms", LONG_SNIPPET),
            SearchHit::new("https://nhs.uk/flu", "Flu overview", LONG_SNIPPET),
        ]
    }

    fn components(model: ScriptedLanguageModel, web: StaticSearchBackend) -> AgentComponents {
        let model: Arc<dyn crate::llm::LanguageModel> = Arc::new(model);
        let deadline = Duration::from_millis(300);
        AgentComponents {
            classifier: QueryClassifier::new(model.clone(), deadline),
            sources: EvidenceSourceAdapter::new(
                Arc::new(StaticSearchBackend::always(Vec::new())),
                Arc::new(web),
                5,
                deadline,
            ),
            gate: QualityGate::new(model.clone(), GateConfig::default(), deadline),
            refiner: QueryRefiner::new(model.clone(), deadline),
            summarizer: Summarizer::new(model, deadline),
        }
    }

    fn routed(prompt: &str, refine_reply: &str) -> Result<String, ModelError> {
        Ok(if prompt.contains("Classify") {
            "general".to_string()
        } else if prompt.contains("You review search results") {
            r#"{"decision": "accept", "reason": "covers symptoms"}"#.to_string()
        } else if prompt.contains("returned limited results") {
            refine_reply.to_string()
        } else {
            "Fever and cough are typical [1][2].".to_string()
        })
    }

    #[tokio::test]
    async fn transitions_are_published_in_order() {
        let bus = Arc::new(MemoryEventBus::new(64));
        let telemetry = AgentTelemetry::builder("orchestrator")
            .event_publisher(bus.clone())
            .build()
            .unwrap();
        let model = ScriptedLanguageModel::from_fn(|p| routed(p, "unused"));
        let components = components(model, StaticSearchBackend::always(flu_hits()));
        let mut session = SessionState::new(SessionKey::new("t1"), Query::user("flu symptoms"), 3);

        let outcome = Orchestrator::new(&components, &telemetry, CancellationToken::new())
            .run(&mut session)
            .await;

        assert!(outcome.is_done());
        let stages: Vec<String> = bus
            .events_of("agent.transition")
            .iter()
            .map(|e| e.payload["to"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(
            stages,
            vec!["classifying", "searching", "evaluating", "summarizing", "done"]
        );
        let first = &bus.events_of("agent.transition")[0];
        assert!(first.payload["from"].is_null());
        assert_eq!(bus.events_of("agent.transition")[1].payload["source"], "Tavily");
        assert_eq!(bus.events_of("agent.outcome").len(), 1);
    }

    #[tokio::test]
    async fn repeated_refinement_is_degenerate() {
        let telemetry = AgentTelemetry::builder("orchestrator").build().unwrap();
        let model = ScriptedLanguageModel::from_fn(|p| {
            if p.contains("You review search results") {
                Ok(r#"{"decision": "refine", "reason": "too general"}"#.into())
            } else {
                routed(p, "influenza complications")
            }
        });
        let components = components(model, StaticSearchBackend::always(flu_hits()));
        // The refiner keeps answering with the same text.
        let mut session = SessionState::new(
            SessionKey::new("t2"),
            Query::user("flu symptoms"),
            5,
        );

        let outcome = Orchestrator::new(&components, &telemetry, CancellationToken::new())
            .run(&mut session)
            .await;

        let report = outcome.failure().unwrap();
        assert_eq!(report.reason, FailureReason::RefinementDegenerate);
        assert_eq!(session.attempts(), 2);
        assert_eq!(session.stage(), AgentStage::FailedTerminal);
        assert!(report.partial_evidence.is_some());
    }

    #[tokio::test]
    async fn refiner_outage_consumes_attempts() {
        let telemetry = AgentTelemetry::builder("orchestrator").build().unwrap();
        let model = ScriptedLanguageModel::from_fn(|p| {
            if p.contains("returned limited results") {
                Err(ModelError::Unavailable("503".into()))
            } else if p.contains("You review search results") {
                Ok("refine".into())
            } else {
                routed(p, "unused")
            }
        });
        let web = StaticSearchBackend::always(flu_hits());
        let components = components(model, web.clone());
        let mut session = SessionState::new(SessionKey::new("t3"), Query::user("flu symptoms"), 3);

        let outcome = Orchestrator::new(&components, &telemetry, CancellationToken::new())
            .run(&mut session)
            .await;

        assert_eq!(
            outcome.failure().unwrap().reason,
            FailureReason::EvidenceExhausted
        );
        assert_eq!(web.calls(), 1);
        assert_eq!(session.attempts(), 3);
    }

    #[tokio::test]
    async fn summarizer_outage_is_summary_unavailable() {
        let telemetry = AgentTelemetry::builder("orchestrator").build().unwrap();
        let model = ScriptedLanguageModel::from_fn(|p| {
            if p.contains("Summarize the following") {
                Err(ModelError::Timeout(Duration::from_secs(60)))
            } else {
                routed(p, "unused")
            }
        });
        let components = components(model, StaticSearchBackend::always(flu_hits()));
        let mut session = SessionState::new(SessionKey::new("t4"), Query::user("flu symptoms"), 3);

        let outcome = Orchestrator::new(&components, &telemetry, CancellationToken::new())
            .run(&mut session)
            .await;

        let report = outcome.failure().unwrap();
        assert_eq!(report.reason, FailureReason::SummaryUnavailable);
        assert!(report.message.contains("could not compose a summary"));
        assert!(session.summary().is_none());
    }

    #[tokio::test]
    async fn pre_cancelled_token_makes_no_calls() {
        let telemetry = AgentTelemetry::builder("orchestrator").build().unwrap();
        let model = ScriptedLanguageModel::from_fn(|p| routed(p, "unused"));
        let web = StaticSearchBackend::always(flu_hits());
        let components = components(model.clone(), web.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut session = SessionState::new(SessionKey::new("t5"), Query::user("flu symptoms"), 3);

        let outcome = Orchestrator::new(&components, &telemetry, cancel)
            .run(&mut session)
            .await;

        assert_eq!(outcome.failure().unwrap().reason, FailureReason::Cancelled);
        assert_eq!(model.calls(), 0);
        assert_eq!(web.calls(), 0);
    }

    #[test]
    fn apology_mentions_partial_results_only_when_present() {
        let with = FailureReport::new(
            FailureReason::EvidenceExhausted,
            Some(EvidenceSet::empty()),
        );
        let without = FailureReport::new(FailureReason::EvidenceExhausted, None);
        assert!(with.message.contains("closest matches"));
        assert!(!without.message.contains("closest matches"));
        assert_eq!(
            FailureReport::new(FailureReason::InvalidQuery, None).message,
            "Please enter a medical question."
        );
    }
}
