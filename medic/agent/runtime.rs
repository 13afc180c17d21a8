use std::sync::Arc;

use reqwest::Client;
use serde_json::json;
use shared_logging::LogLevel;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::{CheckpointStore, NoopCheckpointStore, WriterLeases};
use crate::classifier::QueryClassifier;
use crate::config::AgentConfig;
use crate::error::AgentResult;
use crate::gate::QualityGate;
use crate::llm::{HttpLanguageModel, LanguageModel};
use crate::model::Query;
use crate::orchestrator::{AgentComponents, AgentOutcome, FailureReport, Orchestrator};
use crate::refiner::QueryRefiner;
use crate::session::{FailureReason, SessionKey, SessionState};
use crate::sources::EvidenceSourceAdapter;
use crate::summarizer::Summarizer;
use crate::telemetry::AgentTelemetry;

/// One question submitted to the agent.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    text: String,
    session: Option<SessionKey>,
    cancel: CancellationToken,
}

impl AgentRequest {
    /// A single-turn request for `text`.
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            session: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Continues (or starts) the session stored under `key`.
    #[must_use]
    pub fn with_session(mut self, key: SessionKey) -> Self {
        self.session = Some(key);
        self
    }

    /// Cancels the request when `token` fires.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }
}

/// Terminal outcome plus the session it belongs to.
#[derive(Debug, Clone)]
pub struct AgentReply {
    /// Done or Failed.
    pub outcome: AgentOutcome,
    /// Session key, generated when the request had none.
    pub session: SessionKey,
    /// Turn number within the session; 0 when the request never ran.
    pub turn: u32,
}

/// Long-lived agent. Collaborators are shared; each request gets its own
/// session and orchestrator, so independent requests may run concurrently.
pub struct MedicalAgent {
    components: AgentComponents,
    checkpoints: Arc<dyn CheckpointStore>,
    leases: WriterLeases,
    telemetry: AgentTelemetry,
    max_attempts: u32,
}

impl std::fmt::Debug for MedicalAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MedicalAgent")
            .field("components", &self.components)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl MedicalAgent {
    /// Agent over `components` with no persistence and the default attempt budget.
    #[must_use]
    pub fn new(components: AgentComponents, telemetry: AgentTelemetry) -> Self {
        Self {
            components,
            checkpoints: Arc::new(NoopCheckpointStore),
            leases: WriterLeases::default(),
            telemetry,
            max_attempts: crate::config::DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// HTTP-backed agent built from validated configuration.
    pub fn from_config(config: &AgentConfig, telemetry: AgentTelemetry) -> AgentResult<Self> {
        config.validate()?;
        let client = Client::new();
        let model: Arc<dyn LanguageModel> =
            Arc::new(HttpLanguageModel::new(client.clone(), config.llm.clone()));
        let timeouts = &config.timeouts;
        let components = AgentComponents {
            classifier: QueryClassifier::new(Arc::clone(&model), timeouts.classify),
            sources: EvidenceSourceAdapter::from_config(&client, &config.sources, timeouts.search),
            gate: QualityGate::new(Arc::clone(&model), config.gate, timeouts.evaluate),
            refiner: QueryRefiner::new(Arc::clone(&model), timeouts.refine),
            summarizer: Summarizer::new(model, timeouts.summarize),
        };
        Ok(Self::new(components, telemetry).with_max_attempts(config.max_attempts))
    }

    /// Persists sessions through `store`.
    #[must_use]
    pub fn with_checkpoints(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = store;
        self
    }

    /// Searches allowed per request.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Answers one question. Never errors: every failure becomes
    /// [`AgentOutcome::Failed`].
    pub async fn answer(&self, request: AgentRequest) -> AgentReply {
        let key = request.session.unwrap_or_else(SessionKey::generate);
        let Some(_lease) = self.leases.try_acquire(&key) else {
            return self.busy(key).await;
        };
        // A store that cannot be claimed is neither read nor written this turn.
        let claim = match self.checkpoints.claim(&key).await {
            Ok(Some(claim)) => Some(claim),
            Ok(None) => return self.busy(key).await,
            Err(err) => {
                let _ = self.telemetry.log(
                    LogLevel::Warn,
                    "agent.checkpoint_claim_failed",
                    json!({ "session": key.as_str(), "error": err.to_string() }),
                );
                None
            }
        };

        let query = Query::user(request.text);
        let prior = match &claim {
            Some(_) => self.checkpoints.load(&key).await,
            None => Ok(None),
        };
        let mut session = match prior {
            Ok(Some(prior)) => SessionState::resume(prior, query, self.max_attempts),
            Ok(None) => SessionState::new(key.clone(), query, self.max_attempts),
            Err(err) => {
                let _ = self.telemetry.log(
                    LogLevel::Warn,
                    "agent.checkpoint_load_failed",
                    json!({ "session": key.as_str(), "error": err.to_string() }),
                );
                SessionState::new(key.clone(), query, self.max_attempts)
            }
        };

        let outcome = Orchestrator::new(&self.components, &self.telemetry, request.cancel)
            .run(&mut session)
            .await;

        if claim.is_some() {
            if let Err(err) = self.checkpoints.save(&key, &session).await {
                let _ = self.telemetry.log(
                    LogLevel::Error,
                    "agent.checkpoint_save_failed",
                    json!({ "session": key.as_str(), "error": err.to_string() }),
                );
            }
        }

        AgentReply {
            outcome,
            session: key,
            turn: session.turn(),
        }
    }

    async fn busy(&self, key: SessionKey) -> AgentReply {
        self.telemetry
            .emit(
                LogLevel::Warn,
                "agent.outcome",
                json!({ "session": key.as_str(), "outcome": FailureReason::SessionBusy.to_string() }),
            )
            .await;
        AgentReply {
            outcome: AgentOutcome::Failed(FailureReport::new(FailureReason::SessionBusy, None)),
            session: key,
            turn: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use futures::future::join_all;

    use crate::checkpoint::{FileCheckpointStore, MemoryCheckpointStore};
    use crate::config::{GateConfig, LlmConfig, SourcesConfig};
    use crate::error::{AgentError, BackendError, ConfigError};
    use crate::llm::ScriptedLanguageModel;
    use crate::sources::{SearchHit, StaticSearchBackend};
    use crate::summarizer::DISCLAIMER;

    const DEADLINE: Duration = Duration::from_millis(250);

    fn agent(
        model: &ScriptedLanguageModel,
        literature: &StaticSearchBackend,
        web: &StaticSearchBackend,
    ) -> MedicalAgent {
        let model: Arc<dyn LanguageModel> = Arc::new(model.clone());
        let components = AgentComponents {
            classifier: QueryClassifier::new(Arc::clone(&model), DEADLINE),
            sources: EvidenceSourceAdapter::new(
                Arc::new(literature.clone()),
                Arc::new(web.clone()),
                5,
                DEADLINE,
            ),
            gate: QualityGate::new(Arc::clone(&model), GateConfig::default(), DEADLINE),
            refiner: QueryRefiner::new(Arc::clone(&model), DEADLINE),
            summarizer: Summarizer::new(model, DEADLINE),
        };
        MedicalAgent::new(components, AgentTelemetry::builder("runtime").build().unwrap())
    }

    /// Routes prompts by their wording. Refinements are `stem`, `stem 2`, `stem 3`, ...
    fn scripted(
        category: &'static str,
        judgment: &'static str,
        refine_stem: &'static str,
        summary: &'static str,
    ) -> ScriptedLanguageModel {
        let refinements = Arc::new(AtomicUsize::new(0));
        ScriptedLanguageModel::from_fn(move |prompt| {
            Ok(if prompt.contains("Classify") {
                category.to_string()
            } else if prompt.contains("You review search results") {
                judgment.to_string()
            } else if prompt.contains("returned limited results") {
                match refinements.fetch_add(1, Ordering::SeqCst) {
                    0 => refine_stem.to_string(),
                    n => format!("{refine_stem} {}", n + 1),
                }
            } else {
                summary.to_string()
            })
        })
    }

    const ACCEPT: &str = r#"{"decision": "accept", "reason": "relevant and specific"}"#;
    const REFINE: &str = r#"{"decision": "refine", "reason": "too general"}"#;

    fn diabetes_hits() -> Vec<SearchHit> {
        vec![
            SearchHit::new(
                "https://www.cdc.gov/diabetes/symptoms",
                "Diabetes symptoms",
                "Common symptoms of type 2 diabetes include increased thirst, frequent urination, \
                 blurred vision and slow-healing sores.",
            ),
            SearchHit::new(
                "https://www.mayoclinic.org/type-2-diabetes",
                "Type 2 diabetes - Symptoms and causes",
                "Type 2 diabetes symptoms often develop slowly; people can have the condition for \
                 years without noticing common warning signs.",
            ),
            SearchHit::new(
                "https://www.nhs.uk/conditions/type-2-diabetes",
                "Type 2 diabetes overview",
                "Symptoms of type 2 diabetes include tiredness, weight loss and itching around the \
                 genitals; see a GP if you notice them.",
            ),
        ]
    }

    fn crispr_hits() -> Vec<SearchHit> {
        vec![
            SearchHit::new(
                "38011111",
                "CRISPR gene therapy in sickle cell disease: a clinical trial",
                "Phase 3 clinical trial of CRISPR gene therapy (exa-cel) in sickle cell disease. \
                 Journal of Hematology. (2024). Frangoul H, Locatelli F",
            ),
            SearchHit::new(
                "38022222",
                "Clinical trials of CRISPR-based gene editing therapies",
                "Review of ongoing CRISPR gene therapy clinical trials and outcomes. \
                 Nature Medicine. (2024). Doudna J",
            ),
        ]
    }

    fn flu_hits() -> Vec<SearchHit> {
        let snippet = "Influenza symptoms include fever, cough, sore throat, muscle aches and \
                       fatigue; most adults recover from influenza within two weeks.";
        vec![
            SearchHit::new("https://www.cdc.gov/flu", "Influenza symptoms", snippet),
            SearchHit::new("https://www.nhs.uk/flu", "Flu overview", snippet),
        ]
    }

    #[tokio::test]
    async fn general_query_is_answered_from_the_web() {
        let model = scripted(
            "general",
            ACCEPT,
            "unused",
            "Typical symptoms are thirst and frequent urination [1], slow onset [2] and tiredness [3].",
        );
        let literature = StaticSearchBackend::always(Vec::new());
        let web = StaticSearchBackend::always(diabetes_hits());
        let agent = agent(&model, &literature, &web);

        let reply = agent
            .answer(AgentRequest::new(
                "What are the common symptoms of type 2 diabetes?",
            ))
            .await;

        let summary = reply.outcome.summary().expect("done");
        assert_eq!(summary.citations.len(), 3);
        assert_eq!(summary.disclaimer, DISCLAIMER);
        assert_eq!(web.calls(), 1);
        assert_eq!(literature.calls(), 0);
    }

    #[tokio::test]
    async fn empty_literature_search_is_refined_once() {
        let model = scripted(
            "research",
            ACCEPT,
            "CRISPR gene therapy clinical trial outcomes",
            "Exa-cel showed durable responses [1]; other trials are ongoing [2].",
        );
        let literature = StaticSearchBackend::sequence(vec![Ok(Vec::new()), Ok(crispr_hits())]);
        let web = StaticSearchBackend::always(Vec::new());
        let agent = agent(&model, &literature, &web);

        let reply = agent
            .answer(AgentRequest::new("latest clinical trials for CRISPR gene therapy"))
            .await;

        let summary = reply.outcome.summary().expect("done");
        assert_eq!(summary.citations, vec!["38011111", "38022222"]);
        assert_eq!(
            literature.queries(),
            vec![
                "latest clinical trials for CRISPR gene therapy",
                "CRISPR gene therapy clinical trial outcomes",
            ]
        );
        assert_eq!(web.calls(), 0);
    }

    #[tokio::test]
    async fn empty_query_makes_no_external_calls() {
        let model = scripted("general", ACCEPT, "unused", "unused");
        let literature = StaticSearchBackend::always(Vec::new());
        let web = StaticSearchBackend::always(Vec::new());
        let agent = agent(&model, &literature, &web);

        let reply = agent.answer(AgentRequest::new("   ")).await;

        let report = reply.outcome.failure().expect("failed");
        assert_eq!(report.reason, FailureReason::InvalidQuery);
        assert_eq!(report.message, "Please enter a medical question.");
        assert_eq!(model.calls(), 0);
        assert_eq!(literature.calls() + web.calls(), 0);
    }

    #[tokio::test]
    async fn unavailable_literature_exhausts_the_budget() {
        let model = scripted("research", ACCEPT, "CRISPR therapy trials", "unused");
        let literature = StaticSearchBackend::failing("503 Service Unavailable");
        let web = StaticSearchBackend::always(Vec::new());
        let agent = agent(&model, &literature, &web);

        let reply = agent
            .answer(AgentRequest::new("latest clinical trials for CRISPR gene therapy"))
            .await;

        let report = reply.outcome.failure().expect("failed");
        assert_eq!(report.reason, FailureReason::EvidenceExhausted);
        assert!(report.partial_evidence.is_none());
        assert_eq!(literature.calls(), 3);
        assert!(!model
            .prompts()
            .iter()
            .any(|p| p.contains("Summarize the following")));
    }

    #[tokio::test]
    async fn identical_refinement_fails_without_searching_again() {
        let model = ScriptedLanguageModel::from_fn(|prompt| {
            Ok(if prompt.contains("Classify") {
                "research".to_string()
            } else {
                "statin myopathy".to_string()
            })
        });
        let literature = StaticSearchBackend::always(Vec::new());
        let web = StaticSearchBackend::always(Vec::new());
        let agent = agent(&model, &literature, &web);

        let reply = agent.answer(AgentRequest::new("statin myopathy")).await;

        assert_eq!(
            reply.outcome.failure().expect("failed").reason,
            FailureReason::RefinementDegenerate
        );
        assert_eq!(literature.calls(), 1);
    }

    #[tokio::test]
    async fn searches_never_exceed_max_attempts() {
        let model = scripted("general", REFINE, "influenza symptoms in adults", "unused");
        let literature = StaticSearchBackend::always(Vec::new());
        let web = StaticSearchBackend::always(flu_hits());
        let agent = agent(&model, &literature, &web).with_max_attempts(4);

        let reply = agent.answer(AgentRequest::new("flu symptoms")).await;

        let report = reply.outcome.failure().expect("failed");
        assert_eq!(report.reason, FailureReason::EvidenceExhausted);
        assert_eq!(report.partial_evidence.as_ref().map(|e| e.len()), Some(2));
        assert_eq!(web.calls(), 4);
    }

    #[tokio::test]
    async fn citations_follow_evidence_order() {
        let model = scripted("general", ACCEPT, "unused", "Thirst is common [3]; onset is slow [1].");
        let literature = StaticSearchBackend::always(Vec::new());
        let web = StaticSearchBackend::always(diabetes_hits());
        let agent = agent(&model, &literature, &web);

        let reply = agent
            .answer(AgentRequest::new("What are the common symptoms of type 2 diabetes?"))
            .await;

        let summary = reply.outcome.summary().expect("done");
        assert_eq!(
            summary.citations,
            vec![
                "https://www.cdc.gov/diabetes/symptoms",
                "https://www.nhs.uk/conditions/type-2-diabetes",
            ]
        );
        assert!(summary.text.contains("[3]"));
    }

    #[tokio::test]
    async fn cancellation_interrupts_a_slow_search() {
        let model = scripted("general", ACCEPT, "unused", "unused");
        let literature = StaticSearchBackend::always(Vec::new());
        let web = StaticSearchBackend::always(flu_hits()).with_delay(Duration::from_secs(2));
        let mut agent = agent(&model, &literature, &web);
        // Keep the search deadline above the delay so only cancellation can end it.
        agent.components.sources = EvidenceSourceAdapter::new(
            Arc::new(literature.clone()),
            Arc::new(web.clone()),
            5,
            Duration::from_secs(5),
        );
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = tokio::time::Instant::now();
        let reply = agent
            .answer(AgentRequest::new("flu symptoms").with_cancellation(token))
            .await;

        let report = reply.outcome.failure().expect("failed");
        assert_eq!(report.reason, FailureReason::Cancelled);
        assert!(report.partial_evidence.is_none());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn search_timeout_is_recorded_and_exhausts_a_single_attempt() {
        let model = scripted("general", ACCEPT, "unused", "unused");
        let literature = StaticSearchBackend::always(Vec::new());
        let web = StaticSearchBackend::always(flu_hits()).with_delay(Duration::from_secs(1));
        let store = MemoryCheckpointStore::default();
        let agent = agent(&model, &literature, &web)
            .with_max_attempts(1)
            .with_checkpoints(Arc::new(store.clone()));
        let key = SessionKey::new("timeout-1");

        let reply = agent
            .answer(AgentRequest::new("flu symptoms").with_session(key.clone()))
            .await;

        assert_eq!(
            reply.outcome.failure().expect("failed").reason,
            FailureReason::EvidenceExhausted
        );
        let saved = store.load(&key).await.unwrap().expect("saved");
        assert!(saved.trail().iter().any(|t| t.note.contains("timed out")));
        assert_eq!(saved.attempts(), 1);
    }

    #[tokio::test]
    async fn independent_requests_run_concurrently() {
        let model = scripted("general", ACCEPT, "unused", "Fever and cough [1].");
        let literature = StaticSearchBackend::always(Vec::new());
        let web = StaticSearchBackend::always(flu_hits()).with_delay(Duration::from_millis(50));
        let agent = agent(&model, &literature, &web);

        let replies = join_all(
            ["flu symptoms", "influenza fever", "flu cough"]
                .into_iter()
                .map(|q| agent.answer(AgentRequest::new(q))),
        )
        .await;

        assert!(replies.iter().all(|r| r.outcome.is_done()));
        assert_eq!(web.calls(), 3);
        assert_ne!(replies[0].session, replies[1].session);
    }

    #[tokio::test]
    async fn second_writer_on_a_session_is_rejected() {
        let model = scripted("general", ACCEPT, "unused", "Fever and cough [1].");
        let literature = StaticSearchBackend::always(Vec::new());
        let web = StaticSearchBackend::always(flu_hits()).with_delay(Duration::from_millis(100));
        let agent = agent(&model, &literature, &web);
        let key = SessionKey::new("chat-9");

        let (first, second) = futures::join!(
            agent.answer(AgentRequest::new("flu symptoms").with_session(key.clone())),
            agent.answer(AgentRequest::new("flu cough").with_session(key.clone())),
        );

        assert!(first.outcome.is_done());
        assert_eq!(
            second.outcome.failure().expect("busy").reason,
            FailureReason::SessionBusy
        );
        assert_eq!(web.calls(), 1);
    }

    #[tokio::test]
    async fn agents_sharing_a_checkpoint_directory_exclude_each_other() {
        let dir = tempfile::tempdir().unwrap();
        let model = scripted("general", ACCEPT, "unused", "Fever and cough [1].");
        let literature = StaticSearchBackend::always(Vec::new());
        let web = StaticSearchBackend::always(flu_hits()).with_delay(Duration::from_millis(100));
        let store = || -> Arc<dyn CheckpointStore> {
            Arc::new(FileCheckpointStore::open(dir.path()).unwrap())
        };
        let first_agent = agent(&model, &literature, &web).with_checkpoints(store());
        let second_agent = agent(&model, &literature, &web).with_checkpoints(store());
        let key = SessionKey::new("chat-4");

        let (first, second) = futures::join!(
            first_agent.answer(AgentRequest::new("flu symptoms").with_session(key.clone())),
            async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                second_agent
                    .answer(AgentRequest::new("flu cough").with_session(key.clone()))
                    .await
            },
        );

        assert!(first.outcome.is_done());
        assert_eq!(
            second.outcome.failure().expect("busy").reason,
            FailureReason::SessionBusy
        );
        assert_eq!(web.calls(), 1);
        assert!(!dir.path().join("chat-4.lock").exists());

        let third = second_agent
            .answer(AgentRequest::new("flu cough").with_session(key))
            .await;
        assert_eq!(third.turn, 2);
    }

    #[tokio::test]
    async fn unclaimable_session_still_answers_without_saving() {
        let dir = tempfile::tempdir().unwrap();
        let model = scripted("general", ACCEPT, "unused", "Fever and cough [1].");
        let literature = StaticSearchBackend::always(Vec::new());
        let web = StaticSearchBackend::always(flu_hits());
        let agent = agent(&model, &literature, &web)
            .with_checkpoints(Arc::new(FileCheckpointStore::open(dir.path()).unwrap()));

        let reply = agent
            .answer(AgentRequest::new("flu symptoms").with_session(SessionKey::new("../escape")))
            .await;

        assert!(reply.outcome.is_done());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn session_resumes_from_checkpoint() {
        let model = scripted("general", ACCEPT, "unused", "Fever and cough [1].");
        let literature = StaticSearchBackend::always(Vec::new());
        let web = StaticSearchBackend::always(flu_hits());
        let store = MemoryCheckpointStore::default();
        let agent = agent(&model, &literature, &web).with_checkpoints(Arc::new(store.clone()));
        let key = SessionKey::new("chat-1");

        let first = agent
            .answer(AgentRequest::new("flu symptoms").with_session(key.clone()))
            .await;
        let second = agent
            .answer(AgentRequest::new("influenza fever").with_session(key.clone()))
            .await;

        assert_eq!((first.turn, second.turn), (1, 2));
        let saved = store.load(&key).await.unwrap().expect("saved");
        let outcomes: Vec<&str> = saved.transcript().iter().map(|t| t.outcome.as_str()).collect();
        assert_eq!(outcomes, vec!["done", "done"]);
        assert_eq!(saved.original_query().text(), "influenza fever");
    }

    #[tokio::test]
    async fn backend_errors_surface_as_failure_not_panic() {
        let model = scripted("general", ACCEPT, "flu symptoms adults", "unused");
        let literature = StaticSearchBackend::always(Vec::new());
        let web = StaticSearchBackend::sequence(vec![Err(BackendError::Malformed(
            "missing results".into(),
        ))]);
        let agent = agent(&model, &literature, &web).with_max_attempts(2);

        let reply = agent.answer(AgentRequest::new("flu symptoms")).await;

        assert!(!reply.outcome.is_done());
        assert_eq!(web.calls(), 2);
    }

    #[test]
    fn from_config_requires_credentials() {
        let telemetry = AgentTelemetry::builder("runtime").build().unwrap();
        let missing = MedicalAgent::from_config(&AgentConfig::default(), telemetry.clone());
        assert!(matches!(
            missing,
            Err(AgentError::Configuration(ConfigError::MissingCredential(_)))
        ));

        let config = AgentConfig {
            llm: LlmConfig {
                api_key: Some("sk-test".into()),
                ..LlmConfig::default()
            },
            sources: SourcesConfig {
                tavily_api_key: Some("tvly-test".into()),
                ..SourcesConfig::default()
            },
            max_attempts: 5,
            ..AgentConfig::default()
        };
        let agent = MedicalAgent::from_config(&config, telemetry).unwrap();
        assert_eq!(agent.max_attempts, 5);
    }
}
