use std::{sync::Arc, time::Duration};

use crate::error::{AgentError, AgentResult};
use crate::llm::{complete_within, CompletionOptions, LanguageModel};
use crate::model::{QualityVerdict, Query};

const PREFIXES: &[&str] = &["refined query:", "new query:", "query:", "alternative query:"];

/// Rewrites a query after the gate asked for refinement.
#[derive(Clone)]
pub struct QueryRefiner {
    model: Arc<dyn LanguageModel>,
    deadline: Duration,
}

impl std::fmt::Debug for QueryRefiner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryRefiner")
            .field("deadline", &self.deadline)
            .finish()
    }
}

impl QueryRefiner {
    /// Creates a refiner.
    pub fn new(model: Arc<dyn LanguageModel>, deadline: Duration) -> Self {
        Self { model, deadline }
    }

    /// Produces the next query. Output identical to the input text (or empty)
    /// is [`AgentError::RefinementDegenerate`].
    pub async fn refine(&self, query: &Query, verdict: &QualityVerdict) -> AgentResult<Query> {
        let prompt = refine_prompt(query.text(), &verdict.reason);
        let reply = complete_within(
            self.model.as_ref(),
            &prompt,
            CompletionOptions {
                max_tokens: 64,
                temperature: 0.4,
            },
            self.deadline,
        )
        .await?;
        let text = clean_reply(&reply);
        if text.is_empty() {
            return Err(AgentError::RefinementDegenerate("empty rewrite".into()));
        }
        if text == query.text() {
            return Err(AgentError::RefinementDegenerate(format!(
                "rewrite identical to \"{text}\""
            )));
        }
        Ok(Query::refined_from(query, text))
    }
}

fn refine_prompt(query: &str, gap: &str) -> String {
    format!(
        r#"The previous search for "{query}" returned limited results.
Problem with the results: {gap}

Suggest a more specific or alternative search query that could yield better results.
Broaden or re-target the terms; do not repeat the query unchanged.
Reply with the new query only, on one line."#
    )
}

/// First non-empty line with list markers, labels and quotes removed.
fn clean_reply(reply: &str) -> String {
    let line = reply
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or_default();
    let mut text = line.trim_start_matches(['-', '*', '•']).trim();
    let lowered = text.to_lowercase();
    if let Some(prefix) = PREFIXES.iter().find(|p| lowered.starts_with(*p)) {
        text = text.get(prefix.len()..).unwrap_or(text).trim();
    }
    text.trim_matches(|c: char| matches!(c, '"' | '\'' | '`' | '“' | '”'))
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ModelError;
    use crate::llm::ScriptedLanguageModel;
    use crate::model::QueryOrigin;

    fn refiner(model: &ScriptedLanguageModel) -> QueryRefiner {
        QueryRefiner::new(Arc::new(model.clone()), Duration::from_millis(200))
    }

    #[test]
    fn cleans_labels_and_quotes() {
        assert_eq!(
            clean_reply("\n  Refined query: \"CRISPR Cas9 clinical trial outcomes\"\nbecause..."),
            "CRISPR Cas9 clinical trial outcomes"
        );
        assert_eq!(clean_reply("- `gene therapy trials`"), "gene therapy trials");
        assert_eq!(clean_reply("   \n  "), "");
    }

    #[tokio::test]
    async fn produces_next_attempt() {
        let model = ScriptedLanguageModel::constant("CRISPR gene editing clinical trial results");
        let query = Query::user("latest clinical trials for CRISPR gene therapy");
        let refined = refiner(&model)
            .refine(&query, &QualityVerdict::refine("no evidence returned"))
            .await
            .unwrap();
        assert_eq!(refined.origin(), QueryOrigin::Refined);
        assert_eq!(refined.attempt(), 1);
        assert_ne!(refined.text(), query.text());
        assert!(model.prompts()[0].contains("no evidence returned"));
    }

    #[tokio::test]
    async fn identical_or_empty_rewrite_is_degenerate() {
        let query = Query::user("measles vaccine schedule");
        let same = ScriptedLanguageModel::constant("\"measles vaccine schedule\"");
        let err = refiner(&same)
            .refine(&query, &QualityVerdict::refine("thin"))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::RefinementDegenerate(_)));

        let empty = ScriptedLanguageModel::constant("  ");
        let err = refiner(&empty)
            .refine(&query, &QualityVerdict::refine("thin"))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::RefinementDegenerate(_)));
    }

    #[tokio::test]
    async fn model_failure_propagates() {
        let model = ScriptedLanguageModel::from_fn(|_| Err(ModelError::Unavailable("401".into())));
        let err = refiner(&model)
            .refine(&Query::user("q"), &QualityVerdict::refine("thin"))
            .await
            .unwrap_err();
        assert!(err.is_model_failure());
    }
}
