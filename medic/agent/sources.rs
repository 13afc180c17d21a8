//! Evidence source adapter over the literature and web backends.

use std::{collections::VecDeque, fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::SourcesConfig;
use crate::error::{AgentError, AgentResult, BackendError};
use crate::model::{EvidenceItem, EvidenceSet, EvidenceSource, Query, QueryCategory};

/// Raw hit as returned by a backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SearchHit {
    /// PMID or URL.
    pub id: String,
    /// Title.
    pub title: String,
    /// Snippet text.
    pub snippet: String,
}

impl SearchHit {
    /// Creates a hit.
    #[must_use]
    pub fn new(id: impl Into<String>, title: impl Into<String>, snippet: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            snippet: snippet.into(),
        }
    }
}

/// A search backend.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    /// Returns up to `limit` hits in relevance order.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, BackendError>;
}

/// NCBI E-utilities client (esearch for PMIDs, esummary for metadata).
#[derive(Debug, Clone)]
pub struct PubMedClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Deserialize)]
struct EsearchEnvelope {
    esearchresult: EsearchResult,
}

#[derive(Deserialize)]
struct EsearchResult {
    #[serde(default)]
    idlist: Vec<String>,
}

impl PubMedClient {
    /// Creates a client rooted at `base_url` (…/entrez/eutils).
    pub fn new(client: Client, base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }

    async fn get_json(&self, endpoint: &str, params: &[(&str, String)]) -> Result<Value, BackendError> {
        let url = format!("{}/{endpoint}", self.base_url);
        let mut req = self.client.get(&url).query(params);
        if let Some(key) = &self.api_key {
            req = req.query(&[("api_key", key)]);
        }
        let response = req
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|err| BackendError::Request(err.to_string()))?;
        response
            .json()
            .await
            .map_err(|err| BackendError::Malformed(err.to_string()))
    }
}

#[async_trait]
impl SearchBackend for PubMedClient {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, BackendError> {
        let ids = self
            .get_json(
                "esearch.fcgi",
                &[
                    ("db", "pubmed".into()),
                    ("term", query.to_string()),
                    ("retmode", "json".into()),
                    ("retmax", limit.to_string()),
                ],
            )
            .await?;
        let ids: EsearchEnvelope = serde_json::from_value(ids)
            .map_err(|err| BackendError::Malformed(err.to_string()))?;
        if ids.esearchresult.idlist.is_empty() {
            return Ok(Vec::new());
        }
        let summary = self
            .get_json(
                "esummary.fcgi",
                &[
                    ("db", "pubmed".into()),
                    ("id", ids.esearchresult.idlist.join(",")),
                    ("retmode", "json".into()),
                ],
            )
            .await?;
        Ok(parse_esummary(&ids.esearchresult.idlist, &summary))
    }
}

/// Builds hits from an esummary document, keeping the esearch rank order.
fn parse_esummary(order: &[String], summary: &Value) -> Vec<SearchHit> {
    let Some(result) = summary.get("result") else {
        return Vec::new();
    };
    order
        .iter()
        .filter_map(|pmid| {
            let doc = result.get(pmid)?;
            let title = doc.get("title")?.as_str()?.trim().to_string();
            let journal = doc
                .get("fulljournalname")
                .or_else(|| doc.get("source"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            let pubdate = doc.get("pubdate").and_then(Value::as_str).unwrap_or_default();
            let authors: Vec<&str> = doc
                .get("authors")
                .and_then(Value::as_array)
                .map(|list| {
                    list.iter()
                        .filter_map(|a| a.get("name").and_then(Value::as_str))
                        .take(3)
                        .collect()
                })
                .unwrap_or_default();
            let mut snippet = title.clone();
            if !journal.is_empty() {
                snippet.push_str(&format!(" {journal}"));
            }
            if !pubdate.is_empty() {
                snippet.push_str(&format!(" ({pubdate})"));
            }
            if !authors.is_empty() {
                snippet.push_str(&format!(". {}", authors.join(", ")));
            }
            Some(SearchHit::new(pmid.clone(), title, snippet))
        })
        .collect()
}

/// Tavily web search client.
#[derive(Debug, Clone)]
pub struct TavilyClient {
    client: Client,
    base_url: String,
    api_key: String,
}

#[derive(Serialize)]
struct TavilyRequest<'a> {
    api_key: &'a str,
    query: &'a str,
    max_results: usize,
    search_depth: &'static str,
}

#[derive(Deserialize)]
struct TavilyResponse {
    #[serde(default)]
    results: Vec<TavilyResult>,
}

#[derive(Deserialize)]
struct TavilyResult {
    url: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    content: String,
}

impl TavilyClient {
    /// Creates a client.
    pub fn new(client: Client, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl SearchBackend for TavilyClient {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, BackendError> {
        let payload = TavilyRequest {
            api_key: &self.api_key,
            query,
            max_results: limit,
            search_depth: "basic",
        };
        let response = self
            .client
            .post(format!("{}/search", self.base_url))
            .json(&payload)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|err| BackendError::Request(err.to_string()))?;
        let body: TavilyResponse = response
            .json()
            .await
            .map_err(|err| BackendError::Malformed(err.to_string()))?;
        Ok(body
            .results
            .into_iter()
            .map(|r| SearchHit::new(r.url, r.title, r.content))
            .collect())
    }
}

/// Canned backend for tests and offline runs. Replays scripted responses in
/// order and repeats the last one once the script runs out.
#[derive(Clone)]
pub struct StaticSearchBackend {
    script: Arc<Mutex<VecDeque<Result<Vec<SearchHit>, BackendError>>>>,
    delay: Option<Duration>,
    queries: Arc<Mutex<Vec<String>>>,
}

impl fmt::Debug for StaticSearchBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticSearchBackend")
            .field("calls", &self.calls())
            .finish()
    }
}

impl StaticSearchBackend {
    /// Replays `script`.
    #[must_use]
    pub fn sequence(script: Vec<Result<Vec<SearchHit>, BackendError>>) -> Self {
        Self {
            script: Arc::new(Mutex::new(script.into())),
            delay: None,
            queries: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Always returns `hits`.
    #[must_use]
    pub fn always(hits: Vec<SearchHit>) -> Self {
        Self::sequence(vec![Ok(hits)])
    }

    /// Always fails.
    #[must_use]
    pub fn failing(detail: impl Into<String>) -> Self {
        Self::sequence(vec![Err(BackendError::Request(detail.into()))])
    }

    /// Sleeps before answering.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of searches served.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.queries.lock().len()
    }

    /// Query strings received, in order.
    #[must_use]
    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().clone()
    }
}

#[async_trait]
impl SearchBackend for StaticSearchBackend {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, BackendError> {
        self.queries.lock().push(query.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = {
            let mut script = self.script.lock();
            if script.len() > 1 {
                script.pop_front()
            } else {
                script.front().cloned()
            }
        };
        next.unwrap_or_else(|| Ok(Vec::new())).map(|mut hits| {
            hits.truncate(limit);
            hits
        })
    }
}

/// Routes a query to the backend its category selects.
#[derive(Clone)]
pub struct EvidenceSourceAdapter {
    literature: Arc<dyn SearchBackend>,
    web: Arc<dyn SearchBackend>,
    limit: usize,
    deadline: Duration,
}

impl fmt::Debug for EvidenceSourceAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvidenceSourceAdapter")
            .field("limit", &self.limit)
            .field("deadline", &self.deadline)
            .finish()
    }
}

impl EvidenceSourceAdapter {
    /// Creates an adapter over the two backends.
    pub fn new(
        literature: Arc<dyn SearchBackend>,
        web: Arc<dyn SearchBackend>,
        limit: usize,
        deadline: Duration,
    ) -> Self {
        Self {
            literature,
            web,
            limit: limit.max(1),
            deadline,
        }
    }

    /// Builds the HTTP-backed adapter from configuration.
    ///
    /// The Tavily key is validated by [`crate::config::AgentConfig::validate`];
    /// an unset key here yields requests the backend rejects.
    pub fn from_config(client: &Client, config: &SourcesConfig, deadline: Duration) -> Self {
        let literature = PubMedClient::new(
            client.clone(),
            config.pubmed_base_url.clone(),
            config.ncbi_api_key.clone(),
        );
        let web = TavilyClient::new(
            client.clone(),
            config.tavily_base_url.clone(),
            config.tavily_api_key.clone().unwrap_or_default(),
        );
        Self::new(Arc::new(literature), Arc::new(web), config.result_limit, deadline)
    }

    /// Searches the backend for `category`. Zero hits is an empty set;
    /// failures and timeouts are [`AgentError::SourceUnavailable`].
    pub async fn search(&self, query: &Query, category: QueryCategory) -> AgentResult<EvidenceSet> {
        let source = category.source();
        let backend = match category {
            QueryCategory::Research => &self.literature,
            QueryCategory::General => &self.web,
        };
        let hits = match tokio::time::timeout(self.deadline, backend.search(query.text(), self.limit)).await {
            Ok(Ok(hits)) => hits,
            Ok(Err(err)) => return Err(AgentError::source_unavailable(source, &err)),
            Err(_) => {
                return Err(AgentError::SourceUnavailable {
                    backend: source,
                    detail: format!("timed out after {:?}", self.deadline),
                })
            }
        };
        Ok(EvidenceSet::from_ranked(
            hits.into_iter()
                .filter(|hit| !hit.id.trim().is_empty())
                .take(self.limit)
                .map(|hit| EvidenceItem::new(hit.id, hit.title, hit.snippet, source)),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn adapter(literature: StaticSearchBackend, web: StaticSearchBackend) -> EvidenceSourceAdapter {
        EvidenceSourceAdapter::new(
            Arc::new(literature),
            Arc::new(web),
            5,
            Duration::from_millis(200),
        )
    }

    #[tokio::test]
    async fn routes_by_category() {
        let literature = StaticSearchBackend::always(vec![SearchHit::new("3815", "t", "s")]);
        let web = StaticSearchBackend::always(vec![SearchHit::new("https://a.org", "t", "s")]);
        let adapter = adapter(literature.clone(), web.clone());

        let set = adapter
            .search(&Query::user("crispr trials"), QueryCategory::Research)
            .await
            .unwrap();
        assert_eq!(set.items()[0].source, EvidenceSource::PubMed);
        assert_eq!(literature.calls(), 1);
        assert_eq!(web.calls(), 0);

        let set = adapter
            .search(&Query::user("flu symptoms"), QueryCategory::General)
            .await
            .unwrap();
        assert_eq!(set.identifiers(), vec!["https://a.org"]);
        assert_eq!(web.queries(), vec!["flu symptoms".to_string()]);
    }

    #[tokio::test]
    async fn zero_hits_is_empty_not_error() {
        let adapter = adapter(StaticSearchBackend::always(Vec::new()), StaticSearchBackend::always(Vec::new()));
        let set = adapter
            .search(&Query::user("rare thing"), QueryCategory::Research)
            .await
            .unwrap();
        assert!(set.is_empty());
    }

    #[tokio::test]
    async fn failures_and_timeouts_are_source_unavailable() {
        let adapter = adapter(
            StaticSearchBackend::failing("503"),
            StaticSearchBackend::always(Vec::new()).with_delay(Duration::from_secs(5)),
        );
        let err = adapter
            .search(&Query::user("q"), QueryCategory::Research)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::SourceUnavailable { backend: EvidenceSource::PubMed, .. }));
        let err = adapter
            .search(&Query::user("q"), QueryCategory::General)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::SourceUnavailable { backend: EvidenceSource::Tavily, .. }));
    }

    #[tokio::test]
    async fn static_backend_repeats_last_response() {
        let backend = StaticSearchBackend::sequence(vec![
            Ok(Vec::new()),
            Ok(vec![SearchHit::new("1", "a", "b")]),
        ]);
        assert!(backend.search("q", 5).await.unwrap().is_empty());
        assert_eq!(backend.search("q", 5).await.unwrap().len(), 1);
        assert_eq!(backend.search("q", 5).await.unwrap().len(), 1);
    }

    #[test]
    fn esummary_keeps_rank_and_builds_snippet() {
        let order = vec!["222".to_string(), "111".to_string(), "999".to_string()];
        let doc = json!({
            "result": {
                "uids": ["111", "222"],
                "111": { "title": "Second paper", "fulljournalname": "Nature", "pubdate": "2024" },
                "222": {
                    "title": "CRISPR base editing in sickle cell disease",
                    "fulljournalname": "The New England journal of medicine",
                    "pubdate": "2023 Jan",
                    "authors": [{ "name": "Frangoul H" }, { "name": "Altshuler D" }]
                }
            }
        });
        let hits = parse_esummary(&order, &doc);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "222");
        assert!(hits[0].snippet.contains("New England"));
        assert!(hits[0].snippet.contains("Frangoul H"));
        assert_eq!(hits[1].id, "111");
    }
}
