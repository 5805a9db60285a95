use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};

pub const MAX_RESULTS: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub link: String,
    pub snippet: String,
}

#[async_trait]
pub trait WebSearch: Send + Sync {
    async fn search(&self, query: &str, limit: usize) -> AppResult<Vec<SearchResult>>;
}

/// Optional enrichment: backend failures degrade to an empty result list.
#[derive(Clone)]
pub struct SearchService {
    inner: Arc<dyn WebSearch>,
}

impl SearchService {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        Ok(Self {
            inner: Arc::new(DuckDuckGoClient::new(config)?),
        })
    }

    pub fn from_backend(inner: Arc<dyn WebSearch>) -> Self {
        Self { inner }
    }

    pub async fn search(&self, query: &str) -> Vec<SearchResult> {
        match self.inner.search(query, MAX_RESULTS).await {
            Ok(mut results) => {
                results.truncate(MAX_RESULTS);
                debug!(target: "web_search", query, count = results.len(), "search complete");
                results
            }
            Err(err) => {
                warn!(target: "web_search", query, error = %err, "web search failed; continuing without results");
                Vec::new()
            }
        }
    }
}

pub struct DuckDuckGoClient {
    http: reqwest::Client,
    api_url: String,
}

impl DuckDuckGoClient {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("map-insight/", env!("CARGO_PKG_VERSION")))
            .timeout(config.search_timeout())
            .build()?;
        Ok(Self {
            http,
            api_url: config.search_api_url.clone(),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InstantAnswer {
    #[serde(default)]
    heading: String,
    #[serde(default, rename = "AbstractText")]
    abstract_text: String,
    #[serde(default, rename = "AbstractURL")]
    abstract_url: String,
    #[serde(default)]
    results: Vec<Topic>,
    #[serde(default)]
    related_topics: Vec<Topic>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Topic {
    Entry {
        #[serde(rename = "FirstURL")]
        first_url: String,
        #[serde(rename = "Text", default)]
        text: String,
    },
    Group {
        #[serde(rename = "Topics", default)]
        topics: Vec<Topic>,
    },
}

impl InstantAnswer {
    fn into_results(self, limit: usize) -> Vec<SearchResult> {
        let mut out = Vec::new();
        if !self.abstract_url.is_empty() {
            out.push(SearchResult {
                title: self.heading,
                link: self.abstract_url,
                snippet: self.abstract_text,
            });
        }
        let mut pending: Vec<Topic> = self.results;
        pending.extend(self.related_topics);
        flatten_topics(pending, &mut out, limit);
        out.truncate(limit);
        out
    }
}

fn flatten_topics(topics: Vec<Topic>, out: &mut Vec<SearchResult>, limit: usize) {
    for topic in topics {
        if out.len() >= limit {
            return;
        }
        match topic {
            Topic::Entry { first_url, text } if !first_url.is_empty() => {
                let title = text
                    .split(" - ")
                    .next()
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .unwrap_or(first_url.as_str())
                    .to_string();
                out.push(SearchResult {
                    title,
                    link: first_url,
                    snippet: text,
                });
            }
            Topic::Entry { .. } => {}
            Topic::Group { topics } => flatten_topics(topics, out, limit),
        }
    }
}

#[async_trait]
impl WebSearch for DuckDuckGoClient {
    async fn search(&self, query: &str, limit: usize) -> AppResult<Vec<SearchResult>> {
        let response = self
            .http
            .get(&self.api_url)
            .query(&[
                ("q", query),
                ("format", "json"),
                ("no_html", "1"),
                ("skip_disambig", "1"),
            ])
            .send()
            .await?
            .error_for_status()
            .map_err(AppError::from)?;

        let answer: InstantAnswer = response.json().await?;
        Ok(answer.into_results(limit))
    }
}
