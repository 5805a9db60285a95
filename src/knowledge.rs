use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};

/// Summary text used when neither lookup strategy finds an article.
pub const WIKIPEDIA_NOT_FOUND: &str = "No matching Wikipedia article found.";

const SUMMARY_MAX_CHARS: usize = 700;
const GEOSEARCH_RADIUS_M: u32 = 1000;
const GEOSEARCH_LIMIT: u32 = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct PageSummary {
    pub title: String,
    pub summary: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KnowledgeSummary {
    pub summary: String,
    pub reference_url: Option<String>,
}

impl KnowledgeSummary {
    fn not_found() -> Self {
        Self {
            summary: WIKIPEDIA_NOT_FOUND.to_string(),
            reference_url: None,
        }
    }

    fn from_page(page: PageSummary) -> Self {
        Self {
            summary: truncate_summary(&page.summary),
            reference_url: Some(page.url),
        }
    }
}

#[async_trait]
pub trait Encyclopedia: Send + Sync {
    /// Looks up a page by exact title; `None` when it does not exist.
    async fn page(&self, title: &str) -> AppResult<Option<PageSummary>>;

    /// Titles of pages near the coordinates, nearest first.
    async fn nearby_titles(&self, lat: f64, lng: f64, radius_m: u32) -> AppResult<Vec<String>>;
}

#[derive(Clone)]
pub struct KnowledgeLookup {
    source: Arc<dyn Encyclopedia>,
}

impl KnowledgeLookup {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        Ok(Self {
            source: Arc::new(WikipediaClient::new(config)?),
        })
    }

    pub fn from_source(source: Arc<dyn Encyclopedia>) -> Self {
        Self { source }
    }

    pub async fn summarize(&self, place_name: &str, lat: f64, lng: f64) -> AppResult<KnowledgeSummary> {
        let title = place_name.split(',').next().unwrap_or_default().trim();
        if !title.is_empty() {
            if let Some(page) = self.source.page(title).await? {
                info!(target: "knowledge", title = %page.title, "found article by name");
                return Ok(KnowledgeSummary::from_page(page));
            }
        }

        debug!(target: "knowledge", title, "name lookup failed; trying geo search");
        let nearby = self
            .source
            .nearby_titles(lat, lng, GEOSEARCH_RADIUS_M)
            .await?;
        if let Some(closest) = nearby.first() {
            if let Some(page) = self.source.page(closest).await? {
                info!(target: "knowledge", title = %page.title, "found nearby article");
                return Ok(KnowledgeSummary::from_page(page));
            }
        }

        info!(target: "knowledge", place_name, "no relevant article found");
        Ok(KnowledgeSummary::not_found())
    }
}

fn truncate_summary(summary: &str) -> String {
    if summary.chars().count() <= SUMMARY_MAX_CHARS {
        return summary.to_string();
    }
    let mut truncated: String = summary.chars().take(SUMMARY_MAX_CHARS).collect();
    truncated.push_str("...");
    truncated
}

pub struct WikipediaClient {
    http: reqwest::Client,
    api_url: String,
}

impl WikipediaClient {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(config.wiki_user_agent.as_str())
            .timeout(config.wiki_timeout())
            .build()?;
        Ok(Self {
            http,
            api_url: config.wikipedia_api_url.clone(),
        })
    }

    async fn query<T: for<'de> Deserialize<'de>>(&self, params: &[(&str, String)]) -> AppResult<T> {
        let response = self
            .http
            .get(&self.api_url)
            .query(&[("action", "query"), ("format", "json"), ("formatversion", "2")])
            .query(params)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Knowledge(format!("wikipedia returned {status}")));
        }
        Ok(response.json().await?)
    }
}

#[derive(Deserialize)]
struct ApiError {
    code: String,
    info: Option<String>,
}

fn api_failure(err: ApiError) -> AppError {
    AppError::Knowledge(format!(
        "{}: {}",
        err.code,
        err.info.unwrap_or_default()
    ))
}

#[async_trait]
impl Encyclopedia for WikipediaClient {
    async fn page(&self, title: &str) -> AppResult<Option<PageSummary>> {
        #[derive(Deserialize)]
        struct Response {
            query: Option<Query>,
            error: Option<ApiError>,
        }

        #[derive(Deserialize)]
        struct Query {
            #[serde(default)]
            pages: Vec<Page>,
        }

        #[derive(Deserialize)]
        struct Page {
            title: String,
            #[serde(default)]
            missing: bool,
            #[serde(default)]
            invalid: bool,
            extract: Option<String>,
            fullurl: Option<String>,
        }

        let parsed: Response = self
            .query(&[
                ("prop", "extracts|info".to_string()),
                ("exintro", "1".to_string()),
                ("explaintext", "1".to_string()),
                ("inprop", "url".to_string()),
                ("redirects", "1".to_string()),
                ("titles", title.to_string()),
            ])
            .await?;
        if let Some(err) = parsed.error {
            return Err(api_failure(err));
        }

        let page = parsed
            .query
            .and_then(|q| q.pages.into_iter().next())
            .filter(|page| !page.missing && !page.invalid);
        Ok(page.and_then(|page| {
            let url = page.fullurl?;
            Some(PageSummary {
                title: page.title,
                summary: page.extract.unwrap_or_default(),
                url,
            })
        }))
    }

    async fn nearby_titles(&self, lat: f64, lng: f64, radius_m: u32) -> AppResult<Vec<String>> {
        #[derive(Deserialize)]
        struct Response {
            query: Option<Query>,
            error: Option<ApiError>,
        }

        #[derive(Deserialize)]
        struct Query {
            #[serde(default)]
            geosearch: Vec<GeoHit>,
        }

        #[derive(Deserialize)]
        struct GeoHit {
            title: String,
            #[serde(default)]
            dist: f64,
        }

        let parsed: Response = self
            .query(&[
                ("list", "geosearch".to_string()),
                ("gscoord", format!("{lat}|{lng}")),
                ("gsradius", radius_m.to_string()),
                ("gslimit", GEOSEARCH_LIMIT.to_string()),
            ])
            .await?;
        if let Some(err) = parsed.error {
            return Err(api_failure(err));
        }

        let mut hits = parsed.query.map(|q| q.geosearch).unwrap_or_default();
        hits.sort_by(|a, b| a.dist.total_cmp(&b.dist));
        Ok(hits.into_iter().map(|hit| hit.title).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    use httptest::matchers::{all_of, contains, request, url_decoded};
    use httptest::responders::{json_encoded, status_code};
    use httptest::{Expectation, Server};
    use serde_json::json;

    #[derive(Default)]
    struct FakeEncyclopedia {
        pages: HashMap<String, PageSummary>,
        nearby: Vec<String>,
        requested: Mutex<Vec<String>>,
    }

    impl FakeEncyclopedia {
        fn with_page(mut self, title: &str, summary: &str) -> Self {
            self.pages.insert(
                title.to_string(),
                PageSummary {
                    title: title.to_string(),
                    summary: summary.to_string(),
                    url: format!("https://en.wikipedia.org/wiki/{}", title.replace(' ', "_")),
                },
            );
            self
        }
    }

    #[async_trait]
    impl Encyclopedia for FakeEncyclopedia {
        async fn page(&self, title: &str) -> AppResult<Option<PageSummary>> {
            self.requested.lock().push(title.to_string());
            Ok(self.pages.get(title).cloned())
        }

        async fn nearby_titles(&self, _lat: f64, _lng: f64, radius_m: u32) -> AppResult<Vec<String>> {
            assert_eq!(radius_m, GEOSEARCH_RADIUS_M);
            Ok(self.nearby.clone())
        }
    }

    #[tokio::test]
    async fn looks_up_first_name_segment() {
        let source = Arc::new(FakeEncyclopedia::default().with_page("Eiffel Tower", "Iron tower."));
        let lookup = KnowledgeLookup::from_source(source.clone());

        let result = lookup.summarize("Eiffel Tower, Paris", 48.85, 2.29).await.unwrap();
        assert_eq!(result.summary, "Iron tower.");
        assert_eq!(
            result.reference_url.as_deref(),
            Some("https://en.wikipedia.org/wiki/Eiffel_Tower")
        );
        assert_eq!(*source.requested.lock(), vec!["Eiffel Tower".to_string()]);
    }

    #[tokio::test]
    async fn falls_back_to_nearest_page() {
        let mut fake = FakeEncyclopedia::default().with_page("Pont d'Iéna", "A bridge.");
        fake.nearby = vec!["Pont d'Iéna".into(), "Trocadéro".into()];
        let lookup = KnowledgeLookup::from_source(Arc::new(fake));

        let result = lookup.summarize("Quai Branly, Paris", 48.86, 2.29).await.unwrap();
        assert_eq!(result.summary, "A bridge.");
        assert!(result.reference_url.is_some());
    }

    #[tokio::test]
    async fn reports_sentinel_when_nothing_matches() {
        let lookup = KnowledgeLookup::from_source(Arc::new(FakeEncyclopedia::default()));
        let result = lookup.summarize("Nowhere", 0.0, 0.0).await.unwrap();
        assert_eq!(result.summary, WIKIPEDIA_NOT_FOUND);
        assert_eq!(result.reference_url, None);
    }

    #[test]
    fn truncates_long_summaries_on_char_boundaries() {
        let long = "é".repeat(800);
        let truncated = truncate_summary(&long);
        assert_eq!(truncated.chars().count(), SUMMARY_MAX_CHARS + 3);
        assert!(truncated.ends_with("..."));

        let exact = "a".repeat(SUMMARY_MAX_CHARS);
        assert_eq!(truncate_summary(&exact), exact);
    }

    fn client_for(server: &Server) -> WikipediaClient {
        let config = AppConfig {
            wikipedia_api_url: server.url_str("/w/api.php"),
            ..AppConfig::default()
        };
        WikipediaClient::new(&config).unwrap()
    }

    #[tokio::test]
    async fn reads_page_extract_over_http() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("GET", "/w/api.php"),
                request::query(url_decoded(contains(("titles", "Louvre")))),
            ])
            .respond_with(json_encoded(json!({
                "query": { "pages": [{
                    "pageid": 1,
                    "title": "Louvre",
                    "extract": "The Louvre is a museum.",
                    "fullurl": "https://en.wikipedia.org/wiki/Louvre"
                }]}
            }))),
        );

        let page = client_for(&server).page("Louvre").await.unwrap().unwrap();
        assert_eq!(page.summary, "The Louvre is a museum.");
        assert_eq!(page.url, "https://en.wikipedia.org/wiki/Louvre");
    }

    #[tokio::test]
    async fn missing_page_is_none() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/w/api.php")).respond_with(
                json_encoded(json!({
                    "query": { "pages": [{ "title": "Nope", "missing": true }] }
                })),
            ),
        );

        assert!(client_for(&server).page("Nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn geosearch_orders_by_distance() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("GET", "/w/api.php"),
                request::query(url_decoded(contains(("list", "geosearch")))),
                request::query(url_decoded(contains(("gsradius", "1000")))),
            ])
            .respond_with(json_encoded(json!({
                "query": { "geosearch": [
                    { "title": "Far", "dist": 800.5 },
                    { "title": "Near", "dist": 12.0 }
                ]}
            }))),
        );

        let titles = client_for(&server)
            .nearby_titles(48.0, 2.0, GEOSEARCH_RADIUS_M)
            .await
            .unwrap();
        assert_eq!(titles, vec!["Near".to_string(), "Far".to_string()]);
    }

    #[tokio::test]
    async fn propagates_service_errors() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/w/api.php"))
                .respond_with(status_code(500)),
        );

        let err = client_for(&server).page("Anything").await.unwrap_err();
        assert!(matches!(err, AppError::Knowledge(_)));
    }
}
