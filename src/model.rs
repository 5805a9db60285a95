use std::sync::Arc;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};

const RAW_LOG_PREVIEW_CHARS: usize = 500;

/// Textual payload of a model response, resolved once at the client boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelOutput {
    Text(String),
    Parts(Vec<String>),
}

impl ModelOutput {
    /// Prefers the direct text field and falls back to the multi-part output.
    pub fn resolve(response: RawModelResponse) -> AppResult<Self> {
        if let Some(text) = response.text {
            return Ok(Self::Text(text));
        }
        if !response.parts.is_empty() {
            return Ok(Self::Parts(response.parts));
        }
        Err(AppError::MalformedModelResponse(
            response
                .finish_reason
                .map(|reason| format!("no text in response (finish reason {reason})"))
                .unwrap_or_else(|| "no text in response".to_string()),
        ))
    }

    pub fn into_text(self) -> String {
        match self {
            Self::Text(text) => text,
            Self::Parts(parts) => parts.concat(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawModelResponse {
    pub text: Option<String>,
    pub parts: Vec<String>,
    pub finish_reason: Option<String>,
}

impl RawModelResponse {
    /// A candidate holding exactly one text part is reported as direct text.
    pub fn from_candidate_parts(mut parts: Vec<String>, finish_reason: Option<String>) -> Self {
        let text = if parts.len() == 1 { parts.pop() } else { None };
        Self {
            text,
            parts,
            finish_reason,
        }
    }
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    fn model_name(&self) -> &str;

    /// Sends the prompt with generation options that force a JSON-typed response.
    async fn generate_json(&self, prompt: &str) -> AppResult<RawModelResponse>;
}

#[derive(Clone)]
pub struct ModelClient {
    backend: Option<Arc<dyn TextGenerator>>,
}

impl ModelClient {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let api_key = config.require_model_credentials()?.clone();
        let backend = GeminiClient::new(config, api_key)?;
        info!(target: "model_client", model = %config.gemini_model, "generative model configured");
        Ok(Self {
            backend: Some(Arc::new(backend)),
        })
    }

    pub fn from_backend(backend: Arc<dyn TextGenerator>) -> Self {
        Self {
            backend: Some(backend),
        }
    }

    pub fn unconfigured() -> Self {
        Self { backend: None }
    }

    /// Generates a strict-JSON answer; `schema_hint` names the expected document shape.
    pub async fn generate(&self, prompt: &str, schema_hint: &str) -> AppResult<Value> {
        let backend = self.backend.as_ref().ok_or(AppError::ModelNotInitialized)?;
        debug!(
            target: "model_client",
            model = backend.model_name(),
            prompt_chars = prompt.len(),
            schema = schema_hint.trim(),
            "sending prompt"
        );

        let raw = backend.generate_json(prompt).await?;
        let text = ModelOutput::resolve(raw)
            .inspect_err(|err| error!(target: "model_client", error = %err, "unexpected response structure"))?
            .into_text();
        debug!(
            target: "model_client",
            preview = %text.chars().take(RAW_LOG_PREVIEW_CHARS).collect::<String>(),
            "raw model output"
        );

        serde_json::from_str(&text).map_err(|err| {
            error!(target: "model_client", error = %err, "model output failed JSON parsing");
            AppError::ModelJson(err)
        })
    }
}

pub struct GeminiClient {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: SecretString,
}

impl GeminiClient {
    pub fn new(config: &AppConfig, api_key: SecretString) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("map-insight/", env!("CARGO_PKG_VERSION")))
            .timeout(config.model_timeout())
            .build()?;
        let endpoint = format!(
            "{}/v1beta/models/{}:generateContent",
            config.gemini_api_base.trim_end_matches('/'),
            config.gemini_model
        );
        Ok(Self {
            http,
            endpoint,
            model: config.gemini_model.clone(),
            api_key,
        })
    }
}

#[async_trait]
impl TextGenerator for GeminiClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate_json(&self, prompt: &str) -> AppResult<RawModelResponse> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct RequestBody<'a> {
            contents: [Content<'a>; 1],
            generation_config: GenerationConfig,
        }

        #[derive(Serialize)]
        struct Content<'a> {
            role: &'static str,
            parts: [RequestPart<'a>; 1],
        }

        #[derive(Serialize)]
        struct RequestPart<'a> {
            text: &'a str,
        }

        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct GenerationConfig {
            response_mime_type: &'static str,
        }

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Response {
            #[serde(default)]
            candidates: Vec<Candidate>,
        }

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Candidate {
            content: Option<CandidateContent>,
            finish_reason: Option<String>,
        }

        #[derive(Deserialize)]
        struct CandidateContent {
            #[serde(default)]
            parts: Vec<ResponsePart>,
        }

        #[derive(Deserialize)]
        struct ResponsePart {
            text: Option<String>,
        }

        let body = RequestBody {
            contents: [Content {
                role: "user",
                parts: [RequestPart { text: prompt }],
            }],
            generation_config: GenerationConfig {
                response_mime_type: "application/json",
            },
        };

        let response = self
            .http
            .post(&self.endpoint)
            .header("x-goog-api-key", self.api_key.expose_secret())
            .json(&body)
            .send()
            .await?
            .error_for_status()?;

        let parsed: Response = response.json().await?;
        let first = parsed.candidates.into_iter().next();
        let finish_reason = first.as_ref().and_then(|c| c.finish_reason.clone());
        let parts = first
            .and_then(|c| c.content)
            .map(|content| content.parts.into_iter().filter_map(|p| p.text).collect())
            .unwrap_or_default();

        Ok(RawModelResponse::from_candidate_parts(parts, finish_reason))
    }
}
