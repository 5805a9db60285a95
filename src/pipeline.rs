use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::{error, info, info_span, Instrument};

use crate::cache::{cache_place_info, cached_place_info, coordinate_key};
use crate::config::AppConfig;
use crate::context::RequestContext;
use crate::errors::{AppError, AppResult};
use crate::geocoder::{geocoder_from_config, ResolvedLocation, ReverseGeocoder};
use crate::knowledge::{KnowledgeLookup, KnowledgeSummary};
use crate::model::ModelClient;
use crate::search::{SearchResult, SearchService};
use crate::telemetry::{events, TelemetryClient};

pub const PLACE_INFO_SCHEMA: &str = r#"{
  "title": "string (short, precise title)",
  "description": "string (engaging paragraph, ~100-150 words, tailored to the user's interests)",
  "details": ["string", "string", "..."] (key facts or features),
  "ai_confidence": "'High', 'Medium' or 'Low' (your confidence in the generated information)",
  "sources": ["url1", "url2", ...] (URLs of the sources used, if any)
}"#;

#[derive(Clone)]
pub struct PlaceInfoPipeline {
    geocoder: Arc<dyn ReverseGeocoder>,
    knowledge: KnowledgeLookup,
    search: SearchService,
    model: ModelClient,
    cache_max_age: chrono::Duration,
    telemetry: TelemetryClient,
}

/// Everything gathered about a location before the model is asked to describe it.
pub struct PromptInputs<'a> {
    pub lat: f64,
    pub lng: f64,
    pub location: &'a ResolvedLocation,
    pub knowledge: &'a KnowledgeSummary,
    pub web_results: &'a [SearchResult],
    pub interests: &'a [String],
}

impl PlaceInfoPipeline {
    pub fn from_config(
        config: &AppConfig,
        model: ModelClient,
        telemetry: TelemetryClient,
    ) -> AppResult<Self> {
        Ok(Self {
            geocoder: geocoder_from_config(config)?,
            knowledge: KnowledgeLookup::new(config)?,
            search: SearchService::new(config)?,
            model,
            cache_max_age: config.cache_max_age(),
            telemetry,
        })
    }

    pub fn new(
        geocoder: Arc<dyn ReverseGeocoder>,
        knowledge: KnowledgeLookup,
        search: SearchService,
        model: ModelClient,
        cache_max_age: chrono::Duration,
        telemetry: TelemetryClient,
    ) -> Self {
        Self {
            geocoder,
            knowledge,
            search,
            model,
            cache_max_age,
            telemetry,
        }
    }

    pub async fn place_info(
        &self,
        ctx: &RequestContext,
        lat: f64,
        lng: f64,
        interests: &[String],
    ) -> AppResult<Value> {
        let cache_key = coordinate_key(lat, lng);
        let span = info_span!(
            "place_info",
            cache_key = %cache_key,
            user_id = ctx.user().map(|u| u.id)
        );

        async {
            let cached = ctx
                .with_connection(|conn| Ok(cached_place_info(conn, lat, lng, self.cache_max_age)))
                .unwrap_or_else(|err| {
                    error!(target: "place_pipeline", error = %err, "cache unavailable; computing fresh result");
                    None
                });

            if let Some(mut hit) = cached {
                info!(target: "place_pipeline", "returning cached place info");
                self.telemetry
                    .record(events::CACHE_HIT, json!({ "cache_key": cache_key }));
                if let Value::Object(fields) = &mut hit {
                    fields.insert("requested_lat".into(), json!(lat));
                    fields.insert("requested_lng".into(), json!(lng));
                }
                return Ok(hit);
            }

            self.telemetry
                .record(events::CACHE_MISS, json!({ "cache_key": cache_key }));
            match self.generate(ctx, lat, lng, interests).await {
                Ok(value) => Ok(value),
                Err(err) => {
                    error!(target: "place_pipeline", error = %err, "place info generation failed");
                    self.telemetry.record(
                        events::PLACE_INFO_FAILED,
                        json!({ "cache_key": cache_key, "error": err.to_string() }),
                    );
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn generate(
        &self,
        ctx: &RequestContext,
        lat: f64,
        lng: f64,
        interests: &[String],
    ) -> AppResult<Value> {
        let location = self.geocoder.resolve(lat, lng).await?;
        let knowledge = self
            .knowledge
            .summarize(&location.place_name, lat, lng)
            .await?;
        let web_results = self.search.search(&location.place_name).await;

        let prompt = build_prompt(&PromptInputs {
            lat,
            lng,
            location: &location,
            knowledge: &knowledge,
            web_results: &web_results,
            interests,
        })?;
        let generated = self.model.generate(&prompt, PLACE_INFO_SCHEMA).await?;
        let enriched = enrich(generated, lat, lng, &location, knowledge, web_results)?;

        if let Err(err) =
            ctx.with_connection(|conn| Ok(cache_place_info(conn, lat, lng, &enriched)))
        {
            error!(target: "place_pipeline", error = %err, "could not open storage for cache write");
        }

        info!(
            target: "place_pipeline",
            place_name = %location.place_name,
            "generated place info"
        );
        self.telemetry.record(
            events::PLACE_INFO_GENERATED,
            json!({ "cache_key": coordinate_key(lat, lng), "place_name": location.place_name }),
        );
        Ok(enriched)
    }
}

pub fn build_prompt(inputs: &PromptInputs<'_>) -> AppResult<String> {
    let address = if inputs.location.address.is_empty() {
        "Unavailable".to_string()
    } else {
        serde_json::to_string(&inputs.location.address)?
    };
    let web_results = serde_json::to_string(inputs.web_results)?;
    let interests = if inputs.interests.is_empty() {
        "None".to_string()
    } else {
        inputs.interests.join(", ")
    };
    let reference = inputs
        .knowledge
        .reference_url
        .as_deref()
        .unwrap_or("None");

    Ok(format!(
        "Analyze the location: Lat={lat}, Lng={lng}.\n\
         Probable name/area: {place_name}\n\
         Address details: {address}\n\
         Wikipedia summary: {summary}\n\
         Web search results: {web_results}\n\
         User interests: {interests}.\n\
         \n\
         Task: write a short, engaging description focused on the aspects relevant to the user's \
         interests. If the exact coordinates are not interesting, describe the nearest relevant \
         point of interest or the general character of the area, mentioning the user's interests.\n\
         \n\
         The output MUST be a SINGLE valid JSON object matching this structure:\n\
         {schema}\n\
         Tailor the 'description' and 'details' fields to the user interests listed above. \
         Include '{reference}' in 'sources' if it is available and relevant. Do not add any \
         introductory phrases such as \"Here is the JSON:\" and no markdown code fences.",
        lat = inputs.lat,
        lng = inputs.lng,
        place_name = inputs.location.place_name,
        summary = inputs.knowledge.summary,
        schema = PLACE_INFO_SCHEMA,
    ))
}

fn enrich(
    generated: Value,
    lat: f64,
    lng: f64,
    location: &ResolvedLocation,
    knowledge: KnowledgeSummary,
    web_results: Vec<SearchResult>,
) -> AppResult<Value> {
    let mut fields = match generated {
        Value::Object(fields) => fields,
        other => {
            return Err(AppError::UnexpectedModelShape {
                expected: "object",
                actual: json_kind(&other),
            })
        }
    };

    fields.insert("requested_lat".into(), json!(lat));
    fields.insert("requested_lng".into(), json!(lng));
    fields.insert(
        "identified_place_name".into(),
        Value::String(location.place_name.clone()),
    );
    fields.insert(
        "wikipedia_summary".into(),
        Value::String(knowledge.summary),
    );
    fields.insert("web_results".into(), serde_json::to_value(web_results)?);
    if let Some(url) = knowledge.reference_url {
        merge_reference_url(&mut fields, url);
    }
    Ok(Value::Object(fields))
}

/// Puts the reference URL first in `sources` unless the model already listed it.
fn merge_reference_url(fields: &mut Map<String, Value>, url: String) {
    match fields.get_mut("sources") {
        Some(Value::Array(sources)) => {
            if !sources.iter().any(|s| s.as_str() == Some(url.as_str())) {
                sources.insert(0, Value::String(url));
            }
        }
        _ => {
            fields.insert("sources".into(), json!([url]));
        }
    }
}

pub(crate) fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
