use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::accounts::{self, Interest, VisitedPlace};
use crate::config::PublicAppConfig;
use crate::context::{AuthenticatedUser, RequestContext};
use crate::errors::AppError;
use crate::mindmap::{generate_mind_map, MindMap};
use crate::AppState;

const INTERNAL_ERROR: &str = "Internal server error";

/// Error response: client errors carry their message, everything else becomes a 500
/// with a fixed headline and the underlying error as `details`.
#[derive(Debug)]
pub struct ApiError {
    source: AppError,
    headline: &'static str,
}

impl ApiError {
    fn with_headline(mut self, headline: &'static str) -> Self {
        self.headline = headline;
        self
    }
}

impl From<AppError> for ApiError {
    fn from(source: AppError) -> Self {
        Self {
            source,
            headline: INTERNAL_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self.source {
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, json!({ "error": msg })),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, json!({ "error": msg })),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, json!({ "error": msg })),
            other => {
                error!(target: "http", error = %other, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": self.headline, "details": other.to_string() }),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/get-place-info", post(get_place_info))
        .route("/get-recommendations", get(get_recommendations))
        .route("/generate-scheme", post(generate_scheme))
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/auth/logout", post(logout))
        .route("/auth/profile", get(profile).put(update_profile))
        .route("/visited", get(list_visited).post(add_visited))
        .with_state(state)
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Builds the request context and resolves the caller from the bearer token, if any.
/// Unknown or expired tokens are treated as anonymous.
fn request_context(state: &AppState, headers: &HeaderMap) -> ApiResult<RequestContext> {
    let mut ctx = state.request_context();
    if let Some(token) = bearer_token(headers) {
        let ttl = state.config().session_ttl();
        let user = ctx.with_connection(|conn| accounts::user_for_session(conn, token, ttl))?;
        ctx.set_user(user);
    }
    Ok(ctx)
}

fn require_user(ctx: &RequestContext, message: &str) -> ApiResult<AuthenticatedUser> {
    ctx.user()
        .cloned()
        .ok_or_else(|| ApiError::from(AppError::Unauthorized(message.to_string())))
}

fn parse_json_body(body: &Bytes) -> Option<Value> {
    serde_json::from_slice(body).ok()
}

fn coordinates(body: &Bytes) -> ApiResult<(f64, f64)> {
    let missing = || ApiError::from(AppError::Validation("Missing coordinates".into()));
    let payload = parse_json_body(body).ok_or_else(missing)?;
    let lat = payload.get("lat").and_then(Value::as_f64).ok_or_else(missing)?;
    let lng = payload.get("lng").and_then(Value::as_f64).ok_or_else(missing)?;
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lng) {
        return Err(AppError::Validation("Coordinates out of range".into()).into());
    }
    Ok((lat, lng))
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    telemetry_queue_depth: usize,
    config: PublicAppConfig,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        telemetry_queue_depth: state.telemetry().queue_depth(),
        config: state.config().public_profile(),
    })
}

async fn get_place_info(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let (lat, lng) = coordinates(&body)?;
    let ctx = request_context(&state, &headers)?;
    let interests = match ctx.user() {
        Some(user) => ctx.with_connection(|conn| accounts::user_interest_names(conn, user.id))?,
        None => Vec::new(),
    };
    info!(
        target: "http",
        lat,
        lng,
        user_id = ctx.user().map(|u| u.id),
        interests = interests.len(),
        "place info requested"
    );

    let value = state
        .pipeline()
        .place_info(&ctx, lat, lng, &interests)
        .await?;
    Ok(Json(value))
}

async fn get_recommendations(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let ctx = request_context(&state, &headers)?;
    let user = require_user(&ctx, "Login required for recommendations")?;
    let list = state
        .recommender()
        .recommend(&ctx, &user)
        .await
        .map_err(|err| ApiError::from(err).with_headline("Failed to generate recommendations"))?;
    Ok(Json(list))
}

async fn generate_scheme(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<MindMap>> {
    let place_data = parse_json_body(&body)
        .and_then(|mut payload| payload.get_mut("place_data").map(Value::take))
        .filter(|value| !value.is_null())
        .ok_or_else(|| AppError::Validation("Missing place data".into()))?;

    let ctx = request_context(&state, &headers)?;
    let interests = match ctx.user() {
        Some(user) => ctx.with_connection(|conn| accounts::user_interest_names(conn, user.id))?,
        None => Vec::new(),
    };
    Ok(Json(generate_mind_map(&place_data, &interests)?))
}

#[derive(Debug, Default, Deserialize)]
struct Credentials {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
}

fn credentials(body: &Bytes) -> ApiResult<Credentials> {
    serde_json::from_slice(body).map_err(|_| {
        ApiError::from(AppError::Validation(
            "Expected a JSON body with username and password".into(),
        ))
    })
}

async fn register(State(state): State<AppState>, body: Bytes) -> ApiResult<(StatusCode, Json<AuthenticatedUser>)> {
    let creds = credentials(&body)?;
    let ctx = state.request_context();
    let user = ctx.with_connection(|conn| accounts::register(conn, &creds.username, &creds.password))?;
    Ok((StatusCode::CREATED, Json(user)))
}

async fn login(State(state): State<AppState>, body: Bytes) -> ApiResult<Json<accounts::Session>> {
    let creds = credentials(&body)?;
    let ctx = state.request_context();
    let session = ctx.with_connection(|conn| accounts::login(conn, &creds.username, &creds.password))?;
    Ok(Json(session))
}

async fn logout(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<StatusCode> {
    let Some(token) = bearer_token(&headers) else {
        return Err(AppError::Unauthorized("Missing bearer token".into()).into());
    };
    let ctx = state.request_context();
    if !ctx.with_connection(|conn| accounts::logout(conn, token))? {
        warn!(target: "http", "logout for unknown session");
    }
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
struct InterestChoice {
    id: i64,
    name: String,
    selected: bool,
}

#[derive(Debug, Serialize)]
struct ProfileResponse {
    user: AuthenticatedUser,
    interests: Vec<InterestChoice>,
}

fn profile_response(ctx: &RequestContext, user: AuthenticatedUser) -> ApiResult<ProfileResponse> {
    let (catalogue, selected) = ctx.with_connection(|conn| {
        Ok((
            accounts::all_interests(conn)?,
            accounts::user_interest_ids(conn, user.id)?,
        ))
    })?;
    let interests = catalogue
        .into_iter()
        .map(|Interest { id, name }| InterestChoice {
            id,
            name,
            selected: selected.contains(&id),
        })
        .collect();
    Ok(ProfileResponse { user, interests })
}

async fn profile(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Json<ProfileResponse>> {
    let ctx = request_context(&state, &headers)?;
    let user = require_user(&ctx, "Login required")?;
    Ok(Json(profile_response(&ctx, user)?))
}

#[derive(Debug, Deserialize)]
struct InterestUpdate {
    #[serde(default)]
    interest_ids: Vec<i64>,
}

async fn update_profile(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<ProfileResponse>> {
    let ctx = request_context(&state, &headers)?;
    let user = require_user(&ctx, "Login required")?;
    let update: InterestUpdate = serde_json::from_slice(&body)
        .map_err(|_| AppError::Validation("Expected a JSON body with interest_ids".into()))?;
    ctx.with_connection(|conn| accounts::update_user_interests(conn, user.id, &update.interest_ids))?;
    Ok(Json(profile_response(&ctx, user)?))
}

async fn list_visited(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Json<Vec<VisitedPlace>>> {
    let ctx = request_context(&state, &headers)?;
    let user = require_user(&ctx, "Login required")?;
    let places = ctx.with_connection(|conn| accounts::visited_places(conn, user.id, None))?;
    Ok(Json(places))
}

async fn add_visited(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<VisitedPlace>)> {
    let ctx = request_context(&state, &headers)?;
    let user = require_user(&ctx, "Login required")?;
    let (lat, lng) = coordinates(&body)?;
    let place_name = parse_json_body(&body)
        .and_then(|payload| payload.get("place_name")?.as_str().map(str::to_string));
    let place = ctx.with_connection(|conn| {
        accounts::add_visited_place(conn, user.id, place_name.as_deref(), lat, lng)
    })?;
    Ok((StatusCode::CREATED, Json(place)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::db::bootstrap;
    use crate::errors::AppResult;
    use crate::geocoder::{ResolvedLocation, ReverseGeocoder};
    use crate::knowledge::{Encyclopedia, KnowledgeLookup, PageSummary};
    use crate::model::ModelClient;
    use crate::pipeline::PlaceInfoPipeline;
    use crate::recommendations::Recommender;
    use crate::search::{SearchResult, SearchService, WebSearch};
    use crate::telemetry::TelemetryClient;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use tempfile::{tempdir, TempDir};
    use tower::util::ServiceExt;

    struct Nowhere;

    #[async_trait]
    impl ReverseGeocoder for Nowhere {
        async fn resolve(&self, lat: f64, lng: f64) -> AppResult<ResolvedLocation> {
            Ok(ResolvedLocation::from_address(lat, lng, None))
        }
    }

    #[async_trait]
    impl Encyclopedia for Nowhere {
        async fn page(&self, _title: &str) -> AppResult<Option<PageSummary>> {
            Ok(None)
        }

        async fn nearby_titles(&self, _lat: f64, _lng: f64, _radius_m: u32) -> AppResult<Vec<String>> {
            Ok(Vec::new())
        }
    }

    #[async_trait]
    impl WebSearch for Nowhere {
        async fn search(&self, _query: &str, _limit: usize) -> AppResult<Vec<SearchResult>> {
            Ok(Vec::new())
        }
    }

    fn app() -> (TempDir, Router) {
        let dir = tempdir().unwrap();
        let config = AppConfig {
            data_dir: dir.path().to_path_buf(),
            ..AppConfig::default()
        };
        let db = bootstrap(&config.data_dir, &config.database_file_name).unwrap();
        let telemetry = TelemetryClient::disabled();
        let pipeline = PlaceInfoPipeline::new(
            Arc::new(Nowhere),
            KnowledgeLookup::from_source(Arc::new(Nowhere)),
            SearchService::from_backend(Arc::new(Nowhere)),
            ModelClient::unconfigured(),
            config.cache_max_age(),
            telemetry.clone(),
        );
        let state = AppState::new(
            config,
            db.path,
            pipeline,
            Recommender::new(ModelClient::unconfigured()),
            telemetry,
        );
        (dir, build_router(state))
    }

    async fn call(app: &Router, method: &str, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let body = match body {
            Some(value) => {
                builder = builder.header("content-type", "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        let response = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn signed_in(app: &Router) -> String {
        let creds = json!({ "username": "ada", "password": "lovelace" });
        let (status, _) = call(app, "POST", "/auth/register", None, Some(creds.clone())).await;
        assert_eq!(status, StatusCode::CREATED);
        let (status, session) = call(app, "POST", "/auth/login", None, Some(creds)).await;
        assert_eq!(status, StatusCode::OK);
        session["token"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn health_reports_public_config() {
        let (_dir, app) = app();
        let (status, body) = call(&app, "GET", "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["config"]["has_google_api_key"], false);
    }

    #[tokio::test]
    async fn place_info_requires_numeric_coordinates() {
        let (_dir, app) = app();
        for body in [json!({ "lat": 1.0 }), json!({ "lat": "1", "lng": 2 }), json!([])] {
            let (status, value) = call(&app, "POST", "/get-place-info", None, Some(body)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(value, json!({ "error": "Missing coordinates" }));
        }
        let (status, _) = call(&app, "POST", "/get-place-info", None, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, value) =
            call(&app, "POST", "/get-place-info", None, Some(json!({ "lat": 91.0, "lng": 0.0 }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(value["error"], "Coordinates out of range");
    }

    #[tokio::test]
    async fn pipeline_failures_are_reported_with_details() {
        let (_dir, app) = app();
        let (status, value) =
            call(&app, "POST", "/get-place-info", None, Some(json!({ "lat": 1.0, "lng": 2.0 }))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(value["error"], "Internal server error");
        assert_eq!(value["details"], "generative model is not initialized");
    }

    #[tokio::test]
    async fn account_flow_and_profile_updates() {
        let (_dir, app) = app();
        let token = signed_in(&app).await;

        let (status, _) = call(
            &app,
            "POST",
            "/auth/register",
            None,
            Some(json!({ "username": "ada", "password": "x" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, profile) = call(&app, "GET", "/auth/profile", Some(token.as_str()), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(profile["user"]["username"], "ada");
        let art_id = profile["interests"]
            .as_array()
            .unwrap()
            .iter()
            .find(|i| i["name"] == "Art")
            .unwrap()["id"]
            .as_i64()
            .unwrap();

        let (status, updated) = call(
            &app,
            "PUT",
            "/auth/profile",
            Some(token.as_str()),
            Some(json!({ "interest_ids": [art_id] })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let selected: Vec<&str> = updated["interests"]
            .as_array()
            .unwrap()
            .iter()
            .filter(|i| i["selected"] == true)
            .filter_map(|i| i["name"].as_str())
            .collect();
        assert_eq!(selected, vec!["Art"]);

        let (status, _) = call(&app, "POST", "/auth/logout", Some(token.as_str()), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = call(&app, "GET", "/auth/profile", Some(token.as_str()), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn visited_places_round_trip() {
        let (_dir, app) = app();
        let token = signed_in(&app).await;

        let (status, _) = call(&app, "GET", "/visited", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, created) = call(
            &app,
            "POST",
            "/visited",
            Some(token.as_str()),
            Some(json!({ "place_name": "Louvre", "lat": 48.86, "lng": 2.33 })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["place_name"], "Louvre");

        let (_, list) = call(&app, "GET", "/visited", Some(token.as_str()), None).await;
        assert_eq!(list.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn recommendations_require_login() {
        let (_dir, app) = app();
        let (status, body) = call(&app, "GET", "/get-recommendations", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "Login required for recommendations");

        let token = signed_in(&app).await;
        let (status, body) = call(&app, "GET", "/get-recommendations", Some(token.as_str()), None).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Failed to generate recommendations");
    }

    #[tokio::test]
    async fn scheme_generation_validates_input() {
        let (_dir, app) = app();
        let (status, body) = call(&app, "POST", "/generate-scheme", None, Some(json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Missing place data");

        let (status, _) = call(
            &app,
            "POST",
            "/generate-scheme",
            None,
            Some(json!({ "place_data": { "error": "boom" } })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(
            &app,
            "POST",
            "/generate-scheme",
            None,
            Some(json!({ "place_data": { "title": "Louvre", "ai_confidence": "High" } })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["type"], "mermaid_mindmap");
        assert!(body["data"].as_str().unwrap().contains("root((Louvre))"));
    }
}
