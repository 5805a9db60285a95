pub mod accounts;
pub mod cache;
pub mod config;
pub mod context;
pub mod db;
pub mod errors;
pub mod geocoder;
pub mod knowledge;
pub mod mindmap;
pub mod model;
pub mod pipeline;
pub mod recommendations;
pub mod search;
pub mod server;
pub mod telemetry;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::context::RequestContext;
use crate::db::bootstrap;
use crate::model::ModelClient;
use crate::pipeline::PlaceInfoPipeline;
use crate::recommendations::Recommender;
use crate::telemetry::{events, TelemetryClient};

pub use config::AppConfig;
pub use errors::{AppError, AppResult};
pub use server::build_router;

/// Shared, cheaply cloned service state handed to every request handler.
#[derive(Clone)]
pub struct AppState {
    config: Arc<AppConfig>,
    db_path: Arc<PathBuf>,
    pipeline: PlaceInfoPipeline,
    recommender: Recommender,
    telemetry: TelemetryClient,
}

impl AppState {
    /// Bootstraps storage and builds the upstream clients. Fails when the model
    /// credentials are missing.
    pub fn initialize(config: AppConfig) -> AppResult<Self> {
        let model = ModelClient::new(&config)?;
        let db = bootstrap(&config.data_dir, &config.database_file_name)?;
        let telemetry = TelemetryClient::new(&config)?;
        let pipeline = PlaceInfoPipeline::from_config(&config, model.clone(), telemetry.clone())?;

        telemetry.record(
            events::SERVICE_START,
            json!({
                "version": env!("CARGO_PKG_VERSION"),
                "model": config.gemini_model,
            }),
        );
        info!(
            db_path = %db.path.display(),
            telemetry_buffer = %telemetry.buffer_path().display(),
            "service state initialized"
        );

        Ok(Self::new(
            config,
            db.path,
            pipeline,
            Recommender::new(model),
            telemetry,
        ))
    }

    pub fn new(
        config: AppConfig,
        db_path: PathBuf,
        pipeline: PlaceInfoPipeline,
        recommender: Recommender,
        telemetry: TelemetryClient,
    ) -> Self {
        Self {
            config: Arc::new(config),
            db_path: Arc::new(db_path),
            pipeline,
            recommender,
            telemetry,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn pipeline(&self) -> &PlaceInfoPipeline {
        &self.pipeline
    }

    pub fn recommender(&self) -> &Recommender {
        &self.recommender
    }

    pub fn telemetry(&self) -> &TelemetryClient {
        &self.telemetry
    }

    /// Fresh per-request context; its storage connection opens on first use.
    pub fn request_context(&self) -> RequestContext {
        RequestContext::new(self.db_path.as_path())
    }

    pub fn shutdown(&self) {
        if let Err(err) = self.telemetry.flush() {
            warn!(?err, "failed to flush telemetry queue on shutdown");
        }
    }
}

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,map_insight=debug"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    });
}
