use std::path::PathBuf;
use std::time::Duration;
use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::debug;

use crate::errors::{AppError, AppResult};

const DEFAULT_CLIENT_IDENTITY: &str = "MapInsight/0.1 (map-insight; contact@example.com)";
const DEFAULT_CACHE_MAX_AGE_SECS: u64 = 6 * 60 * 60;
const DEFAULT_SESSION_TTL_SECS: u64 = 7 * 24 * 60 * 60;
const DEFAULT_TELEMETRY_BUFFER_MAX_BYTES: u64 = 5 * 1024 * 1024;
// chrono durations are bounded by i64::MAX milliseconds.
const MAX_DURATION_SECS: u64 = (i64::MAX / 1000) as u64;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub database_file_name: String,
    pub bind_address: String,
    pub google_api_key: Option<SecretString>,
    pub gemini_model: String,
    pub gemini_api_base: String,
    pub model_timeout_secs: u64,
    pub nominatim_base_url: String,
    pub geocoder_user_agent: String,
    pub geocoder_timeout_secs: u64,
    pub wikipedia_api_url: String,
    pub wiki_user_agent: String,
    pub wiki_timeout_secs: u64,
    pub search_api_url: String,
    pub search_timeout_secs: u64,
    pub cache_max_age_secs: u64,
    pub session_ttl_secs: u64,
    pub telemetry_enabled: bool,
    pub telemetry_batch_size: usize,
    pub telemetry_buffer_max_bytes: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub database_file_name: String,
    pub gemini_model: String,
    pub has_google_api_key: bool,
    pub geocoder_timeout_secs: u64,
    pub wiki_timeout_secs: u64,
    pub search_timeout_secs: u64,
    pub model_timeout_secs: u64,
    pub cache_max_age_secs: u64,
    pub telemetry_enabled: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("instance"),
            database_file_name: "main.db".to_string(),
            bind_address: "127.0.0.1:5000".to_string(),
            google_api_key: None,
            gemini_model: "gemini-1.5-flash".to_string(),
            gemini_api_base: "https://generativelanguage.googleapis.com".to_string(),
            model_timeout_secs: 60,
            nominatim_base_url: "https://nominatim.openstreetmap.org".to_string(),
            geocoder_user_agent: DEFAULT_CLIENT_IDENTITY.to_string(),
            geocoder_timeout_secs: 10,
            wikipedia_api_url: "https://en.wikipedia.org/w/api.php".to_string(),
            wiki_user_agent: DEFAULT_CLIENT_IDENTITY.to_string(),
            wiki_timeout_secs: 10,
            search_api_url: "https://api.duckduckgo.com/".to_string(),
            search_timeout_secs: 10,
            cache_max_age_secs: DEFAULT_CACHE_MAX_AGE_SECS,
            session_ttl_secs: DEFAULT_SESSION_TTL_SECS,
            telemetry_enabled: true,
            telemetry_batch_size: 25,
            telemetry_buffer_max_bytes: DEFAULT_TELEMETRY_BUFFER_MAX_BYTES,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        let defaults = Self::default();
        Self {
            data_dir: env::var("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            database_file_name: parse_string("DATABASE_FILE_NAME", defaults.database_file_name),
            bind_address: parse_string("BIND_ADDRESS", defaults.bind_address),
            google_api_key: env::var("GOOGLE_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(|v| SecretString::new(v.into())),
            gemini_model: parse_string("GOOGLE_GEMINI_MODEL", defaults.gemini_model),
            gemini_api_base: parse_string("GEMINI_API_BASE", defaults.gemini_api_base),
            model_timeout_secs: parse_u64("MODEL_TIMEOUT_SECS", defaults.model_timeout_secs),
            nominatim_base_url: parse_string("NOMINATIM_BASE_URL", defaults.nominatim_base_url),
            geocoder_user_agent: parse_string("GEOCODER_USER_AGENT", defaults.geocoder_user_agent),
            geocoder_timeout_secs: parse_u64(
                "GEOCODER_TIMEOUT_SECS",
                defaults.geocoder_timeout_secs,
            ),
            wikipedia_api_url: parse_string("WIKIPEDIA_API_URL", defaults.wikipedia_api_url),
            wiki_user_agent: parse_string("WIKI_USER_AGENT", defaults.wiki_user_agent),
            wiki_timeout_secs: parse_u64("WIKI_TIMEOUT_SECS", defaults.wiki_timeout_secs),
            search_api_url: parse_string("SEARCH_API_URL", defaults.search_api_url),
            search_timeout_secs: parse_u64("SEARCH_TIMEOUT_SECS", defaults.search_timeout_secs),
            cache_max_age_secs: parse_u64("CACHE_MAX_AGE_SECS", defaults.cache_max_age_secs),
            session_ttl_secs: parse_u64("SESSION_TTL_SECS", defaults.session_ttl_secs),
            telemetry_enabled: parse_bool("TELEMETRY_ENABLED", defaults.telemetry_enabled),
            telemetry_batch_size: parse_usize(
                "TELEMETRY_BATCH_SIZE",
                defaults.telemetry_batch_size,
            )
            .max(1),
            telemetry_buffer_max_bytes: parse_u64(
                "TELEMETRY_BUFFER_MAX_BYTES",
                defaults.telemetry_buffer_max_bytes,
            ),
        }
    }

    /// Startup check: the service cannot answer place requests without model credentials.
    pub fn require_model_credentials(&self) -> AppResult<&SecretString> {
        self.google_api_key
            .as_ref()
            .ok_or_else(|| AppError::Config("GOOGLE_API_KEY is not set".into()))
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.database_file_name)
    }

    pub fn cache_max_age(&self) -> chrono::Duration {
        clamped_seconds(self.cache_max_age_secs)
    }

    pub fn session_ttl(&self) -> chrono::Duration {
        clamped_seconds(self.session_ttl_secs)
    }

    pub fn geocoder_timeout(&self) -> Duration {
        Duration::from_secs(self.geocoder_timeout_secs.max(1))
    }

    pub fn wiki_timeout(&self) -> Duration {
        Duration::from_secs(self.wiki_timeout_secs.max(1))
    }

    pub fn search_timeout(&self) -> Duration {
        Duration::from_secs(self.search_timeout_secs.max(1))
    }

    pub fn model_timeout(&self) -> Duration {
        Duration::from_secs(self.model_timeout_secs.max(1))
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            database_file_name: self.database_file_name.clone(),
            gemini_model: self.gemini_model.clone(),
            has_google_api_key: self.google_api_key.is_some(),
            geocoder_timeout_secs: self.geocoder_timeout_secs,
            wiki_timeout_secs: self.wiki_timeout_secs,
            search_timeout_secs: self.search_timeout_secs,
            model_timeout_secs: self.model_timeout_secs,
            cache_max_age_secs: self.cache_max_age_secs,
            telemetry_enabled: self.telemetry_enabled,
        }
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_string(key: &str, default: String) -> String {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or(default)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn clamped_seconds(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(secs.min(MAX_DURATION_SECS) as i64)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_public_profile_without_secrets() {
        env::set_var("GOOGLE_API_KEY", "secret");
        env::set_var("DATABASE_FILE_NAME", "custom.db");
        env::set_var("CACHE_MAX_AGE_SECS", "120");
        env::set_var("TELEMETRY_BATCH_SIZE", "0");

        let config = AppConfig::from_env();
        let public = config.public_profile();

        assert_eq!(public.database_file_name, "custom.db");
        assert!(public.has_google_api_key);
        assert_eq!(public.cache_max_age_secs, 120);
        assert_eq!(config.telemetry_batch_size, 1);
        assert!(config.require_model_credentials().is_ok());
        let serialized = serde_json::to_string(&public).unwrap();
        assert!(!serialized.contains("secret"));
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = AppConfig::default();
        assert_eq!(config.cache_max_age(), chrono::Duration::hours(6));
        assert_eq!(config.geocoder_timeout(), Duration::from_secs(10));
        assert_eq!(config.gemini_model, "gemini-1.5-flash");
        assert!(config.database_path().ends_with("main.db"));
    }

    #[test]
    fn missing_api_key_is_a_config_error() {
        let config = AppConfig::default();
        let err = config.require_model_credentials().unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[test]
    fn oversized_durations_are_clamped() {
        let config = AppConfig {
            cache_max_age_secs: 99_999_999_999_999_999,
            session_ttl_secs: u64::MAX,
            ..AppConfig::default()
        };
        let max = chrono::Duration::seconds(MAX_DURATION_SECS as i64);
        assert_eq!(config.cache_max_age(), max);
        assert_eq!(config.session_ttl(), max);
        assert!(chrono::Utc::now() - chrono::Utc::now() < config.cache_max_age());
    }
}
