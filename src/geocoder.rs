use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};

/// Optional address fields returned by the reverse geocoder.
///
/// Only string values are kept; there is no fixed schema beyond the keys the
/// accessors below look at.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AddressAttributes(BTreeMap<String, String>);

impl AddressAttributes {
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    fn from_json(raw: BTreeMap<String, Value>) -> Self {
        Self(
            raw.into_iter()
                .filter_map(|(k, v)| match v {
                    Value::String(s) => Some((k, s)),
                    _ => None,
                })
                .collect(),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the field only when it is present and non-blank.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    pub fn neighbourhood(&self) -> Option<&str> {
        self.get("neighbourhood").or_else(|| self.get("suburb"))
    }

    pub fn settlement(&self) -> Option<&str> {
        self.get("city")
            .or_else(|| self.get("town"))
            .or_else(|| self.get("village"))
    }

    pub fn locality(&self) -> Option<&str> {
        self.settlement().or_else(|| self.get("country"))
    }

    /// Most specific available label, scanned in fixed priority order.
    pub fn primary_name(&self) -> Option<&str> {
        ["amenity", "historic", "tourism", "shop", "building", "road"]
            .iter()
            .find_map(|key| self.get(key))
            .or_else(|| self.neighbourhood())
            .or_else(|| self.settlement())
            .or_else(|| self.get("country"))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedLocation {
    pub place_name: String,
    pub address: AddressAttributes,
}

impl ResolvedLocation {
    pub fn from_address(lat: f64, lng: f64, address: Option<AddressAttributes>) -> Self {
        let Some(address) = address.filter(|a| !a.is_empty()) else {
            return Self {
                place_name: format!("Location at {lat:.5}, {lng:.5}"),
                address: AddressAttributes::default(),
            };
        };

        let place_name = match address.primary_name() {
            Some(name) => match address.locality() {
                Some(area) if area != name => format!("{name}, {area}"),
                _ => name.to_string(),
            },
            None => address.locality().unwrap_or("Unknown Location").to_string(),
        };

        Self {
            place_name,
            address,
        }
    }
}

#[async_trait]
pub trait ReverseGeocoder: Send + Sync {
    async fn resolve(&self, lat: f64, lng: f64) -> AppResult<ResolvedLocation>;
}

pub fn geocoder_from_config(config: &AppConfig) -> AppResult<Arc<dyn ReverseGeocoder>> {
    Ok(Arc::new(NominatimClient::new(config)?))
}

pub struct NominatimClient {
    http: reqwest::Client,
    base_url: String,
}

impl NominatimClient {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(config.geocoder_user_agent.as_str())
            .timeout(config.geocoder_timeout())
            .build()?;
        Ok(Self {
            http,
            base_url: config.nominatim_base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ReverseGeocoder for NominatimClient {
    async fn resolve(&self, lat: f64, lng: f64) -> AppResult<ResolvedLocation> {
        #[derive(Deserialize)]
        struct ReverseResponse {
            address: Option<BTreeMap<String, Value>>,
            error: Option<String>,
        }

        debug!(target: "geocoder", lat, lng, "reverse geocoding");
        let response = self
            .http
            .get(format!("{}/reverse", self.base_url))
            .query(&[
                ("format", "jsonv2".to_string()),
                ("lat", lat.to_string()),
                ("lon", lng.to_string()),
                ("addressdetails", "1".to_string()),
                ("accept-language", "en".to_string()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Geocoder(format!(
                "reverse geocoding returned {status}"
            )));
        }

        let parsed: ReverseResponse = response.json().await?;
        if let Some(reason) = parsed.error.as_deref() {
            debug!(target: "geocoder", reason, "geocoder returned no address");
        }
        let resolved =
            ResolvedLocation::from_address(lat, lng, parsed.address.map(AddressAttributes::from_json));
        info!(target: "geocoder", place_name = %resolved.place_name, "geocoded coordinates");
        Ok(resolved)
    }
}
