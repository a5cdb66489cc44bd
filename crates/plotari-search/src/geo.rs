//! Geospatial POI provider contract, an Overpass API client, and
//! `PoiFinder`, which wraps a provider with retries and deduplication.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use plotari_core::config::GeoConfig;
use plotari_core::error::ProviderError;
use plotari_core::geo::GeoPoint;
use plotari_core::retry::RetryPolicy;
use plotari_core::types::RawPoi;

use crate::dedup::{DedupOutcome, PoiDeduplicator};

/// Source of raw points of interest around a coordinate.
#[async_trait]
pub trait GeoProvider: Send + Sync {
    /// Raw POIs within `radius_m` of `center`, closest first.
    async fn nearby(
        &self,
        center: GeoPoint,
        radius_m: u32,
        category: Option<&str>,
    ) -> Result<Vec<RawPoi>, ProviderError>;
}

// =============================================================================
// Overpass
// =============================================================================

/// OpenStreetMap POIs through the Overpass interpreter.
pub struct OverpassProvider {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct OverpassResponse {
    #[serde(default)]
    elements: Vec<OverpassElement>,
}

#[derive(Debug, Deserialize)]
struct OverpassElement {
    #[serde(rename = "type")]
    kind: String,
    id: u64,
    lat: Option<f64>,
    lon: Option<f64>,
    center: Option<OverpassCenter>,
    #[serde(default)]
    tags: serde_json::Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct OverpassCenter {
    lat: f64,
    lon: f64,
}

impl OverpassProvider {
    pub fn new(config: &GeoConfig) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .user_agent(concat!("plotari/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ProviderError::Unavailable(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            timeout: config.timeout(),
        })
    }

    fn build_query(center: GeoPoint, radius_m: u32, category: Option<&str>) -> String {
        let (key, filter) = match category.and_then(category_filter) {
            Some((key, values)) => (key, format!("~\"^({})$\"", values)),
            None => ("amenity", String::new()),
        };
        let around = format!("(around:{},{},{})", radius_m, center.lat, center.lon);
        format!(
            "[out:json][timeout:25];(node[\"{key}\"{filter}]{around};way[\"{key}\"{filter}]{around};);out center body;"
        )
    }
}

#[async_trait]
impl GeoProvider for OverpassProvider {
    async fn nearby(
        &self,
        center: GeoPoint,
        radius_m: u32,
        category: Option<&str>,
    ) -> Result<Vec<RawPoi>, ProviderError> {
        let query = Self::build_query(center, radius_m, category);
        debug!(%query, "Querying Overpass");

        let response = self
            .client
            .post(&self.endpoint)
            .form(&[("data", query.as_str())])
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                code: status.as_u16(),
                message: message.chars().take(200).collect(),
            });
        }

        let body: OverpassResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;

        let mut pois: Vec<RawPoi> = body
            .elements
            .into_iter()
            .map(|el| element_to_raw(el, center))
            .collect();
        pois.sort_by(|a, b| {
            let da = a.distance_m.unwrap_or(f64::MAX);
            let db = b.distance_m.unwrap_or(f64::MAX);
            da.total_cmp(&db)
        });
        Ok(pois)
    }
}

/// Overpass tag key and value alternation for a user-facing category.
fn category_filter(category: &str) -> Option<(&'static str, &'static str)> {
    match category.trim().to_lowercase().as_str() {
        "school" | "schools" | "education" => {
            Some(("amenity", "school|kindergarten|college|university"))
        }
        "restaurant" | "restaurants" | "food" | "dining" => {
            Some(("amenity", "restaurant|cafe|fast_food|bar|pub"))
        }
        "healthcare" | "health" | "hospital" | "hospitals" | "pharmacy" => {
            Some(("amenity", "hospital|clinic|doctors|dentist|pharmacy"))
        }
        "shopping" | "shop" | "shops" | "supermarket" => {
            Some(("shop", "supermarket|mall|convenience|department_store"))
        }
        "park" | "parks" => Some(("leisure", "park|playground")),
        "transit" | "transport" => Some(("amenity", "bus_station|ferry_terminal|taxi")),
        _ => None,
    }
}

fn element_to_raw(el: OverpassElement, center: GeoPoint) -> RawPoi {
    let tag = |name: &str| el.tags.get(name).and_then(Value::as_str).map(str::to_string);

    let (lat, lon) = match (&el.lat, &el.lon, &el.center) {
        (Some(lat), Some(lon), _) => (Some(*lat), Some(*lon)),
        (_, _, Some(c)) => (Some(c.lat), Some(c.lon)),
        _ => (None, None),
    };
    let distance_m = match (lat, lon) {
        (Some(lat), Some(lon)) => Some(center.distance_m(&GeoPoint::new(lat, lon))),
        _ => None,
    };
    let address = match (tag("addr:housenumber"), tag("addr:street"), tag("addr:city")) {
        (number, Some(street), city) => Some(
            [number, Some(street), city]
                .into_iter()
                .flatten()
                .collect::<Vec<_>>()
                .join(" "),
        ),
        _ => None,
    };

    RawPoi {
        id: Some(format!("{}/{}", el.kind, el.id)),
        name: tag("name"),
        category: tag("amenity").or_else(|| tag("shop")).or_else(|| tag("leisure")),
        lat,
        lon,
        address,
        phone: tag("phone").or_else(|| tag("contact:phone")),
        website: tag("website").or_else(|| tag("contact:website")),
        opening_hours: tag("opening_hours"),
        cuisine: tag("cuisine"),
        brand: tag("brand"),
        rating: tag("stars").and_then(|s| s.parse().ok()),
        distance_m,
        source: Some("OpenStreetMap".to_string()),
    }
}

fn map_reqwest_error(err: reqwest::Error, timeout: Duration) -> ProviderError {
    if err.is_timeout() {
        ProviderError::timeout("overpass request", timeout)
    } else if let Some(status) = err.status() {
        ProviderError::Status {
            code: status.as_u16(),
            message: err.to_string(),
        }
    } else {
        ProviderError::Unavailable(err.to_string())
    }
}

// =============================================================================
// PoiFinder
// =============================================================================

/// Provider calls with bounded retries and a per-call timeout, followed by
/// deduplication.
pub struct PoiFinder {
    provider: Arc<dyn GeoProvider>,
    dedup: PoiDeduplicator,
    retry: RetryPolicy,
    timeout: Duration,
}

impl PoiFinder {
    pub fn new(provider: Arc<dyn GeoProvider>, config: &GeoConfig) -> Self {
        Self {
            provider,
            dedup: PoiDeduplicator::new(config.coordinate_precision),
            retry: config.retry.policy(),
            timeout: config.timeout(),
        }
    }

    pub async fn find(
        &self,
        center: GeoPoint,
        radius_m: u32,
        category: Option<&str>,
        limit: usize,
    ) -> Result<DedupOutcome, ProviderError> {
        let raw = self
            .retry
            .run("poi lookup", self.timeout, || {
                self.provider.nearby(center, radius_m, category)
            })
            .await?;
        let fetched = raw.len();
        let outcome = self.dedup.dedupe(raw, limit);
        info!(
            fetched,
            kept = outcome.pois.len(),
            dropped = outcome.dropped_malformed,
            radius_m,
            "POI lookup completed"
        );
        Ok(outcome)
    }
}
