//! Collapse near-duplicate POIs from a geospatial provider into one
//! canonical entry per physical place.

use std::collections::HashMap;

use tracing::debug;

use plotari_core::geo::GeoPoint;
use plotari_core::types::{Poi, RawPoi};

const UNKNOWN_CATEGORY: &str = "unknown";
const DEFAULT_SOURCE: &str = "OpenStreetMap";

/// Result of one deduplication pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DedupOutcome {
    /// Canonical POIs in upstream proximity order, at most `limit`.
    pub pois: Vec<Poi>,
    /// Entries dropped for missing a name or a usable coordinate.
    pub dropped_malformed: usize,
    /// Entries folded into another entry for the same place.
    pub collapsed: usize,
}

/// Groups POIs by normalized name, category and rounded coordinate.
#[derive(Debug, Clone)]
pub struct PoiDeduplicator {
    precision: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PlaceKey {
    name: String,
    category: String,
    lat: i64,
    lon: i64,
}

impl PoiDeduplicator {
    /// `precision` is the number of decimal places kept when comparing
    /// coordinates.
    pub fn new(precision: u32) -> Self {
        Self {
            precision: precision.min(9),
        }
    }

    pub fn dedupe(&self, raw_pois: Vec<RawPoi>, limit: usize) -> DedupOutcome {
        let mut outcome = DedupOutcome::default();
        let mut groups: Vec<Poi> = Vec::new();
        let mut positions: HashMap<PlaceKey, usize> = HashMap::new();

        for raw in raw_pois {
            let Some(poi) = validate(raw) else {
                outcome.dropped_malformed += 1;
                continue;
            };

            let key = self.key(&poi);
            match positions.get(&key) {
                Some(&pos) => {
                    outcome.collapsed += 1;
                    if prefers(&poi, &groups[pos]) {
                        groups[pos] = poi;
                    }
                }
                None => {
                    positions.insert(key, groups.len());
                    groups.push(poi);
                }
            }
        }

        if outcome.dropped_malformed > 0 || outcome.collapsed > 0 {
            debug!(
                dropped = outcome.dropped_malformed,
                collapsed = outcome.collapsed,
                kept = groups.len(),
                "Deduplicated POIs"
            );
        }

        groups.truncate(limit);
        outcome.pois = groups;
        outcome
    }

    fn key(&self, poi: &Poi) -> PlaceKey {
        let scale = 10f64.powi(self.precision as i32);
        PlaceKey {
            name: normalize_name(&poi.name),
            category: poi.category.trim().to_lowercase(),
            lat: (poi.location.lat * scale).round() as i64,
            lon: (poi.location.lon * scale).round() as i64,
        }
    }
}

impl Default for PoiDeduplicator {
    fn default() -> Self {
        Self::new(4)
    }
}

// -- Private helpers --

/// Keep entries with a non-blank name and a valid coordinate.
fn validate(raw: RawPoi) -> Option<Poi> {
    let name = raw.name.as_deref().map(str::trim).filter(|n| !n.is_empty())?.to_string();
    let location = GeoPoint::new(raw.lat?, raw.lon?);
    if !location.is_valid() {
        return None;
    }
    let category = raw
        .category
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| UNKNOWN_CATEGORY.to_string());

    Some(Poi {
        id: raw.id.filter(|id| !id.trim().is_empty()),
        name,
        category,
        location,
        address: non_blank(raw.address),
        phone: non_blank(raw.phone),
        website: non_blank(raw.website),
        opening_hours: non_blank(raw.opening_hours),
        cuisine: non_blank(raw.cuisine),
        brand: non_blank(raw.brand),
        rating: raw.rating.filter(|r| r.is_finite()),
        distance_m: raw.distance_m.filter(|d| d.is_finite()),
        source: raw.source.unwrap_or_else(|| DEFAULT_SOURCE.to_string()),
    })
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn normalize_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn completeness(poi: &Poi) -> usize {
    [
        poi.address.is_some(),
        poi.phone.is_some(),
        poi.website.is_some(),
        poi.opening_hours.is_some(),
        poi.cuisine.is_some(),
        poi.brand.is_some(),
        poi.rating.is_some(),
    ]
    .into_iter()
    .filter(|present| *present)
    .count()
}

/// Whether `candidate` should replace `current` as the group's canonical
/// entry: more complete wins, then the smaller provider id, with entries
/// lacking an id losing to those that have one.
fn prefers(candidate: &Poi, current: &Poi) -> bool {
    let (a, b) = (completeness(candidate), completeness(current));
    if a != b {
        return a > b;
    }
    match (&candidate.id, &current.id) {
        (Some(x), Some(y)) => x < y,
        (Some(_), None) => true,
        _ => false,
    }
}
