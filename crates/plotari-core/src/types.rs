use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geo::{GeoPoint, GeoRadius};

/// Listing ids named in a single comparison request.
pub const MAX_COMPARED_PROPERTIES: usize = 5;

/// Results remembered in the conversation context between turns.
pub const REMEMBERED_RESULTS: usize = 3;

// =============================================================================
// Enums
// =============================================================================

/// Author of a conversation message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// What the user is asking for in one message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentKind {
    /// Find listings matching structured filters and free text.
    PropertySearch,
    /// Find points of interest around a listing or coordinate.
    PoiSearch,
    /// Put several listings side by side.
    Comparison,
    /// Small talk, help, or anything without a retrieval step.
    #[default]
    GeneralInquiry,
}

impl IntentKind {
    /// Map a free-form label to a kind. Unknown labels become
    /// `GeneralInquiry`, never an error.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "property_search" | "property_detail" | "search" => IntentKind::PropertySearch,
            "poi_search" | "poi" | "near_pois" | "nearby" => IntentKind::PoiSearch,
            "comparison" | "compare" | "property_compare" => IntentKind::Comparison,
            _ => IntentKind::GeneralInquiry,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IntentKind::PropertySearch => "property_search",
            IntentKind::PoiSearch => "poi_search",
            IntentKind::Comparison => "comparison",
            IntentKind::GeneralInquiry => "general_inquiry",
        }
    }
}

impl fmt::Display for IntentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Conversation
// =============================================================================

/// Composite identity of a conversation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversationKey {
    pub user_id: String,
    pub session_id: String,
}

impl ConversationKey {
    pub fn new(user_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            session_id: session_id.into(),
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.user_id, self.session_id)
    }
}

/// A single message in a conversation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    /// Listing ids shown alongside an assistant reply.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub result_ids: Vec<String>,
}

impl Message {
    pub fn user(text: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role: Role::User,
            text: text.into(),
            timestamp,
            result_ids: Vec::new(),
        }
    }

    pub fn assistant(
        text: impl Into<String>,
        timestamp: DateTime<Utc>,
        result_ids: Vec<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            role: Role::Assistant,
            text: text.into(),
            timestamp,
            result_ids,
        }
    }
}

/// Compact record of a listing shown in an earlier turn.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResultSummary {
    pub id: String,
    pub address: String,
    pub city: Option<String>,
    pub price: Option<f64>,
}

impl From<&Property> for ResultSummary {
    fn from(p: &Property) -> Self {
        Self {
            id: p.id.clone(),
            address: p.address.clone(),
            city: p.city.clone(),
            price: p.price,
        }
    }
}

/// Preferences inferred from the user's searches.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserPreferences {
    pub preferred_city: Option<String>,
    pub property_type: Option<String>,
    pub min_bedrooms: Option<u32>,
    pub max_price: Option<f64>,
    /// The user has asked for nearby places at least once.
    pub wants_nearby_pois: bool,
}

/// Fixed-schema state carried between turns.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationContext {
    pub last_intent: Option<SearchIntent>,
    pub last_results: Vec<ResultSummary>,
    pub preferences: UserPreferences,
    /// Listing the user is currently focused on.
    pub current_property: Option<String>,
}

/// A multi-turn conversation between one user and the assistant.
///
/// Messages are append-only. `last_activity <= expires_at` holds after
/// construction and after every `touch`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub key: ConversationKey,
    pub messages: Vec<Message>,
    pub context: ConversationContext,
    /// Short title derived from the first user message.
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(key: ConversationKey, now: DateTime<Utc>, ttl: chrono::Duration) -> Self {
        Self {
            key,
            messages: Vec::new(),
            context: ConversationContext::default(),
            summary: None,
            created_at: now,
            last_activity: now,
            expires_at: now + ttl,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Record activity at `now` and push the expiry out by `ttl`.
    pub fn touch(&mut self, now: DateTime<Utc>, ttl: chrono::Duration) {
        self.last_activity = now.max(self.last_activity);
        self.expires_at = self.last_activity + ttl;
    }

    /// The last `n` messages, oldest first.
    pub fn recent(&self, n: usize) -> &[Message] {
        let start = self.messages.len().saturating_sub(n);
        &self.messages[start..]
    }
}

// =============================================================================
// Intent
// =============================================================================

/// Typed constraints extracted from a message. Every field is optional and
/// an absent field means "no constraint".
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchFilters {
    pub price_min: Option<f64>,
    pub price_max: Option<f64>,
    /// Minimum bedroom count.
    pub bedrooms: Option<u32>,
    /// Minimum bathroom count.
    pub bathrooms: Option<f32>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub neighborhood: Option<String>,
    pub property_type: Option<String>,
    pub geo: Option<GeoRadius>,
    pub poi_category: Option<String>,
    pub poi_radius_m: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub property_ids: Vec<String>,
}

impl SearchFilters {
    /// No listing constraint is set. POI and comparison fields are ignored.
    pub fn is_unconstrained(&self) -> bool {
        self.price_min.is_none()
            && self.price_max.is_none()
            && self.bedrooms.is_none()
            && self.bathrooms.is_none()
            && self.city.is_none()
            && self.state.is_none()
            && self.neighborhood.is_none()
            && self.property_type.is_none()
            && self.geo.is_none()
    }

    /// Whether `property` satisfies every constraint that is set. A listing
    /// missing a constrained attribute does not match.
    pub fn matches(&self, property: &Property) -> bool {
        fn text_eq(want: &Option<String>, have: &Option<String>) -> bool {
            match (want, have) {
                (None, _) => true,
                (Some(w), Some(h)) => w.trim().eq_ignore_ascii_case(h.trim()),
                (Some(_), None) => false,
            }
        }

        if let Some(min) = self.price_min {
            if !property.price.is_some_and(|p| p >= min) {
                return false;
            }
        }
        if let Some(max) = self.price_max {
            if !property.price.is_some_and(|p| p <= max) {
                return false;
            }
        }
        if let Some(beds) = self.bedrooms {
            if !property.bedrooms.is_some_and(|b| b >= beds) {
                return false;
            }
        }
        if let Some(baths) = self.bathrooms {
            if !property.bathrooms.is_some_and(|b| b >= baths) {
                return false;
            }
        }
        if let Some(geo) = &self.geo {
            if !property.location.is_some_and(|loc| geo.contains(&loc)) {
                return false;
            }
        }
        text_eq(&self.city, &property.city)
            && text_eq(&self.state, &property.state)
            && text_eq(&self.neighborhood, &property.neighborhood)
            && text_eq(&self.property_type, &property.property_type)
    }
}

/// Structured reading of one user message.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchIntent {
    pub kind: IntentKind,
    #[serde(default)]
    pub filters: SearchFilters,
    /// Free text left after structured constraints, used for retrieval.
    #[serde(default)]
    pub query: String,
    /// Model-reported confidence in [0, 1].
    #[serde(default)]
    pub raw_confidence: Option<f32>,
}

impl SearchIntent {
    pub fn general() -> Self {
        Self::default()
    }

    /// Text handed to semantic and keyword retrieval: the free-text
    /// remainder, or the descriptive filters when the remainder is empty.
    pub fn retrieval_text(&self) -> String {
        let query = self.query.trim();
        if !query.is_empty() {
            return query.to_string();
        }
        [
            &self.filters.property_type,
            &self.filters.neighborhood,
            &self.filters.city,
        ]
        .into_iter()
        .flatten()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
    }
}

// =============================================================================
// Records
// =============================================================================

/// A property listing as served by the search index.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Property {
    #[serde(alias = "zpid")]
    pub id: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub zipcode: Option<String>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub bedrooms: Option<u32>,
    #[serde(default)]
    pub bathrooms: Option<f32>,
    #[serde(default)]
    pub living_area: Option<f64>,
    #[serde(default)]
    pub year_built: Option<i32>,
    #[serde(default)]
    pub property_type: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub neighborhood: Option<String>,
    #[serde(default)]
    pub location: Option<GeoPoint>,
    /// Last time the listing changed, used to break ranking ties.
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Property {
    /// Text indexed for keyword and semantic matching.
    pub fn search_text(&self) -> String {
        let mut parts: Vec<&str> = vec![self.address.as_str()];
        for field in [
            &self.city,
            &self.state,
            &self.neighborhood,
            &self.property_type,
            &self.description,
        ] {
            if let Some(value) = field {
                parts.push(value);
            }
        }
        parts.extend(self.features.iter().map(String::as_str));
        parts.retain(|p| !p.trim().is_empty());
        parts.join(" ")
    }
}

/// A canonical point of interest after deduplication.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Poi {
    pub id: Option<String>,
    pub name: String,
    pub category: String,
    pub location: GeoPoint,
    pub address: Option<String>,
    pub phone: Option<String>,
    pub website: Option<String>,
    pub opening_hours: Option<String>,
    pub cuisine: Option<String>,
    pub brand: Option<String>,
    pub rating: Option<f32>,
    pub distance_m: Option<f64>,
    pub source: String,
}

/// A point of interest as returned by a geospatial provider, before any
/// validation. Any field may be missing.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawPoi {
    pub id: Option<String>,
    pub name: Option<String>,
    pub category: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub address: Option<String>,
    pub phone: Option<String>,
    pub website: Option<String>,
    pub opening_hours: Option<String>,
    pub cuisine: Option<String>,
    pub brand: Option<String>,
    pub rating: Option<f32>,
    pub distance_m: Option<f64>,
    pub source: Option<String>,
}

impl From<Poi> for RawPoi {
    fn from(poi: Poi) -> Self {
        Self {
            id: poi.id,
            name: Some(poi.name),
            category: Some(poi.category),
            lat: Some(poi.location.lat),
            lon: Some(poi.location.lon),
            address: poi.address,
            phone: poi.phone,
            website: poi.website,
            opening_hours: poi.opening_hours,
            cuisine: poi.cuisine,
            brand: poi.brand,
            rating: poi.rating,
            distance_m: poi.distance_m,
            source: Some(poi.source),
        }
    }
}

/// Distinct listing ids in first-seen order, capped at
/// [`MAX_COMPARED_PROPERTIES`].
pub fn distinct_ids<'a>(ids: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    ids.into_iter()
        .filter(|id| seen.insert(*id))
        .take(MAX_COMPARED_PROPERTIES)
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, hour, 0, 0).unwrap()
    }

    fn listing(id: &str) -> Property {
        Property {
            id: id.to_string(),
            address: "12 Elm St".to_string(),
            city: Some("Springfield".to_string()),
            state: Some("IL".to_string()),
            zipcode: None,
            price: Some(350_000.0),
            bedrooms: Some(3),
            bathrooms: Some(2.0),
            living_area: None,
            year_built: None,
            property_type: Some("house".to_string()),
            description: Some("Bright family home".to_string()),
            features: vec!["garage".to_string()],
            neighborhood: None,
            location: Some(GeoPoint::new(39.78, -89.65)),
            updated_at: None,
        }
    }

    #[test]
    fn test_key_display() {
        let key = ConversationKey::new("u1", "s1");
        assert_eq!(key.to_string(), "u1:s1");
    }

    #[test]
    fn test_intent_kind_from_label() {
        assert_eq!(IntentKind::from_label("property_search"), IntentKind::PropertySearch);
        assert_eq!(IntentKind::from_label("Property Compare"), IntentKind::Comparison);
        assert_eq!(IntentKind::from_label("poi-search"), IntentKind::PoiSearch);
        assert_eq!(IntentKind::from_label("weather"), IntentKind::GeneralInquiry);
        assert_eq!(IntentKind::from_label(""), IntentKind::GeneralInquiry);
    }

    #[test]
    fn test_intent_kind_serde() {
        let json = serde_json::to_string(&IntentKind::PoiSearch).unwrap();
        assert_eq!(json, "\"poi_search\"");
    }

    #[test]
    fn test_conversation_touch_keeps_invariant() {
        let ttl = chrono::Duration::hours(24);
        let mut conv = Conversation::new(ConversationKey::new("u", "s"), at(1), ttl);
        assert_eq!(conv.expires_at, at(1) + ttl);
        conv.touch(at(5), ttl);
        assert_eq!(conv.last_activity, at(5));
        assert_eq!(conv.expires_at, at(5) + ttl);
        assert!(conv.last_activity <= conv.expires_at);

        // A clock going backwards never moves last_activity back.
        conv.touch(at(2), ttl);
        assert_eq!(conv.last_activity, at(5));
    }

    #[test]
    fn test_conversation_expiry() {
        let conv = Conversation::new(ConversationKey::new("u", "s"), at(1), chrono::Duration::hours(1));
        assert!(!conv.is_expired(at(1)));
        assert!(conv.is_expired(at(2)));
        assert!(conv.is_expired(at(3)));
    }

    #[test]
    fn test_recent_messages() {
        let mut conv = Conversation::new(ConversationKey::new("u", "s"), at(1), chrono::Duration::hours(1));
        for i in 0..5 {
            conv.push(Message::user(format!("m{}", i), at(1)));
        }
        let recent: Vec<_> = conv.recent(2).iter().map(|m| m.text.as_str()).collect();
        assert_eq!(recent, vec!["m3", "m4"]);
        assert_eq!(conv.recent(10).len(), 5);
    }

    #[test]
    fn test_filters_match() {
        let p = listing("1");
        assert!(SearchFilters::default().matches(&p));

        let filters = SearchFilters {
            bedrooms: Some(3),
            city: Some("springfield".into()),
            price_max: Some(400_000.0),
            ..Default::default()
        };
        assert!(filters.matches(&p));

        let too_cheap = SearchFilters {
            price_max: Some(300_000.0),
            ..Default::default()
        };
        assert!(!too_cheap.matches(&p));

        let other_city = SearchFilters {
            city: Some("Shelbyville".into()),
            ..Default::default()
        };
        assert!(!other_city.matches(&p));
    }

    #[test]
    fn test_filters_missing_attribute_does_not_match() {
        let mut p = listing("1");
        p.price = None;
        let filters = SearchFilters {
            price_min: Some(1.0),
            ..Default::default()
        };
        assert!(!filters.matches(&p));
    }

    #[test]
    fn test_filters_geo() {
        let p = listing("1");
        let near = SearchFilters {
            geo: Some(GeoRadius {
                center: GeoPoint::new(39.781, -89.651),
                radius_m: 500,
            }),
            ..Default::default()
        };
        assert!(near.matches(&p));
    }

    #[test]
    fn test_filters_deserialize_partial() {
        let filters: SearchFilters = serde_json::from_str(r#"{"bedrooms": 2}"#).unwrap();
        assert_eq!(filters.bedrooms, Some(2));
        assert!(filters.city.is_none());
        assert!(!filters.is_unconstrained());
        assert!(SearchFilters::default().is_unconstrained());
    }

    #[test]
    fn test_retrieval_text_prefers_query() {
        let mut intent = SearchIntent {
            kind: IntentKind::PropertySearch,
            query: "  sunny backyard ".into(),
            filters: SearchFilters {
                city: Some("Springfield".into()),
                property_type: Some("house".into()),
                ..Default::default()
            },
            raw_confidence: None,
        };
        assert_eq!(intent.retrieval_text(), "sunny backyard");
        intent.query.clear();
        assert_eq!(intent.retrieval_text(), "house Springfield");
        assert_eq!(SearchIntent::general().retrieval_text(), "");
    }

    #[test]
    fn test_property_zpid_alias_and_search_text() {
        let p: Property = serde_json::from_str(
            r#"{"zpid": "12345678", "address": "1 Main St", "city": "Springfield", "features": ["pool"]}"#,
        )
        .unwrap();
        assert_eq!(p.id, "12345678");
        assert_eq!(p.search_text(), "1 Main St Springfield pool");
    }

    #[test]
    fn test_distinct_ids_caps_and_dedupes() {
        let ids = distinct_ids(["a", "b", "a", "c", "d", "e", "f"]);
        assert_eq!(ids, vec!["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn test_poi_into_raw() {
        let poi = Poi {
            id: Some("node/1".into()),
            name: "Cafe".into(),
            category: "cafe".into(),
            location: GeoPoint::new(1.0, 2.0),
            address: None,
            phone: None,
            website: None,
            opening_hours: None,
            cuisine: Some("coffee".into()),
            brand: None,
            rating: None,
            distance_m: Some(10.0),
            source: "OpenStreetMap".into(),
        };
        let raw = RawPoi::from(poi);
        assert_eq!(raw.name.as_deref(), Some("Cafe"));
        assert_eq!(raw.lat, Some(1.0));
        assert_eq!(raw.cuisine.as_deref(), Some("coffee"));
    }
}
