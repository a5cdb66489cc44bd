//! Intent extraction.
//!
//! The language model is asked for a JSON intent, which is validated field
//! by field with one repair attempt. When the model is unavailable, slow,
//! or keeps producing garbage, [`HeuristicExtractor`] reads the message
//! with keyword and pattern rules. Neither path can fail: the worst case is
//! a `general_inquiry` intent with no filters.

use std::ops::Range;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use plotari_core::config::LlmConfig;
use plotari_core::error::ProviderError;
use plotari_core::geo::{GeoPoint, GeoRadius};
use plotari_core::types::{
    distinct_ids, ConversationContext, IntentKind, SearchFilters, SearchIntent,
};

use crate::error::ValidationError;
use crate::llm::{CompletionRequest, LanguageModel, PromptMessage};
use crate::types::IntentSource;

/// Smallest amount read as a price when the message gives no `k`/`m` suffix.
const MIN_PRICE: f64 = 1_000.0;

const MIN_RADIUS_M: u32 = 50;
const MAX_RADIUS_M: u32 = 50_000;

/// Bedroom and bathroom counts are clamped to this.
const MAX_ROOMS: u32 = 50;

/// Cities recognised even without a leading "in".
const KNOWN_CITIES: &[&str] = &[
    "springfield",
    "shelbyville",
    "austin",
    "boston",
    "chicago",
    "dallas",
    "denver",
    "houston",
    "miami",
    "phoenix",
    "portland",
    "seattle",
    "atlanta",
    "los angeles",
    "new york",
    "san diego",
    "san francisco",
];

/// Words dropped from the free-text remainder handed to retrieval.
const FILLER_WORDS: &[&str] = &[
    "a", "an", "and", "any", "are", "at", "bath", "baths", "bed", "beds", "bedroom", "bedrooms",
    "buy", "can", "find", "for", "get", "has", "have", "home", "homes", "i", "i'm", "im", "in",
    "is", "like", "listing", "listings", "look", "looking", "me", "need", "of", "or", "place",
    "places", "please", "properties", "property", "rent", "search", "show", "some", "something",
    "that", "the", "to", "want", "with", "would", "you",
];

// =============================================================================
// Compiled regex sets
// =============================================================================

struct FilterPatterns {
    bedrooms: Regex,
    bathrooms: Regex,
    price_between: Regex,
    price_max: Regex,
    price_min: Regex,
    city: Regex,
    known_city: Regex,
    property_type: Regex,
    listing_id: Regex,
    radius: Regex,
}

struct KindPatterns {
    comparison: Vec<Regex>,
    poi: Vec<Regex>,
    search: Vec<Regex>,
    poi_categories: Vec<(Regex, &'static str)>,
}

const AMOUNT: &str = r"\$?\s*(\d[\d,]*(?:\.\d+)?)\s*([km])?\b";
const COUNT: &str = r"(\d{1,2}(?:\.5)?|one|two|three|four|five|six|seven|eight)";

static FILTER_PATTERNS: LazyLock<FilterPatterns> = LazyLock::new(|| {
    let mk = |p: &str| Regex::new(p).expect("Invalid filter regex");

    FilterPatterns {
        bedrooms: mk(&format!(
            r"(?i)\b{COUNT}\s*-?\s*(?:bed(?:room)?s?|brs?|bds?)\b"
        )),
        bathrooms: mk(&format!(r"(?i)\b{COUNT}\s*-?\s*(?:bath(?:room)?s?|ba)\b")),
        price_between: mk(&format!(
            r"(?i)\b(?:between|from)\s+{AMOUNT}\s*(?:and|to|-)\s*{AMOUNT}"
        )),
        price_max: mk(&format!(
            r"(?i)\b(?:under|below|less\s+than|max(?:imum)?|up\s+to|at\s+most|no\s+more\s+than|cheaper\s+than|budget\s+of)\s*{AMOUNT}"
        )),
        price_min: mk(&format!(
            r"(?i)\b(?:over|above|more\s+than|at\s+least|min(?:imum)?|starting\s+at)\s*{AMOUNT}"
        )),
        city: mk(r"\bin\s+([A-Z][a-zA-Z'-]+(?:\s+[A-Z][a-zA-Z'-]+){0,2})(?:,\s*([A-Z]{2})\b)?"),
        known_city: mk(&format!(r"(?i)\b({})\b", KNOWN_CITIES.join("|"))),
        property_type: mk(
            r"(?i)\b(single[-\s]family(?:\s+homes?)?|houses?|condos?|condominiums?|apartments?|apts?|flats?|townhomes?|townhouses?|duplex(?:es)?)\b",
        ),
        listing_id: mk(r"\b\d{8,}\b"),
        radius: mk(r"(?i)\b(\d+(?:\.\d+)?)\s*(km|kilometers?|kilometres?|m|meters?|metres?)\b"),
    }
});

static KIND_PATTERNS: LazyLock<KindPatterns> = LazyLock::new(|| {
    let mk = |pats: &[&str]| -> Vec<Regex> {
        pats.iter()
            .map(|p| Regex::new(p).expect("Invalid intent regex"))
            .collect()
    };
    let category = |p: &str, name: &'static str| {
        (Regex::new(p).expect("Invalid category regex"), name)
    };

    KindPatterns {
        comparison: mk(&[
            r"(?i)\bcompar(?:e|ing|ison)\b",
            r"(?i)\bvs\.?\s",
            r"(?i)\bversus\b",
            r"(?i)\bside\s+by\s+side\b",
            r"(?i)\bdifference\s+between\b",
            r"(?i)\bwhich\s+(?:one\s+)?is\s+better\b",
        ]),
        poi: mk(&[
            r"(?i)\bnear(?:by)?\b",
            r"(?i)\bclose\s+to\b",
            r"(?i)\bwalking\s+distance\b",
            r"(?i)\bwhat'?s\s+around\b",
            r"(?i)\baround\s+(?:it|there|here|the\s+(?:house|property|area))\b",
            r"(?i)\bpoints?\s+of\s+interest\b",
            r"(?i)\bpois?\b",
            r"(?i)\bamenities\b",
        ]),
        search: mk(&[
            r"(?i)\bfind\b",
            r"(?i)\bshow\s+me\b",
            r"(?i)\blooking\s+for\b",
            r"(?i)\bsearch\b",
            r"(?i)\b(?:homes?|propert(?:y|ies)|listings?)\b",
            r"(?i)\bfor\s+sale\b",
            r"(?i)\bbuy\b",
            r"(?i)\bdetails?\b",
            r"(?i)\btell\s+me\s+(?:more\s+)?about\b",
        ]),
        poi_categories: vec![
            category(
                r"(?i)\b(?:schools?|kindergartens?|colleges?|universit(?:y|ies)|education)\b",
                "school",
            ),
            category(
                r"(?i)\b(?:restaurants?|food|dining|cafes?|coffee|bars?|pubs?)\b",
                "restaurant",
            ),
            category(
                r"(?i)\b(?:hospitals?|clinics?|doctors?|pharmac(?:y|ies)|healthcare|medical)\b",
                "healthcare",
            ),
            category(
                r"(?i)\b(?:shops?|shopping|stores?|supermarkets?|grocer(?:y|ies)|malls?)\b",
                "shopping",
            ),
            category(r"(?i)\b(?:parks?|playgrounds?)\b", "park"),
            category(
                r"(?i)\b(?:transit|bus\s+stops?|train|subway|metro|stations?)\b",
                "transit",
            ),
        ],
    }
});

// =============================================================================
// IntentExtractor
// =============================================================================

/// An intent and the path that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedIntent {
    pub intent: SearchIntent,
    pub source: IntentSource,
}

#[derive(Debug, thiserror::Error)]
enum ModelFailure {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

/// Model-first intent extraction with a heuristic fallback.
pub struct IntentExtractor {
    model: Arc<dyn LanguageModel>,
    heuristic: HeuristicExtractor,
    temperature: f32,
    max_tokens: u32,
    timeout: Duration,
}

impl IntentExtractor {
    pub fn new(model: Arc<dyn LanguageModel>, config: &LlmConfig) -> Self {
        Self {
            model,
            heuristic: HeuristicExtractor,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            timeout: config.timeout(),
        }
    }

    /// Read `message` as a typed intent. Never fails.
    pub async fn extract(&self, message: &str, context: &ConversationContext) -> ExtractedIntent {
        match self.extract_with_model(message, context).await {
            Ok(intent) => {
                debug!(kind = %intent.kind, model = self.model.name(), "Intent extracted by model");
                ExtractedIntent {
                    intent,
                    source: IntentSource::Model,
                }
            }
            Err(failure) => {
                warn!(
                    model = self.model.name(),
                    reason = %failure,
                    "Falling back to heuristic intent extraction"
                );
                ExtractedIntent {
                    intent: self.heuristic.extract(message),
                    source: IntentSource::Heuristic,
                }
            }
        }
    }

    async fn extract_with_model(
        &self,
        message: &str,
        context: &ConversationContext,
    ) -> Result<SearchIntent, ModelFailure> {
        let request = CompletionRequest {
            system: intent_prompt(context),
            messages: vec![PromptMessage::user(message)],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            json_mode: true,
        };
        let raw = match tokio::time::timeout(self.timeout, self.model.complete(&request)).await {
            Ok(result) => result?,
            Err(_) => return Err(ProviderError::timeout("intent extraction", self.timeout).into()),
        };
        Ok(parse_model_intent(&raw)?)
    }
}

fn intent_prompt(context: &ConversationContext) -> String {
    let prior = json!({
        "last_intent": context.last_intent,
        "last_result_ids": context.last_results.iter().map(|r| &r.id).collect::<Vec<_>>(),
        "current_property": context.current_property,
        "preferences": context.preferences,
    });
    format!(
        "You read messages sent to a real-estate search assistant and reply with one JSON object:\n\
         {{\"kind\": \"property_search\" | \"poi_search\" | \"comparison\" | \"general_inquiry\",\n\
          \"query\": free text left after the structured filters,\n\
          \"confidence\": number between 0 and 1,\n\
          \"filters\": {{\"price_min\", \"price_max\", \"bedrooms\", \"bathrooms\", \"city\", \"state\",\n\
                        \"neighborhood\", \"property_type\", \"poi_category\", \"poi_radius_m\",\n\
                        \"property_ids\": [listing ids, at most 5]}}}}\n\
         Omit filters the user did not state. Bedrooms and bathrooms are minimums. \
         Prices are plain numbers in dollars.\n\
         Conversation so far: {}",
        prior
    )
}

/// Validate model output as a [`SearchIntent`], repairing it once.
///
/// The repair strips Markdown code fences and surrounding prose and keeps
/// the outermost JSON object.
pub fn parse_model_intent(raw: &str) -> Result<SearchIntent, ValidationError> {
    match validate_intent(raw) {
        Ok(intent) => Ok(intent),
        Err(first) => {
            let repaired = repair(raw);
            if repaired == raw.trim() {
                return Err(first);
            }
            debug!(error = %first, "Repairing model intent output");
            validate_intent(&repaired)
        }
    }
}

fn repair(raw: &str) -> String {
    let mut text = raw.trim();
    if let Some(rest) = text.strip_prefix("```") {
        text = rest.trim_start_matches(|c: char| c.is_ascii_alphabetic());
        text = text.trim_end().trim_end_matches("```");
    }
    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if start < end => text[start..=end].to_string(),
        _ => text.trim().to_string(),
    }
}

fn validate_intent(text: &str) -> Result<SearchIntent, ValidationError> {
    let value: Value =
        serde_json::from_str(text.trim()).map_err(|e| ValidationError::NotJson(e.to_string()))?;
    let obj = value.as_object().ok_or(ValidationError::NotAnObject)?;

    let kind = match obj.get("kind").or_else(|| obj.get("type")) {
        None | Some(Value::Null) => IntentKind::GeneralInquiry,
        Some(Value::String(label)) => IntentKind::from_label(label),
        Some(_) => return Err(wrong_type("kind", "a string")),
    };
    let query = text_field(obj, "query", "query")?.unwrap_or_default();
    let confidence_key = if obj.contains_key("confidence") {
        "confidence"
    } else {
        "raw_confidence"
    };
    let raw_confidence =
        number_field(obj, confidence_key, confidence_key)?.map(|c| c.clamp(0.0, 1.0) as f32);
    let filters = match obj.get("filters") {
        None | Some(Value::Null) => SearchFilters::default(),
        Some(Value::Object(map)) => validate_filters(map)?,
        Some(_) => return Err(wrong_type("filters", "an object")),
    };

    Ok(SearchIntent {
        kind,
        filters,
        query,
        raw_confidence,
    })
}

fn validate_filters(map: &Map<String, Value>) -> Result<SearchFilters, ValidationError> {
    let mut filters = SearchFilters {
        price_min: number_field(map, "price_min", "filters.price_min")?,
        price_max: number_field(map, "price_max", "filters.price_max")?,
        bedrooms: count_field(map, "bedrooms", "filters.bedrooms")?.map(|b| b.min(MAX_ROOMS)),
        bathrooms: number_field(map, "bathrooms", "filters.bathrooms")?
            .map(|b| b.min(MAX_ROOMS as f64) as f32),
        city: text_field(map, "city", "filters.city")?,
        state: text_field(map, "state", "filters.state")?,
        neighborhood: text_field(map, "neighborhood", "filters.neighborhood")?,
        property_type: text_field(map, "property_type", "filters.property_type")?
            .map(|t| t.to_lowercase()),
        geo: geo_field(map)?,
        poi_category: text_field(map, "poi_category", "filters.poi_category")?
            .map(|c| c.to_lowercase()),
        poi_radius_m: count_field(map, "poi_radius_m", "filters.poi_radius_m")?
            .map(|r| r.clamp(MIN_RADIUS_M, MAX_RADIUS_M)),
        property_ids: ids_field(map)?,
    };
    if let (Some(min), Some(max)) = (filters.price_min, filters.price_max) {
        if min > max {
            filters.price_min = Some(max);
            filters.price_max = Some(min);
        }
    }
    Ok(filters)
}

// -- Field readers --

fn wrong_type(field: &str, expected: &'static str) -> ValidationError {
    ValidationError::WrongType {
        field: field.to_string(),
        expected,
    }
}

fn number_field(
    map: &Map<String, Value>,
    key: &str,
    field: &str,
) -> Result<Option<f64>, ValidationError> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_f64()
            .filter(|v| v.is_finite() && *v >= 0.0)
            .map(Some)
            .ok_or_else(|| wrong_type(field, "a non-negative number")),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => parse_amount(s)
            .map(Some)
            .ok_or_else(|| wrong_type(field, "a non-negative number")),
        Some(_) => Err(wrong_type(field, "a non-negative number")),
    }
}

fn count_field(
    map: &Map<String, Value>,
    key: &str,
    field: &str,
) -> Result<Option<u32>, ValidationError> {
    match number_field(map, key, field)? {
        None => Ok(None),
        Some(v) if v.fract() == 0.0 && v <= u32::MAX as f64 => Ok(Some(v as u32)),
        Some(_) => Err(wrong_type(field, "a non-negative integer")),
    }
}

fn text_field(
    map: &Map<String, Value>,
    key: &str,
    field: &str,
) -> Result<Option<String>, ValidationError> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.trim().to_string()).filter(|s| !s.is_empty())),
        Some(_) => Err(wrong_type(field, "a string")),
    }
}

fn geo_field(map: &Map<String, Value>) -> Result<Option<GeoRadius>, ValidationError> {
    const EXPECTED: &str = "an object with lat, lon and radius_m";
    let obj = match map.get("geo") {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Object(obj)) => obj,
        Some(_) => return Err(wrong_type("filters.geo", EXPECTED)),
    };
    let coord = |key: &str| obj.get(key).and_then(Value::as_f64);
    let (Some(lat), Some(lon)) = (coord("lat"), coord("lon")) else {
        return Err(wrong_type("filters.geo", EXPECTED));
    };
    let center = GeoPoint::new(lat, lon);
    if !center.is_valid() {
        return Err(wrong_type("filters.geo", EXPECTED));
    }
    let radius_m = count_field(obj, "radius_m", "filters.geo.radius_m")?
        .unwrap_or(MAX_RADIUS_M / 10)
        .clamp(MIN_RADIUS_M, MAX_RADIUS_M);
    Ok(Some(GeoRadius { center, radius_m }))
}

fn ids_field(map: &Map<String, Value>) -> Result<Vec<String>, ValidationError> {
    const EXPECTED: &str = "a list of listing ids";
    let items = match map.get("property_ids") {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Array(items)) => items,
        Some(_) => return Err(wrong_type("filters.property_ids", EXPECTED)),
    };
    let ids = items
        .iter()
        .map(|item| match item {
            Value::String(s) => Ok(s.trim().to_string()),
            Value::Number(n) => Ok(n.to_string()),
            _ => Err(wrong_type("filters.property_ids", EXPECTED)),
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(distinct_ids(
        ids.iter().map(String::as_str).filter(|id| !id.is_empty()),
    ))
}

/// Parse "400k", "$1.2m" or "350,000" as dollars.
fn parse_amount(text: &str) -> Option<f64> {
    let cleaned = text.trim().trim_start_matches('$').replace(',', "").to_lowercase();
    let (digits, multiplier) = if let Some(d) = cleaned.strip_suffix('k') {
        (d, 1_000.0)
    } else if let Some(d) = cleaned.strip_suffix('m') {
        (d, 1_000_000.0)
    } else {
        (cleaned.as_str(), 1.0)
    };
    let value: f64 = digits.trim().trim_end_matches('.').parse().ok()?;
    let amount = value * multiplier;
    (amount.is_finite() && amount >= 0.0).then_some(amount)
}

// =============================================================================
// HeuristicExtractor
// =============================================================================

/// Keyword and pattern rules used when no model answer is usable.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicExtractor;

impl HeuristicExtractor {
    /// Best-effort reading of `message`. Never fails.
    pub fn extract(&self, message: &str) -> SearchIntent {
        let text = message.trim();
        let mut spans: Vec<Range<usize>> = Vec::new();
        let ids = listing_ids(text, &mut spans);

        if matches_any(&KIND_PATTERNS.comparison, text) {
            return SearchIntent {
                kind: IntentKind::Comparison,
                filters: SearchFilters {
                    property_ids: ids,
                    ..Default::default()
                },
                query: text.to_string(),
                raw_confidence: None,
            };
        }

        let mut filters = SearchFilters::default();
        extract_prices(text, &mut filters, &mut spans);
        extract_rooms(text, &mut filters, &mut spans);
        extract_location(text, &mut filters, &mut spans);
        extract_property_type(text, &mut filters, &mut spans);

        let poi_category = KIND_PATTERNS
            .poi_categories
            .iter()
            .find(|(re, _)| re.is_match(text))
            .map(|(_, name)| name.to_string());
        let wants_poi = poi_category.is_some() || matches_any(&KIND_PATTERNS.poi, text);
        let has_listing_filters = !filters.is_unconstrained();

        let kind = if wants_poi && !has_listing_filters {
            IntentKind::PoiSearch
        } else if has_listing_filters || !ids.is_empty() || matches_any(&KIND_PATTERNS.search, text)
        {
            IntentKind::PropertySearch
        } else {
            IntentKind::GeneralInquiry
        };

        if wants_poi {
            filters.poi_category = poi_category;
            filters.poi_radius_m = extract_radius(text, &spans);
            // Place words describe the surroundings, not the listing text.
            let place_words = KIND_PATTERNS
                .poi
                .iter()
                .chain(KIND_PATTERNS.poi_categories.iter().map(|(re, _)| re));
            for re in place_words {
                spans.extend(re.find_iter(text).map(|m| m.range()));
            }
        }
        filters.property_ids = ids;

        let query = match kind {
            IntentKind::GeneralInquiry => text.to_string(),
            _ => remainder(text, &spans),
        };
        SearchIntent {
            kind,
            filters,
            query,
            raw_confidence: None,
        }
    }
}

// -- Private helpers --

fn matches_any(patterns: &[Regex], text: &str) -> bool {
    patterns.iter().any(|re| re.is_match(text))
}

fn overlaps(spans: &[Range<usize>], range: &Range<usize>) -> bool {
    spans
        .iter()
        .any(|s| s.start < range.end && range.start < s.end)
}

fn listing_ids(text: &str, spans: &mut Vec<Range<usize>>) -> Vec<String> {
    let found: Vec<&str> = FILTER_PATTERNS
        .listing_id
        .find_iter(text)
        .map(|m| {
            spans.push(m.range());
            m.as_str()
        })
        .collect();
    distinct_ids(found)
}

fn amount_from(digits: Option<regex::Match<'_>>, suffix: Option<regex::Match<'_>>) -> Option<f64> {
    let raw = format!(
        "{}{}",
        digits?.as_str(),
        suffix.map(|s| s.as_str()).unwrap_or_default()
    );
    parse_amount(&raw).filter(|amount| *amount >= MIN_PRICE)
}

fn extract_prices(text: &str, filters: &mut SearchFilters, spans: &mut Vec<Range<usize>>) {
    let patterns = &*FILTER_PATTERNS;

    if let Some(caps) = patterns.price_between.captures(text) {
        let low = amount_from(caps.get(1), caps.get(2));
        let high = amount_from(caps.get(3), caps.get(4));
        if let (Some(low), Some(high)) = (low, high) {
            filters.price_min = Some(low.min(high));
            filters.price_max = Some(low.max(high));
            if let Some(m) = caps.get(0) {
                spans.push(m.range());
            }
        }
    }

    for (re, is_max) in [(&patterns.price_max, true), (&patterns.price_min, false)] {
        for caps in re.captures_iter(text) {
            let Some(whole) = caps.get(0) else { continue };
            if overlaps(spans, &whole.range()) {
                continue;
            }
            let Some(amount) = amount_from(caps.get(1), caps.get(2)) else {
                continue;
            };
            let slot = if is_max {
                &mut filters.price_max
            } else {
                &mut filters.price_min
            };
            if slot.is_none() {
                *slot = Some(amount);
                spans.push(whole.range());
            }
        }
    }
}

fn word_number(word: &str) -> Option<f64> {
    let n = match word.to_lowercase().as_str() {
        "one" => 1.0,
        "two" => 2.0,
        "three" => 3.0,
        "four" => 4.0,
        "five" => 5.0,
        "six" => 6.0,
        "seven" => 7.0,
        "eight" => 8.0,
        other => other.parse().ok()?,
    };
    Some(n)
}

fn extract_rooms(text: &str, filters: &mut SearchFilters, spans: &mut Vec<Range<usize>>) {
    if let Some(caps) = FILTER_PATTERNS.bedrooms.captures(text) {
        if let (Some(whole), Some(n)) = (caps.get(0), caps.get(1).and_then(|m| word_number(m.as_str())))
        {
            filters.bedrooms = Some((n.floor() as u32).min(MAX_ROOMS));
            spans.push(whole.range());
        }
    }
    if let Some(caps) = FILTER_PATTERNS.bathrooms.captures(text) {
        if let (Some(whole), Some(n)) = (caps.get(0), caps.get(1).and_then(|m| word_number(m.as_str())))
        {
            filters.bathrooms = Some(n.min(MAX_ROOMS as f64) as f32);
            spans.push(whole.range());
        }
    }
}

fn extract_location(text: &str, filters: &mut SearchFilters, spans: &mut Vec<Range<usize>>) {
    if let Some(caps) = FILTER_PATTERNS.city.captures(text) {
        if let (Some(whole), Some(city)) = (caps.get(0), caps.get(1)) {
            filters.city = Some(city.as_str().to_string());
            filters.state = caps.get(2).map(|s| s.as_str().to_string());
            spans.push(whole.range());
            return;
        }
    }
    if let Some(m) = FILTER_PATTERNS.known_city.find(text) {
        filters.city = Some(title_case(m.as_str()));
        spans.push(m.range());
    }
}

fn extract_property_type(text: &str, filters: &mut SearchFilters, spans: &mut Vec<Range<usize>>) {
    let Some(m) = FILTER_PATTERNS.property_type.find(text) else {
        return;
    };
    let word = m.as_str().to_lowercase();
    let canonical = if word.starts_with("single") || word.starts_with("house") {
        "house"
    } else if word.starts_with("condo") {
        "condo"
    } else if word.starts_with("apartment") || word.starts_with("apt") || word.starts_with("flat") {
        "apartment"
    } else if word.starts_with("town") {
        "townhouse"
    } else {
        "duplex"
    };
    filters.property_type = Some(canonical.to_string());
    spans.push(m.range());
}

fn extract_radius(text: &str, spans: &[Range<usize>]) -> Option<u32> {
    FILTER_PATTERNS.radius.captures_iter(text).find_map(|caps| {
        let whole = caps.get(0)?;
        if overlaps(spans, &whole.range()) {
            return None;
        }
        let value: f64 = caps.get(1)?.as_str().parse().ok()?;
        let unit = caps.get(2)?.as_str().to_lowercase();
        let meters = if unit.starts_with('k') {
            value * 1_000.0
        } else {
            value
        };
        Some((meters.round() as u32).clamp(MIN_RADIUS_M, MAX_RADIUS_M))
    })
}

/// The message with matched filter spans and filler words removed.
fn remainder(text: &str, spans: &[Range<usize>]) -> String {
    let kept: String = text
        .char_indices()
        .map(|(i, c)| {
            if spans.iter().any(|s| s.contains(&i)) {
                ' '
            } else {
                c
            }
        })
        .collect();
    kept.split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric() && c != '\''))
        .filter(|w| !w.is_empty() && !FILLER_WORDS.contains(&w.to_lowercase().as_str()))
        .collect::<Vec<_>>()
        .join(" ")
}

fn title_case(text: &str) -> String {
    text.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}
