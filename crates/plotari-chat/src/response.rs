//! Reply composition.
//!
//! The language model writes the reply from the turn's results when it is
//! reachable. Templates cover everything else: small talk, degraded turns,
//! and any model failure.

use std::fmt::Write as _;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use serde_json::json;
use tracing::{debug, warn};

use plotari_core::config::{ChatConfig, LlmConfig};
use plotari_core::types::{Conversation, IntentKind, Poi, Property, Role, SearchFilters};

use crate::llm::{CompletionRequest, LanguageModel, PromptMessage};
use crate::types::{NearbyPois, ResponseSource};

/// Reply used when a turn fails outright.
pub const APOLOGY: &str =
    "Sorry, something went wrong while handling your message. Please try again in a moment.";

struct SmallTalkPatterns {
    greeting: Regex,
    how_are_you: Regex,
    thanks: Regex,
    goodbye: Regex,
    help: Regex,
}

static SMALL_TALK: LazyLock<SmallTalkPatterns> = LazyLock::new(|| {
    let mk = |p: &str| Regex::new(p).expect("Invalid small-talk regex");
    SmallTalkPatterns {
        greeting: mk(r"(?i)^\s*(?:hi|hello|hey|hola|good\s+(?:morning|afternoon|evening))\b"),
        how_are_you: mk(r"(?i)\bhow\s+are\s+you\b"),
        thanks: mk(r"(?i)\b(?:thanks|thank\s+you|thx)\b"),
        goodbye: mk(r"(?i)\b(?:bye|goodbye|see\s+you)\b"),
        help: mk(r"(?i)\b(?:help|what\s+can\s+you\s+do)\b"),
    }
});

/// Why a turn could not produce its normal answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    /// Both retrieval modalities failed.
    RetrievalUnavailable,
    /// The geospatial provider failed.
    PoiUnavailable,
    /// A POI search with no listing or coordinate to search around.
    NeedLocation,
    /// A comparison with no listings to compare.
    NeedListings,
}

/// What the pipeline produced for one turn.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    pub kind: IntentKind,
    pub filters: SearchFilters,
    pub results: Vec<Property>,
    pub pois: Vec<Poi>,
    pub nearby: Vec<NearbyPois>,
    /// One retrieval modality failed.
    pub partial: bool,
    pub notice: Option<Notice>,
}

impl TurnOutcome {
    pub fn new(kind: IntentKind, filters: SearchFilters) -> Self {
        Self {
            kind,
            filters,
            results: Vec::new(),
            pois: Vec::new(),
            nearby: Vec::new(),
            partial: false,
            notice: None,
        }
    }

    pub fn with_notice(mut self, notice: Notice) -> Self {
        self.notice = Some(notice);
        self
    }
}

/// Reply text and the path that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct ComposedReply {
    pub text: String,
    pub source: ResponseSource,
}

/// Writes replies, with the model when possible and templates otherwise.
pub struct ResponseComposer {
    model: Arc<dyn LanguageModel>,
    temperature: f32,
    max_tokens: u32,
    timeout: Duration,
    history_turns: usize,
}

impl ResponseComposer {
    pub fn new(model: Arc<dyn LanguageModel>, llm: &LlmConfig, chat: &ChatConfig) -> Self {
        Self {
            model,
            temperature: llm.temperature,
            max_tokens: llm.max_tokens,
            timeout: llm.timeout(),
            history_turns: chat.history_turns,
        }
    }

    /// Compose the reply to `message`.
    ///
    /// Turns carrying a [`Notice`] always use templates so a failing
    /// collaborator produces a predictable answer.
    pub async fn compose(
        &self,
        message: &str,
        outcome: &TurnOutcome,
        conversation: &Conversation,
    ) -> ComposedReply {
        if outcome.notice.is_none() {
            match self.compose_with_model(message, outcome, conversation).await {
                Ok(text) => {
                    return ComposedReply {
                        text,
                        source: ResponseSource::Model,
                    }
                }
                Err(reason) => {
                    debug!(model = self.model.name(), %reason, "Using template reply");
                }
            }
        }
        ComposedReply {
            text: template(message, outcome),
            source: ResponseSource::Template,
        }
    }

    async fn compose_with_model(
        &self,
        message: &str,
        outcome: &TurnOutcome,
        conversation: &Conversation,
    ) -> Result<String, String> {
        let mut messages: Vec<PromptMessage> = conversation
            .recent(self.history_turns)
            .iter()
            .map(|m| PromptMessage {
                role: m.role,
                content: m.text.clone(),
            })
            .collect();
        messages.push(PromptMessage {
            role: Role::User,
            content: message.to_string(),
        });

        let request = CompletionRequest {
            system: reply_prompt(outcome, conversation),
            messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            json_mode: false,
        };
        let text = match tokio::time::timeout(self.timeout, self.model.complete(&request)).await {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => return Err(e.to_string()),
            Err(_) => return Err(format!("timed out after {}ms", self.timeout.as_millis())),
        };
        let text = text.trim();
        if text.is_empty() {
            warn!(model = self.model.name(), "Model returned an empty reply");
            return Err("empty reply".into());
        }
        Ok(text.to_string())
    }
}

fn reply_prompt(outcome: &TurnOutcome, conversation: &Conversation) -> String {
    let results: Vec<_> = outcome
        .results
        .iter()
        .map(|p| {
            json!({
                "id": p.id,
                "address": p.address,
                "city": p.city,
                "price": p.price,
                "bedrooms": p.bedrooms,
                "bathrooms": p.bathrooms,
                "living_area": p.living_area,
                "property_type": p.property_type,
                "description": p.description,
            })
        })
        .collect();
    let pois: Vec<_> = outcome
        .pois
        .iter()
        .chain(outcome.nearby.iter().flat_map(|n| n.pois.iter()))
        .map(|p| json!({"name": p.name, "category": p.category, "distance_m": p.distance_m}))
        .collect();
    let facts = json!({
        "intent": outcome.kind,
        "filters": outcome.filters,
        "results": results,
        "nearby_places": pois,
        "results_partial": outcome.partial,
        "preferences": conversation.context.preferences,
    });
    format!(
        "You are a friendly real-estate assistant. Answer the user's last message in a few \
         sentences using only the facts below. Mention prices, bedrooms and addresses of the \
         listings you refer to. Never invent listings.\nFacts: {}",
        facts
    )
}

// =============================================================================
// Templates
// =============================================================================

/// Template reply for a turn.
pub fn template(message: &str, outcome: &TurnOutcome) -> String {
    match outcome.notice {
        Some(Notice::RetrievalUnavailable) => {
            return "Sorry, property search is unavailable right now. Please try again in a moment."
                .to_string()
        }
        Some(Notice::PoiUnavailable) => {
            return "I couldn't reach the map service right now, so I can't list nearby places. Please try again in a moment."
                .to_string()
        }
        Some(Notice::NeedLocation) => {
            return "Which property or area should I look around? Share a listing id or search for properties first."
                .to_string()
        }
        Some(Notice::NeedListings) => {
            return "Tell me which listings to compare by their ids, or run a search first and I'll compare the results."
                .to_string()
        }
        None => {}
    }

    match outcome.kind {
        IntentKind::GeneralInquiry => small_talk(message),
        IntentKind::PropertySearch => property_reply(outcome),
        IntentKind::PoiSearch => poi_reply(outcome),
        IntentKind::Comparison => comparison_reply(outcome),
    }
}

fn small_talk(message: &str) -> String {
    let p = &*SMALL_TALK;
    let reply = if p.how_are_you.is_match(message) {
        "I'm doing well, thanks for asking! Are you looking for a home today?"
    } else if p.greeting.is_match(message) {
        "Hello! I can help you find properties. Tell me a city, a budget or how many bedrooms you need."
    } else if p.thanks.is_match(message) {
        "You're welcome! Let me know if you want to refine the search."
    } else if p.goodbye.is_match(message) {
        "Goodbye! Come back any time you want to keep searching."
    } else if p.help.is_match(message) {
        "I can search listings by city, price, bedrooms and bathrooms, compare properties side by side, and show schools, restaurants or parks nearby."
    } else {
        "I can search listings, compare properties and show what's nearby. Try something like \"3 bedroom house in Springfield under 400k\"."
    };
    reply.to_string()
}

fn property_reply(outcome: &TurnOutcome) -> String {
    let criteria = describe_filters(&outcome.filters);
    if outcome.results.is_empty() {
        return if criteria.is_empty() {
            "I couldn't find any properties for that. Try naming a city, a budget or a number of bedrooms.".to_string()
        } else {
            format!(
                "I couldn't find properties {}. Try widening the budget or the area.",
                criteria
            )
        };
    }

    let n = outcome.results.len();
    let mut reply = format!(
        "I found {} propert{}{}{}:",
        n,
        if n == 1 { "y" } else { "ies" },
        if criteria.is_empty() { "" } else { " " },
        criteria
    );
    for (i, property) in outcome.results.iter().enumerate() {
        let _ = write!(reply, "\n{}. {}", i + 1, listing_line(property));
    }
    if !outcome.nearby.is_empty() {
        let places: usize = outcome.nearby.iter().map(|n| n.pois.len()).sum();
        let _ = write!(
            reply,
            "\nI also found {} nearby place{} around the top {}.",
            places,
            if places == 1 { "" } else { "s" },
            if outcome.nearby.len() == 1 {
                "result".to_string()
            } else {
                format!("{} results", outcome.nearby.len())
            }
        );
    }
    if outcome.partial {
        reply.push_str("\nSome search signals were unavailable, so these results may be incomplete.");
    }
    reply
}

fn poi_reply(outcome: &TurnOutcome) -> String {
    let n = outcome.pois.len();
    let noun = if n == 1 { "place" } else { "places" };
    let what = match &outcome.filters.poi_category {
        Some(category) => format!("{} {}", category, noun),
        None => noun.to_string(),
    };
    let radius = outcome
        .filters
        .poi_radius_m
        .map(|r| format!(" within {} m", r))
        .unwrap_or_default();

    if n == 0 {
        return format!("I couldn't find any {}{}.", what, radius);
    }
    let mut reply = format!("I found {} {}{}:", n, what, radius);
    for poi in &outcome.pois {
        let _ = write!(reply, "\n- {} ({}", poi.name, poi.category);
        if let Some(d) = poi.distance_m {
            let _ = write!(reply, ", {:.0} m away", d);
        }
        reply.push(')');
    }
    reply
}

fn comparison_reply(outcome: &TurnOutcome) -> String {
    match outcome.results.as_slice() {
        [] => "I couldn't find any of those listings.".to_string(),
        [only] => format!(
            "I could only find one of those listings: {}",
            listing_line(only)
        ),
        results => {
            let mut reply = format!("Here is how these {} properties compare:", results.len());
            for property in results {
                let _ = write!(reply, "\n- {}", listing_line(property));
            }
            if let Some(cheapest) = results
                .iter()
                .filter(|p| p.price.is_some())
                .min_by(|a, b| a.price.unwrap_or(f64::MAX).total_cmp(&b.price.unwrap_or(f64::MAX)))
            {
                let _ = write!(reply, "\nThe most affordable is {}.", cheapest.address);
            }
            if let Some(roomiest) = results.iter().filter(|p| p.bedrooms.is_some()).max_by_key(|p| p.bedrooms) {
                let _ = write!(reply, "\n{} has the most bedrooms.", roomiest.address);
            }
            reply
        }
    }
}

fn listing_line(p: &Property) -> String {
    let mut line = p.address.clone();
    if let Some(city) = &p.city {
        let _ = write!(line, ", {}", city);
    }
    if let Some(price) = p.price {
        let _ = write!(line, " - {}", format_price(price));
    }
    let mut rooms = Vec::new();
    if let Some(beds) = p.bedrooms {
        rooms.push(format!("{} bd", beds));
    }
    if let Some(baths) = p.bathrooms {
        rooms.push(format!("{} ba", baths));
    }
    if let Some(area) = p.living_area {
        rooms.push(format!("{:.0} sqft", area));
    }
    if !rooms.is_empty() {
        let _ = write!(line, " - {}", rooms.join(" / "));
    }
    line
}

/// Human-readable summary of the listing constraints, e.g.
/// "with 3+ bedrooms in Springfield under $400,000".
fn describe_filters(filters: &SearchFilters) -> String {
    let mut parts = Vec::new();
    if let Some(beds) = filters.bedrooms {
        parts.push(format!("with {}+ bedrooms", beds));
    }
    if let Some(baths) = filters.bathrooms {
        parts.push(format!("with {}+ bathrooms", baths));
    }
    if let Some(city) = &filters.city {
        match &filters.state {
            Some(state) => parts.push(format!("in {}, {}", city, state)),
            None => parts.push(format!("in {}", city)),
        }
    }
    match (filters.price_min, filters.price_max) {
        (Some(min), Some(max)) => parts.push(format!(
            "between {} and {}",
            format_price(min),
            format_price(max)
        )),
        (None, Some(max)) => parts.push(format!("under {}", format_price(max))),
        (Some(min), None) => parts.push(format!("over {}", format_price(min))),
        (None, None) => {}
    }
    if let Some(category) = &filters.poi_category {
        parts.push(format!("near {}", category));
    }
    parts.join(" ")
}

/// "$1,250,000"
fn format_price(amount: f64) -> String {
    let whole = amount.round().max(0.0) as u64;
    let digits = whole.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    out.push('$');
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use plotari_core::error::ProviderError;
    use plotari_core::geo::GeoPoint;
    use plotari_core::types::ConversationKey;

    struct EchoModel;

    #[async_trait]
    impl LanguageModel for EchoModel {
        async fn complete(&self, request: &CompletionRequest) -> Result<String, ProviderError> {
            Ok(format!("model saw {} messages", request.messages.len()))
        }

        fn name(&self) -> &str {
            "echo"
        }
    }

    struct DownModel;

    #[async_trait]
    impl LanguageModel for DownModel {
        async fn complete(&self, _request: &CompletionRequest) -> Result<String, ProviderError> {
            Err(ProviderError::Unavailable("offline".into()))
        }

        fn name(&self) -> &str {
            "down"
        }
    }

    fn property(id: &str, price: f64, beds: u32) -> Property {
        serde_json::from_value(json!({
            "id": id,
            "address": format!("{} Elm St", id),
            "city": "Springfield",
            "price": price,
            "bedrooms": beds,
            "bathrooms": 2.0
        }))
        .unwrap()
    }

    fn poi(name: &str, distance: f64) -> Poi {
        Poi {
            id: None,
            name: name.into(),
            category: "school".into(),
            location: GeoPoint::new(39.78, -89.65),
            address: None,
            phone: None,
            website: None,
            opening_hours: None,
            cuisine: None,
            brand: None,
            rating: None,
            distance_m: Some(distance),
            source: "OpenStreetMap".into(),
        }
    }

    fn conversation() -> Conversation {
        Conversation::new(
            ConversationKey::new("u1", "s1"),
            Utc::now(),
            chrono::Duration::minutes(10),
        )
    }

    fn composer(model: Arc<dyn LanguageModel>) -> ResponseComposer {
        ResponseComposer::new(model, &LlmConfig::default(), &ChatConfig::default())
    }

    #[test]
    fn test_property_template_lists_results() {
        let mut outcome = TurnOutcome::new(
            IntentKind::PropertySearch,
            SearchFilters {
                bedrooms: Some(3),
                city: Some("Springfield".into()),
                price_max: Some(400_000.0),
                ..Default::default()
            },
        );
        outcome.results = vec![property("1", 350_000.0, 3), property("2", 399_000.0, 4)];
        outcome.partial = true;

        let reply = template("3 bedroom house in Springfield under 400k", &outcome);
        assert!(reply.starts_with(
            "I found 2 properties with 3+ bedrooms in Springfield under $400,000:"
        ));
        assert!(reply.contains("1. 1 Elm St, Springfield - $350,000 - 3 bd / 2 ba"));
        assert!(reply.contains("may be incomplete"));
    }

    #[test]
    fn test_property_template_no_results() {
        let outcome = TurnOutcome::new(
            IntentKind::PropertySearch,
            SearchFilters {
                city: Some("Nowhere".into()),
                ..Default::default()
            },
        );
        assert_eq!(
            template("", &outcome),
            "I couldn't find properties in Nowhere. Try widening the budget or the area."
        );
    }

    #[test]
    fn test_poi_and_comparison_templates() {
        let mut outcome = TurnOutcome::new(
            IntentKind::PoiSearch,
            SearchFilters {
                poi_category: Some("school".into()),
                poi_radius_m: Some(800),
                ..Default::default()
            },
        );
        outcome.pois = vec![poi("Lincoln Elementary", 120.4)];
        let reply = template("schools nearby", &outcome);
        assert!(reply.starts_with("I found 1 school place within 800 m:"));
        assert!(reply.contains("- Lincoln Elementary (school, 120 m away)"));

        let mut outcome = TurnOutcome::new(IntentKind::Comparison, SearchFilters::default());
        outcome.results = vec![property("1", 350_000.0, 3), property("2", 299_000.0, 4)];
        let reply = template("compare", &outcome);
        assert!(reply.contains("The most affordable is 2 Elm St."));
        assert!(reply.contains("2 Elm St has the most bedrooms."));
    }

    #[test]
    fn test_notices_and_small_talk() {
        let degraded = TurnOutcome::new(IntentKind::PropertySearch, SearchFilters::default())
            .with_notice(Notice::RetrievalUnavailable);
        assert!(template("houses", &degraded).starts_with("Sorry, property search is unavailable"));

        let general = TurnOutcome::new(IntentKind::GeneralInquiry, SearchFilters::default());
        assert!(template("Hello!", &general).starts_with("Hello!"));
        assert!(template("thank you so much", &general).starts_with("You're welcome"));
        assert!(template("how are you?", &general).starts_with("I'm doing well"));
        assert!(template("asdf", &general).contains("3 bedroom house in Springfield"));
    }

    #[test]
    fn test_format_price() {
        assert_eq!(format_price(400_000.0), "$400,000");
        assert_eq!(format_price(1_250_000.4), "$1,250,000");
        assert_eq!(format_price(999.0), "$999");
    }

    #[tokio::test]
    async fn test_compose_prefers_model() {
        let outcome = TurnOutcome::new(IntentKind::GeneralInquiry, SearchFilters::default());
        let reply = composer(Arc::new(EchoModel))
            .compose("hi", &outcome, &conversation())
            .await;
        assert_eq!(reply.source, ResponseSource::Model);
        assert_eq!(reply.text, "model saw 1 messages");
    }

    #[tokio::test]
    async fn test_compose_falls_back_to_template() {
        let outcome = TurnOutcome::new(IntentKind::GeneralInquiry, SearchFilters::default());
        let reply = composer(Arc::new(DownModel))
            .compose("hello", &outcome, &conversation())
            .await;
        assert_eq!(reply.source, ResponseSource::Template);
        assert!(reply.text.starts_with("Hello!"));

        // Degraded turns never reach the model.
        let degraded = outcome.with_notice(Notice::NeedLocation);
        let reply = composer(Arc::new(EchoModel))
            .compose("what's nearby", &degraded, &conversation())
            .await;
        assert_eq!(reply.source, ResponseSource::Template);
    }
}
