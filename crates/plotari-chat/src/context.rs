//! Conversation context management.
//!
//! Starts conversations, records each turn into the fixed-schema context,
//! and resolves follow-up messages against what the user asked before.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;

use plotari_core::types::{
    distinct_ids, Conversation, ConversationContext, ConversationKey, IntentKind, Message,
    Property, ResultSummary, SearchIntent, REMEMBERED_RESULTS,
};

/// Longest conversation summary, in characters.
const SUMMARY_CHARS: usize = 100;

/// "cheaper" lowers the previous price ceiling by this factor.
const CHEAPER_FACTOR: f64 = 0.85;

static REFINEMENT_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)^\s*(?:what|how)\s+about\b",
        r"(?i)^\s*(?:and|but|with|without|only)\b",
        r"(?i)\b(?:cheaper|less\s+expensive|bigger|larger|more\s+bedrooms|instead|same|those|these|them|ones)\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("Invalid refinement regex"))
    .collect()
});

static CHEAPER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:cheaper|less\s+expensive|lower\s+price)\b").expect("Invalid regex")
});

static BIGGER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:bigger|larger|more\s+bedrooms)\b").expect("Invalid regex")
});

// =============================================================================
// ContextTracker
// =============================================================================

/// Creates conversations and folds finished turns into them.
#[derive(Debug, Clone)]
pub struct ContextTracker {
    ttl: chrono::Duration,
}

impl ContextTracker {
    pub fn new(ttl: chrono::Duration) -> Self {
        Self { ttl }
    }

    pub fn ttl(&self) -> chrono::Duration {
        self.ttl
    }

    /// A fresh conversation expiring `ttl` after `now`.
    pub fn start(&self, key: ConversationKey, now: DateTime<Utc>) -> Conversation {
        Conversation::new(key, now, self.ttl)
    }

    /// Append the user message and the reply, update the context and push
    /// the expiry out.
    ///
    /// `intent` is `None` when the turn failed before extraction finished.
    pub fn record_turn(
        &self,
        conversation: &mut Conversation,
        user_text: &str,
        reply: &str,
        intent: Option<&SearchIntent>,
        shown: &[Property],
        now: DateTime<Utc>,
    ) {
        if conversation.summary.is_none() {
            conversation.summary = Some(summarize(user_text));
        }

        let result_ids = shown.iter().map(|p| p.id.clone()).collect();
        conversation.push(Message::user(user_text, now));
        conversation.push(Message::assistant(reply, now, result_ids));

        if let Some(intent) = intent {
            update_context(&mut conversation.context, intent, shown);
        }
        conversation.touch(now, self.ttl);
    }
}

/// First user message, cut to at most 100 characters.
pub fn summarize(text: &str) -> String {
    let text = text.trim();
    if text.chars().count() <= SUMMARY_CHARS {
        return text.to_string();
    }
    let cut: String = text.chars().take(SUMMARY_CHARS - 3).collect();
    format!("{}...", cut)
}

fn update_context(context: &mut ConversationContext, intent: &SearchIntent, shown: &[Property]) {
    // Small talk keeps the last real search available for follow-ups.
    if intent.kind != IntentKind::GeneralInquiry {
        context.last_intent = Some(intent.clone());
    }

    if !shown.is_empty() {
        context.last_results = shown
            .iter()
            .take(REMEMBERED_RESULTS)
            .map(ResultSummary::from)
            .collect();
    }

    match intent.kind {
        IntentKind::Comparison => {}
        _ if shown.len() == 1 => context.current_property = Some(shown[0].id.clone()),
        _ => {
            if let Some(id) = intent.filters.property_ids.first() {
                context.current_property = Some(id.clone());
            }
        }
    }

    let filters = &intent.filters;
    let prefs = &mut context.preferences;
    if intent.kind == IntentKind::PropertySearch {
        if let Some(city) = &filters.city {
            prefs.preferred_city = Some(city.clone());
        }
        if let Some(kind) = &filters.property_type {
            prefs.property_type = Some(kind.clone());
        }
        if let Some(beds) = filters.bedrooms {
            prefs.min_bedrooms = Some(beds);
        }
        if let Some(max) = filters.price_max {
            prefs.max_price = Some(max);
        }
    }
    if intent.kind == IntentKind::PoiSearch || filters.poi_category.is_some() {
        prefs.wants_nearby_pois = true;
    }
}

// =============================================================================
// FollowUpResolver
// =============================================================================

/// Fills gaps in a new intent from the conversation context.
#[derive(Debug, Clone, Copy, Default)]
pub struct FollowUpResolver;

impl FollowUpResolver {
    /// Resolve context-dependent references in `intent`.
    ///
    /// - A refinement of a previous property search ("what about 2
    ///   bedrooms?", "cheaper ones") inherits the filters it does not set.
    /// - A property search without a city uses the preferred city.
    /// - A comparison naming fewer than two listings compares the current
    ///   listing and the last results.
    pub fn resolve(&self, intent: &mut SearchIntent, message: &str, context: &ConversationContext) {
        let previous = context
            .last_intent
            .as_ref()
            .filter(|i| i.kind == IntentKind::PropertySearch);
        let refinement = is_refinement(message);

        if intent.kind == IntentKind::GeneralInquiry && refinement && previous.is_some() {
            intent.kind = IntentKind::PropertySearch;
            intent.query.clear();
        }

        match intent.kind {
            IntentKind::PropertySearch => {
                if let (true, Some(previous)) = (refinement, previous) {
                    carry_forward(intent, previous, message);
                }
                if intent.filters.city.is_none() {
                    intent.filters.city = context.preferences.preferred_city.clone();
                }
            }
            IntentKind::Comparison if intent.filters.property_ids.len() < 2 => {
                let named = intent.filters.property_ids.iter().map(String::as_str);
                let current = context.current_property.as_deref();
                let recent = context.last_results.iter().map(|r| r.id.as_str());
                intent.filters.property_ids = distinct_ids(named.chain(current).chain(recent));
            }
            _ => {}
        }
    }
}

fn is_refinement(message: &str) -> bool {
    REFINEMENT_PATTERNS.iter().any(|re| re.is_match(message))
}

fn carry_forward(intent: &mut SearchIntent, previous: &SearchIntent, message: &str) {
    let filters = &mut intent.filters;
    let prior = &previous.filters;

    if CHEAPER.is_match(message) && filters.price_max.is_none() {
        filters.price_max = prior.price_max.map(|p| (p * CHEAPER_FACTOR).round());
    }
    if BIGGER.is_match(message) && filters.bedrooms.is_none() {
        filters.bedrooms = Some(prior.bedrooms.unwrap_or(1).saturating_add(1));
    }

    macro_rules! inherit {
        ($($field:ident),*) => {
            $(
                if filters.$field.is_none() {
                    filters.$field = prior.$field.clone();
                }
            )*
        };
    }
    inherit!(
        price_min,
        price_max,
        bedrooms,
        bathrooms,
        city,
        state,
        neighborhood,
        property_type,
        geo,
        poi_category
    );

    if intent.query.trim().is_empty() {
        intent.query = previous.query.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plotari_core::types::{Role, SearchFilters};

    fn property(id: &str) -> Property {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "address": format!("{} Oak St", id),
            "city": "Springfield",
            "price": 350000.0
        }))
        .unwrap()
    }

    fn search(filters: SearchFilters) -> SearchIntent {
        SearchIntent {
            kind: IntentKind::PropertySearch,
            filters,
            ..Default::default()
        }
    }

    fn springfield_context() -> ConversationContext {
        let mut context = ConversationContext::default();
        update_context(
            &mut context,
            &search(SearchFilters {
                bedrooms: Some(3),
                city: Some("Springfield".into()),
                price_max: Some(400_000.0),
                ..Default::default()
            }),
            &[property("11111111"), property("22222222")],
        );
        context
    }

    #[test]
    fn test_record_turn_appends_and_refreshes() {
        let tracker = ContextTracker::new(chrono::Duration::minutes(30));
        let start = Utc::now();
        let mut conv = tracker.start(ConversationKey::new("u1", "s1"), start);
        assert_eq!(conv.expires_at, start + chrono::Duration::minutes(30));

        let later = start + chrono::Duration::minutes(10);
        let intent = search(SearchFilters::default());
        tracker.record_turn(
            &mut conv,
            "houses please",
            "I found 1 property.",
            Some(&intent),
            &[property("11111111")],
            later,
        );

        assert_eq!(conv.messages.len(), 2);
        assert_eq!(conv.messages[0].role, Role::User);
        assert_eq!(conv.messages[1].result_ids, vec!["11111111"]);
        assert_eq!(conv.last_activity, later);
        assert_eq!(conv.expires_at, later + chrono::Duration::minutes(30));
        assert_eq!(conv.summary.as_deref(), Some("houses please"));
        assert_eq!(conv.context.current_property.as_deref(), Some("11111111"));

        // The summary is only set once.
        tracker.record_turn(&mut conv, "second", "ok", None, &[], later);
        assert_eq!(conv.summary.as_deref(), Some("houses please"));
        assert_eq!(conv.messages.len(), 4);
    }

    #[test]
    fn test_summarize_truncates_long_messages() {
        let long = "x".repeat(150);
        let summary = summarize(&long);
        assert_eq!(summary.chars().count(), 100);
        assert!(summary.ends_with("..."));
        assert_eq!(summarize(&"y".repeat(100)), "y".repeat(100));
    }

    #[test]
    fn test_context_remembers_top_results_and_preferences() {
        let mut context = ConversationContext::default();
        let shown: Vec<Property> = ["1", "2", "3", "4"].iter().map(|id| property(id)).collect();
        update_context(
            &mut context,
            &search(SearchFilters {
                city: Some("Springfield".into()),
                bedrooms: Some(2),
                poi_category: Some("school".into()),
                ..Default::default()
            }),
            &shown,
        );
        assert_eq!(context.last_results.len(), REMEMBERED_RESULTS);
        assert_eq!(context.preferences.preferred_city.as_deref(), Some("Springfield"));
        assert_eq!(context.preferences.min_bedrooms, Some(2));
        assert!(context.preferences.wants_nearby_pois);
        assert!(context.current_property.is_none());

        // Small talk leaves the last search in place.
        update_context(&mut context, &SearchIntent::general(), &[]);
        assert_eq!(
            context.last_intent.as_ref().map(|i| i.kind),
            Some(IntentKind::PropertySearch)
        );
        assert_eq!(context.last_results.len(), REMEMBERED_RESULTS);
    }

    #[test]
    fn test_refinement_inherits_previous_filters() {
        let context = springfield_context();
        let mut intent = search(SearchFilters {
            bedrooms: Some(2),
            ..Default::default()
        });
        FollowUpResolver.resolve(&mut intent, "what about 2 bedrooms?", &context);
        assert_eq!(intent.filters.bedrooms, Some(2));
        assert_eq!(intent.filters.city.as_deref(), Some("Springfield"));
        assert_eq!(intent.filters.price_max, Some(400_000.0));
    }

    #[test]
    fn test_cheaper_turns_small_talk_into_search() {
        let context = springfield_context();
        let mut intent = SearchIntent {
            query: "cheaper ones".into(),
            ..SearchIntent::general()
        };
        FollowUpResolver.resolve(&mut intent, "cheaper ones", &context);
        assert_eq!(intent.kind, IntentKind::PropertySearch);
        assert_eq!(intent.filters.price_max, Some(340_000.0));
        assert_eq!(intent.filters.bedrooms, Some(3));
        assert_eq!(intent.query, "");
    }

    #[test]
    fn test_bigger_adds_a_bedroom_without_overflow() {
        let context = springfield_context();
        let mut intent = SearchIntent::general();
        FollowUpResolver.resolve(&mut intent, "bigger ones", &context);
        assert_eq!(intent.kind, IntentKind::PropertySearch);
        assert_eq!(intent.filters.bedrooms, Some(4));

        let mut huge = ConversationContext::default();
        update_context(
            &mut huge,
            &search(SearchFilters {
                bedrooms: Some(u32::MAX),
                ..Default::default()
            }),
            &[property("11111111")],
        );
        let mut intent = SearchIntent::general();
        FollowUpResolver.resolve(&mut intent, "bigger ones", &huge);
        assert_eq!(intent.filters.bedrooms, Some(u32::MAX));
    }

    #[test]
    fn test_new_search_only_gets_preferred_city() {
        let context = springfield_context();
        let mut intent = search(SearchFilters {
            property_type: Some("condo".into()),
            ..Default::default()
        });
        FollowUpResolver.resolve(&mut intent, "show me condos", &context);
        assert_eq!(intent.filters.city.as_deref(), Some("Springfield"));
        assert_eq!(intent.filters.bedrooms, None);
        assert_eq!(intent.filters.price_max, None);
    }

    #[test]
    fn test_comparison_falls_back_to_last_results() {
        let mut context = springfield_context();
        context.current_property = Some("99999999".into());
        let mut intent = SearchIntent {
            kind: IntentKind::Comparison,
            ..Default::default()
        };
        FollowUpResolver.resolve(&mut intent, "compare them", &context);
        assert_eq!(
            intent.filters.property_ids,
            vec!["99999999", "11111111", "22222222"]
        );

        let mut named = SearchIntent {
            kind: IntentKind::Comparison,
            filters: SearchFilters {
                property_ids: vec!["12345678".into(), "87654321".into()],
                ..Default::default()
            },
            ..Default::default()
        };
        FollowUpResolver.resolve(&mut named, "compare 12345678 and 87654321", &context);
        assert_eq!(named.filters.property_ids.len(), 2);
    }

    #[test]
    fn test_general_inquiry_without_history_untouched() {
        let mut intent = SearchIntent::general();
        FollowUpResolver.resolve(&mut intent, "what about the weather?", &ConversationContext::default());
        assert_eq!(intent.kind, IntentKind::GeneralInquiry);
    }
}
