//! Multi-intent detection: one LLM call with a strict JSON contract, then
//! local categorisation, prioritisation and sorting.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::json::extract_object;
use crate::provider::{ChatMessage, LlmProvider, LlmRequest, ProviderError, Role};

/// Closed intent vocabulary; anything else collapses to `OTHER`.
pub const INTENT_VOCABULARY: &[&str] = &[
    "GREETING",
    "BROWSE_PRODUCTS",
    "PRODUCT_DETAILS",
    "PRICE_CHECK",
    "STOCK_CHECK",
    "ADD_TO_CART",
    "CHECKOUT_LINK",
    "BROWSE_SERVICES",
    "SERVICE_DETAILS",
    "CHECK_AVAILABILITY",
    "BOOK_APPOINTMENT",
    "RESCHEDULE_APPOINTMENT",
    "CANCEL_APPOINTMENT",
    "OPT_IN_PROMOTIONS",
    "OPT_OUT_PROMOTIONS",
    "STOP_ALL",
    "START_ALL",
    "HUMAN_HANDOFF",
    "OTHER",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentCategory {
    Urgent,
    Transactional,
    Informational,
    Browsing,
    Support,
}

impl IntentCategory {
    /// Base priority score; confidence adds up to 20 on top.
    pub fn base_priority(&self) -> i32 {
        match self {
            IntentCategory::Urgent => 100,
            IntentCategory::Transactional => 80,
            IntentCategory::Informational => 60,
            IntentCategory::Support => 50,
            IntentCategory::Browsing => 40,
        }
    }
}

/// Category assignment for a (possibly unknown) intent name.
pub fn category_of(intent_name: &str) -> IntentCategory {
    match intent_name {
        "HUMAN_HANDOFF" | "CANCEL_APPOINTMENT" | "STOP_ALL" => IntentCategory::Urgent,
        "CHECKOUT_LINK" | "BOOK_APPOINTMENT" | "ADD_TO_CART" => IntentCategory::Transactional,
        "PRODUCT_DETAILS" | "SERVICE_DETAILS" | "CHECK_AVAILABILITY" | "PRICE_CHECK"
        | "STOCK_CHECK" => IntentCategory::Informational,
        "BROWSE_PRODUCTS" | "BROWSE_SERVICES" | "GREETING" => IntentCategory::Browsing,
        _ => IntentCategory::Support,
    }
}

/// A detected customer intent with extraction metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intent {
    pub name: String,
    pub confidence: f64,
    pub slots: serde_json::Value,
    pub category: IntentCategory,
    pub priority: i32,
    pub reasoning: String,
}

/// Context cues fed into the detection prompt so terse messages ("yes",
/// "that one", "how much?") resolve against what was just discussed.
#[derive(Debug, Clone, Default)]
pub struct IntentCues {
    /// Recent turns as (inbound?, text), oldest first.
    pub recent_turns: Vec<(bool, String)>,
    pub last_product_viewed: Option<String>,
    pub last_service_viewed: Option<String>,
}

/// Detect all intents in a logical turn. Parse failures and empty responses
/// yield an empty list rather than an error.
pub async fn detect_intents(
    provider: &dyn LlmProvider,
    model: &str,
    message_text: &str,
    cues: &IntentCues,
) -> Result<Vec<Intent>, ProviderError> {
    let request = LlmRequest {
        model: model.to_string(),
        messages: vec![
            ChatMessage {
                role: Role::System,
                content: detection_system_prompt(),
            },
            ChatMessage {
                role: Role::User,
                content: detection_user_prompt(message_text, cues),
            },
        ],
        temperature: 0.3,
        max_tokens: 1000,
    };

    let response = provider.generate(&request).await?;
    let intents = parse_intents(&response.content);
    info!(
        count = intents.len(),
        intents = ?intents.iter().map(|i| i.name.as_str()).collect::<Vec<_>>(),
        "intents detected"
    );
    Ok(prioritize(intents))
}

/// Parse the model's JSON into intents, collapsing unknown names to `OTHER`.
pub fn parse_intents(response_text: &str) -> Vec<Intent> {
    let Some(value) = extract_object(response_text) else {
        warn!("could not parse intent response as JSON, returning no intents");
        return Vec::new();
    };
    let Some(items) = value.get("intents").and_then(|v| v.as_array()) else {
        return Vec::new();
    };

    items
        .iter()
        .map(|item| {
            let raw_name = item
                .get("intent")
                .and_then(|v| v.as_str())
                .unwrap_or("OTHER");
            let name = if INTENT_VOCABULARY.contains(&raw_name) {
                raw_name.to_string()
            } else {
                "OTHER".to_string()
            };
            let confidence = item
                .get("confidence")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0)
                .clamp(0.0, 1.0);
            Intent {
                category: category_of(&name),
                name,
                confidence,
                slots: item.get("slots").cloned().unwrap_or(serde_json::json!({})),
                priority: 0,
                reasoning: item
                    .get("reasoning")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
            }
        })
        .collect()
}

/// Assign priority scores (category base + ⌊confidence·20⌋) and sort
/// descending by (priority, confidence).
pub fn prioritize(mut intents: Vec<Intent>) -> Vec<Intent> {
    for intent in &mut intents {
        intent.priority = intent.category.base_priority() + (intent.confidence * 20.0) as i32;
    }
    intents.sort_by(|a, b| {
        b.priority.cmp(&a.priority).then(
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal),
        )
    });
    intents
}

fn detection_system_prompt() -> String {
    let vocabulary = INTENT_VOCABULARY.join("\n- ");
    format!(
        "You are an AI assistant that detects multiple intents in customer messages.\n\
         Identify ALL distinct intents in the message, even if there are several.\n\n\
         SUPPORTED INTENTS:\n- {vocabulary}\n\n\
         RESPONSE FORMAT:\n\
         Return a JSON object with an array of intents:\n\
         {{\"intents\": [{{\"intent\": \"INTENT_NAME\", \"confidence\": 0.0, \
         \"slots\": {{}}, \"reasoning\": \"why\"}}]}}\n\n\
         GUIDELINES:\n\
         - Detect ALL intents, even if there are 3-4 in one message\n\
         - Each intent must be distinct (no duplicates)\n\
         - Extract relevant slots for each intent\n\
         - If the message is terse (\"yes\", \"that one\", \"how much?\"), use the \
           conversation context and last-viewed items to resolve what it refers to\n\
         - A simple message with one intent returns an array with one item"
    )
}

fn detection_user_prompt(message_text: &str, cues: &IntentCues) -> String {
    let mut prompt = format!("Detect all intents in this customer message:\n\n\"{message_text}\"");

    if !cues.recent_turns.is_empty() {
        prompt.push_str("\n\nRecent conversation context:\n");
        for (inbound, text) in cues.recent_turns.iter().rev().take(3).rev() {
            let role = if *inbound { "Customer" } else { "Assistant" };
            prompt.push_str(&format!("{role}: {text}\n"));
        }
    }
    if let Some(product) = &cues.last_product_viewed {
        prompt.push_str(&format!("\nLast product discussed: {product}"));
    }
    if let Some(service) = &cues.last_service_viewed {
        prompt.push_str(&format!("\nLast service discussed: {service}"));
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intent(name: &str, confidence: f64) -> Intent {
        Intent {
            name: name.to_string(),
            confidence,
            slots: serde_json::json!({}),
            category: category_of(name),
            priority: 0,
            reasoning: String::new(),
        }
    }

    #[test]
    fn urgent_outranks_browsing_regardless_of_confidence() {
        let sorted = prioritize(vec![
            intent("BROWSE_PRODUCTS", 0.9),
            intent("HUMAN_HANDOFF", 0.8),
            intent("PRICE_CHECK", 0.85),
        ]);
        let names: Vec<_> = sorted.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["HUMAN_HANDOFF", "PRICE_CHECK", "BROWSE_PRODUCTS"]);
    }

    #[test]
    fn priority_formula_matches_contract() {
        let sorted = prioritize(vec![intent("BOOK_APPOINTMENT", 0.95)]);
        // transactional base 80 + floor(0.95 * 20) = 99
        assert_eq!(sorted[0].priority, 99);
    }

    #[test]
    fn unknown_intent_collapses_to_other_support() {
        let parsed = parse_intents(
            r#"{"intents": [{"intent": "MAKE_ME_A_SANDWICH", "confidence": 0.9}]}"#,
        );
        assert_eq!(parsed[0].name, "OTHER");
        assert_eq!(parsed[0].category, IntentCategory::Support);
    }

    #[test]
    fn unparseable_response_yields_empty_list() {
        assert!(parse_intents("I'm sorry, I can't help with that").is_empty());
    }

    #[test]
    fn fenced_response_parses() {
        let parsed = parse_intents(
            "```json\n{\"intents\": [{\"intent\": \"BOOK_APPOINTMENT\", \"confidence\": 0.92, \
             \"slots\": {\"service\": \"haircut\", \"time\": \"tomorrow 10am\"}}]}\n```",
        );
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].name, "BOOK_APPOINTMENT");
        assert_eq!(parsed[0].slots["service"], "haircut");
    }

    #[test]
    fn confidence_is_clamped() {
        let parsed =
            parse_intents(r#"{"intents": [{"intent": "GREETING", "confidence": 1.7}]}"#);
        assert_eq!(parsed[0].confidence, 1.0);
    }

    #[test]
    fn cues_appear_in_user_prompt() {
        let cues = IntentCues {
            recent_turns: vec![
                (false, "Would you like the Blue Shirt?".to_string()),
                (true, "yes".to_string()),
            ],
            last_product_viewed: Some("Blue Shirt".to_string()),
            last_service_viewed: None,
        };
        let prompt = detection_user_prompt("yes", &cues);
        assert!(prompt.contains("Last product discussed: Blue Shirt"));
        assert!(prompt.contains("Assistant: Would you like the Blue Shirt?"));
    }
}
