//! Model routing: a pure function of the request shape. Identical inputs
//! always yield the same (provider, model, reason).

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::provider::{cost_per_1k_tokens, ChatMessage, Role};

const SIMPLE_THRESHOLD: f64 = 0.3;
const COMPLEX_THRESHOLD: f64 = 0.7;
const LARGE_CONTEXT_THRESHOLD: usize = 100_000;

const COMPLEX_KEYWORDS: &[&str] = &[
    "analyze",
    "compare",
    "evaluate",
    "explain why",
    "reasoning",
    "calculate",
    "solve",
    "optimize",
    "recommend",
    "strategy",
    "complex",
    "detailed",
    "comprehensive",
    "in-depth",
    "technical",
    "algorithm",
    "logic",
    "proof",
    "derive",
    "synthesize",
];

/// One routing slot: where a class of request goes and why.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteChoice {
    pub provider: String,
    pub model: String,
    pub reason: String,
}

/// The four-way routing table. Tenants may override the defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingTable {
    pub simple_queries: RouteChoice,
    pub large_context: RouteChoice,
    pub complex_reasoning: RouteChoice,
    pub default: RouteChoice,
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self {
            simple_queries: RouteChoice {
                provider: "gemini".into(),
                model: "gemini-1.5-flash".into(),
                reason: "Simple query - using cost-effective Gemini Flash".into(),
            },
            large_context: RouteChoice {
                provider: "gemini".into(),
                model: "gemini-1.5-pro".into(),
                reason: "Large context - using Gemini Pro with 1M token window".into(),
            },
            complex_reasoning: RouteChoice {
                provider: "openai".into(),
                model: "o1-preview".into(),
                reason: "Complex reasoning - using OpenAI o1-preview".into(),
            },
            default: RouteChoice {
                provider: "openai".into(),
                model: "gpt-4o".into(),
                reason: "Balanced performance - using GPT-4o".into(),
            },
        }
    }
}

/// Result of a routing decision.
#[derive(Debug, Clone, Serialize)]
pub struct RoutingDecision {
    pub provider: String,
    pub model: String,
    pub reason: String,
    pub estimated_cost_per_1k_tokens: f64,
    pub complexity_score: f64,
}

impl RoutingTable {
    /// Pick a provider/model for the request. Context size wins over
    /// complexity; an explicit preference wins over both.
    pub fn route(
        &self,
        messages: &[ChatMessage],
        context_size: Option<usize>,
        preferred: Option<(&str, &str)>,
    ) -> RoutingDecision {
        if let Some((provider, model)) = preferred {
            return RoutingDecision {
                provider: provider.to_string(),
                model: model.to_string(),
                reason: "User-specified provider and model".to_string(),
                estimated_cost_per_1k_tokens: cost_per_1k_tokens(provider, model),
                complexity_score: 0.0,
            };
        }

        let complexity_score = calculate_complexity(messages);
        let context_size = context_size.unwrap_or_else(|| estimate_context_size(messages));
        debug!(complexity = complexity_score, context_size, "routing decision inputs");

        let choice = if context_size > LARGE_CONTEXT_THRESHOLD {
            &self.large_context
        } else if complexity_score < SIMPLE_THRESHOLD {
            &self.simple_queries
        } else if complexity_score > COMPLEX_THRESHOLD {
            &self.complex_reasoning
        } else {
            &self.default
        };

        RoutingDecision {
            provider: choice.provider.clone(),
            model: choice.model.clone(),
            reason: choice.reason.clone(),
            estimated_cost_per_1k_tokens: cost_per_1k_tokens(&choice.provider, &choice.model),
            complexity_score,
        }
    }
}

/// Complexity score in [0, 1]: conversation length (≤0.2), total message
/// length (≤0.2), complex keywords in the last user message (≤0.3), question
/// marks plus message length (≤0.3), clamped.
pub fn calculate_complexity(messages: &[ChatMessage]) -> f64 {
    if messages.is_empty() {
        return 0.0;
    }
    let mut score = 0.0;

    let conversation_length = messages.len();
    if conversation_length > 10 {
        score += 0.2;
    } else if conversation_length > 5 {
        score += 0.1;
    } else {
        score += conversation_length as f64 * 0.02;
    }

    let total_length: usize = messages.iter().map(|m| m.content.len()).sum();
    if total_length > 5000 {
        score += 0.2;
    } else if total_length > 2000 {
        score += 0.15;
    } else if total_length > 1000 {
        score += 0.1;
    } else {
        score += total_length as f64 / 10_000.0;
    }

    let last_user = messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.to_lowercase());

    if let Some(last) = &last_user {
        let keyword_count = COMPLEX_KEYWORDS.iter().filter(|k| last.contains(*k)).count();
        score += (keyword_count as f64 * 0.1).min(0.3);

        let question_marks = last.matches('?').count();
        if question_marks > 2 {
            score += 0.2;
        } else if question_marks > 1 {
            score += 0.1;
        }
        if last.len() > 500 {
            score += 0.1;
        } else if last.len() > 200 {
            score += 0.05;
        }
    }

    score.min(1.0)
}

/// Rough token estimate: 4 characters per token.
pub fn estimate_context_size(messages: &[ChatMessage]) -> usize {
    messages.iter().map(|m| m.content.len()).sum::<usize>() / 4
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(content: &str) -> ChatMessage {
        ChatMessage {
            role: Role::User,
            content: content.to_string(),
        }
    }

    #[test]
    fn large_context_wins_over_complexity() {
        let table = RoutingTable::default();
        let decision = table.route(&[user("hi")], Some(120_000), None);
        assert_eq!(decision.model, "gemini-1.5-pro");
        assert!(decision.reason.starts_with("Large context"));
    }

    #[test]
    fn simple_message_routes_to_cheap_model() {
        let table = RoutingTable::default();
        let decision = table.route(&[user("hi")], Some(10), None);
        assert!(decision.complexity_score < 0.3);
        assert_eq!(decision.model, "gemini-1.5-flash");
    }

    #[test]
    fn complex_message_routes_to_reasoning_model() {
        let table = RoutingTable::default();
        let text = format!(
            "Please analyze and compare these options, calculate the optimal strategy, \
             and explain why in a detailed, comprehensive, technical way. {} \
             What is the tradeoff? Which algorithm wins? How would you derive the proof?",
            "x".repeat(2500)
        );
        let messages: Vec<ChatMessage> = (0..12).map(|_| user(&text)).collect();
        let decision = table.route(&messages, Some(10), None);
        assert!(decision.complexity_score > 0.7);
        assert_eq!(decision.model, "o1-preview");
    }

    #[test]
    fn preferred_model_short_circuits() {
        let table = RoutingTable::default();
        let decision = table.route(&[user("hi")], None, Some(("openai", "gpt-4o-mini")));
        assert_eq!(decision.provider, "openai");
        assert_eq!(decision.model, "gpt-4o-mini");
        assert_eq!(decision.reason, "User-specified provider and model");
    }

    #[test]
    fn routing_is_deterministic() {
        let table = RoutingTable::default();
        let messages = vec![user("how much is the blue shirt?")];
        let a = table.route(&messages, Some(500), None);
        let b = table.route(&messages, Some(500), None);
        assert_eq!(a.provider, b.provider);
        assert_eq!(a.model, b.model);
        assert_eq!(a.reason, b.reason);
        assert_eq!(a.complexity_score, b.complexity_score);
    }

    #[test]
    fn empty_messages_score_zero() {
        assert_eq!(calculate_complexity(&[]), 0.0);
    }
}
