//! Handoff policy: ordered rules; the first match fires and records its
//! reason. Rule 1 (low confidence) may instead ask the caller to bump the
//! counter and continue.

use tracing::info;

use mercato_tenants::settings::AgentSettings;

/// Phrases by which a customer explicitly asks for a human.
const CUSTOMER_REQUEST_PHRASES: &[&str] = &[
    "speak to a human",
    "talk to a person",
    "human agent",
    "real person",
    "live agent",
    "customer service",
    "speak to someone",
    "talk to someone",
    "connect me to",
    "transfer me to",
];

/// Phrases by which the agent itself suggests escalation.
const AGENT_SUGGESTED_PHRASES: &[&str] = &[
    "connect you with",
    "transfer you to",
    "speak with a human",
    "human agent",
    "live agent",
    "escalate",
    "specialist can help",
];

/// Keywords marking issues that go straight to a human.
const SENSITIVE_KEYWORDS: &[&str] = &[
    "refund", "complaint", "legal", "lawsuit", "lawyer", "sue", "fraud", "scam", "emergency",
    "urgent", "critical",
];

/// Outcome of the handoff evaluation for one turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandoffDecision {
    /// Transition the conversation to a human; reason goes into metadata.
    Handoff { reason: String },
    /// Confidence was low but the attempt budget is not yet exhausted:
    /// increment the counter and still send the reply.
    IncrementLowConfidence,
    /// No rule fired; confidence was acceptable, reset the counter.
    Continue,
}

/// Evaluate the ordered handoff rules for a turn.
///
/// `low_confidence_count` is the counter value before this turn.
pub fn evaluate_handoff(
    reply: &str,
    confidence: f64,
    low_confidence_count: u32,
    last_inbound: Option<&str>,
    settings: &AgentSettings,
) -> HandoffDecision {
    // 1. Consecutive low confidence.
    if confidence < settings.confidence_threshold {
        if low_confidence_count >= settings.max_low_confidence_attempts.saturating_sub(1) {
            info!(
                confidence,
                attempts = low_confidence_count + 1,
                "handoff: consecutive low-confidence responses"
            );
            return HandoffDecision::Handoff {
                reason: "consecutive_low_confidence".to_string(),
            };
        }
        return HandoffDecision::IncrementLowConfidence;
    }

    let inbound_lower = last_inbound.map(str::to_lowercase);

    // 2. Explicit customer request for a human.
    if let Some(inbound) = &inbound_lower {
        if let Some(phrase) = CUSTOMER_REQUEST_PHRASES.iter().find(|p| inbound.contains(*p)) {
            info!(phrase, "handoff: customer explicitly requested human");
            return HandoffDecision::Handoff {
                reason: "customer_requested_human".to_string(),
            };
        }
    }

    // 3. Agent-suggested escalation in the reply.
    let reply_lower = reply.to_lowercase();
    if let Some(phrase) = AGENT_SUGGESTED_PHRASES.iter().find(|p| reply_lower.contains(*p)) {
        info!(phrase, "handoff: agent suggested escalation");
        return HandoffDecision::Handoff {
            reason: "agent_suggested_handoff".to_string(),
        };
    }

    // 4. Tenant-configured auto-handoff topics.
    if let Some(inbound) = &inbound_lower {
        for topic in &settings.auto_handoff_topics {
            if inbound.contains(&topic.to_lowercase()) {
                info!(topic = %topic, "handoff: configured topic matched");
                return HandoffDecision::Handoff {
                    reason: format!("auto_handoff_topic:{topic}"),
                };
            }
        }
    }

    // 5. Sensitive keywords.
    if let Some(inbound) = &inbound_lower {
        if let Some(keyword) = SENSITIVE_KEYWORDS.iter().find(|k| inbound.contains(*k)) {
            info!(keyword, "handoff: sensitive keyword detected");
            return HandoffDecision::Handoff {
                reason: format!("complex_issue:{keyword}"),
            };
        }
    }

    HandoffDecision::Continue
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> AgentSettings {
        AgentSettings {
            confidence_threshold: 0.7,
            max_low_confidence_attempts: 2,
            ..Default::default()
        }
    }

    #[test]
    fn first_low_confidence_increments() {
        let decision = evaluate_handoff("ok", 0.5, 0, Some("hello"), &settings());
        assert_eq!(decision, HandoffDecision::IncrementLowConfidence);
    }

    #[test]
    fn second_low_confidence_hands_off() {
        let decision = evaluate_handoff("ok", 0.5, 1, Some("hello"), &settings());
        assert_eq!(
            decision,
            HandoffDecision::Handoff {
                reason: "consecutive_low_confidence".to_string()
            }
        );
    }

    #[test]
    fn customer_request_beats_agent_phrases() {
        let decision = evaluate_handoff(
            "Let me escalate this for you",
            0.9,
            0,
            Some("I want to speak to a human now"),
            &settings(),
        );
        assert_eq!(
            decision,
            HandoffDecision::Handoff {
                reason: "customer_requested_human".to_string()
            }
        );
    }

    #[test]
    fn agent_suggested_phrase_fires() {
        let decision = evaluate_handoff(
            "I'll connect you with our team.",
            0.9,
            0,
            Some("my order is late"),
            &settings(),
        );
        assert_eq!(
            decision,
            HandoffDecision::Handoff {
                reason: "agent_suggested_handoff".to_string()
            }
        );
    }

    #[test]
    fn configured_topic_fires() {
        let mut s = settings();
        s.auto_handoff_topics = vec!["warranty claim".into()];
        let decision =
            evaluate_handoff("sure", 0.9, 0, Some("I have a Warranty Claim question"), &s);
        assert_eq!(
            decision,
            HandoffDecision::Handoff {
                reason: "auto_handoff_topic:warranty claim".to_string()
            }
        );
    }

    #[test]
    fn sensitive_keyword_fires() {
        let decision = evaluate_handoff(
            "sorry to hear that",
            0.9,
            0,
            Some("I want a refund right now"),
            &settings(),
        );
        assert_eq!(
            decision,
            HandoffDecision::Handoff {
                reason: "complex_issue:refund".to_string()
            }
        );
    }

    #[test]
    fn calm_turn_continues() {
        let decision = evaluate_handoff(
            "The Blue Shirt costs $29.99.",
            0.9,
            0,
            Some("how much is the blue shirt?"),
            &settings(),
        );
        assert_eq!(decision, HandoffDecision::Continue);
    }
}
