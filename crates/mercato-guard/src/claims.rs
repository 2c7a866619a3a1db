//! Factual-claim extraction from a prospective reply. Sentences are
//! classified in a fixed order; existence checks run before feature checks
//! so "we have products" is not mistaken for a feature claim.

use regex::Regex;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimKind {
    Price,
    Availability,
    Existence,
    Feature,
}

#[derive(Debug, Clone)]
pub struct Claim {
    pub text: String,
    pub kind: ClaimKind,
}

pub(crate) fn price_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)(?:costs?|priced? at|is|are)\s+(?:about\s+)?(?:KES|USD|EUR|GBP|\$|€|£)?\s*(\d+(?:,\d{3})*(?:\.\d{2})?)",
        )
        .expect("valid regex")
    })
}

pub(crate) fn stock_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(?:in stock|available|have|has)\s+(\d+)").expect("valid regex")
    })
}

pub(crate) fn availability_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(?:is|are)\s+(?:currently\s+)?(?:available|in stock|out of stock|unavailable)")
            .expect("valid regex")
    })
}

pub(crate) fn feature_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(?:has|have|includes?|comes? with|features?)\s+([^.!?]+)")
            .expect("valid regex")
    })
}

const EXISTENCE_MARKERS: &[&str] = &["we have", "we offer", "we sell"];

/// Split a reply into sentences and keep those making factual claims.
pub fn extract_claims(response: &str) -> Vec<Claim> {
    response
        .split(['.', '!', '?'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|sentence| {
            let lower = sentence.to_lowercase();
            let kind = if price_re().is_match(sentence) {
                ClaimKind::Price
            } else if stock_re().is_match(sentence) || availability_re().is_match(sentence) {
                ClaimKind::Availability
            } else if EXISTENCE_MARKERS.iter().any(|m| lower.contains(m)) {
                ClaimKind::Existence
            } else if feature_re().is_match(sentence) {
                ClaimKind::Feature
            } else {
                return None;
            };
            Some(Claim {
                text: sentence.to_string(),
                kind,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_sentence_detected() {
        let claims = extract_claims("The Blue Shirt costs $29.99.");
        assert_eq!(claims.len(), 1);
        assert_eq!(claims[0].kind, ClaimKind::Price);
    }

    #[test]
    fn availability_sentence_detected() {
        let claims = extract_claims("The Blue Shirt is currently in stock!");
        assert_eq!(claims[0].kind, ClaimKind::Availability);
    }

    #[test]
    fn existence_beats_feature_classification() {
        // "we have products" must not be classified as a feature claim.
        let claims = extract_claims("We have products for every budget.");
        assert_eq!(claims[0].kind, ClaimKind::Existence);
    }

    #[test]
    fn feature_sentence_detected() {
        let claims = extract_claims("The Blue Shirt comes with a two-year warranty.");
        assert_eq!(claims[0].kind, ClaimKind::Feature);
    }

    #[test]
    fn chit_chat_yields_no_claims() {
        assert!(extract_claims("Hello! How can I help you today?").is_empty());
    }

    #[test]
    fn multiple_sentences_multiple_claims() {
        let claims =
            extract_claims("The Blue Shirt costs $29.99. It is available. Anything else?");
        assert_eq!(claims.len(), 2);
        assert_eq!(claims[0].kind, ClaimKind::Price);
        assert_eq!(claims[1].kind, ClaimKind::Availability);
    }
}
