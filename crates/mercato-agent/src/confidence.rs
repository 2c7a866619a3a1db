//! Local confidence scoring for a generated reply.

/// Phrases whose presence marks the reply as uncertain.
const UNCERTAINTY_PHRASES: &[&str] = &[
    "i'm not sure",
    "i don't know",
    "i cannot",
    "i'm unable",
    "unclear",
    "uncertain",
];

/// Score a reply: base 0.8; −0.1 when no knowledge was in context; −0.2 when
/// any uncertainty phrase appears; +0.1 when average knowledge similarity
/// exceeds 0.8; clamped to [0, 1].
pub fn score_confidence(reply: &str, knowledge_scores: &[f32]) -> f64 {
    let mut confidence: f64 = 0.8;

    if knowledge_scores.is_empty() {
        confidence -= 0.1;
    }

    let reply_lower = reply.to_lowercase();
    if UNCERTAINTY_PHRASES.iter().any(|p| reply_lower.contains(p)) {
        confidence -= 0.2;
    }

    if !knowledge_scores.is_empty() {
        let avg = knowledge_scores.iter().sum::<f32>() / knowledge_scores.len() as f32;
        if avg > 0.8 {
            confidence += 0.1;
        }
    }

    confidence.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grounded_confident_reply_scores_high() {
        let score = score_confidence("The Blue Shirt costs USD 29.99.", &[0.9, 0.85]);
        assert!((score - 0.9).abs() < 1e-9);
    }

    #[test]
    fn no_knowledge_reduces_score() {
        let score = score_confidence("We open at 9am.", &[]);
        assert!((score - 0.7).abs() < 1e-9);
    }

    #[test]
    fn uncertainty_phrase_reduces_score() {
        let score = score_confidence("I'm not sure about that.", &[0.75]);
        assert!((score - 0.6).abs() < 1e-9);
    }

    #[test]
    fn combined_penalties_stack() {
        let score = score_confidence("I don't know.", &[]);
        assert!((score - 0.5).abs() < 1e-9);
    }

    #[test]
    fn clamped_to_unit_interval() {
        assert!(score_confidence("fine", &[0.99]) <= 1.0);
        assert!(score_confidence("i'm not sure, unclear, i cannot", &[]) >= 0.0);
    }
}
