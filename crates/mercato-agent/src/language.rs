//! Lightweight language detection over the tenant's allowed languages,
//! used to inject a language-lock instruction into the system prompt.

use std::collections::HashMap;

/// Per-language stopword lists; detection is a vote over word hits.
fn stopwords() -> HashMap<&'static str, &'static [&'static str]> {
    let mut map: HashMap<&'static str, &'static [&'static str]> = HashMap::new();
    map.insert(
        "en",
        &[
            "the", "is", "are", "do", "you", "i", "want", "how", "much", "can", "what", "please",
            "thanks", "hello", "have", "a", "to", "for",
        ][..],
    );
    map.insert(
        "sw",
        &[
            "habari", "nataka", "bei", "gani", "asante", "ndiyo", "hapana", "sasa", "kwa", "na",
            "ni", "je", "kiasi", "tafadhali", "karibu", "mambo",
        ][..],
    );
    map.insert(
        "es",
        &[
            "el", "la", "es", "quiero", "cuanto", "cuánto", "gracias", "hola", "por", "favor",
            "que", "qué", "como", "cómo", "tienes", "precio",
        ][..],
    );
    map.insert(
        "fr",
        &[
            "le", "la", "est", "je", "veux", "combien", "merci", "bonjour", "pour", "que",
            "comment", "vous", "avez", "prix", "s'il",
        ][..],
    );
    map
}

/// Detect the customer's language among the tenant's allowed list.
/// Falls back to the first allowed language when nothing scores.
pub fn detect_language(text: &str, allowed: &[String]) -> String {
    let default = allowed
        .first()
        .cloned()
        .unwrap_or_else(|| "en".to_string());
    if allowed.len() <= 1 {
        return default;
    }

    let words: Vec<String> = text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '\'')
        .filter(|w| !w.is_empty())
        .map(String::from)
        .collect();
    if words.is_empty() {
        return default;
    }

    let lists = stopwords();
    let mut best = (default.clone(), 0usize);
    for lang in allowed {
        let Some(list) = lists.get(lang.as_str()) else {
            continue;
        };
        let hits = words.iter().filter(|w| list.contains(&w.as_str())).count();
        if hits > best.1 {
            best = (lang.clone(), hits);
        }
    }
    best.0
}

/// The instruction injected into the system prompt to lock the reply
/// language to the customer's.
pub fn language_lock_instruction(language: &str) -> String {
    format!(
        "IMPORTANT: The customer is writing in '{language}'. Reply ONLY in '{language}', \
         even if context or knowledge entries are in another language."
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allowed() -> Vec<String> {
        vec!["en".into(), "sw".into()]
    }

    #[test]
    fn detects_swahili() {
        assert_eq!(
            detect_language("habari, nataka kujua bei gani ya shampoo", &allowed()),
            "sw"
        );
    }

    #[test]
    fn detects_english() {
        assert_eq!(
            detect_language("hello, how much is the shampoo?", &allowed()),
            "en"
        );
    }

    #[test]
    fn single_allowed_language_short_circuits() {
        assert_eq!(detect_language("bonjour", &["en".to_string()]), "en");
    }

    #[test]
    fn empty_text_falls_back_to_first() {
        assert_eq!(detect_language("", &allowed()), "en");
    }
}
