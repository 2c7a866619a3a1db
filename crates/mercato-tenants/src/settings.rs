//! Per-tenant agent configuration: persona, routing, thresholds, toggles.
//!
//! The full structure is stored as one JSON column with a separate version
//! counter; reading back yields a structurally equal value after defaulting.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TenantError};

/// Reply register the persona writes in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Tone {
    Professional,
    #[default]
    Friendly,
    Casual,
    Formal,
}

/// How often the agent asks for feedback after answering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackFrequency {
    Never,
    #[default]
    Sometimes,
    Always,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    pub agent_name: String,
    /// trait -> value, e.g. "warmth" -> "high".
    pub persona_traits: std::collections::BTreeMap<String, String>,
    pub tone: Tone,
    pub default_model: String,
    /// Ordered (provider, model) fallback chain tried after the primary.
    pub fallback_models: Vec<(String, String)>,
    pub temperature: f64,
    pub max_response_length: u32,
    /// Ordered behavioural restrictions injected into the system prompt.
    pub restrictions: Vec<String>,
    /// Ordered disclaimers that must appear; never truncated from context.
    pub disclaimers: Vec<String>,
    pub confidence_threshold: f64,
    pub auto_handoff_topics: Vec<String>,
    pub max_low_confidence_attempts: u32,
    pub enable_proactive_suggestions: bool,
    pub enable_spelling_correction: bool,
    pub enable_rich_messages: bool,
    pub enable_document_retrieval: bool,
    pub enable_database_retrieval: bool,
    pub enable_internet_retrieval: bool,
    pub enable_source_attribution: bool,
    pub enable_feedback_collection: bool,
    pub feedback_frequency: FeedbackFrequency,
    pub agent_can_do: String,
    pub agent_cannot_do: String,
    pub max_document_results: u32,
    pub max_database_results: u32,
    pub max_internet_results: u32,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            agent_name: "Assistant".to_string(),
            persona_traits: Default::default(),
            tone: Tone::default(),
            default_model: "gpt-4o".to_string(),
            fallback_models: vec![
                ("gemini".to_string(), "gemini-1.5-pro".to_string()),
                ("openai".to_string(), "gpt-4o-mini".to_string()),
                ("gemini".to_string(), "gemini-1.5-flash".to_string()),
            ],
            temperature: 0.7,
            max_response_length: 500,
            restrictions: Vec::new(),
            disclaimers: Vec::new(),
            confidence_threshold: 0.7,
            auto_handoff_topics: Vec::new(),
            max_low_confidence_attempts: 2,
            enable_proactive_suggestions: true,
            enable_spelling_correction: true,
            enable_rich_messages: true,
            enable_document_retrieval: false,
            enable_database_retrieval: true,
            enable_internet_retrieval: false,
            enable_source_attribution: false,
            enable_feedback_collection: false,
            feedback_frequency: FeedbackFrequency::default(),
            agent_can_do: String::new(),
            agent_cannot_do: String::new(),
            max_document_results: 5,
            max_database_results: 10,
            max_internet_results: 3,
        }
    }
}

impl AgentSettings {
    /// Validate ranges before a create or update is persisted.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(TenantError::Validation(
                "temperature must be between 0.0 and 2.0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(TenantError::Validation(
                "confidence threshold must be between 0.0 and 1.0".into(),
            ));
        }
        if !(50..=2000).contains(&self.max_response_length) {
            return Err(TenantError::Validation(
                "max response length must be between 50 and 2000".into(),
            ));
        }
        if !(1..=10).contains(&self.max_low_confidence_attempts) {
            return Err(TenantError::Validation(
                "max low confidence attempts must be between 1 and 10".into(),
            ));
        }
        Ok(())
    }

    /// Per-source retrieval cap for the RAG fan-out.
    pub fn source_cap(&self, source: &str) -> u32 {
        match source {
            "documents" => self.max_document_results,
            "database" => self.max_database_results,
            "internet" => self.max_internet_results,
            _ => 0,
        }
    }
}

/// A persisted configuration row: settings JSON plus a version bumped on
/// every validated update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionedSettings {
    pub settings: AgentSettings,
    pub version: u32,
    pub updated_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_temperatures_accepted() {
        let mut s = AgentSettings {
            temperature: 0.0,
            ..Default::default()
        };
        assert!(s.validate().is_ok());
        s.temperature = 2.0;
        assert!(s.validate().is_ok());
        s.temperature = 2.01;
        assert!(s.validate().is_err());
        s.temperature = -0.1;
        assert!(s.validate().is_err());
    }

    #[test]
    fn response_length_range() {
        let mut s = AgentSettings {
            max_response_length: 50,
            ..Default::default()
        };
        assert!(s.validate().is_ok());
        s.max_response_length = 2000;
        assert!(s.validate().is_ok());
        s.max_response_length = 49;
        assert!(s.validate().is_err());
        s.max_response_length = 2001;
        assert!(s.validate().is_err());
    }

    #[test]
    fn json_round_trip_is_structural_identity() {
        let s = AgentSettings {
            agent_name: "Amina".into(),
            auto_handoff_topics: vec!["warranty claim".into()],
            ..Default::default()
        };
        let json = serde_json::to_string(&s).unwrap();
        let back: AgentSettings = serde_json::from_str(&json).unwrap();
        assert_eq!(s, back);
    }

    #[test]
    fn partial_json_defaults_unspecified_fields() {
        let back: AgentSettings = serde_json::from_str(r#"{"agent_name":"Zuri"}"#).unwrap();
        assert_eq!(back.agent_name, "Zuri");
        assert_eq!(back.confidence_threshold, 0.7);
        assert_eq!(back.max_low_confidence_attempts, 2);
    }
}
