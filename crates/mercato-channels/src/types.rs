use serde::{Deserialize, Serialize};

/// What the core asks the channel gateway to deliver. The gateway owns the
/// wire encoding; these variants are the contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum OutboundPayload {
    Text {
        body: String,
    },
    /// Up to three quick-reply buttons.
    Buttons {
        body: String,
        buttons: Vec<Button>,
    },
    /// A titled list of selectable rows grouped into sections.
    List {
        title: String,
        body: String,
        button_label: String,
        sections: Vec<ListSection>,
    },
    /// Media card with a caption and optional buttons.
    MediaCard {
        media_url: String,
        caption: String,
        buttons: Vec<Button>,
    },
}

impl OutboundPayload {
    /// The plain text a payload degrades to when rich delivery is impossible.
    pub fn text_body(&self) -> &str {
        match self {
            OutboundPayload::Text { body } => body,
            OutboundPayload::Buttons { body, .. } => body,
            OutboundPayload::List { body, .. } => body,
            OutboundPayload::MediaCard { caption, .. } => caption,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Button {
    pub id: String,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListSection {
    pub title: String,
    pub rows: Vec<ListRow>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListRow {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
}

/// Gateway acknowledgement for an accepted send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendReceipt {
    pub provider_message_id: String,
    pub accepted_status: String,
}
