//! Channel format limits for rich payloads. Carried as a value so different
//! channels can plug their own ceilings in; defaults follow common business
//! messaging constraints.

use mercato_channels::OutboundPayload;

#[derive(Debug, Clone)]
pub struct ChannelLimits {
    pub max_buttons: usize,
    pub max_button_label_chars: usize,
    pub max_list_rows: usize,
    pub max_title_chars: usize,
    pub max_row_description_chars: usize,
    pub max_body_chars: usize,
}

impl Default for ChannelLimits {
    fn default() -> Self {
        Self {
            max_buttons: 3,
            max_button_label_chars: 20,
            max_list_rows: 10,
            max_title_chars: 24,
            max_row_description_chars: 72,
            max_body_chars: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitViolation(pub String);

impl std::fmt::Display for LimitViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl ChannelLimits {
    /// Check a payload against this channel's format ceilings.
    pub fn validate(&self, payload: &OutboundPayload) -> Result<(), LimitViolation> {
        match payload {
            OutboundPayload::Text { .. } => Ok(()),
            OutboundPayload::Buttons { body, buttons } => {
                if buttons.is_empty() || buttons.len() > self.max_buttons {
                    return Err(LimitViolation(format!(
                        "button count {} outside 1..={}",
                        buttons.len(),
                        self.max_buttons
                    )));
                }
                for button in buttons {
                    if button.label.chars().count() > self.max_button_label_chars {
                        return Err(LimitViolation(format!(
                            "button label '{}' exceeds {} chars",
                            button.label, self.max_button_label_chars
                        )));
                    }
                }
                if body.chars().count() > self.max_body_chars {
                    return Err(LimitViolation("body exceeds channel limit".into()));
                }
                Ok(())
            }
            OutboundPayload::List {
                title,
                body,
                sections,
                ..
            } => {
                if title.chars().count() > self.max_title_chars {
                    return Err(LimitViolation(format!(
                        "list title exceeds {} chars",
                        self.max_title_chars
                    )));
                }
                if body.chars().count() > self.max_body_chars {
                    return Err(LimitViolation("body exceeds channel limit".into()));
                }
                let row_count: usize = sections.iter().map(|s| s.rows.len()).sum();
                if row_count == 0 || row_count > self.max_list_rows {
                    return Err(LimitViolation(format!(
                        "list row count {} outside 1..={}",
                        row_count, self.max_list_rows
                    )));
                }
                for section in sections {
                    for row in &section.rows {
                        if row.title.chars().count() > self.max_title_chars {
                            return Err(LimitViolation(format!(
                                "row title '{}' exceeds {} chars",
                                row.title, self.max_title_chars
                            )));
                        }
                        if let Some(description) = &row.description {
                            if description.chars().count() > self.max_row_description_chars {
                                return Err(LimitViolation(
                                    "row description exceeds channel limit".into(),
                                ));
                            }
                        }
                    }
                }
                Ok(())
            }
            OutboundPayload::MediaCard {
                caption, buttons, ..
            } => {
                if caption.chars().count() > self.max_body_chars {
                    return Err(LimitViolation("caption exceeds channel limit".into()));
                }
                if buttons.len() > self.max_buttons {
                    return Err(LimitViolation(format!(
                        "button count {} exceeds {}",
                        buttons.len(),
                        self.max_buttons
                    )));
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mercato_channels::types::Button;

    #[test]
    fn four_buttons_rejected() {
        let limits = ChannelLimits::default();
        let payload = OutboundPayload::Buttons {
            body: "pick one".into(),
            buttons: (0..4)
                .map(|i| Button {
                    id: format!("b{i}"),
                    label: format!("Option {i}"),
                })
                .collect(),
        };
        assert!(limits.validate(&payload).is_err());
    }

    #[test]
    fn long_title_rejected() {
        let limits = ChannelLimits::default();
        let payload = OutboundPayload::List {
            title: "x".repeat(25),
            body: "pick".into(),
            button_label: "Select".into(),
            sections: vec![],
        };
        assert!(limits.validate(&payload).is_err());
    }

    #[test]
    fn plain_text_always_valid() {
        let limits = ChannelLimits::default();
        let payload = OutboundPayload::Text {
            body: "y".repeat(5000),
        };
        assert!(limits.validate(&payload).is_ok());
    }
}
