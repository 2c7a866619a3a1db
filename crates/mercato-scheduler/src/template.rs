//! `{{placeholder}}` template rendering from a stored context map.
//! Unknown placeholders are left intact so missing context is visible in
//! review rather than silently blanked.

pub fn render(template: &str, context: &serde_json::Value) -> String {
    let Some(map) = context.as_object() else {
        return template.to_string();
    };
    let mut out = template.to_string();
    for (key, value) in map {
        let needle = format!("{{{{{key}}}}}");
        let replacement = match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        out = out.replace(&needle, &replacement);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn substitutes_known_placeholders() {
        let rendered = render(
            "Hi {{customer_name}}, your {{service}} is tomorrow at {{time}}.",
            &json!({ "customer_name": "Wanjiku", "service": "haircut", "time": "10am" }),
        );
        assert_eq!(rendered, "Hi Wanjiku, your haircut is tomorrow at 10am.");
    }

    #[test]
    fn unknown_placeholders_survive() {
        let rendered = render("Hi {{customer_name}}!", &json!({}));
        assert_eq!(rendered, "Hi {{customer_name}}!");
    }

    #[test]
    fn non_string_values_render() {
        let rendered = render("You have {{points}} points.", &json!({ "points": 42 }));
        assert_eq!(rendered, "You have 42 points.");
    }
}
