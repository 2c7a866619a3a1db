//! Prompt assembly: a persona-overlaid system prompt plus a sectioned user
//! prompt carrying the assembled context.

use std::fmt::Write as _;

use mercato_context::AgentContext;
use mercato_tenants::settings::{AgentSettings, Tone};

use crate::intent::{Intent, IntentCategory};
use crate::language::language_lock_instruction;

/// Scenario-selected base template; the persona overlay is appended.
fn base_template(top_category: Option<IntentCategory>) -> &'static str {
    match top_category {
        Some(IntentCategory::Urgent) => {
            "You are a customer service AI for a commerce business. The customer has an \
             urgent request. Address it first, directly and calmly, before anything else."
        }
        Some(IntentCategory::Transactional) => {
            "You are a customer service AI for a commerce business. The customer wants to \
             complete a transaction (purchase or booking). Guide them to completion with \
             concrete next steps, confirming details as you go."
        }
        _ => {
            "You are a customer service AI for a commerce business. Answer the customer's \
             questions using ONLY the business information provided in context. Never invent \
             products, services, prices or availability."
        }
    }
}

fn tone_guidance(tone: Tone) -> &'static str {
    match tone {
        Tone::Professional => "Keep a professional, courteous register.",
        Tone::Friendly => "Keep a warm, friendly and approachable register.",
        Tone::Casual => "Keep a relaxed, casual register.",
        Tone::Formal => "Keep a formal, precise register.",
    }
}

/// Compose the system prompt: base template + persona overlay + language lock.
pub fn build_system_prompt(
    settings: &AgentSettings,
    top_category: Option<IntentCategory>,
    language: &str,
) -> String {
    let mut prompt = String::new();
    prompt.push_str(base_template(top_category));

    let _ = write!(prompt, "\n\nYou are '{}'. {}", settings.agent_name, tone_guidance(settings.tone));

    if !settings.persona_traits.is_empty() {
        prompt.push_str("\n\nPersonality:");
        for (trait_name, value) in &settings.persona_traits {
            let _ = write!(prompt, "\n- {trait_name}: {value}");
        }
    }

    if !settings.restrictions.is_empty() {
        prompt.push_str("\n\nYou MUST follow these restrictions:");
        for restriction in &settings.restrictions {
            let _ = write!(prompt, "\n- {restriction}");
        }
    }

    if !settings.disclaimers.is_empty() {
        prompt.push_str("\n\nInclude these disclaimers when relevant:");
        for disclaimer in &settings.disclaimers {
            let _ = write!(prompt, "\n- {disclaimer}");
        }
    }

    let _ = write!(
        prompt,
        "\n\nKeep replies under {} characters.",
        settings.max_response_length
    );
    prompt.push_str(
        "\nIf you are not confident you can answer correctly from the provided context, \
         say so and offer to connect the customer with a human.",
    );

    if !settings.agent_can_do.is_empty() {
        let _ = write!(prompt, "\n\nYou can: {}", settings.agent_can_do);
    }
    if !settings.agent_cannot_do.is_empty() {
        let _ = write!(prompt, "\nYou cannot: {}", settings.agent_cannot_do);
    }

    let _ = write!(prompt, "\n\n{}", language_lock_instruction(language));
    prompt
}

/// Compose the sectioned user prompt from the assembled context.
pub fn build_user_prompt(context: &AgentContext, intents: &[Intent]) -> String {
    let mut prompt = String::new();

    if let Some(summary) = &context.conversation_context.summary {
        let _ = write!(prompt, "## Conversation summary\n{summary}\n\n");
    }

    if !context.conversation_context.key_facts.is_empty() {
        prompt.push_str("## Known facts about this customer\n");
        for fact in &context.conversation_context.key_facts {
            let _ = writeln!(prompt, "- {fact}");
        }
        prompt.push('\n');
    }

    if !context.history.is_empty() {
        prompt.push_str("## Recent conversation\n");
        for message in &context.history {
            let speaker = match message.direction {
                mercato_conversations::types::Direction::In => "Customer",
                mercato_conversations::types::Direction::Out => "Assistant",
            };
            let _ = writeln!(prompt, "{speaker}: {}", message.text);
        }
        prompt.push('\n');
    }

    if !intents.is_empty() {
        prompt.push_str("## Detected intents (priority order)\n");
        for (i, intent) in intents.iter().enumerate() {
            let _ = writeln!(
                prompt,
                "{}. {} (confidence: {:.2})",
                i + 1,
                intent.name,
                intent.confidence
            );
        }
        prompt.push('\n');
    }

    if !context.knowledge.is_empty() {
        prompt.push_str("## Relevant business knowledge\n");
        for scored in &context.knowledge {
            let _ = writeln!(
                prompt,
                "- [{:.2}] {}: {}",
                scored.score, scored.entry.title, scored.entry.content
            );
        }
        prompt.push('\n');
    }

    if !context.products.is_empty() {
        prompt.push_str("## Products\n");
        for product in &context.products {
            let _ = writeln!(
                prompt,
                "- {} — {} {} ({} in stock){}",
                product.title,
                product.currency,
                product.price,
                product.stock,
                product
                    .description
                    .as_deref()
                    .map(|d| format!(": {d}"))
                    .unwrap_or_default(),
            );
        }
        prompt.push('\n');
    }

    if !context.services.is_empty() {
        prompt.push_str("## Services\n");
        for service in &context.services {
            let _ = writeln!(
                prompt,
                "- {} — {} {} ({} min){}",
                service.title,
                service.currency,
                service.price,
                service.duration_minutes,
                service
                    .description
                    .as_deref()
                    .map(|d| format!(": {d}"))
                    .unwrap_or_default(),
            );
        }
        prompt.push('\n');
    }

    if context.customer_history.total_orders > 0 || context.customer_history.total_appointments > 0
    {
        let _ = write!(
            prompt,
            "## Customer history\n{} orders (lifetime spend {}), {} appointments\n\n",
            context.customer_history.total_orders,
            context.customer_history.total_spent,
            context.customer_history.total_appointments,
        );
    }

    if let Some(rag) = &context.rag {
        if !rag.is_empty() {
            prompt.push_str("## Retrieved information\n");
            for passage in rag.all_passages() {
                let _ = writeln!(prompt, "- [{}] {}: {}", passage.source, passage.title, passage.content);
            }
            for note in &rag.synthesis_notes {
                let _ = writeln!(prompt, "- NOTE: {note}");
            }
            prompt.push('\n');
        }
    }

    if let Some(suggestions) = &context.suggestions {
        if !suggestions.is_empty() {
            prompt.push_str("## You may proactively suggest\n");
            for product in &suggestions.products {
                let _ = writeln!(prompt, "- Product: {} ({} {})", product.title, product.currency, product.price);
            }
            for service in &suggestions.services {
                let _ = writeln!(prompt, "- Service: {} ({} {})", service.title, service.currency, service.price);
            }
            prompt.push('\n');
        }
    }

    let _ = write!(prompt, "## Customer message\n{}", context.current_message);
    prompt
}
