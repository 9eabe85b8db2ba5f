//! System prompts for the two agent phases.

use crate::config::{Config, Sensitivity};
use crate::models::KnowledgeFile;
use crate::provider::ChatMessage;
use crate::tools::ToolOutcome;

/// Prior turns included in the routing call.
pub const ROUTING_HISTORY: usize = 10;
/// Prior turns included in the synthesis and greeting calls.
pub const SYNTHESIS_HISTORY: usize = 6;

pub const GREETING_MARKER: &str = "[greeting]";
pub const OFF_TOPIC_MARKER: &str = "[off_topic]";

/// System prompt, the tail of `history`, then the user's message.
pub fn with_history(
    system: String,
    history: &[ChatMessage],
    keep: usize,
    user_message: &str,
) -> Vec<ChatMessage> {
    let start = history.len().saturating_sub(keep);
    let mut messages = Vec::with_capacity(history.len() - start + 2);
    messages.push(ChatMessage::system(system));
    messages.extend(history[start..].iter().cloned());
    messages.push(ChatMessage::user(user_message));
    messages
}

fn escalation_policy(sensitivity: Sensitivity) -> &'static str {
    match sensitivity {
        Sensitivity::Low => concat!(
            "   STRICT: Only escalate when the user explicitly and firmly demands a human, person, agent, or representative.\n",
            "   Phrases like \"I need help\", \"can you help\", \"this isn't working\" are NOT escalation requests. Always try to help first.\n",
            "   Even repeated frustration is not enough: the user must clearly say they want a human.\n\n",
        ),
        Sensitivity::Medium => concat!(
            "   BALANCED: Escalate when the user clearly asks for human help (e.g. \"talk to someone\", \"connect me to support\", \"I want a real person\").\n",
            "   \"I need help\" or \"can you help me\" is NOT a request for a human. Try to help first.\n",
            "   If you've tried to help and the user is still unsatisfied and asks again, then escalate.\n\n",
        ),
        Sensitivity::High => concat!(
            "   SENSITIVE: Escalate when the user asks for a human OR seems frustrated, dissatisfied, or you've failed to answer their question after the conversation shows repeated attempts.\n",
            "   Signs to escalate: repeated complaints, expressions of frustration (\"this is useless\", \"you're not helping\"), or saying \"I need help\" after you already tried.\n",
            "   Still try to help first on the initial ask. Don't escalate on the very first message.\n\n",
        ),
    }
}

/// Classification and tool-selection prompt.
///
/// `files` should be the ready knowledge files; they are listed by name so
/// the model knows what the knowledge base covers.
pub fn routing_prompt(config: &Config, files: &[KnowledgeFile], page_url: Option<&str>) -> String {
    let mut prompt = format!(
        "You are a routing assistant for {}. Your job is to classify the user's message and call the right tools.\n\n",
        config.agent.name
    );

    prompt.push_str("MESSAGE CLASSIFICATION (pick ONE):\n\n");
    prompt.push_str("A) GREETING or casual message (\"hello\", \"hi\", \"thanks\", \"how are you\", etc.)\n");
    prompt.push_str("   → Respond with exactly: [GREETING]\n");
    prompt.push_str("   Do NOT call any tools for greetings or pleasantries.\n\n");
    prompt.push_str("B) QUESTION or request that needs information\n");
    prompt.push_str("   → Call one or more tools to gather the information. Do NOT answer directly.\n\n");
    prompt.push_str("C) OFF-TOPIC or DISALLOWED topic\n");
    prompt.push_str("   → Respond with exactly: [OFF_TOPIC]\n\n");

    if config.escalation.enabled {
        prompt.push_str("D) User wants to be connected to a human\n");
        prompt.push_str("   → Call the escalate tool.\n");
        prompt.push_str(escalation_policy(config.escalation.sensitivity));
    }

    if !files.is_empty() {
        prompt.push_str("KNOWLEDGE BASE FILES AVAILABLE:\n");
        for file in files {
            prompt.push_str(&format!(
                "- {} ({} chunks)\n",
                file.original_name, file.chunk_count
            ));
        }
        prompt.push('\n');
    }

    let restrictions = &config.restrictions;
    if !restrictions.allowed_topics.trim().is_empty() {
        prompt.push_str(&format!(
            "ALLOWED TOPICS (only these are on-topic):\n{}\n\n",
            restrictions.allowed_topics.trim()
        ));
    }
    if !restrictions.disallowed_topics.trim().is_empty() {
        prompt.push_str(&format!(
            "DISALLOWED TOPICS (refuse these and classify as OFF-TOPIC):\n{}\n\n",
            restrictions.disallowed_topics.trim()
        ));
    }

    prompt.push_str("TOOL SELECTION RULES (for category B messages):\n");
    prompt.push_str("1. For questions that could be answered by documents, call search_knowledge_base. This is your PRIMARY source.\n");
    prompt.push_str("2. Also call get_business_info if asking about the company, contact info, hours, etc.\n");
    prompt.push_str("3. Also call get_page_context if the question relates to the current page.\n");
    prompt.push_str("4. Call list_knowledge_topics if unsure what information is available.\n");
    prompt.push_str("5. You CAN call multiple tools in a single response.\n");
    prompt.push_str("6. When in doubt, call search_knowledge_base. It is better to search and find nothing than to skip it.\n");

    if let Some(url) = page_url.filter(|u| !u.is_empty()) {
        prompt.push_str(&format!("\nThe user is currently on page: {}", url));
    }
    prompt
}

/// Answer prompt grounded on the tool results, each labeled by tool name.
pub fn synthesis_prompt(config: &Config, outcomes: &[ToolOutcome], page_url: Option<&str>) -> String {
    let context = outcomes
        .iter()
        .map(|o| format!("--- Tool: {} ---\n{}", o.name, o.result))
        .collect::<Vec<_>>()
        .join("\n\n");

    let mut prompt = format!("You are {}. {}\n\n", config.agent.name, config.agent.persona);
    prompt.push_str("Use the following context to answer the user's question. ");
    prompt.push_str("If the context doesn't contain relevant information, say so honestly.\n\n");
    prompt.push_str("CONTEXT:\n");
    prompt.push_str(&context);

    if let Some(url) = page_url.filter(|u| !u.is_empty()) {
        prompt.push_str(&format!("\n\nThe user is currently on page: {}", url));
    }
    prompt
}

pub fn greeting_prompt(config: &Config) -> String {
    format!(
        "You are {}. {}\n\
         The user sent a greeting or casual message. Respond warmly and briefly, then offer to help.\n\
         Keep your response short, 1-2 sentences max. Be friendly and natural.",
        config.agent.name, config.agent.persona
    )
}
