//! TOML configuration.
//!
//! A single [`Config`] value is loaded once at startup, wrapped in an
//! `Arc`, and threaded into every component. Nothing reads settings from
//! ambient global state.
//!
//! ```toml
//! [db]
//! path = "./data/sitechat.sqlite"
//!
//! [storage]
//! blob_dir = "./data/blobs"
//!
//! [agent]
//! enabled = true
//! provider = "openai"
//!
//! [server]
//! bind = "127.0.0.1:8080"
//! ```
//!
//! Every other table is optional and falls back to the defaults below.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub restrictions: RestrictionsConfig,
    #[serde(default)]
    pub escalation: EscalationConfig,
    #[serde(default)]
    pub business: BusinessConfig,
    #[serde(default)]
    pub widget: WidgetConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub blob_dir: PathBuf,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
}

fn default_max_file_bytes() -> u64 {
    10 * 1024 * 1024
}

// ============ Agent ============

/// Which chat-completion vendor backs the agent.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Openai,
    Anthropic,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Openai => "openai",
            ProviderKind::Anthropic => "anthropic",
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_provider")]
    pub provider: ProviderKind,
    #[serde(default = "default_openai_model")]
    pub openai_model: String,
    #[serde(default = "default_anthropic_model")]
    pub anthropic_model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_routing_temperature")]
    pub routing_temperature: f32,
    #[serde(default = "default_agent_name")]
    pub name: String,
    #[serde(default = "default_persona")]
    pub persona: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: default_provider(),
            openai_model: default_openai_model(),
            anthropic_model: default_anthropic_model(),
            api_key: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            routing_temperature: default_routing_temperature(),
            name: default_agent_name(),
            persona: default_persona(),
            request_timeout_secs: default_request_timeout_secs(),
            tool_timeout_secs: default_tool_timeout_secs(),
        }
    }
}

fn default_provider() -> ProviderKind {
    ProviderKind::Openai
}
fn default_openai_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_anthropic_model() -> String {
    "claude-3-5-sonnet-latest".to_string()
}
fn default_max_tokens() -> u32 {
    1024
}
fn default_temperature() -> f32 {
    0.7
}
fn default_routing_temperature() -> f32 {
    0.3
}
fn default_agent_name() -> String {
    "AI Assistant".to_string()
}
fn default_persona() -> String {
    "You are a helpful assistant. Answer questions clearly and concisely based on the provided context."
        .to_string()
}
fn default_request_timeout_secs() -> u64 {
    60
}
fn default_tool_timeout_secs() -> u64 {
    15
}

impl AgentConfig {
    /// Model name for the selected vendor.
    pub fn model(&self) -> &str {
        match self.provider {
            ProviderKind::Openai => &self.openai_model,
            ProviderKind::Anthropic => &self.anthropic_model,
        }
    }

    /// Chat credential: the configured key, else the vendor's environment variable.
    pub fn resolve_api_key(&self) -> Option<String> {
        let env_var = match self.provider {
            ProviderKind::Openai => "OPENAI_API_KEY",
            ProviderKind::Anthropic => "ANTHROPIC_API_KEY",
        };
        non_empty(self.api_key.clone()).or_else(|| non_empty(std::env::var(env_var).ok()))
    }

    /// Enabled and holding a credential.
    pub fn is_configured(&self) -> bool {
        self.enabled && self.resolve_api_key().is_some()
    }
}

// ============ Embedding / chunking / retrieval ============

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Extra attempts per batch on 429, 5xx, or network failure.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: default_embedding_model(),
            batch_size: default_batch_size(),
            concurrency: default_concurrency(),
            max_retries: default_max_retries(),
            api_key: None,
        }
    }
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_batch_size() -> usize {
    20
}
fn default_concurrency() -> usize {
    4
}
fn default_max_retries() -> u32 {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_tokens")]
    pub chunk_tokens: usize,
    #[serde(default = "default_overlap_words")]
    pub overlap_words: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_tokens: default_chunk_tokens(),
            overlap_words: default_overlap_words(),
        }
    }
}

fn default_chunk_tokens() -> usize {
    500
}
fn default_overlap_words() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_limit")]
    pub default_limit: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
        }
    }
}

fn default_limit() -> usize {
    5
}

// ============ Restrictions / escalation / business ============

#[derive(Debug, Deserialize, Clone)]
pub struct RestrictionsConfig {
    #[serde(default)]
    pub allowed_topics: String,
    #[serde(default)]
    pub disallowed_topics: String,
    #[serde(default = "default_fallback_message")]
    pub fallback_message: String,
    #[serde(default = "default_error_message")]
    pub error_message: String,
    #[serde(default = "default_max_messages")]
    pub max_messages_per_conversation: i64,
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_minute: i64,
}

impl Default for RestrictionsConfig {
    fn default() -> Self {
        Self {
            allowed_topics: String::new(),
            disallowed_topics: String::new(),
            fallback_message: default_fallback_message(),
            error_message: default_error_message(),
            max_messages_per_conversation: default_max_messages(),
            rate_limit_per_minute: default_rate_limit(),
        }
    }
}

fn default_fallback_message() -> String {
    "I'm sorry, I can only help with topics related to this website. Is there anything else I can assist you with?"
        .to_string()
}
fn default_error_message() -> String {
    "I'm sorry, something went wrong. Please try again later.".to_string()
}
fn default_max_messages() -> i64 {
    50
}
fn default_rate_limit() -> i64 {
    10
}

/// How eagerly the router should reach for the `escalate` tool.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Sensitivity {
    /// Strict: only on an explicit, firm demand for a human.
    Low,
    /// Balanced: when the user clearly asks for human help.
    Medium,
    /// Sensitive: also on visible frustration after repeated attempts.
    High,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy)]
pub struct EscalationFields {
    #[serde(default = "default_true")]
    pub name: bool,
    #[serde(default = "default_true")]
    pub email: bool,
    #[serde(default)]
    pub phone: bool,
}

impl Default for EscalationFields {
    fn default() -> Self {
        Self {
            name: true,
            email: true,
            phone: false,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct EscalationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_sensitivity")]
    pub sensitivity: Sensitivity,
    #[serde(default = "default_escalation_message")]
    pub message: String,
    #[serde(default)]
    pub fields: EscalationFields,
    #[serde(default)]
    pub custom_questions: Vec<String>,
    #[serde(default = "default_confirmation")]
    pub confirmation: String,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sensitivity: default_sensitivity(),
            message: default_escalation_message(),
            fields: EscalationFields::default(),
            custom_questions: Vec::new(),
            confirmation: default_confirmation(),
        }
    }
}

fn default_sensitivity() -> Sensitivity {
    Sensitivity::Medium
}
fn default_escalation_message() -> String {
    "It looks like you'd like to speak with a person. Leave your details and we'll get back to you."
        .to_string()
}
fn default_confirmation() -> String {
    "Thank you! A team member will reach out to you shortly.".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct BusinessConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub contact: String,
    #[serde(default)]
    pub hours: String,
    #[serde(default)]
    pub extra: String,
}

// ============ Widget ============

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ThemeConfig {
    #[serde(default = "default_primary_color")]
    pub primary_color: String,
    #[serde(default = "default_secondary_color")]
    pub secondary_color: String,
    #[serde(default = "default_background_color")]
    pub background_color: String,
    #[serde(default = "default_text_color")]
    pub text_color: String,
    #[serde(default = "default_font_family")]
    pub font_family: String,
}

impl Default for ThemeConfig {
    fn default() -> Self {
        Self {
            primary_color: default_primary_color(),
            secondary_color: default_secondary_color(),
            background_color: default_background_color(),
            text_color: default_text_color(),
            font_family: default_font_family(),
        }
    }
}

fn default_primary_color() -> String {
    "#2563eb".to_string()
}
fn default_secondary_color() -> String {
    "#1e40af".to_string()
}
fn default_background_color() -> String {
    "#ffffff".to_string()
}
fn default_text_color() -> String {
    "#1f2937".to_string()
}
fn default_font_family() -> String {
    "system-ui, sans-serif".to_string()
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PageRuleKind {
    Include,
    Exclude,
}

/// URL pattern that shows or hides the widget on matching pages.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PageRule {
    pub pattern: String,
    pub rule: PageRuleKind,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WidgetConfig {
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default = "default_welcome_message")]
    pub welcome_message: String,
    #[serde(default = "default_placeholder")]
    pub placeholder_text: String,
    #[serde(default = "default_position")]
    pub position: String,
    #[serde(default)]
    pub theme: ThemeConfig,
    #[serde(default)]
    pub custom_css: String,
    #[serde(default)]
    pub custom_js: String,
    #[serde(default)]
    pub page_rules: Vec<PageRule>,
}

impl Default for WidgetConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            avatar_url: None,
            welcome_message: default_welcome_message(),
            placeholder_text: default_placeholder(),
            position: default_position(),
            theme: ThemeConfig::default(),
            custom_css: String::new(),
            custom_js: String::new(),
            page_rules: Vec::new(),
        }
    }
}

fn default_welcome_message() -> String {
    "Hi! How can I help you today?".to_string()
}
fn default_placeholder() -> String {
    "Type your message...".to_string()
}
fn default_position() -> String {
    "bottom-right".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
    #[serde(default)]
    pub admin_token: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl EmbeddingConfig {
    /// Embedding credential. Embeddings always go to the OpenAI endpoint,
    /// so an Anthropic chat key is never used here.
    pub fn resolve_api_key(&self, agent: &AgentConfig) -> Option<String> {
        non_empty(self.api_key.clone())
            .or_else(|| non_empty(std::env::var("OPENAI_API_KEY").ok()))
            .or_else(|| match agent.provider {
                ProviderKind::Openai => non_empty(agent.api_key.clone()),
                ProviderKind::Anthropic => None,
            })
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate configuration text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    if config.chunking.chunk_tokens == 0 {
        anyhow::bail!("chunking.chunk_tokens must be > 0");
    }
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }
    if config.embedding.concurrency == 0 {
        anyhow::bail!("embedding.concurrency must be > 0");
    }
    if config.retrieval.default_limit == 0 {
        anyhow::bail!("retrieval.default_limit must be > 0");
    }
    for (key, t) in [
        ("agent.temperature", config.agent.temperature),
        ("agent.routing_temperature", config.agent.routing_temperature),
    ] {
        if !(0.0..=2.0).contains(&t) {
            anyhow::bail!("{} must be in [0.0, 2.0]", key);
        }
    }
    if config.agent.max_tokens == 0 {
        anyhow::bail!("agent.max_tokens must be > 0");
    }
    if config.restrictions.rate_limit_per_minute < 1 {
        anyhow::bail!("restrictions.rate_limit_per_minute must be >= 1");
    }
    if config.restrictions.max_messages_per_conversation < 1 {
        anyhow::bail!("restrictions.max_messages_per_conversation must be >= 1");
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[db]
path = "/tmp/sitechat.sqlite"

[storage]
blob_dir = "/tmp/blobs"

[server]
bind = "127.0.0.1:8080"
"#;

    #[test]
    fn test_example_config_parses() {
        let config = parse_config(include_str!("../config/sitechat.example.toml")).unwrap();
        assert!(config.agent.enabled);
        assert_eq!(config.chunking.chunk_tokens, 500);
        assert_eq!(config.escalation.sensitivity, Sensitivity::Medium);
        assert!(config.server.admin_token.is_none());
    }

    #[test]
    fn test_minimal_config_defaults() {
        let config = parse_config(MINIMAL).unwrap();
        assert!(!config.agent.enabled);
        assert_eq!(config.agent.provider, ProviderKind::Openai);
        assert_eq!(config.agent.model(), "gpt-4o-mini");
        assert_eq!(config.agent.max_tokens, 1024);
        assert_eq!(config.chunking.chunk_tokens, 500);
        assert_eq!(config.chunking.overlap_words, 50);
        assert_eq!(config.embedding.batch_size, 20);
        assert_eq!(config.embedding.model, "text-embedding-3-small");
        assert_eq!(config.restrictions.rate_limit_per_minute, 10);
        assert_eq!(config.restrictions.max_messages_per_conversation, 50);
        assert_eq!(config.escalation.sensitivity, Sensitivity::Medium);
        assert!(config.escalation.enabled);
        assert_eq!(config.storage.max_file_bytes, 10 * 1024 * 1024);
    }

    #[test]
    fn test_anthropic_model_selection() {
        let text = format!("{}\n[agent]\nprovider = \"anthropic\"\n", MINIMAL);
        let config = parse_config(&text).unwrap();
        assert_eq!(config.agent.model(), "claude-3-5-sonnet-latest");
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let text = format!("{}\n[agent]\nprovider = \"mistral\"\n", MINIMAL);
        assert!(parse_config(&text).is_err());
    }

    #[test]
    fn test_unknown_sensitivity_rejected() {
        let text = format!("{}\n[escalation]\nsensitivity = \"extreme\"\n", MINIMAL);
        assert!(parse_config(&text).is_err());
    }

    #[test]
    fn test_zero_chunk_tokens_rejected() {
        let text = format!("{}\n[chunking]\nchunk_tokens = 0\n", MINIMAL);
        let err = parse_config(&text).unwrap_err();
        assert!(err.to_string().contains("chunk_tokens"));
    }

    #[test]
    fn test_temperature_out_of_range_rejected() {
        let text = format!("{}\n[agent]\ntemperature = 3.5\n", MINIMAL);
        assert!(parse_config(&text).is_err());
    }

    #[test]
    fn test_configured_requires_enabled_and_key() {
        let text = format!(
            "{}\n[agent]\nenabled = true\napi_key = \"sk-test\"\n",
            MINIMAL
        );
        let config = parse_config(&text).unwrap();
        assert!(config.agent.is_configured());

        let text = format!("{}\n[agent]\nenabled = false\napi_key = \"sk-test\"\n", MINIMAL);
        let config = parse_config(&text).unwrap();
        assert!(!config.agent.is_configured());
    }

    #[test]
    fn test_page_rules_parse() {
        let text = format!(
            "{}\n[[widget.page_rules]]\npattern = \"/blog/*\"\nrule = \"exclude\"\n",
            MINIMAL
        );
        let config = parse_config(&text).unwrap();
        assert_eq!(config.widget.page_rules.len(), 1);
        assert_eq!(config.widget.page_rules[0].rule, PageRuleKind::Exclude);
    }
}
