//! What the browser widget needs to render itself.
//!
//! Pure data derived from [`Config`]; field names are camelCase because the
//! widget script reads them directly.

use globset::{GlobBuilder, GlobMatcher};
use serde::Serialize;
use tracing::warn;

use crate::config::{Config, PageRuleKind};

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WidgetConfigView {
    pub enabled: bool,
    pub agent_name: String,
    pub avatar_url: Option<String>,
    pub welcome_message: String,
    pub placeholder_text: String,
    pub position: String,
    pub theme: ThemeView,
    pub custom_css: String,
    pub custom_js: String,
    pub endpoints: Endpoints,
    pub page_rules: Vec<PageRuleView>,
    pub escalation: EscalationView,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ThemeView {
    pub primary_color: String,
    pub secondary_color: String,
    pub background_color: String,
    pub text_color: String,
    pub font_family: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Endpoints {
    pub chat: String,
    pub stream: String,
    pub escalate: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PageRuleView {
    pub pattern: String,
    pub rule_type: PageRuleKind,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EscalationFieldsView {
    pub name: bool,
    pub email: bool,
    pub phone: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EscalationView {
    pub enabled: bool,
    pub message: String,
    pub fields: EscalationFieldsView,
    pub custom_questions: Vec<String>,
    pub confirmation: String,
}

impl WidgetConfigView {
    pub fn from_config(config: &Config) -> Self {
        let widget = &config.widget;
        let base = widget.base_url.trim_end_matches('/');
        let escalation = &config.escalation;

        Self {
            enabled: config.agent.enabled,
            agent_name: config.agent.name.clone(),
            avatar_url: widget.avatar_url.clone().filter(|u| !u.is_empty()),
            welcome_message: widget.welcome_message.clone(),
            placeholder_text: widget.placeholder_text.clone(),
            position: widget.position.clone(),
            theme: ThemeView {
                primary_color: widget.theme.primary_color.clone(),
                secondary_color: widget.theme.secondary_color.clone(),
                background_color: widget.theme.background_color.clone(),
                text_color: widget.theme.text_color.clone(),
                font_family: widget.theme.font_family.clone(),
            },
            custom_css: widget.custom_css.clone(),
            custom_js: widget.custom_js.clone(),
            endpoints: Endpoints {
                chat: format!("{}/chat", base),
                stream: format!("{}/chat/stream", base),
                escalate: format!("{}/escalate", base),
            },
            page_rules: widget
                .page_rules
                .iter()
                .map(|r| PageRuleView {
                    pattern: r.pattern.clone(),
                    rule_type: r.rule,
                })
                .collect(),
            escalation: EscalationView {
                enabled: escalation.enabled,
                message: escalation.message.clone(),
                fields: EscalationFieldsView {
                    name: escalation.fields.name,
                    email: escalation.fields.email,
                    phone: escalation.fields.phone,
                },
                custom_questions: escalation
                    .custom_questions
                    .iter()
                    .map(|q| q.trim())
                    .filter(|q| !q.is_empty())
                    .map(String::from)
                    .collect(),
                confirmation: escalation.confirmation.clone(),
            },
        }
    }

    /// Whether the widget shows on a page with this path.
    ///
    /// With no include rules every page is allowed by default; otherwise
    /// nothing is. Rules are applied in order and the last match wins.
    /// `*` stays within one path segment, `**` spans segments.
    pub fn shows_on(&self, path: &str) -> bool {
        let has_includes = self
            .page_rules
            .iter()
            .any(|r| r.rule_type == PageRuleKind::Include);
        let mut allowed = !has_includes;

        for rule in &self.page_rules {
            let Some(matcher) = compile_rule(&rule.pattern) else {
                continue;
            };
            if matcher.is_match(path) {
                allowed = rule.rule_type == PageRuleKind::Include;
            }
        }
        allowed
    }
}

fn compile_rule(pattern: &str) -> Option<GlobMatcher> {
    match GlobBuilder::new(pattern).literal_separator(true).build() {
        Ok(glob) => Some(glob.compile_matcher()),
        Err(e) => {
            warn!(pattern, "ignoring invalid page rule: {e}");
            None
        }
    }
}
