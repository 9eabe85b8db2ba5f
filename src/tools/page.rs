//! Outbound page fetch and HTML content extraction for `get_page_context`.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use scraper::{Html, Selector};

const FETCH_TIMEOUT: Duration = Duration::from_secs(5);
const USER_AGENT: &str = concat!("sitechat/", env!("CARGO_PKG_VERSION"), " (internal)");
const MAX_HEADINGS: usize = 20;
const MAX_TEXT_CHARS: usize = 3000;
const SKIPPED_ELEMENTS: [&str; 4] = ["script", "style", "nav", "noscript"];

#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// GET `url` and return the body as text.
    async fn fetch(&self, url: &str) -> Result<String>;
}

pub struct HttpPageFetcher {
    client: reqwest::Client,
}

impl HttpPageFetcher {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }
}

impl Default for HttpPageFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    async fn fetch(&self, url: &str) -> Result<String> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("GET {}", url))?;
        if !resp.status().is_success() {
            bail!("GET {} returned {}", url, resp.status());
        }
        resp.text().await.context("reading page body")
    }
}

/// Visible content of a rendered page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageContent {
    pub title: String,
    pub headings: Vec<String>,
    pub text: String,
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Title, up to 20 headings, and body text with scripts, styles, and
/// navigation removed. Text past 3000 characters is cut and marked `...`.
pub fn extract_page(html: &str) -> PageContent {
    let doc = Html::parse_document(html);
    let mut page = PageContent::default();

    if let Ok(sel) = Selector::parse("title") {
        if let Some(title) = doc.select(&sel).next() {
            page.title = collapse_whitespace(&title.text().collect::<String>());
        }
    }

    if let Ok(sel) = Selector::parse("h1, h2, h3, h4, h5, h6") {
        page.headings = doc
            .select(&sel)
            .map(|h| collapse_whitespace(&h.text().collect::<String>()))
            .filter(|h| !h.is_empty())
            .take(MAX_HEADINGS)
            .collect();
    }

    let mut raw = String::new();
    if let Ok(sel) = Selector::parse("body") {
        let root = doc.select(&sel).next().unwrap_or_else(|| doc.root_element());
        for node in root.descendants() {
            let Some(text) = node.value().as_text() else {
                continue;
            };
            let hidden = node.ancestors().any(|a| {
                a.value()
                    .as_element()
                    .map(|e| SKIPPED_ELEMENTS.contains(&e.name()))
                    .unwrap_or(false)
            });
            if !hidden {
                raw.push_str(text);
                raw.push(' ');
            }
        }
    }

    let text = collapse_whitespace(&raw);
    page.text = if text.chars().count() > MAX_TEXT_CHARS {
        format!("{}...", text.chars().take(MAX_TEXT_CHARS).collect::<String>())
    } else {
        text
    };
    page
}
