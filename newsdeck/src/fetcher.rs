use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use feed_rs::parser;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;

/// A normalized article record produced on every fetch. Missing fields are
/// empty strings, never absent, so downstream code stays total.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedEntry {
    pub title: String,
    pub summary: String,
    pub url: String,
    pub author: String,
    pub category: String,
    pub source: String,
    pub published_at: DateTime<Utc>,
    #[serde(default)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// Fetches a feed URL and parses it into normalized entries.
///
/// The public contract is soft-failure: timeouts, connection errors, non-2xx
/// statuses and malformed bodies all yield an empty list. A caller cannot
/// distinguish "empty feed" from "parse failure" through this call alone.
pub struct FeedFetcher {
    client: Client,
}

impl FeedFetcher {
    pub fn new(timeout: Duration, user_agent: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .context("failed to build reqwest client")?;
        Ok(Self { client })
    }

    /// Fetch and parse a feed. Pure transform over network input: no cache or
    /// persistence writes happen here.
    pub async fn fetch(&self, url: &str) -> Vec<FeedEntry> {
        let response = match self.client.get(url).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(url = %url, error = %e, "feed fetch failed");
                return Vec::new();
            }
        };

        let status = response.status();
        if !status.is_success() {
            warn!(url = %url, %status, "feed fetch returned non-success status");
            return Vec::new();
        }

        let last_modified = response
            .headers()
            .get(reqwest::header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_date);

        let bytes = match response.bytes().await {
            Ok(b) => b,
            Err(e) => {
                warn!(url = %url, error = %e, "failed to read feed body");
                return Vec::new();
            }
        };

        let fetched_at = Utc::now();
        let feed = match parser::parse(bytes.as_ref()) {
            Ok(f) => f,
            Err(e) => {
                warn!(url = %url, error = %e, "failed to parse feed");
                return Vec::new();
            }
        };

        let source = feed
            .title
            .as_ref()
            .map(|t| t.content.clone())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| url_host(url));

        // Undated entries fall back to the response's Last-Modified header,
        // then to the fetch time.
        let default_published = last_modified.unwrap_or(fetched_at);

        feed.entries
            .iter()
            .map(|entry| normalize_entry(entry, &source, default_published))
            .collect()
    }
}

/// Parse a raw date string, trying RFC 2822 then RFC 3339.
/// Returns None when neither format matches; callers decide the default.
pub fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(raw)
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

fn url_host(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_default()
}

fn normalize_entry(
    entry: &feed_rs::model::Entry,
    source: &str,
    default_published: DateTime<Utc>,
) -> FeedEntry {
    let title = entry
        .title
        .as_ref()
        .map(|t| t.content.clone())
        .unwrap_or_default();
    // Use the first link as the canonical URL
    let url = entry.links.first().map(|l| l.href.clone()).unwrap_or_default();
    let summary = entry
        .summary
        .as_ref()
        .map(|s| s.content.clone())
        .or_else(|| entry.content.as_ref().and_then(|c| c.body.clone()))
        .unwrap_or_default();
    let author = entry
        .authors
        .first()
        .map(|a| a.name.clone())
        .unwrap_or_default();
    let category = entry
        .categories
        .first()
        .map(|c| c.term.clone())
        .unwrap_or_default();

    // Lossy default: entries with no parseable date get the response's
    // Last-Modified time, or failing that the fetch time.
    let published_at = entry.published.or(entry.updated).unwrap_or(default_published);

    let tags: Vec<String> = entry.categories.iter().map(|c| c.term.clone()).collect();
    let mut extra = HashMap::new();
    extra.insert("guid".to_string(), serde_json::Value::String(entry.id.clone()));
    extra.insert(
        "tags".to_string(),
        serde_json::Value::Array(tags.into_iter().map(serde_json::Value::String).collect()),
    );

    FeedEntry {
        title,
        summary,
        url,
        author,
        category,
        source: source.to_string(),
        published_at,
        extra,
    }
}
