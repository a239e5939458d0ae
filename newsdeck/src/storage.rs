use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::time::Duration;
use tracing::debug;

use crate::fetcher::FeedEntry;
use crate::notify::Frequency;

/// A feed as the refresh core sees it. Owned by the feed-collection side of
/// the application; the core reads descriptors and writes back fetch
/// timestamps only.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FeedDescriptor {
    pub id: i64,
    pub url: String,
    pub title: String,
    pub active: bool,
    pub last_fetched: Option<DateTime<Utc>>,
    /// Per-feed refresh interval in seconds, overriding the global default.
    pub refresh_interval_override: Option<i64>,
}

impl FeedDescriptor {
    /// A feed is stale when it has never been fetched, or its last fetch is
    /// older than its refresh interval (the override, if set).
    pub fn is_stale(&self, now: DateTime<Utc>, default_interval: Duration) -> bool {
        let interval_secs = self
            .refresh_interval_override
            .unwrap_or(default_interval.as_secs() as i64);
        match self.last_fetched {
            None => true,
            Some(last) => now - last >= chrono::Duration::seconds(interval_secs),
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ArticleRecord {
    pub id: i64,
    pub feed_id: i64,
    pub canonical_url: String,
    pub title: String,
    pub published_at: DateTime<Utc>,
}

/// A user's notification preference for one feed.
#[derive(Debug, Clone)]
pub struct FeedPreference {
    pub id: i64,
    pub user_id: i64,
    pub feed_id: i64,
    pub frequency: Frequency,
    pub last_notified_at: Option<DateTime<Utc>>,
}

/// Create the core tables if they do not exist. The wider application owns
/// migrations; this keeps the worker self-sufficient on a fresh database.
pub async fn ensure_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS feeds (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            url TEXT NOT NULL UNIQUE,
            title TEXT NOT NULL DEFAULT '',
            active INTEGER NOT NULL DEFAULT 1,
            last_fetched TEXT,
            last_updated TEXT,
            refresh_interval_override INTEGER
        )
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create feeds table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS articles (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            feed_id INTEGER NOT NULL REFERENCES feeds(id),
            canonical_url TEXT NOT NULL UNIQUE,
            title TEXT NOT NULL DEFAULT '',
            summary TEXT NOT NULL DEFAULT '',
            author TEXT NOT NULL DEFAULT '',
            category TEXT NOT NULL DEFAULT '',
            source TEXT NOT NULL DEFAULT '',
            published_at TEXT NOT NULL,
            first_seen_at TEXT NOT NULL,
            extra_data TEXT
        )
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create articles table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            username TEXT NOT NULL UNIQUE
        )
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create users table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS feed_preferences (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL REFERENCES users(id),
            feed_id INTEGER NOT NULL REFERENCES feeds(id),
            notifications_enabled INTEGER NOT NULL DEFAULT 1,
            update_frequency TEXT NOT NULL DEFAULT 'daily',
            last_notified_at TEXT,
            UNIQUE(user_id, feed_id)
        )
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create feed_preferences table")?;

    Ok(())
}

/// Insert a feed, returning its id. Re-inserting an existing URL returns the
/// existing id.
pub async fn create_feed(pool: &SqlitePool, url: &str, title: &str) -> Result<i64> {
    let existing = sqlx::query_scalar::<_, i64>("SELECT id FROM feeds WHERE url = ?")
        .bind(url)
        .fetch_optional(pool)
        .await
        .context("failed to check existing feed")?;
    if let Some(id) = existing {
        return Ok(id);
    }

    let id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO feeds (url, title) VALUES (?, ?) RETURNING id",
    )
    .bind(url)
    .bind(title)
    .fetch_one(pool)
    .await
    .context("failed to insert feed")?;
    Ok(id)
}

pub async fn get_feed(pool: &SqlitePool, feed_id: i64) -> Result<Option<FeedDescriptor>> {
    let feed = sqlx::query_as::<_, FeedDescriptor>(
        "SELECT id, url, title, active, last_fetched, refresh_interval_override FROM feeds WHERE id = ?",
    )
    .bind(feed_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch feed")?;
    Ok(feed)
}

/// Active feeds due for a refresh. Staleness is evaluated in Rust so per-feed
/// interval overrides apply.
pub async fn list_stale_feeds(
    pool: &SqlitePool,
    now: DateTime<Utc>,
    default_interval: Duration,
) -> Result<Vec<FeedDescriptor>> {
    let feeds = sqlx::query_as::<_, FeedDescriptor>(
        "SELECT id, url, title, active, last_fetched, refresh_interval_override FROM feeds WHERE active = 1",
    )
    .fetch_all(pool)
    .await
    .context("failed to list active feeds")?;

    Ok(feeds
        .into_iter()
        .filter(|f| f.is_stale(now, default_interval))
        .collect())
}

/// Advance a feed's fetch timestamps. `last_fetched` only ever moves forward;
/// a write with an older timestamp is a no-op.
pub async fn mark_feed_fetched(pool: &SqlitePool, feed_id: i64, now: DateTime<Utc>) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE feeds SET last_fetched = ?, last_updated = ?
        WHERE id = ? AND (last_fetched IS NULL OR last_fetched < ?)
        "#,
    )
    .bind(now)
    .bind(now)
    .bind(feed_id)
    .bind(now)
    .execute(pool)
    .await
    .context("failed to update feed timestamps")?;
    Ok(())
}

pub async fn get_article_by_url(pool: &SqlitePool, url: &str) -> Result<Option<ArticleRecord>> {
    let article = sqlx::query_as::<_, ArticleRecord>(
        "SELECT id, feed_id, canonical_url, title, published_at FROM articles WHERE canonical_url = ?",
    )
    .bind(url)
    .fetch_optional(pool)
    .await
    .context("failed to check existing article")?;
    Ok(article)
}

/// Persist one fetched entry as an article. Callers are expected to have
/// deduplicated by canonical URL first.
pub async fn create_article(pool: &SqlitePool, feed_id: i64, entry: &FeedEntry) -> Result<i64> {
    let extra = serde_json::to_string(&entry.extra).context("failed to serialize extra data")?;
    let id = sqlx::query_scalar::<_, i64>(
        r#"
        INSERT INTO articles (feed_id, canonical_url, title, summary, author, category, source, published_at, first_seen_at, extra_data)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        RETURNING id
        "#,
    )
    .bind(feed_id)
    .bind(&entry.url)
    .bind(&entry.title)
    .bind(&entry.summary)
    .bind(&entry.author)
    .bind(&entry.category)
    .bind(&entry.source)
    .bind(entry.published_at)
    .bind(Utc::now())
    .bind(extra)
    .fetch_one(pool)
    .await
    .context("failed to insert article")?;

    debug!(article_id = id, url = %entry.url, "stored article");
    Ok(id)
}

/// Subscribers of a feed with notifications enabled.
pub async fn subscribers_for_feed(pool: &SqlitePool, feed_id: i64) -> Result<Vec<FeedPreference>> {
    let rows = sqlx::query_as::<_, PreferenceRow>(
        r#"
        SELECT id, user_id, feed_id, update_frequency, last_notified_at
        FROM feed_preferences
        WHERE feed_id = ? AND notifications_enabled = 1
        "#,
    )
    .bind(feed_id)
    .fetch_all(pool)
    .await
    .context("failed to list feed subscribers")?;
    Ok(rows.into_iter().map(FeedPreference::from).collect())
}

/// Preference-holders on one tier whose elapsed time since the last
/// notification meets the tier interval (or who were never notified).
pub async fn due_preferences(
    pool: &SqlitePool,
    tier: Frequency,
    now: DateTime<Utc>,
) -> Result<Vec<FeedPreference>> {
    let cutoff = now - tier.interval();
    let rows = sqlx::query_as::<_, PreferenceRow>(
        r#"
        SELECT id, user_id, feed_id, update_frequency, last_notified_at
        FROM feed_preferences
        WHERE notifications_enabled = 1
          AND update_frequency = ?
          AND (last_notified_at IS NULL OR last_notified_at <= ?)
        "#,
    )
    .bind(tier.as_str())
    .bind(cutoff)
    .fetch_all(pool)
    .await
    .context("failed to list due preferences")?;
    Ok(rows.into_iter().map(FeedPreference::from).collect())
}

pub async fn mark_notified(pool: &SqlitePool, pref_id: i64, now: DateTime<Utc>) -> Result<()> {
    sqlx::query("UPDATE feed_preferences SET last_notified_at = ? WHERE id = ?")
        .bind(now)
        .bind(pref_id)
        .execute(pool)
        .await
        .context("failed to record notification time")?;
    Ok(())
}

#[derive(sqlx::FromRow)]
struct PreferenceRow {
    id: i64,
    user_id: i64,
    feed_id: i64,
    update_frequency: String,
    last_notified_at: Option<DateTime<Utc>>,
}

impl From<PreferenceRow> for FeedPreference {
    fn from(row: PreferenceRow) -> Self {
        FeedPreference {
            id: row.id,
            user_id: row.user_id,
            feed_id: row.feed_id,
            frequency: Frequency::parse(&row.update_frequency),
            last_notified_at: row.last_notified_at,
        }
    }
}
