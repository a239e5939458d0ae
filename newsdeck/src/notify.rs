use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::fetcher::FeedEntry;

/// Notification frequency tiers. Fixed set; unknown preference strings fall
/// back to daily.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Hourly,
    Daily,
    Weekly,
}

impl Frequency {
    pub const ALL: [Frequency; 3] = [Frequency::Hourly, Frequency::Daily, Frequency::Weekly];

    /// Wall-clock elapsed time that must pass between notifications for a
    /// preference-holder on this tier. Not cron-aligned.
    pub fn interval(&self) -> chrono::Duration {
        match self {
            Frequency::Hourly => chrono::Duration::hours(1),
            Frequency::Daily => chrono::Duration::days(1),
            Frequency::Weekly => chrono::Duration::weeks(1),
        }
    }

    pub fn parse(s: &str) -> Frequency {
        match s {
            "hourly" => Frequency::Hourly,
            "weekly" => Frequency::Weekly,
            _ => Frequency::Daily,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Hourly => "hourly",
            Frequency::Daily => "daily",
            Frequency::Weekly => "weekly",
        }
    }
}

/// One update awaiting delivery, tagged with its enqueue time.
#[derive(Debug, Clone)]
pub struct PendingUpdate {
    pub user_id: i64,
    pub feed_id: i64,
    pub entry: FeedEntry,
    pub queued_at: DateTime<Utc>,
}

/// Per-tier queues of pending updates. Queues are time-ordered by arrival;
/// eviction is explicit by age, so memory stays bounded deterministically.
pub struct NotificationBatcher {
    queues: Mutex<HashMap<Frequency, VecDeque<PendingUpdate>>>,
}

impl NotificationBatcher {
    pub fn new() -> Self {
        let mut queues = HashMap::new();
        for tier in Frequency::ALL {
            queues.insert(tier, VecDeque::new());
        }
        Self {
            queues: Mutex::new(queues),
        }
    }

    pub async fn enqueue(&self, tier: Frequency, update: PendingUpdate) {
        let mut queues = self.queues.lock().await;
        debug!(tier = tier.as_str(), user_id = update.user_id, feed_id = update.feed_id, "queued update");
        queues.entry(tier).or_default().push_back(update);
    }

    /// Remove and return all pending updates for one user on one tier.
    pub async fn drain_for_user(&self, tier: Frequency, user_id: i64) -> Vec<PendingUpdate> {
        let mut queues = self.queues.lock().await;
        let queue = queues.entry(tier).or_default();
        let mut drained = Vec::new();
        let mut remaining = VecDeque::with_capacity(queue.len());
        for update in queue.drain(..) {
            if update.user_id == user_id {
                drained.push(update);
            } else {
                remaining.push_back(update);
            }
        }
        *queue = remaining;
        drained
    }

    /// Drop updates queued before the cutoff, across all tiers, even if they
    /// were never sent. Returns the number dropped.
    pub async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let mut queues = self.queues.lock().await;
        let mut dropped = 0;
        for queue in queues.values_mut() {
            let before = queue.len();
            queue.retain(|u| u.queued_at >= cutoff);
            dropped += before - queue.len();
        }
        dropped
    }

    pub async fn len(&self, tier: Frequency) -> usize {
        self.queues
            .lock()
            .await
            .get(&tier)
            .map(|q| q.len())
            .unwrap_or(0)
    }
}

impl Default for NotificationBatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Delivery seam for batched updates. The scheduler treats delivery as
/// fire-and-forget: errors are logged, never retried inline.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_feed_updates(
        &self,
        user_id: i64,
        feed_id: i64,
        updates: &[FeedEntry],
    ) -> Result<()>;
}

/// Default notifier: writes update summaries to the log. Actual delivery
/// (email, push) is an external collaborator outside this core.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify_feed_updates(
        &self,
        user_id: i64,
        feed_id: i64,
        updates: &[FeedEntry],
    ) -> Result<()> {
        info!(user_id, feed_id, count = updates.len(), "feed updates ready for delivery");
        for update in updates {
            debug!(title = %update.title, url = %update.url, "update");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(url: &str) -> FeedEntry {
        FeedEntry {
            title: "t".into(),
            summary: String::new(),
            url: url.into(),
            author: String::new(),
            category: String::new(),
            source: String::new(),
            published_at: Utc::now(),
            extra: HashMap::new(),
        }
    }

    fn update(user_id: i64, feed_id: i64, queued_at: DateTime<Utc>) -> PendingUpdate {
        PendingUpdate {
            user_id,
            feed_id,
            entry: entry("https://example.com/a"),
            queued_at,
        }
    }

    #[test]
    fn parse_falls_back_to_daily() {
        assert_eq!(Frequency::parse("hourly"), Frequency::Hourly);
        assert_eq!(Frequency::parse("weekly"), Frequency::Weekly);
        assert_eq!(Frequency::parse("daily"), Frequency::Daily);
        assert_eq!(Frequency::parse("realtime"), Frequency::Daily);
        assert_eq!(Frequency::parse(""), Frequency::Daily);
    }

    #[tokio::test]
    async fn drain_removes_only_that_users_updates() {
        let batcher = NotificationBatcher::new();
        let now = Utc::now();
        batcher.enqueue(Frequency::Hourly, update(1, 10, now)).await;
        batcher.enqueue(Frequency::Hourly, update(2, 10, now)).await;
        batcher.enqueue(Frequency::Hourly, update(1, 11, now)).await;
        batcher.enqueue(Frequency::Daily, update(1, 10, now)).await;

        let drained = batcher.drain_for_user(Frequency::Hourly, 1).await;
        assert_eq!(drained.len(), 2);
        assert!(drained.iter().all(|u| u.user_id == 1));

        // User 2's update and the daily-tier update survive
        assert_eq!(batcher.len(Frequency::Hourly).await, 1);
        assert_eq!(batcher.len(Frequency::Daily).await, 1);

        // A second drain finds nothing
        assert!(batcher.drain_for_user(Frequency::Hourly, 1).await.is_empty());
    }

    #[tokio::test]
    async fn prune_drops_expired_updates_even_if_unsent() {
        let batcher = NotificationBatcher::new();
        let now = Utc::now();
        let old = now - chrono::Duration::days(8);
        batcher.enqueue(Frequency::Weekly, update(1, 10, old)).await;
        batcher.enqueue(Frequency::Weekly, update(1, 10, now)).await;
        batcher.enqueue(Frequency::Hourly, update(2, 10, old)).await;

        let dropped = batcher
            .prune_older_than(now - chrono::Duration::days(7))
            .await;
        assert_eq!(dropped, 2);
        assert_eq!(batcher.len(Frequency::Weekly).await, 1);
        assert_eq!(batcher.len(Frequency::Hourly).await, 0);
    }

    #[test]
    fn tier_intervals_are_wall_clock_spans() {
        assert_eq!(Frequency::Hourly.interval(), chrono::Duration::hours(1));
        assert_eq!(Frequency::Daily.interval(), chrono::Duration::days(1));
        assert_eq!(Frequency::Weekly.interval(), chrono::Duration::weeks(1));
    }
}
