use anyhow::{Context, Result};
use chrono::Utc;
use common::{NotificationConfig, SchedulerConfig};
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::{cache_key, CachedValue, FailoverCache};
use crate::fetcher::{FeedEntry, FeedFetcher};
use crate::notify::{Frequency, NotificationBatcher, Notifier, PendingUpdate};
use crate::storage::{self, FeedDescriptor};

/// Cache key for a feed's last-seen content.
pub fn feed_content_key(feed_id: i64) -> String {
    cache_key("feed_content", &[&feed_id.to_string()])
}

/// Long-lived background scheduler hosting the feed refresh loop and the
/// notification flush loop.
///
/// Lifecycle: stopped -> running -> stopping -> stopped. `start` is
/// idempotent; `stop` is safe to call even if `start` never ran. Both loops
/// are tracked tasks cancelled cooperatively via a shared notify plus a stop
/// flag checked between feeds.
pub struct RefreshScheduler {
    pool: Arc<SqlitePool>,
    cache: Arc<FailoverCache>,
    fetcher: Arc<FeedFetcher>,
    batcher: Arc<NotificationBatcher>,
    notifier: Arc<dyn Notifier>,
    scheduler_cfg: SchedulerConfig,
    notification_cfg: NotificationConfig,
    running: AtomicBool,
    stopping: AtomicBool,
    shutdown: Notify,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RefreshScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: Arc<SqlitePool>,
        cache: Arc<FailoverCache>,
        fetcher: Arc<FeedFetcher>,
        batcher: Arc<NotificationBatcher>,
        notifier: Arc<dyn Notifier>,
        scheduler_cfg: SchedulerConfig,
        notification_cfg: NotificationConfig,
    ) -> Self {
        Self {
            pool,
            cache,
            fetcher,
            batcher,
            notifier,
            scheduler_cfg,
            notification_cfg,
            running: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            shutdown: Notify::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawn the refresh and flush loops. Calling while already running is a
    /// no-op.
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("scheduler already running; start ignored");
            return;
        }
        self.stopping.store(false, Ordering::SeqCst);
        info!("starting refresh scheduler");

        let mut tasks = self.tasks.lock().await;
        let scheduler = self.clone();
        tasks.push(tokio::spawn(async move { scheduler.refresh_loop().await }));
        let scheduler = self.clone();
        tasks.push(tokio::spawn(async move { scheduler.flush_loop().await }));
    }

    /// Cancel both loops and wait for them, swallowing cancellation-induced
    /// errors.
    pub async fn stop(&self) {
        info!("stopping refresh scheduler");
        self.stopping.store(true, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_waiters();

        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let abort = task.abort_handle();
            match tokio::time::timeout(Duration::from_secs(10), task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => error!(error = %e, "scheduler task panicked"),
                Err(_) => {
                    warn!("timed out waiting for scheduler task; aborting");
                    abort.abort();
                }
            }
        }
        info!("refresh scheduler stopped");
    }

    async fn refresh_loop(&self) {
        info!("feed refresh loop started");
        loop {
            if self.stopping.load(Ordering::SeqCst) {
                break;
            }
            // Register for shutdown before the cycle so a stop() during the
            // cycle cancels it instead of waiting out the next sleep.
            let shutdown = self.shutdown.notified();
            tokio::pin!(shutdown);
            let pause = select! {
                _ = &mut shutdown => break,
                result = self.run_cycle() => match result {
                    Ok(count) => {
                        debug!(feeds = count, "refresh cycle complete");
                        self.scheduler_cfg.refresh_interval()
                    }
                    Err(e) => {
                        // A cycle-level failure must never terminate the loop
                        error!(error = %e, "refresh cycle failed; backing off");
                        self.scheduler_cfg.error_backoff()
                    }
                },
            };
            select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }
        info!("feed refresh loop exited");
    }

    /// One pass over all stale feeds. A single feed's failure is logged and
    /// the pass continues; every stale feed is attempted exactly once.
    pub async fn run_cycle(&self) -> Result<usize> {
        let now = Utc::now();
        let feeds = storage::list_stale_feeds(
            &self.pool,
            now,
            self.scheduler_cfg.refresh_interval(),
        )
        .await?;
        let total = feeds.len();
        if total == 0 {
            debug!("no stale feeds");
            return Ok(0);
        }
        info!(count = total, "refreshing stale feeds");

        for feed in feeds {
            if self.stopping.load(Ordering::SeqCst) {
                break;
            }
            match self.process_feed(&feed).await {
                Ok(new_count) if new_count > 0 => {
                    info!(feed_id = feed.id, url = %feed.url, new = new_count, "feed updated");
                }
                Ok(_) => {}
                Err(e) => {
                    error!(feed_id = feed.id, url = %feed.url, error = %e, "feed refresh failed; continuing");
                }
            }
            // Per-source pacing between feeds
            select! {
                _ = tokio::time::sleep(self.scheduler_cfg.feed_pause()) => {}
                _ = self.shutdown.notified() => break,
            }
        }
        Ok(total)
    }

    /// Fetch one feed, diff against its cached content by URL set, persist
    /// genuinely new entries and queue notifications, then advance the fetch
    /// timestamp.
    async fn process_feed(&self, feed: &FeedDescriptor) -> Result<usize> {
        // Empty covers "nothing published" and failed fetch alike; the next
        // cycle retries either way.
        let fetched = self.fetcher.fetch(&feed.url).await;

        let key = feed_content_key(feed.id);
        let cached: Vec<FeedEntry> = match self.cache.get_json::<Vec<FeedEntry>>(&key).await {
            Some(CachedValue::Typed(entries)) => entries,
            Some(CachedValue::Raw(_)) | None => Vec::new(),
        };
        let known: HashSet<&str> = cached.iter().map(|e| e.url.as_str()).collect();

        let mut new_entries = Vec::new();
        for entry in &fetched {
            if entry.url.is_empty() || known.contains(entry.url.as_str()) {
                continue;
            }
            // Dedup against already-stored articles as well; another process
            // running the same scheduler may have stored it first.
            if storage::get_article_by_url(&self.pool, &entry.url)
                .await?
                .is_some()
            {
                continue;
            }
            storage::create_article(&self.pool, feed.id, entry)
                .await
                .with_context(|| format!("failed to persist article {}", entry.url))?;
            new_entries.push(entry.clone());
        }

        if !new_entries.is_empty() {
            self.enqueue_notifications(feed, &new_entries).await?;
            // Overwrite the cache entry with the full fetched set so the next
            // diff runs against what the source currently publishes.
            self.cache.set_json(&key, &fetched, None).await;
        }

        storage::mark_feed_fetched(&self.pool, feed.id, Utc::now()).await?;
        Ok(new_entries.len())
    }

    /// Synchronous single-feed refresh for the route layer's "refresh now"
    /// endpoint. Returns only the count of new entries; fetch-level detail
    /// stays in the logs.
    pub async fn refresh_feed(&self, feed_id: i64) -> Result<usize> {
        let feed = storage::get_feed(&self.pool, feed_id)
            .await?
            .with_context(|| format!("feed {} not found", feed_id))?;
        self.process_feed(&feed).await
    }

    async fn enqueue_notifications(
        &self,
        feed: &FeedDescriptor,
        entries: &[FeedEntry],
    ) -> Result<()> {
        let prefs = storage::subscribers_for_feed(&self.pool, feed.id).await?;
        let now = Utc::now();
        for pref in &prefs {
            for entry in entries {
                self.batcher
                    .enqueue(
                        pref.frequency,
                        PendingUpdate {
                            user_id: pref.user_id,
                            feed_id: feed.id,
                            entry: entry.clone(),
                            queued_at: now,
                        },
                    )
                    .await;
            }
        }
        Ok(())
    }

    async fn flush_loop(&self) {
        info!("notification flush loop started");
        loop {
            if self.stopping.load(Ordering::SeqCst) {
                break;
            }
            select! {
                _ = self.shutdown.notified() => break,
                _ = tokio::time::sleep(self.scheduler_cfg.flush_interval()) => {}
            }
            if self.stopping.load(Ordering::SeqCst) {
                break;
            }
            if let Err(e) = self.flush_due_notifications(Utc::now()).await {
                error!(error = %e, "notification flush failed; will retry next interval");
            }
            let cutoff = Utc::now() - self.notification_cfg.retention();
            let dropped = self.batcher.prune_older_than(cutoff).await;
            if dropped > 0 {
                warn!(dropped, "dropped unsent notifications past retention");
            }
        }
        info!("notification flush loop exited");
    }

    /// Deliver batched updates to every preference-holder whose tier interval
    /// has elapsed. Delivery is fire-and-forget; a failed send is logged and
    /// the holder's slot still advances.
    pub async fn flush_due_notifications(&self, now: chrono::DateTime<Utc>) -> Result<usize> {
        let mut delivered = 0;
        for tier in Frequency::ALL {
            let due = storage::due_preferences(&self.pool, tier, now).await?;
            for pref in due {
                let updates = self.batcher.drain_for_user(tier, pref.user_id).await;
                if updates.is_empty() {
                    continue;
                }
                let mut by_feed: HashMap<i64, Vec<FeedEntry>> = HashMap::new();
                for update in updates {
                    by_feed.entry(update.feed_id).or_default().push(update.entry);
                }
                for (feed_id, entries) in by_feed {
                    match self
                        .notifier
                        .notify_feed_updates(pref.user_id, feed_id, &entries)
                        .await
                    {
                        Ok(()) => delivered += entries.len(),
                        Err(e) => {
                            error!(user_id = pref.user_id, feed_id, error = %e, "notification delivery failed");
                        }
                    }
                }
                storage::mark_notified(&self.pool, pref.id, now).await?;
            }
        }
        Ok(delivered)
    }
}
