use chrono::{DateTime, Utc};
use common::WarmingConfig;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::select;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cache::{cache_key, FailoverCache};
use crate::fetcher::FeedFetcher;

/// Per-feed access tracking, held only in process memory.
#[derive(Debug, Clone)]
struct AccessStat {
    count: u64,
    last_access: DateTime<Utc>,
}

/// Snapshot returned by [`CacheWarmer::stats`].
#[derive(Debug, Clone, Serialize)]
pub struct WarmingStats {
    pub tracked_feeds: usize,
    pub popular_feeds: usize,
    pub access_counts: HashMap<String, u64>,
    pub last_accessed: HashMap<String, DateTime<Utc>>,
}

/// Cache key for a feed's warmed content.
pub fn warm_key(feed_url: &str) -> String {
    cache_key("warm_feed", &[feed_url])
}

/// Tracks per-feed access frequency and proactively refreshes the cache for
/// popular feeds ahead of expiry.
///
/// A feed is popular when its access count meets the configured threshold AND
/// its last access falls within the recency window; failing either test
/// excludes it from warming. No hysteresis is applied, so a feed near the
/// threshold can move in and out of the popular set across cycles.
pub struct CacheWarmer {
    cache: Arc<FailoverCache>,
    fetcher: Arc<FeedFetcher>,
    config: WarmingConfig,
    stats: Mutex<HashMap<String, AccessStat>>,
}

impl CacheWarmer {
    pub fn new(cache: Arc<FailoverCache>, fetcher: Arc<FeedFetcher>, config: WarmingConfig) -> Self {
        Self {
            cache,
            fetcher,
            config,
            stats: Mutex::new(HashMap::new()),
        }
    }

    /// Record that a feed's cached content was served to a request.
    pub async fn record_access(&self, feed_url: &str) {
        let now = Utc::now();
        let mut stats = self.stats.lock().await;
        let entry = stats.entry(feed_url.to_string()).or_insert(AccessStat {
            count: 0,
            last_access: now,
        });
        entry.count += 1;
        entry.last_access = now;
    }

    async fn popular_feeds(&self, now: DateTime<Utc>) -> Vec<String> {
        let window_start = now - self.config.recency_window();
        let threshold = self.config.popularity_threshold();
        let stats = self.stats.lock().await;
        stats
            .iter()
            .filter(|(_, s)| s.count >= threshold && s.last_access >= window_start)
            .map(|(url, _)| url.clone())
            .collect()
    }

    /// Unconditional sweep of stale access stats; bounds memory growth.
    async fn prune_stats(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.config.prune_after();
        let mut stats = self.stats.lock().await;
        let before = stats.len();
        stats.retain(|_, s| s.last_access >= cutoff);
        before - stats.len()
    }

    /// Re-fetch one feed and write it under the warmed-content key. The
    /// warmed TTL is twice the warming interval: pre-fetched content can
    /// tolerate being slightly stale.
    pub async fn warm_feed(&self, feed_url: &str) -> bool {
        let entries = self.fetcher.fetch(feed_url).await;
        let ttl = self.config.interval() * 2;
        let ok = self
            .cache
            .set_json(&warm_key(feed_url), &entries, Some(ttl))
            .await;
        if ok {
            debug!(url = %feed_url, entries = entries.len(), "warmed cache for feed");
        }
        ok
    }

    /// Remove the warmed entry and immediately re-warm it. The returned bool
    /// reflects only the re-warm; invalidation is best-effort and unreported.
    pub async fn force_invalidate(&self, feed_url: &str) -> bool {
        self.cache.invalidate(&warm_key(feed_url)).await;
        info!(url = %feed_url, "forced cache invalidation; rewarming");
        self.warm_feed(feed_url).await
    }

    /// One warming pass: refresh every popular feed, then sweep stale stats.
    pub async fn run_cycle(&self) -> usize {
        let popular = self.popular_feeds(Utc::now()).await;
        for url in &popular {
            self.warm_feed(url).await;
        }
        let pruned = self.prune_stats(Utc::now()).await;
        info!(warmed = popular.len(), pruned, "cache warming cycle complete");
        popular.len()
    }

    /// Spawn the periodic warming loop. Runs until `shutdown` is notified.
    pub fn start(self: &Arc<Self>, shutdown: Arc<Notify>) -> JoinHandle<()> {
        let warmer = self.clone();
        tokio::spawn(async move {
            info!("cache warming loop started");
            loop {
                // Register for shutdown before the cycle so a notification
                // arriving mid-cycle cancels it instead of being lost.
                let stop = shutdown.notified();
                tokio::pin!(stop);
                select! {
                    _ = &mut stop => break,
                    _ = warmer.run_cycle() => {}
                }
                select! {
                    _ = &mut stop => break,
                    _ = tokio::time::sleep(warmer.config.interval()) => {}
                }
            }
            info!("cache warming loop shutting down");
        })
    }

    pub async fn stats(&self) -> WarmingStats {
        let popular = self.popular_feeds(Utc::now()).await.len();
        let stats = self.stats.lock().await;
        WarmingStats {
            tracked_feeds: stats.len(),
            popular_feeds: popular,
            access_counts: stats.iter().map(|(k, s)| (k.clone(), s.count)).collect(),
            last_accessed: stats
                .iter()
                .map(|(k, s)| (k.clone(), s.last_access))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CachedValue;
    use crate::fetcher::FeedEntry;
    use std::time::Duration;

    const RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0">
  <channel>
    <title>Warm Feed</title>
    <item>
      <title>Warmed article</title>
      <link>https://example.com/warm</link>
      <pubDate>Tue, 01 Aug 2023 12:00:00 +0000</pubDate>
    </item>
  </channel>
</rss>"#;

    fn warmer_with(config: WarmingConfig) -> CacheWarmer {
        let cache = Arc::new(FailoverCache::in_process(Duration::from_secs(300)));
        let fetcher = Arc::new(
            FeedFetcher::new(Duration::from_secs(5), "newsdeck-test").expect("fetcher"),
        );
        CacheWarmer::new(cache, fetcher, config)
    }

    fn config_with_threshold(threshold: u64) -> WarmingConfig {
        WarmingConfig {
            interval_seconds: Some(300),
            popularity_threshold: Some(threshold),
            recency_window_seconds: Some(1800),
            prune_after_seconds: Some(3600),
        }
    }

    #[tokio::test]
    async fn popularity_threshold_boundary() {
        let warmer = warmer_with(config_with_threshold(3));

        // threshold - 1 accesses: excluded
        for _ in 0..2 {
            warmer.record_access("https://a.example/feed").await;
        }
        // exactly threshold accesses: included
        for _ in 0..3 {
            warmer.record_access("https://b.example/feed").await;
        }

        let popular = warmer.popular_feeds(Utc::now()).await;
        assert!(!popular.contains(&"https://a.example/feed".to_string()));
        assert!(popular.contains(&"https://b.example/feed".to_string()));
    }

    #[tokio::test]
    async fn stale_access_is_excluded_and_pruned() {
        let warmer = warmer_with(WarmingConfig {
            interval_seconds: Some(300),
            popularity_threshold: Some(1),
            recency_window_seconds: Some(60),
            prune_after_seconds: Some(120),
        });
        warmer.record_access("https://old.example/feed").await;

        // Within the window the feed qualifies
        assert_eq!(warmer.popular_feeds(Utc::now()).await.len(), 1);

        // Past the recency window it is excluded outright, not deprioritized
        let later = Utc::now() + chrono::Duration::seconds(61);
        assert!(warmer.popular_feeds(later).await.is_empty());

        // Past the prune threshold the stat itself is swept
        let much_later = Utc::now() + chrono::Duration::seconds(121);
        assert_eq!(warmer.prune_stats(much_later).await, 1);
        assert_eq!(warmer.stats().await.tracked_feeds, 0);
    }

    #[tokio::test]
    async fn counts_are_monotonic_between_prunes() {
        let warmer = warmer_with(config_with_threshold(10));
        for i in 1..=5u64 {
            warmer.record_access("https://a.example/feed").await;
            let stats = warmer.stats().await;
            assert_eq!(stats.access_counts["https://a.example/feed"], i);
        }
    }

    #[tokio::test]
    async fn force_invalidate_rewarms_with_fresh_content() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/feed.xml")
            .with_status(200)
            .with_body(RSS)
            .create_async()
            .await;

        let warmer = warmer_with(config_with_threshold(1));
        let url = format!("{}/feed.xml", server.url());

        // Seed the warmed key with stale content
        warmer
            .cache
            .set_json::<Vec<FeedEntry>>(&warm_key(&url), &Vec::new(), None)
            .await;

        assert!(warmer.force_invalidate(&url).await);

        // The cache read returns the freshly fetched content, not the old entry
        match warmer.cache.get_json::<Vec<FeedEntry>>(&warm_key(&url)).await {
            Some(CachedValue::Typed(entries)) => {
                assert_eq!(entries.len(), 1);
                assert_eq!(entries[0].url, "https://example.com/warm");
            }
            other => panic!("expected warmed entries, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn warming_cycle_warms_only_popular_feeds() {
        let mut server = mockito::Server::new_async().await;
        let popular_mock = server
            .mock("GET", "/popular.xml")
            .with_status(200)
            .with_body(RSS)
            .expect(1)
            .create_async()
            .await;
        let quiet_mock = server
            .mock("GET", "/quiet.xml")
            .with_status(200)
            .with_body(RSS)
            .expect(0)
            .create_async()
            .await;

        let warmer = warmer_with(config_with_threshold(2));
        let popular_url = format!("{}/popular.xml", server.url());
        let quiet_url = format!("{}/quiet.xml", server.url());

        warmer.record_access(&popular_url).await;
        warmer.record_access(&popular_url).await;
        warmer.record_access(&quiet_url).await;

        assert_eq!(warmer.run_cycle().await, 1);
        popular_mock.assert_async().await;
        quiet_mock.assert_async().await;
    }

    #[tokio::test]
    async fn shutdown_during_cycle_stops_the_loop() {
        use std::io::Write;

        // The slow body holds the cycle's fetch in flight for two seconds
        let mut server = mockito::Server::new_async().await;
        let _slow = server
            .mock("GET", "/slow.xml")
            .with_status(200)
            .with_chunked_body(|writer| {
                std::thread::sleep(std::time::Duration::from_secs(2));
                writer.write_all(RSS.as_bytes())
            })
            .create_async()
            .await;

        let warmer = Arc::new(warmer_with(config_with_threshold(1)));
        let url = format!("{}/slow.xml", server.url());
        warmer.record_access(&url).await;

        let shutdown = Arc::new(Notify::new());
        let handle = warmer.start(shutdown.clone());

        // Signal shutdown while the cycle is mid-fetch; the loop must not
        // miss it and sleep out a full warming interval
        tokio::time::sleep(Duration::from_millis(500)).await;
        shutdown.notify_waiters();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("warming loop did not exit after shutdown")
            .expect("warming loop task failed");
    }
}
