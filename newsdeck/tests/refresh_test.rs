use anyhow::Result;
use chrono::Utc;
use common::{init_db_pool, NotificationConfig, SchedulerConfig};
use newsdeck::cache::FailoverCache;
use newsdeck::fetcher::{FeedEntry, FeedFetcher};
use newsdeck::notify::{Frequency, NotificationBatcher, Notifier, PendingUpdate};
use newsdeck::scheduler::RefreshScheduler;
use newsdeck::storage;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

// Helper to create a test pool
async fn setup_test_db() -> SqlitePool {
    let db_path = std::env::temp_dir().join(format!("newsdeck_test_{}.sqlite", uuid::Uuid::new_v4()));
    let pool = init_db_pool(&db_path.to_string_lossy()).await.expect("init pool");
    storage::ensure_schema(&pool).await.expect("ensure schema");
    pool
}

/// Test double that records every delivery instead of sending anything.
struct RecordingNotifier {
    deliveries: Mutex<Vec<(i64, i64, usize)>>,
}

impl RecordingNotifier {
    fn new() -> Self {
        Self {
            deliveries: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait::async_trait]
impl Notifier for RecordingNotifier {
    async fn notify_feed_updates(
        &self,
        user_id: i64,
        feed_id: i64,
        updates: &[FeedEntry],
    ) -> Result<()> {
        self.deliveries.lock().await.push((user_id, feed_id, updates.len()));
        Ok(())
    }
}

fn test_scheduler(
    pool: Arc<SqlitePool>,
    batcher: Arc<NotificationBatcher>,
    notifier: Arc<dyn Notifier>,
) -> Arc<RefreshScheduler> {
    let cache = Arc::new(FailoverCache::in_process(Duration::from_secs(300)));
    let fetcher =
        Arc::new(FeedFetcher::new(Duration::from_secs(5), "newsdeck-test").expect("fetcher"));
    let scheduler_cfg = SchedulerConfig {
        refresh_interval_seconds: Some(300),
        feed_pause_ms: Some(0),
        error_backoff_seconds: Some(1),
        flush_interval_seconds: Some(60),
    };
    let notification_cfg = NotificationConfig {
        retention_days: Some(7),
    };
    Arc::new(RefreshScheduler::new(
        pool,
        cache,
        fetcher,
        batcher,
        notifier,
        scheduler_cfg,
        notification_cfg,
    ))
}

fn rss_body(items: &[(&str, &str)]) -> String {
    let mut body = String::from(
        r#"<?xml version="1.0"?><rss version="2.0"><channel><title>Test Feed</title>"#,
    );
    for (title, link) in items {
        body.push_str(&format!(
            "<item><title>{}</title><link>{}</link><pubDate>Tue, 01 Aug 2023 12:00:00 +0000</pubDate></item>",
            title, link
        ));
    }
    body.push_str("</channel></rss>");
    body
}

#[tokio::test]
async fn cycle_attempts_every_stale_feed_despite_one_failure() {
    let pool = Arc::new(setup_test_db().await);
    let mut server = mockito::Server::new_async().await;

    let good_a = server
        .mock("GET", "/a.xml")
        .with_status(200)
        .with_body(rss_body(&[("A1", "https://example.com/a1")]))
        .expect(1)
        .create_async()
        .await;
    let failing = server
        .mock("GET", "/b.xml")
        .with_status(500)
        .expect(1)
        .create_async()
        .await;
    let good_c = server
        .mock("GET", "/c.xml")
        .with_status(200)
        .with_body(rss_body(&[("C1", "https://example.com/c1")]))
        .expect(1)
        .create_async()
        .await;

    for path in ["/a.xml", "/b.xml", "/c.xml"] {
        storage::create_feed(&pool, &format!("{}{}", server.url(), path), "t")
            .await
            .expect("create feed");
    }

    let scheduler = test_scheduler(
        pool.clone(),
        Arc::new(NotificationBatcher::new()),
        Arc::new(RecordingNotifier::new()),
    );

    let started_at = Utc::now();
    let attempted = scheduler.run_cycle().await.expect("cycle");
    assert_eq!(attempted, 3);

    // Each feed was fetched exactly once; the failing one blocked nothing
    good_a.assert_async().await;
    failing.assert_async().await;
    good_c.assert_async().await;

    // Every feed's last_fetched advanced, including the one whose fetch failed
    let stale = storage::list_stale_feeds(&pool, Utc::now(), Duration::from_secs(300))
        .await
        .expect("list stale");
    assert!(stale.is_empty());
    for id in 1..=3i64 {
        let feed = storage::get_feed(&pool, id).await.expect("get").expect("exists");
        assert!(feed.last_fetched.expect("fetched") >= started_at);
    }

    // Articles landed only for the feeds that actually returned content
    let articles: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM articles")
        .fetch_one(&*pool)
        .await
        .expect("count");
    assert_eq!(articles, 2);
}

#[tokio::test]
async fn stale_feed_is_selected_and_timestamp_advances() {
    let pool = Arc::new(setup_test_db().await);
    let mut server = mockito::Server::new_async().await;
    let _m = server
        .mock("GET", "/feed.xml")
        .with_status(200)
        .with_body(rss_body(&[("A", "https://example.com/a")]))
        .create_async()
        .await;

    let feed_id = storage::create_feed(&pool, &format!("{}/feed.xml", server.url()), "t")
        .await
        .expect("create feed");

    // last_fetched ten minutes ago with a five-minute interval: stale
    let ten_min_ago = Utc::now() - chrono::Duration::minutes(10);
    sqlx::query("UPDATE feeds SET last_fetched = ? WHERE id = ?")
        .bind(ten_min_ago)
        .bind(feed_id)
        .execute(&*pool)
        .await
        .expect("backdate");

    let scheduler = test_scheduler(
        pool.clone(),
        Arc::new(NotificationBatcher::new()),
        Arc::new(RecordingNotifier::new()),
    );

    let cycle_start = Utc::now();
    scheduler.run_cycle().await.expect("cycle");
    let cycle_end = Utc::now();

    let feed = storage::get_feed(&pool, feed_id).await.expect("get").expect("exists");
    let fetched = feed.last_fetched.expect("fetched");
    assert!(fetched >= cycle_start && fetched <= cycle_end);
}

#[tokio::test]
async fn removed_article_does_not_resurrect_as_new() {
    let pool = Arc::new(setup_test_db().await);
    let mut server = mockito::Server::new_async().await;
    let _v1 = server
        .mock("GET", "/feed.xml")
        .with_status(200)
        .with_body(rss_body(&[
            ("A", "https://example.com/a"),
            ("B", "https://example.com/b"),
        ]))
        .create_async()
        .await;

    let feed_id = storage::create_feed(&pool, &format!("{}/feed.xml", server.url()), "t")
        .await
        .expect("create feed");

    let scheduler = test_scheduler(
        pool.clone(),
        Arc::new(NotificationBatcher::new()),
        Arc::new(RecordingNotifier::new()),
    );

    // First pass sees both articles
    assert_eq!(scheduler.refresh_feed(feed_id).await.expect("refresh"), 2);

    // Second response omits B entirely; the diff must report nothing new
    server.reset_async().await;
    let _v2 = server
        .mock("GET", "/feed.xml")
        .with_status(200)
        .with_body(rss_body(&[("A", "https://example.com/a")]))
        .create_async()
        .await;

    assert_eq!(scheduler.refresh_feed(feed_id).await.expect("refresh"), 0);

    let articles: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM articles")
        .fetch_one(&*pool)
        .await
        .expect("count");
    assert_eq!(articles, 2);
}

#[tokio::test]
async fn refresh_feed_reports_unknown_feed() {
    let pool = Arc::new(setup_test_db().await);
    let scheduler = test_scheduler(
        pool,
        Arc::new(NotificationBatcher::new()),
        Arc::new(RecordingNotifier::new()),
    );
    assert!(scheduler.refresh_feed(9999).await.is_err());
}

#[tokio::test]
async fn notifications_batch_and_flush_by_tier() {
    let pool = Arc::new(setup_test_db().await);
    let mut server = mockito::Server::new_async().await;
    let _m = server
        .mock("GET", "/feed.xml")
        .with_status(200)
        .with_body(rss_body(&[("A", "https://example.com/a")]))
        .create_async()
        .await;

    let feed_id = storage::create_feed(&pool, &format!("{}/feed.xml", server.url()), "t")
        .await
        .expect("create feed");

    sqlx::query("INSERT INTO users (username) VALUES ('alice')")
        .execute(&*pool)
        .await
        .expect("user");
    let user_id: i64 = sqlx::query_scalar("SELECT id FROM users WHERE username = 'alice'")
        .fetch_one(&*pool)
        .await
        .expect("user id");
    sqlx::query(
        "INSERT INTO feed_preferences (user_id, feed_id, update_frequency) VALUES (?, ?, 'hourly')",
    )
    .bind(user_id)
    .bind(feed_id)
    .execute(&*pool)
    .await
    .expect("pref");

    let batcher = Arc::new(NotificationBatcher::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let scheduler = test_scheduler(pool.clone(), batcher.clone(), notifier.clone());

    // New entries get batched for the subscriber
    assert_eq!(scheduler.refresh_feed(feed_id).await.expect("refresh"), 1);
    assert_eq!(batcher.len(Frequency::Hourly).await, 1);

    // Never-notified holder is due immediately
    let now = Utc::now();
    let delivered = scheduler.flush_due_notifications(now).await.expect("flush");
    assert_eq!(delivered, 1);
    {
        let deliveries = notifier.deliveries.lock().await;
        assert_eq!(deliveries.as_slice(), &[(user_id, feed_id, 1)]);
    }
    assert_eq!(batcher.len(Frequency::Hourly).await, 0);

    // Queue another update by hand; the holder was just notified, so it only
    // flushes once a full hour of wall-clock time has elapsed
    batcher
        .enqueue(
            Frequency::Hourly,
            PendingUpdate {
                user_id,
                feed_id,
                entry: FeedEntry {
                    title: "late".into(),
                    summary: String::new(),
                    url: "https://example.com/late".into(),
                    author: String::new(),
                    category: String::new(),
                    source: String::new(),
                    published_at: Utc::now(),
                    extra: HashMap::new(),
                },
                queued_at: Utc::now(),
            },
        )
        .await;

    assert_eq!(
        scheduler.flush_due_notifications(now).await.expect("flush"),
        0
    );
    assert_eq!(
        scheduler
            .flush_due_notifications(now + chrono::Duration::minutes(61))
            .await
            .expect("flush later"),
        1
    );
}

#[tokio::test]
async fn start_is_idempotent_and_stop_is_always_safe() {
    let pool = Arc::new(setup_test_db().await);
    let scheduler = test_scheduler(
        pool,
        Arc::new(NotificationBatcher::new()),
        Arc::new(RecordingNotifier::new()),
    );

    // stop before any start must not hang or panic
    scheduler.stop().await;
    assert!(!scheduler.is_running());

    scheduler.start().await;
    assert!(scheduler.is_running());
    // second start is a no-op
    scheduler.start().await;
    assert!(scheduler.is_running());

    scheduler.stop().await;
    assert!(!scheduler.is_running());

    // restart after stop works
    scheduler.start().await;
    assert!(scheduler.is_running());
    scheduler.stop().await;
    assert!(!scheduler.is_running());
}
