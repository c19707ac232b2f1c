//! End-to-end sync scenarios: scheduler, merger, storage and persistence
//! working together against a scripted listing source.
//!
//! Every test runs on virtual time and its own temporary state directory.

use futures::future::BoxFuture;
use pretty_assertions::assert_eq;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};

use feedstash::clock::ManualClock;
use feedstash::config::Config;
use feedstash::engine::Engine;
use feedstash::feed::{FetchError, FetchReport, ItemSource};
use feedstash::storage::{Feed, FeedKind, FixedProbe, Item, PersistentStore, Snapshot};
use feedstash::sync::{Job, JobKind, JobQueue, JobStatus};

const NOW_SECS: i64 = 1_700_000_000;

/// Replays queued reports per source; `None` keys the global listing.
#[derive(Default)]
struct ScriptedSource {
    scripts: Mutex<HashMap<Option<String>, VecDeque<FetchReport>>>,
    calls: Mutex<Vec<Option<String>>>,
}

impl ScriptedSource {
    fn push(&self, source: Option<&str>, report: FetchReport) {
        self.scripts
            .lock()
            .unwrap()
            .entry(source.map(str::to_string))
            .or_default()
            .push_back(report);
    }

    fn calls_for(&self, source: Option<&str>) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.as_deref() == source)
            .count()
    }
}

impl ItemSource for ScriptedSource {
    fn fetch<'a>(&'a self, source: Option<&'a str>) -> BoxFuture<'a, FetchReport> {
        Box::pin(async move {
            let key = source.map(str::to_string);
            self.calls.lock().unwrap().push(key.clone());
            self.scripts
                .lock()
                .unwrap()
                .get_mut(&key)
                .and_then(VecDeque::pop_front)
                .unwrap_or_else(|| FetchReport::ok(Vec::new()))
        })
    }
}

fn item(id: &str, created_at: i64) -> Item {
    Item {
        id: id.to_string(),
        source_key: "a".to_string(),
        author: "someone".to_string(),
        created_at,
        title: format!("Item {id}"),
        text: String::new(),
        url: Some(format!("https://example.com/{id}")),
        permalink: None,
        score: 1,
        num_comments: 0,
        media: None,
    }
}

fn ids(items: &[Item]) -> Vec<&str> {
    items.iter().map(|i| i.id.as_str()).collect()
}

fn manual_config() -> Config {
    let mut config = Config::default();
    config.sync.auto_apply_initial = false;
    config.rate_limit.min_interval_ms = 0;
    config
}

async fn open(
    dir: &Path,
    config: Config,
    source: Arc<ScriptedSource>,
    quota_bytes: u64,
) -> (Engine, ManualClock) {
    let clock = ManualClock::new(NOW_SECS * 1000);
    let engine = Engine::open_with_probe(
        config,
        &dir.join("state.json"),
        Arc::new(clock.clone()),
        source,
        Arc::new(FixedProbe(quota_bytes)),
    )
    .await;
    (engine, clock)
}

// ============================================================================
// Staging and applying
// ============================================================================

#[tokio::test]
async fn test_first_fetch_stages_then_apply_sorts() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(ScriptedSource::default());
    source.push(
        Some("a"),
        FetchReport::ok(vec![
            item("1", NOW_SECS - 30),
            item("2", NOW_SECS - 10),
            item("3", NOW_SECS - 20),
        ]),
    );
    let (engine, _clock) = open(dir.path(), manual_config(), source, u64::MAX).await;

    engine
        .scheduler()
        .enqueue(JobKind::FetchSource, Some("a"))
        .await
        .unwrap();
    let report = engine.scheduler().run().await;
    assert_eq!(report.completed, 1);

    {
        let feed = engine.state().feed(FeedKind::Subscribed).lock().await;
        assert_eq!(feed.pending.len(), 3);
        assert!(feed.items.is_empty());
    }

    assert_eq!(engine.apply(Some(FeedKind::Subscribed)).await, 3);
    let feed = engine.state().feed(FeedKind::Subscribed).lock().await;
    assert_eq!(ids(&feed.items), vec!["2", "3", "1"]);
    assert!(feed.pending.is_empty());
}

#[tokio::test]
async fn test_refetch_stages_only_unseen_items() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(ScriptedSource::default());
    source.push(
        Some("a"),
        FetchReport::ok(vec![
            item("1", NOW_SECS - 3),
            item("2", NOW_SECS - 2),
            item("3", NOW_SECS - 1),
        ]),
    );
    source.push(
        Some("a"),
        FetchReport::ok(vec![
            item("2", NOW_SECS - 2),
            item("3", NOW_SECS - 1),
            item("4", NOW_SECS),
        ]),
    );
    // Default config: the first pass populates the empty feed directly.
    let mut config = Config::default();
    config.rate_limit.min_interval_ms = 0;
    let (engine, _clock) = open(dir.path(), config, source, u64::MAX).await;
    engine.subscribe("a").await.unwrap();

    let first = engine.sync().await;
    assert_eq!(first.auto_applied.get(&FeedKind::Subscribed), Some(&3));

    let second = engine.sync().await;
    assert_eq!(second.staged.get(&FeedKind::Subscribed), Some(&1));
    assert!(second.auto_applied.get(&FeedKind::Subscribed).is_none());

    let feed = engine.state().feed(FeedKind::Subscribed).lock().await;
    assert_eq!(ids(&feed.items), vec!["3", "2", "1"]);
    assert_eq!(ids(&feed.pending), vec!["4"]);
}

// ============================================================================
// Failure handling
// ============================================================================

#[tokio::test]
async fn test_repeated_timeouts_fail_permanently_and_leave_queue() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(ScriptedSource::default());
    for _ in 0..3 {
        source.push(Some("a"), FetchReport::err(FetchError::Timeout));
    }
    let mut config = manual_config();
    config.sync.max_retries = 3;
    config.fetch.fetch_retries = 0;
    let (engine, _clock) = open(dir.path(), config, source.clone(), u64::MAX).await;

    let job = engine
        .scheduler()
        .enqueue(JobKind::FetchSource, Some("a"))
        .await
        .unwrap();
    let report = engine.scheduler().run().await;

    assert_eq!(source.calls_for(Some("a")), 3);
    assert_eq!(report.failed_attempts, 3);
    assert_eq!(report.failed_permanently.len(), 1);
    assert_eq!(report.failed_permanently[0].id, job.id);
    assert_eq!(report.failed_permanently[0].retries, 3);
    assert!(engine.state().jobs.lock().await.get(job.id).is_none());

    // The source can be queued again once the failed job is gone.
    assert!(engine
        .scheduler()
        .enqueue(JobKind::FetchSource, Some("a"))
        .await
        .is_some());
}

#[tokio::test]
async fn test_interrupted_job_recovered_on_open() {
    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("state.json");
    let snapshot = Snapshot {
        jobs: JobQueue::from_jobs(vec![Job {
            id: 7,
            kind: JobKind::FetchGlobal,
            source_key: None,
            status: JobStatus::Processing,
            retries: 2,
            enqueued_at: NOW_SECS * 1000 - 5_000,
            started_at: Some(NOW_SECS * 1000 - 4_000),
        }]),
        next_job_id: 8,
        ..Snapshot::default()
    };
    PersistentStore::new(&state_path).save(&snapshot).unwrap();

    let source = Arc::new(ScriptedSource::default());
    let (engine, _clock) = open(dir.path(), manual_config(), source.clone(), u64::MAX).await;
    {
        let jobs = engine.state().jobs.lock().await;
        let job = jobs.get(7).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retries, 0);
    }

    let report = engine.scheduler().run().await;
    assert_eq!(report.completed, 1);
    assert_eq!(source.calls_for(None), 1);

    // Ids continue after the persisted counter.
    let next = engine
        .scheduler()
        .enqueue(JobKind::FetchGlobal, None)
        .await
        .unwrap();
    assert_eq!(next.id, 8);
}

// ============================================================================
// Storage budget
// ============================================================================

#[tokio::test]
async fn test_over_threshold_on_load_evicts_a_fifth() {
    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("state.json");

    let items: Vec<Item> = (0..1000)
        .map(|i| item(&format!("t3_{i:04}"), NOW_SECS - i))
        .collect();
    let mut snapshot = Snapshot::default();
    snapshot.feeds.insert(
        FeedKind::Subscribed,
        Feed {
            items,
            ..Feed::default()
        },
    );
    snapshot.library.pinned.push(item("t3_0999", NOW_SECS - 999));
    let size = PersistentStore::new(&state_path).save(&snapshot).unwrap();

    // Quota such that the store sits at ~95%.
    let quota = size * 100 / 95;
    let source = Arc::new(ScriptedSource::default());
    let (engine, _clock) = open(dir.path(), manual_config(), source, quota).await;

    let feed = engine.state().feed(FeedKind::Subscribed).lock().await;
    assert_eq!(feed.items.len(), 800);
    // Oldest unpinned items went first; the pinned oldest item stayed.
    assert_eq!(feed.items.last().map(|i| i.id.as_str()), Some("t3_0999"));
    assert!(feed
        .items
        .iter()
        .all(|i| i.id.as_str() < "t3_0800" || i.id == "t3_0999"));
}

#[tokio::test]
async fn test_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(ScriptedSource::default());
    source.push(
        None,
        FetchReport::ok(vec![item("g1", NOW_SECS - 1), item("g2", NOW_SECS - 2)]),
    );
    {
        let (engine, _clock) = open(dir.path(), Config::default(), source, u64::MAX).await;
        engine.subscribe("a").await.unwrap();
        engine.sync().await;
        engine.pin("g2").await.unwrap();
        engine.shutdown().await.unwrap();
    }

    let (engine, _clock) = open(
        dir.path(),
        Config::default(),
        Arc::new(ScriptedSource::default()),
        u64::MAX,
    )
    .await;
    let status = engine.status().await.unwrap();
    assert_eq!(status.subscriptions, vec!["a".to_string()]);
    assert_eq!(status.feeds[&FeedKind::Global].applied, 2);
    assert_eq!(status.pinned, 1);
    assert!(status.rate_limit.request_count >= 2);
}

#[tokio::test]
async fn test_corrupt_state_file_starts_empty() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("state.json"), b"not json at all").unwrap();

    let (engine, _clock) = open(
        dir.path(),
        Config::default(),
        Arc::new(ScriptedSource::default()),
        u64::MAX,
    )
    .await;
    let status = engine.status().await.unwrap();
    assert!(status.subscriptions.is_empty());

    let moved_aside = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(Result::ok)
        .any(|e| e.file_name().to_string_lossy().starts_with("state.json.corrupt-"));
    assert!(moved_aside);
}
