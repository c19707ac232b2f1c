//! The explicit state context shared by every engine component.
//!
//! Each durable sub-structure sits behind its own async mutex and has one
//! owner: the scheduler owns `jobs`, the rate limiter owns `rate_limit`,
//! the merger owns the staging/applied transitions of each feed. The
//! persistence layer only ever reads everything at once to build a
//! [`Snapshot`].
//!
//! Lock order, when more than one guard is held: `library`, `subscribed`,
//! `global`, `jobs`, `rate_limit`.

use std::sync::Arc;
use tokio::sync::Mutex;

use crate::storage::{Feed, FeedKind, Library, Snapshot};
use crate::sync::{JobIds, JobQueue, RateLimitState, SequentialIds};

pub struct SyncState {
    subscribed: Mutex<Feed>,
    global: Mutex<Feed>,
    pub jobs: Mutex<JobQueue>,
    pub rate_limit: Mutex<RateLimitState>,
    pub library: Mutex<Library>,
    job_ids: Arc<dyn JobIds>,
}

impl Default for SyncState {
    fn default() -> Self {
        Self::from_snapshot(Snapshot::default())
    }
}

impl SyncState {
    /// Build state from a loaded snapshot, continuing its job id sequence.
    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        let ids = Arc::new(SequentialIds::starting_at(snapshot.next_job_id));
        Self::with_ids(snapshot, ids)
    }

    /// Build state with a caller-supplied id generator.
    pub fn with_ids(mut snapshot: Snapshot, job_ids: Arc<dyn JobIds>) -> Self {
        let subscribed = snapshot.feeds.remove(&FeedKind::Subscribed).unwrap_or_default();
        let global = snapshot.feeds.remove(&FeedKind::Global).unwrap_or_default();
        Self {
            subscribed: Mutex::new(subscribed),
            global: Mutex::new(global),
            jobs: Mutex::new(snapshot.jobs),
            rate_limit: Mutex::new(snapshot.rate_limit),
            library: Mutex::new(snapshot.library),
            job_ids,
        }
    }

    pub fn feed(&self, kind: FeedKind) -> &Mutex<Feed> {
        match kind {
            FeedKind::Subscribed => &self.subscribed,
            FeedKind::Global => &self.global,
        }
    }

    pub fn job_ids(&self) -> &dyn JobIds {
        self.job_ids.as_ref()
    }

    /// Copy every durable field into one consistent snapshot.
    ///
    /// All guards are held together (in lock order) so the copy never
    /// mixes states from before and after a concurrent mutation.
    pub async fn snapshot(&self) -> Snapshot {
        let library = self.library.lock().await;
        let subscribed = self.subscribed.lock().await;
        let global = self.global.lock().await;
        let jobs = self.jobs.lock().await;
        let rate_limit = self.rate_limit.lock().await;

        let mut snapshot = Snapshot {
            library: library.clone(),
            jobs: jobs.clone(),
            rate_limit: rate_limit.clone(),
            next_job_id: self.job_ids.peek(),
            ..Snapshot::default()
        };
        snapshot.feeds.insert(FeedKind::Subscribed, subscribed.clone());
        snapshot.feeds.insert(FeedKind::Global, global.clone());
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::JobKind;

    #[tokio::test]
    async fn test_snapshot_round_trips_through_state() {
        let mut snapshot = Snapshot::default();
        snapshot.next_job_id = 41;
        snapshot
            .library
            .subscriptions
            .push("rust".to_string());
        snapshot.feeds.insert(
            FeedKind::Global,
            Feed {
                last_fetch: [("popular".to_string(), 99)].into_iter().collect(),
                ..Feed::default()
            },
        );

        let state = SyncState::from_snapshot(snapshot.clone());
        {
            let mut jobs = state.jobs.lock().await;
            let job = jobs
                .enqueue(JobKind::FetchGlobal, None, 0, state.job_ids())
                .unwrap();
            assert_eq!(job.id, 41);
        }

        let out = state.snapshot().await;
        assert_eq!(out.next_job_id, 42);
        assert_eq!(out.library, snapshot.library);
        assert_eq!(out.feeds[&FeedKind::Global].last_fetch["popular"], 99);
        assert!(out.feeds.contains_key(&FeedKind::Subscribed));
        assert_eq!(out.jobs.len(), 1);
    }
}
