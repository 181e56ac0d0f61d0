use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Per-job async mutual exclusion.
///
/// Reconciliation, lifecycle transitions and admission checks of the same
/// job are serialised; different jobs never contend. Locks are created on
/// first use and kept for the life of the table.
#[derive(Default)]
pub struct JobLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

/// Held for the duration of one read-modify-write on a job's rows.
pub type JobGuard = OwnedMutexGuard<()>;

impl JobLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for and take the lock of `job_id`.
    pub async fn acquire(&self, job_id: &str) -> JobGuard {
        // Clone the Arc out so the DashMap shard is not held across the await.
        let lock = self
            .locks
            .entry(job_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }
}

/// Run ids handed to a dispatcher and not yet let go: sitting in the
/// dispatch channel, parked in a queue, or executing.
///
/// The tick loop forwards a pending run only if it can claim it here. The
/// dispatcher releases a run once it is done with it, so a run it defers
/// stays pending and is forwarded again by a later tick. The set lives in
/// memory: after a restart every SCHEDULED run is forwarded once more.
#[derive(Debug, Default)]
pub struct InFlight {
    ids: DashMap<String, ()>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take `run_id`; `false` if it is already claimed.
    pub fn claim(&self, run_id: &str) -> bool {
        self.ids.insert(run_id.to_string(), ()).is_none()
    }

    pub fn release(&self, run_id: &str) {
        self.ids.remove(run_id);
    }

    pub fn contains(&self, run_id: &str) -> bool {
        self.ids.contains_key(run_id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}
