//! Per-target serialization locks
//!
//! At most one non-terminal job may exist per target. The scheduler claims
//! the target before creating the job; the executor releases it as part of
//! terminal settlement. Claim-or-reject is atomic: the map is only touched
//! under one lock, and the lock is never held across an await.

use std::collections::HashMap;

use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
pub struct TargetLocks {
    inner: Mutex<HashMap<String, Uuid>>,
}

impl TargetLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `target` for `job_id`. Rejects with the current owner's job id
    /// when the target is already held.
    pub async fn claim(&self, target: &str, job_id: Uuid) -> Result<(), Uuid> {
        let mut locks = self.inner.lock().await;
        match locks.get(target) {
            Some(owner) => Err(*owner),
            None => {
                locks.insert(target.to_string(), job_id);
                Ok(())
            }
        }
    }

    /// Release `target`, but only if `job_id` still owns it. Returns
    /// whether a release happened.
    pub async fn release(&self, target: &str, job_id: Uuid) -> bool {
        let mut locks = self.inner.lock().await;
        match locks.get(target) {
            Some(owner) if *owner == job_id => {
                locks.remove(target);
                true
            }
            _ => false,
        }
    }

    /// Job currently holding `target`, if any
    pub async fn owner(&self, target: &str) -> Option<Uuid> {
        self.inner.lock().await.get(target).copied()
    }

    /// Number of currently claimed targets
    pub async fn claimed_count(&self) -> usize {
        self.inner.lock().await.len()
    }
}
