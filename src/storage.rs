use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::Mutex;

use crate::error::StorageError;
use crate::types::{HitId, JobStatus, JobTracking, NewHit, WebhookHit};

/// Conflicting writers re-read and re-apply their transition at most this
/// many times before giving up.
const MAX_CAS_ATTEMPTS: usize = 8;

#[async_trait]
pub trait HitStore: Send + Sync {
    /// Persist a new hit with status `queued` and zero attempts.
    async fn record(&self, hit: NewHit) -> Result<HitId, StorageError>;

    async fn get(&self, id: HitId) -> Result<Option<WebhookHit>, StorageError>;

    /// Most recently received hits first.
    async fn recent(&self, limit: usize) -> Result<Vec<WebhookHit>, StorageError>;

    async fn with_status(&self, status: JobStatus) -> Result<Vec<WebhookHit>, StorageError>;

    /// Replace the tracking columns of `id` with `next` only if the row still
    /// matches `expected` on `job_id`, `job_status` and `job_attempts`.
    ///
    /// Returns `false` when the row is missing or was changed by someone else.
    async fn compare_and_swap(
        &self,
        id: HitId,
        expected: &JobTracking,
        next: &JobTracking,
    ) -> Result<bool, StorageError>;
}

/// Apply `transition` to the current tracking of `id` and persist it.
///
/// `transition` must be pure: it may run several times when the row changes
/// between read and write. Returns the persisted tracking, or `None` when
/// the hit does not exist.
pub async fn update_tracking<S, F>(
    store: &S,
    id: HitId,
    transition: F,
) -> Result<Option<JobTracking>, StorageError>
where
    S: HitStore + ?Sized,
    F: Fn(&JobTracking) -> JobTracking,
{
    for _ in 0..MAX_CAS_ATTEMPTS {
        let Some(hit) = store.get(id).await? else {
            return Ok(None);
        };
        let next = transition(&hit.tracking);
        if next == hit.tracking {
            return Ok(Some(next));
        }
        if store.compare_and_swap(id, &hit.tracking, &next).await? {
            return Ok(Some(next));
        }
        tracing::debug!(hit_id = %id, "tracking update conflicted, retrying");
    }

    Err(StorageError::Backend(format!(
        "hit {id} kept changing during update"
    )))
}

/// In-memory storage for tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryHitStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    next_id: i64,
    hits: BTreeMap<HitId, WebhookHit>,
}

impl InMemoryHitStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.hits.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl HitStore for InMemoryHitStore {
    async fn record(&self, hit: NewHit) -> Result<HitId, StorageError> {
        let mut inner = self.inner.lock().await;
        inner.next_id += 1;
        let id = HitId(inner.next_id);
        inner.hits.insert(id, hit.into_hit(id));
        Ok(id)
    }

    async fn get(&self, id: HitId) -> Result<Option<WebhookHit>, StorageError> {
        Ok(self.inner.lock().await.hits.get(&id).cloned())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<WebhookHit>, StorageError> {
        let inner = self.inner.lock().await;
        let mut hits: Vec<WebhookHit> = inner.hits.values().cloned().collect();
        hits.sort_by(|a, b| b.received_at.cmp(&a.received_at).then(b.id.cmp(&a.id)));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn with_status(&self, status: JobStatus) -> Result<Vec<WebhookHit>, StorageError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .hits
            .values()
            .filter(|hit| hit.tracking.job_status == status)
            .cloned()
            .collect())
    }

    async fn compare_and_swap(
        &self,
        id: HitId,
        expected: &JobTracking,
        next: &JobTracking,
    ) -> Result<bool, StorageError> {
        let mut inner = self.inner.lock().await;
        let Some(hit) = inner.hits.get_mut(&id) else {
            return Ok(false);
        };
        if !hit.tracking.same_guard(expected) {
            return Ok(false);
        }
        hit.tracking = next.clone();
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CorrelationId;

    fn new_hit() -> NewHit {
        NewHit::from_raw(None, Some("contact.created".into()), b"{}", Default::default(), None)
    }

    #[tokio::test]
    async fn record_starts_queued() {
        let store = InMemoryHitStore::new();
        let id = store.record(new_hit()).await.unwrap();
        let hit = store.get(id).await.unwrap().unwrap();
        assert_eq!(hit.tracking.job_status, JobStatus::Queued);
        assert_eq!(hit.tracking.job_attempts, 0);
        assert!(hit.tracking.job_result.is_none());
    }

    #[tokio::test]
    async fn stale_swap_is_rejected() {
        let store = InMemoryHitStore::new();
        let id = store.record(new_hit()).await.unwrap();
        let stale = store.get(id).await.unwrap().unwrap().tracking;

        let first = stale.dispatched(None, &CorrelationId::generate());
        assert!(store.compare_and_swap(id, &stale, &first).await.unwrap());

        let second = stale.dispatched(None, &CorrelationId::generate());
        assert!(!store.compare_and_swap(id, &stale, &second).await.unwrap());

        let stored = store.get(id).await.unwrap().unwrap().tracking;
        assert_eq!(stored.job_id, first.job_id);
    }

    #[tokio::test]
    async fn update_tracking_missing_hit() {
        let store = InMemoryHitStore::new();
        let result = update_tracking(&store, HitId(42), |t| t.clone()).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn recent_is_newest_first() {
        let store = InMemoryHitStore::new();
        let a = store.record(new_hit()).await.unwrap();
        let b = store.record(new_hit()).await.unwrap();
        let ids: Vec<HitId> = store.recent(10).await.unwrap().iter().map(|h| h.id).collect();
        assert_eq!(ids, vec![b, a]);
        assert_eq!(store.recent(1).await.unwrap().len(), 1);
    }
}
