use super::entry::Snapshot;
use super::key::CacheKey;
use super::QueryCache;
use crate::error::Result;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;

/// A consumer's attachment to one cache key.
///
/// Reading never waits: [`snapshot`](Self::snapshot) returns whatever the
/// entry holds right now, possibly stale while a refresh runs. Dropping the
/// subscription releases it, which may start the entry's eviction.
pub struct CacheSubscription {
    pub(super) cache: QueryCache,
    pub(super) key: CacheKey,
    pub(super) entry_id: u64,
    pub(super) receiver: watch::Receiver<Snapshot>,
}

impl CacheSubscription {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn snapshot(&self) -> Snapshot {
        self.receiver.borrow().clone()
    }

    /// Wait for the entry to change and return its new state.
    ///
    /// Returns `None` once the entry has been cleared from the cache.
    pub async fn changed(&mut self) -> Option<Snapshot> {
        self.receiver.changed().await.ok()?;
        Some(self.receiver.borrow_and_update().clone())
    }

    /// Wait for the in-flight fetch if there is one, otherwise return the
    /// current data or error.
    pub async fn resolve(&self) -> Result<Arc<Value>> {
        self.cache.resolve_entry(&self.key, self.entry_id).await
    }

    /// Refetch now unless a fetch is already running.
    pub fn revalidate(&self) -> bool {
        self.cache.revalidate(&self.key)
    }
}

impl Drop for CacheSubscription {
    fn drop(&mut self) {
        self.cache.release(&self.key, self.entry_id);
    }
}
