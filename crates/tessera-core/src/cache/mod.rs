//! Stale-while-revalidate query cache.
//!
//! Entries are keyed by a fingerprint of (channel, arguments). For any key at
//! most one fetch runs at a time: the check and the in-flight marker are set
//! inside one critical section, and every concurrent reader attaches to the
//! same shared future. Readers never wait for data; they get the current
//! snapshot and are notified through a watch channel when it changes.
//!
//! Besides explicit revalidation, an entry refreshes when it is read after its
//! deduping interval, on [`QueryCache::revalidate_on_focus`] and
//! [`QueryCache::revalidate_on_reconnect`], after an invalidation, and on
//! scheduled error retries with exponential backoff.

mod entry;
mod key;
mod subscription;

pub use entry::Snapshot;
pub use key::CacheKey;
pub use subscription::CacheSubscription;

use crate::channel::Channel;
use crate::config::{CacheConfig, EvictionPolicy, KeyOptions};
use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use entry::{CacheEntry, InFlight, SharedFetch};
use futures::FutureExt;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Where the cache gets its data.
///
/// Implemented by the RPC proxy and the IPC client; tests substitute their
/// own.
#[async_trait]
pub trait Fetcher: Send + Sync + 'static {
    async fn fetch(&self, channel: &str, args: Value) -> Result<Value>;
}

type SlowLoadingCallback = Arc<dyn Fn(&CacheKey) + Send + Sync>;

/// Point-in-time counters for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub in_flight: usize,
    pub subscribers: usize,
    pub fetches_started: u64,
}

/// Cheap to clone; clones share the same entries.
#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    fetcher: Arc<dyn Fetcher>,
    config: CacheConfig,
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
    next_entry_id: AtomicU64,
    last_focus_revalidation: Mutex<Option<Instant>>,
    on_loading_slow: RwLock<Option<SlowLoadingCallback>>,
    fetches_started: AtomicU64,
}

impl QueryCache {
    pub fn new(fetcher: Arc<dyn Fetcher>, config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                fetcher,
                config,
                entries: Mutex::new(HashMap::new()),
                next_entry_id: AtomicU64::new(1),
                last_focus_revalidation: Mutex::new(None),
                on_loading_slow: RwLock::new(None),
                fetches_started: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Subscribe to `channel(args)`.
    ///
    /// Returns immediately. If the entry is missing or older than its
    /// deduping interval and nothing is in flight, one fetch is started in the
    /// background.
    ///
    /// Outside a tokio runtime nothing is spawned: the fetch only makes
    /// progress while someone awaits [`CacheSubscription::resolve`], failed
    /// fetches are not retried, and idle entries are evicted at once.
    pub fn use_keyed(&self, channel: &str, args: Value, options: KeyOptions) -> CacheSubscription {
        let key = CacheKey::fingerprint(channel, &args);
        let options = options.resolve(&self.inner.config);

        let (entry_id, receiver) = {
            let mut entries = self.inner.lock();
            let entry = entries.entry(key.clone()).or_insert_with(|| {
                let id = self.inner.next_entry_id.fetch_add(1, Ordering::Relaxed);
                CacheEntry::new(id, channel, args, options.clone())
            });
            entry.options = options;
            entry.subscribers += 1;
            // Cancels a pending idle eviction.
            entry.idle_epoch += 1;

            if entry.in_flight.is_none() && entry.is_stale(Instant::now()) {
                self.inner.start_fetch(&key, entry, false);
            }
            (entry.id, entry.notifier.subscribe())
        };

        CacheSubscription {
            cache: self.clone(),
            key,
            entry_id,
            receiver,
        }
    }

    /// Read `channel(args)` through the cache, waiting for a fetch if one is
    /// needed.
    pub async fn fetch(&self, channel: &str, args: Value, options: KeyOptions) -> Result<Arc<Value>> {
        self.use_keyed(channel, args, options).resolve().await
    }

    /// Typed variant of [`fetch`](Self::fetch).
    pub async fn fetch_typed<C: Channel>(&self, args: C::Args, options: KeyOptions) -> Result<C::Output> {
        let args = serde_json::to_value(args).map_err(|e| {
            BridgeError::serialization(format!("Unserializable arguments for '{}': {}", C::NAME, e))
        })?;
        let value = self.fetch(C::NAME, args, options).await?;
        <C::Output as Deserialize>::deserialize(value.as_ref()).map_err(|e| {
            BridgeError::serialization(format!("Unexpected result from '{}': {}", C::NAME, e))
        })
    }

    pub fn snapshot(&self, key: &CacheKey) -> Option<Snapshot> {
        self.inner.lock().get(key).map(CacheEntry::snapshot)
    }

    /// Refetch `key` now. Returns `false` if the key is unknown or a fetch is
    /// already running (callers attach to that one instead).
    pub fn revalidate(&self, key: &CacheKey) -> bool {
        let mut entries = self.inner.lock();
        let Some(entry) = entries.get_mut(key) else {
            return false;
        };
        if entry.in_flight.is_some() {
            return false;
        }
        self.inner.start_fetch(key, entry, false);
        true
    }

    /// Mark `key` stale and refetch it for its subscribers.
    ///
    /// A fetch already in flight is followed by exactly one more. Without
    /// subscribers the entry is only marked, and refetches on its next read.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        let mut entries = self.inner.lock();
        match entries.get_mut(key) {
            Some(entry) => {
                self.inner.invalidate_entry(key, entry);
                true
            }
            None => false,
        }
    }

    /// Invalidate every entry of `channel`, whatever its arguments.
    pub fn invalidate_channel(&self, channel: &str) -> usize {
        let mut entries = self.inner.lock();
        let mut count = 0;
        for (key, entry) in entries.iter_mut() {
            if entry.channel == channel {
                self.inner.invalidate_entry(key, entry);
                count += 1;
            }
        }
        debug!("Invalidated {} entr(ies) of '{}'", count, channel);
        count
    }

    /// Replace the data of `key` locally without fetching.
    ///
    /// A fetch that started before the mutation does not overwrite it.
    pub fn mutate(&self, key: &CacheKey, value: Value) -> bool {
        let mut entries = self.inner.lock();
        let Some(entry) = entries.get_mut(key) else {
            return false;
        };
        entry.epoch += 1;
        entry.mutation_epoch = entry.epoch;
        entry.data = Some(Arc::new(value));
        entry.error = None;
        entry.retry_attempt = 0;
        entry.retry_pending = false;
        entry.stale = false;
        entry.last_fetched_at = Some(Instant::now());
        entry.publish();
        true
    }

    /// The window regained focus: refresh stale, subscribed entries.
    ///
    /// Throttled by `focus_throttle_interval`; returns the number of fetches
    /// started.
    pub fn revalidate_on_focus(&self) -> usize {
        let now = Instant::now();
        {
            let mut last = self
                .inner
                .last_focus_revalidation
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(at) = *last {
                if now.saturating_duration_since(at) < self.inner.config.focus_throttle_interval {
                    debug!("Focus revalidation throttled");
                    return 0;
                }
            }
            *last = Some(now);
        }

        let mut entries = self.inner.lock();
        let mut started = 0;
        for (key, entry) in entries.iter_mut() {
            if entry.subscribers > 0
                && entry.options.revalidate_on_focus
                && entry.in_flight.is_none()
                && entry.is_stale(now)
            {
                self.inner.start_fetch(key, entry, false);
                started += 1;
            }
        }
        started
    }

    /// The connection came back: refresh every subscribed entry.
    pub fn revalidate_on_reconnect(&self) -> usize {
        let mut entries = self.inner.lock();
        let mut started = 0;
        for (key, entry) in entries.iter_mut() {
            if entry.subscribers > 0 && entry.options.revalidate_on_reconnect && entry.in_flight.is_none() {
                self.inner.start_fetch(key, entry, false);
                started += 1;
            }
        }
        started
    }

    /// Register the diagnostic callback for fetches that exceed their
    /// `loading_timeout`. The fetch itself keeps running.
    pub fn on_loading_slow<F>(&self, callback: F)
    where
        F: Fn(&CacheKey) + Send + Sync + 'static,
    {
        *self
            .inner
            .on_loading_slow
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
    }

    /// Drop every entry. Subscribers see their watch close.
    pub fn clear(&self) {
        let drained: Vec<CacheEntry> = self.inner.lock().drain().map(|(_, entry)| entry).collect();
        debug!("Cleared {} cache entr(ies)", drained.len());
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.inner.lock();
        CacheStats {
            entries: entries.len(),
            in_flight: entries.values().filter(|e| e.in_flight.is_some()).count(),
            subscribers: entries.values().map(|e| e.subscribers).sum(),
            fetches_started: self.inner.fetches_started.load(Ordering::Relaxed),
        }
    }

    async fn resolve_entry(&self, key: &CacheKey, entry_id: u64) -> Result<Arc<Value>> {
        let pending: SharedFetch = {
            let mut entries = self.inner.lock();
            let Some(entry) = entries.get_mut(key).filter(|e| e.id == entry_id) else {
                return Err(BridgeError::transport(format!("Cache entry {} was cleared", key)));
            };
            if let Some(in_flight) = &entry.in_flight {
                in_flight.future.clone()
            } else if let Some(error) = &entry.error {
                return Err(error.clone());
            } else if let Some(data) = &entry.data {
                return Ok(data.clone());
            } else {
                self.inner.start_fetch(key, entry, false)
            }
        };
        pending.await
    }

    fn release(&self, key: &CacheKey, entry_id: u64) {
        let mut entries = self.inner.lock();
        let Some(entry) = entries.get_mut(key).filter(|e| e.id == entry_id) else {
            return;
        };
        entry.subscribers = entry.subscribers.saturating_sub(1);
        if entry.subscribers > 0 {
            return;
        }

        match self.inner.config.eviction {
            EvictionPolicy::Immediate => {
                entries.remove(key);
                debug!("Evicted {}", key);
            }
            EvictionPolicy::Idle(after) => {
                entry.idle_epoch += 1;
                let idle_epoch = entry.idle_epoch;
                let owner = Arc::downgrade(&self.inner);
                let evict_key = key.clone();
                let timer = spawn_detached(async move {
                    tokio::time::sleep(after).await;
                    if let Some(inner) = owner.upgrade() {
                        inner.evict_idle(&evict_key, entry_id, idle_epoch);
                    }
                });
                // No runtime left to run the timer.
                if !timer {
                    entries.remove(key);
                    debug!("Evicted {}", key);
                }
            }
            EvictionPolicy::Never => {}
        }
    }
}

impl CacheInner {
    fn lock(&self) -> MutexGuard<'_, HashMap<CacheKey, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a fetch for `entry` and mark it in flight.
    ///
    /// Called with the table lock held, so nobody else can start a second
    /// fetch for the same key in between.
    fn start_fetch(self: &Arc<Self>, key: &CacheKey, entry: &mut CacheEntry, is_retry: bool) -> SharedFetch {
        if !is_retry {
            entry.retry_attempt = 0;
            entry.retry_pending = false;
        }
        entry.epoch += 1;
        entry.stale = false;
        let epoch = entry.epoch;
        let entry_id = entry.id;

        let fetcher = self.fetcher.clone();
        let owner = Arc::downgrade(self);
        let channel = entry.channel.clone();
        let args = entry.args.clone();
        let fetch_key = key.clone();
        let future = async move {
            let result = fetcher.fetch(&channel, args).await.map(Arc::new);
            // Settle the entry before any waiter sees the result.
            if let Some(inner) = owner.upgrade() {
                inner.complete(&fetch_key, entry_id, epoch, &result);
            }
            result
        }
        .boxed()
        .shared();

        entry.in_flight = Some(InFlight {
            epoch,
            future: future.clone(),
        });
        entry.publish();

        let started = self.fetches_started.fetch_add(1, Ordering::Relaxed) + 1;
        debug!("Fetching {} (attempt {}, fetch #{})", key, entry.retry_attempt + 1, started);

        self.spawn_driver(key.clone(), future.clone(), entry.options.loading_timeout);
        future
    }

    /// Poll the fetch to completion even if no reader awaits it, and run the
    /// slow-loading watchdog.
    fn spawn_driver(self: &Arc<Self>, key: CacheKey, mut fetch: SharedFetch, loading_timeout: Option<Duration>) {
        let name = key.to_string();
        let owner = Arc::downgrade(self);
        let spawned = spawn_detached(async move {
            let Some(limit) = loading_timeout else {
                let _ = fetch.await;
                return;
            };
            tokio::select! {
                _ = &mut fetch => {}
                _ = tokio::time::sleep(limit) => {
                    if let Some(inner) = owner.upgrade() {
                        inner.loading_slow(&key, limit);
                    }
                    let _ = fetch.await;
                }
            }
        });
        if !spawned {
            debug!("No runtime to drive the fetch for {}; it runs when awaited", name);
        }
    }

    fn loading_slow(&self, key: &CacheKey, limit: Duration) {
        warn!("Fetch for {} still loading after {:?}", key, limit);
        let callback = self
            .on_loading_slow
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(callback) = callback {
            callback(key);
        }
    }

    fn complete(self: &Arc<Self>, key: &CacheKey, entry_id: u64, epoch: u64, result: &Result<Arc<Value>>) {
        let mut entries = self.lock();
        // Epochs restart with a rebuilt entry, so the id decides ownership.
        let Some(entry) = entries.get_mut(key).filter(|e| e.id == entry_id) else {
            debug!("Discarding result for evicted {}", key);
            return;
        };
        if entry.in_flight.as_ref().map(|f| f.epoch) != Some(epoch) {
            return;
        }
        entry.in_flight = None;
        entry.last_fetched_at = Some(Instant::now());
        let superseded = entry.mutation_epoch > epoch;

        match result {
            Ok(data) => {
                if !superseded {
                    entry.data = Some(data.clone());
                    entry.error = None;
                }
                entry.retry_attempt = 0;
                entry.retry_pending = false;
            }
            Err(err) => {
                warn!("Fetch for {} failed: {}", key, err);
                if !superseded {
                    entry.error = Some(err.clone());
                }
                entry.retry_pending = false;
                let can_retry = !superseded
                    && !entry.refetch_queued
                    && err.is_retryable()
                    && entry.subscribers > 0
                    && entry.retry_attempt < entry.options.error_retry_count;
                if can_retry {
                    let delay = entry.options.retry.backoff(entry.retry_attempt);
                    if self.schedule_retry(key.clone(), entry_id, entry.epoch, delay) {
                        entry.retry_attempt += 1;
                        entry.retry_pending = true;
                    }
                }
            }
        }

        if entry.refetch_queued {
            entry.refetch_queued = false;
            if entry.subscribers > 0 {
                self.start_fetch(key, entry, false);
            } else {
                entry.stale = true;
            }
        }
        entry.publish();
    }

    /// Returns `false` when there is no runtime to run the timer on.
    fn schedule_retry(self: &Arc<Self>, key: CacheKey, entry_id: u64, epoch: u64, delay: Duration) -> bool {
        let name = key.to_string();
        let owner = Arc::downgrade(self);
        let scheduled = spawn_detached(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = owner.upgrade() {
                inner.retry(&key, entry_id, epoch);
            }
        });
        if scheduled {
            debug!("Retrying {} in {:?}", name, delay);
        } else {
            debug!("No runtime to retry {}", name);
        }
        scheduled
    }

    fn retry(self: &Arc<Self>, key: &CacheKey, entry_id: u64, epoch: u64) {
        let mut entries = self.lock();
        let Some(entry) = entries.get_mut(key).filter(|e| e.id == entry_id) else {
            return;
        };
        // Anything that touched the entry since scheduling cancels the retry.
        if entry.epoch != epoch || entry.in_flight.is_some() {
            return;
        }
        if entry.subscribers == 0 {
            entry.retry_pending = false;
            entry.publish();
            return;
        }
        self.start_fetch(key, entry, true);
    }

    fn invalidate_entry(self: &Arc<Self>, key: &CacheKey, entry: &mut CacheEntry) {
        entry.epoch += 1;
        entry.retry_attempt = 0;
        entry.retry_pending = false;
        if entry.in_flight.is_some() {
            entry.refetch_queued = true;
        } else if entry.subscribers > 0 {
            self.start_fetch(key, entry, false);
        } else {
            entry.stale = true;
            entry.publish();
        }
    }

    fn evict_idle(&self, key: &CacheKey, entry_id: u64, idle_epoch: u64) {
        let mut entries = self.lock();
        let idle = entries
            .get(key)
            .is_some_and(|e| e.id == entry_id && e.subscribers == 0 && e.idle_epoch == idle_epoch);
        if idle {
            entries.remove(key);
            debug!("Evicted idle {}", key);
        }
    }
}

/// Spawn `task` on the current tokio runtime, if there is one.
fn spawn_detached<F>(task: F) -> bool
where
    F: Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(task);
            true
        }
        Err(_) => false,
    }
}
