//! Per-key cache state.

use crate::config::ResolvedOptions;
use crate::error::{BridgeError, Result};
use futures::future::{BoxFuture, Shared};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;

pub(crate) type SharedFetch = Shared<BoxFuture<'static, Result<Arc<Value>>>>;

/// What a consumer sees for a key at one instant.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    /// Last good value. Kept while a refresh runs and after a failed one.
    pub data: Option<Arc<Value>>,
    /// Error from the most recent fetch, cleared by the next success.
    pub error: Option<BridgeError>,
    pub is_validating: bool,
    /// A retry is scheduled; `error` is not final yet.
    pub retry_pending: bool,
    pub last_fetched_at: Option<Instant>,
}

impl Snapshot {
    /// No data yet and a fetch is running.
    pub fn is_loading(&self) -> bool {
        self.data.is_none() && self.is_validating
    }
}

pub(crate) struct InFlight {
    pub epoch: u64,
    pub future: SharedFetch,
}

pub(crate) struct CacheEntry {
    /// Distinguishes this entry from a later one created under the same key.
    pub id: u64,
    pub channel: String,
    pub args: Value,
    pub options: ResolvedOptions,
    pub data: Option<Arc<Value>>,
    pub error: Option<BridgeError>,
    pub last_fetched_at: Option<Instant>,
    pub in_flight: Option<InFlight>,
    pub subscribers: usize,
    pub retry_attempt: u32,
    pub retry_pending: bool,
    pub refetch_queued: bool,
    /// Forced stale by invalidation while nobody was subscribed.
    pub stale: bool,
    /// Bumped by every fetch start, invalidation and mutation. Scheduled
    /// retries only fire if it is unchanged.
    pub epoch: u64,
    /// Epoch of the latest local mutation; older fetches must not overwrite it.
    pub mutation_epoch: u64,
    pub idle_epoch: u64,
    pub notifier: watch::Sender<Snapshot>,
}

impl CacheEntry {
    pub fn new(id: u64, channel: &str, args: Value, options: ResolvedOptions) -> Self {
        let (notifier, _) = watch::channel(Snapshot::default());
        Self {
            id,
            channel: channel.to_string(),
            args,
            options,
            data: None,
            error: None,
            last_fetched_at: None,
            in_flight: None,
            subscribers: 0,
            retry_attempt: 0,
            retry_pending: false,
            refetch_queued: false,
            stale: false,
            epoch: 0,
            mutation_epoch: 0,
            idle_epoch: 0,
            notifier,
        }
    }

    /// Never fetched, forced stale, or older than the deduping interval.
    pub fn is_stale(&self, now: Instant) -> bool {
        if self.stale {
            return true;
        }
        match self.last_fetched_at {
            Some(at) => now.saturating_duration_since(at) >= self.options.deduping_interval,
            None => true,
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            data: self.data.clone(),
            error: self.error.clone(),
            is_validating: self.in_flight.is_some(),
            retry_pending: self.retry_pending,
            last_fetched_at: self.last_fetched_at,
        }
    }

    /// Push the current state to every subscriber.
    pub fn publish(&self) {
        self.notifier.send_replace(self.snapshot());
    }
}
