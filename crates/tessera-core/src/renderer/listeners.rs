//! Renderer half of the event bus.
//!
//! Listeners are stored per channel with their identity, so removing one
//! never disturbs another listener holding the same callback. The backend is
//! told to start and stop forwarding a channel when its first listener is
//! added and its last one removed.

use crate::channel::validate_channel_name;
use crate::error::Result;
use crate::ipc::protocol::Envelope;
use crate::ipc::transport::FrameSender;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, error};

type Callback = Arc<dyn Fn(&Value) + Send + Sync>;

struct Listener {
    id: u64,
    active: Arc<AtomicBool>,
    callback: Callback,
}

pub struct ListenerRegistry {
    table: Mutex<HashMap<String, Vec<Listener>>>,
    next_id: AtomicU64,
    control: Option<FrameSender>,
}

impl ListenerRegistry {
    /// A registry that only dispatches locally.
    pub fn new() -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            control: None,
        }
    }

    /// A registry that posts `subscribe`/`unsubscribe` envelopes through
    /// `control` as channels gain their first or lose their last listener.
    pub fn with_control(control: FrameSender) -> Self {
        Self {
            control: Some(control),
            ..Self::new()
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<Listener>>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `callback` for events on `channel`.
    pub fn subscribe<F>(self: &Arc<Self>, channel: &str, callback: F) -> Result<Subscription>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        validate_channel_name(channel)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let active = Arc::new(AtomicBool::new(true));
        {
            let mut table = self.lock();
            let first = table.get(channel).map_or(true, Vec::is_empty);
            if first {
                if let Some(control) = &self.control {
                    control.post_now(Envelope::Subscribe {
                        channel: channel.to_string(),
                    })?;
                }
            }
            table.entry(channel.to_string()).or_default().push(Listener {
                id,
                active: active.clone(),
                callback: Arc::new(callback),
            });
        }
        debug!("Listener {} added on '{}'", id, channel);

        Ok(Subscription {
            registry: Arc::downgrade(self),
            channel: channel.to_string(),
            id,
            active,
            detached: false,
        })
    }

    fn remove(&self, channel: &str, id: u64) {
        let mut table = self.lock();
        let Some(listeners) = table.get_mut(channel) else {
            return;
        };
        listeners.retain(|listener| listener.id != id);
        if listeners.is_empty() {
            table.remove(channel);
            if let Some(control) = &self.control {
                // A closed connection has nothing left to unsubscribe from.
                let _ = control.post_now(Envelope::Unsubscribe {
                    channel: channel.to_string(),
                });
            }
        }
        debug!("Listener {} removed from '{}'", id, channel);
    }

    /// Invoke every active listener of `channel` in registration order.
    ///
    /// Callbacks run outside the table lock, so a callback may subscribe or
    /// unsubscribe. Returns how many callbacks ran.
    pub fn emit(&self, channel: &str, payload: &Value) -> usize {
        let listeners: Vec<(Arc<AtomicBool>, Callback)> = match self.lock().get(channel) {
            Some(listeners) => listeners
                .iter()
                .map(|listener| (listener.active.clone(), listener.callback.clone()))
                .collect(),
            None => return 0,
        };

        let mut delivered = 0;
        for (active, callback) in listeners {
            if !active.load(Ordering::SeqCst) {
                continue;
            }
            if catch_unwind(AssertUnwindSafe(|| callback(payload))).is_err() {
                error!("Listener on '{}' panicked", channel);
            }
            delivered += 1;
        }
        delivered
    }

    pub fn listener_count(&self, channel: &str) -> usize {
        self.lock().get(channel).map_or(0, Vec::len)
    }

    /// Deactivate and drop every listener.
    pub fn clear(&self) {
        let mut table = self.lock();
        for listener in table.values().flatten() {
            listener.active.store(false, Ordering::SeqCst);
        }
        table.clear();
    }
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to one registered listener.
///
/// Dropping the handle unsubscribes; call [`detach`](Self::detach) to keep
/// the listener for the lifetime of the registry.
#[must_use = "dropping a Subscription immediately unsubscribes it"]
pub struct Subscription {
    registry: Weak<ListenerRegistry>,
    channel: String,
    id: u64,
    active: Arc<AtomicBool>,
    detached: bool,
}

impl Subscription {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Stop receiving events. Safe to call more than once and after the
    /// registry is gone; returns `true` only for the call that removed it.
    pub fn unsubscribe(&self) -> bool {
        if !self.active.swap(false, Ordering::SeqCst) {
            return false;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.channel, self.id);
        }
        true
    }

    pub fn detach(mut self) {
        self.detached = true;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if !self.detached {
            self.unsubscribe();
        }
    }
}
