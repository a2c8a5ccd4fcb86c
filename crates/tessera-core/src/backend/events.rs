//! Backend half of the event bus.
//!
//! The table maps a channel to the connections that asked for it. Publishing
//! queues one event envelope per live subscriber; there is no buffering for
//! late subscribers and no acknowledgement.

use crate::channel::EventChannel;
use crate::error::{BridgeError, Result};
use crate::ipc::protocol::{Envelope, EventMessage};
use crate::ipc::transport::FrameSender;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{PoisonError, RwLock};
use tracing::{debug, trace};
use uuid::Uuid;

/// Identifies one renderer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<HashMap<String, HashMap<ConnectionId, FrameSender>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if `id` was already subscribed to `channel`.
    pub fn subscribe(&self, channel: &str, id: ConnectionId, sink: FrameSender) -> bool {
        let mut table = self.subscribers.write().unwrap_or_else(PoisonError::into_inner);
        let added = table
            .entry(channel.to_string())
            .or_default()
            .insert(id, sink)
            .is_none();
        if added {
            debug!("Connection {} subscribed to '{}'", id, channel);
        }
        added
    }

    pub fn unsubscribe(&self, channel: &str, id: ConnectionId) -> bool {
        let mut table = self.subscribers.write().unwrap_or_else(PoisonError::into_inner);
        let Some(sinks) = table.get_mut(channel) else {
            return false;
        };
        let removed = sinks.remove(&id).is_some();
        if sinks.is_empty() {
            table.remove(channel);
        }
        if removed {
            debug!("Connection {} unsubscribed from '{}'", id, channel);
        }
        removed
    }

    /// Drop every subscription held by a connection that went away.
    ///
    /// Returns the number of channels it was subscribed to.
    pub fn remove_subscriber(&self, id: ConnectionId) -> usize {
        let mut table = self.subscribers.write().unwrap_or_else(PoisonError::into_inner);
        let mut removed = 0;
        table.retain(|_, sinks| {
            if sinks.remove(&id).is_some() {
                removed += 1;
            }
            !sinks.is_empty()
        });
        removed
    }

    /// Deliver `payload` to every subscriber of `channel`.
    ///
    /// Returns how many subscribers it was queued for. Sinks whose connection
    /// has closed are pruned.
    pub fn publish(&self, channel: &str, payload: Value) -> usize {
        let sinks: Vec<(ConnectionId, FrameSender)> = {
            let table = self.subscribers.read().unwrap_or_else(PoisonError::into_inner);
            match table.get(channel) {
                Some(sinks) => sinks.iter().map(|(id, sink)| (*id, sink.clone())).collect(),
                None => return 0,
            }
        };

        let mut delivered = 0;
        let mut closed = Vec::new();
        for (id, sink) in sinks {
            let envelope = Envelope::Event(EventMessage {
                channel: channel.to_string(),
                payload: payload.clone(),
            });
            match sink.post_now(envelope) {
                Ok(()) => delivered += 1,
                Err(_) => closed.push(id),
            }
        }

        for id in closed {
            self.unsubscribe(channel, id);
        }

        trace!("Published '{}' to {} subscriber(s)", channel, delivered);
        delivered
    }

    /// Publish a typed event.
    pub fn emit<E: EventChannel>(&self, payload: &E::Payload) -> Result<usize> {
        let value = serde_json::to_value(payload).map_err(|e| {
            BridgeError::serialization(format!("Unserializable payload for '{}': {}", E::NAME, e))
        })?;
        Ok(self.publish(E::NAME, value))
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel)
            .map_or(0, HashMap::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct FileChanged {
        path: String,
    }

    struct FileChangedEvent;

    impl EventChannel for FileChangedEvent {
        const NAME: &'static str = "fileChanged";
        type Payload = FileChanged;
    }

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let bus = EventBus::new();
        assert_eq!(bus.publish("fileChanged", json!({})), 0);
    }

    #[test]
    fn test_publish_reaches_each_subscriber_once() {
        let bus = EventBus::new();
        let (a, mut rx_a) = FrameSender::channel();
        let (b, mut rx_b) = FrameSender::channel();
        bus.subscribe("fileChanged", ConnectionId::new(), a);
        bus.subscribe("fileChanged", ConnectionId::new(), b);

        let delivered = bus
            .emit::<FileChangedEvent>(&FileChanged {
                path: "/a.txt".into(),
            })
            .unwrap();

        assert_eq!(delivered, 2);
        let expected = Envelope::Event(EventMessage {
            channel: "fileChanged".into(),
            payload: json!({"path": "/a.txt"}),
        });
        assert_eq!(rx_a.try_recv().unwrap(), expected);
        assert_eq!(rx_b.try_recv().unwrap(), expected);
        assert!(rx_a.try_recv().is_err());
    }

    #[test]
    fn test_unsubscribed_connection_stops_receiving() {
        let bus = EventBus::new();
        let id = ConnectionId::new();
        let (sink, mut rx) = FrameSender::channel();
        bus.subscribe("tick", id, sink);

        assert!(bus.unsubscribe("tick", id));
        assert!(!bus.unsubscribe("tick", id));
        assert_eq!(bus.publish("tick", json!(1)), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_closed_sinks_are_pruned() {
        let bus = EventBus::new();
        let (sink, rx) = FrameSender::channel();
        bus.subscribe("tick", ConnectionId::new(), sink);
        drop(rx);

        assert_eq!(bus.publish("tick", json!(1)), 0);
        assert_eq!(bus.subscriber_count("tick"), 0);
    }

    #[test]
    fn test_remove_subscriber_clears_all_channels() {
        let bus = EventBus::new();
        let id = ConnectionId::new();
        let (sink, _rx) = FrameSender::channel();
        bus.subscribe("a", id, sink.clone());
        bus.subscribe("b", id, sink);

        assert_eq!(bus.remove_subscriber(id), 2);
        assert_eq!(bus.subscriber_count("a"), 0);
        assert_eq!(bus.subscriber_count("b"), 0);
    }
}
