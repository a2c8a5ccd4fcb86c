//! Privileged side of the bridge.
//!
//! A [`Backend`] owns one channel registry, the dispatcher that serves it and
//! the event bus. Nothing here is global, so tests can run many backends side
//! by side.

mod dispatcher;
mod events;
mod registry;

pub use dispatcher::Dispatcher;
pub use events::{ConnectionId, EventBus};
pub use registry::{handler_fn, ChannelHandler, ChannelRegistry, FnHandler, SignalHandler};

use std::sync::Arc;

#[derive(Clone)]
pub struct Backend {
    registry: Arc<ChannelRegistry>,
    dispatcher: Dispatcher,
    events: Arc<EventBus>,
}

impl Backend {
    pub fn new(registry: Arc<ChannelRegistry>) -> Self {
        Self {
            dispatcher: Dispatcher::new(registry.clone()),
            registry,
            events: Arc::new(EventBus::new()),
        }
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }
}

impl Default for Backend {
    fn default() -> Self {
        Self::new(Arc::new(ChannelRegistry::new()))
    }
}
