//! Request dispatcher: turns an invocation request into exactly one response.

use super::registry::ChannelRegistry;
use crate::error::BridgeError;
use crate::ipc::protocol::{InvocationRequest, InvocationResponse, SignalMessage};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Resolves handlers from a registry and normalizes their outcome.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<ChannelRegistry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<ChannelRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    /// Run the handler bound to `request.channel`.
    ///
    /// Never fails: unknown channels, handler errors and handler panics all
    /// become a failure outcome carrying the request's id.
    pub async fn dispatch(&self, request: InvocationRequest) -> InvocationResponse {
        let InvocationRequest { id, channel, args } = request;

        let Some(handler) = self.registry.resolve(&channel) else {
            warn!("Request {} for unknown channel '{}'", id, channel);
            return InvocationResponse::failure(id, BridgeError::unknown_channel(&channel).to_descriptor());
        };

        debug!("Dispatching request {} on '{}'", id, channel);

        match AssertUnwindSafe(handler.handle(args)).catch_unwind().await {
            Ok(Ok(result)) => InvocationResponse::success(id, result),
            Ok(Err(err)) => {
                let normalized = BridgeError::from_handler_error(&err);
                error!("Handler for '{}' failed (request {}): {:#}", channel, id, err);
                InvocationResponse::failure(id, normalized.to_descriptor())
            }
            Err(panic) => {
                error!(
                    "Handler for '{}' panicked (request {}): {}",
                    channel,
                    id,
                    panic_message(panic.as_ref())
                );
                let err = BridgeError::handler(format!("Handler for channel '{}' panicked", channel), None);
                InvocationResponse::failure(id, err.to_descriptor())
            }
        }
    }

    /// Deliver a one-way signal. Nothing is ever sent back.
    pub async fn notify(&self, signal: SignalMessage) {
        let SignalMessage { channel, args } = signal;

        let Some(handler) = self.registry.resolve_signal(&channel) else {
            warn!("Dropping signal for unknown channel '{}'", channel);
            return;
        };

        match AssertUnwindSafe(handler.notify(args)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!("Signal handler for '{}' failed: {:#}", channel, err),
            Err(panic) => error!(
                "Signal handler for '{}' panicked: {}",
                channel,
                panic_message(panic.as_ref())
            ),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
