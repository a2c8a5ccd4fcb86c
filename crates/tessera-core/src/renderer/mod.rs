//! Sandboxed side of the bridge: the RPC proxy and the event listener table.

mod listeners;
mod proxy;

pub use listeners::{ListenerRegistry, Subscription};
pub use proxy::RpcProxy;
