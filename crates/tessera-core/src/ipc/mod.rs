//! Framed IPC between the backend and renderer processes.
//!
//! Uses length-prefixed JSON envelopes over a local TCP connection (or any
//! other async byte stream).
//!
//! # Architecture
//!
//! - **Server**: Runs in the backend, accepts renderer connections, dispatches requests and forwards events
//! - **Client**: Runs in the renderer, correlates calls and routes events to listeners
//! - **Protocol**: Shared envelope types and framing used by both
//! - **Transport**: The post-one-envelope seam and its queued stream writer

pub mod client;
pub mod protocol;
pub mod server;
pub mod transport;

pub use client::IpcClient;
pub use protocol::{Envelope, EventMessage, InvocationRequest, InvocationResponse, Outcome, RequestId, SignalMessage};
pub use server::{serve_connection, IpcServer, IpcServerHandle};
pub use transport::{FrameSender, Transport};
