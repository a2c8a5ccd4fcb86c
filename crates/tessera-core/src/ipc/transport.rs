//! The send half of the isolation boundary.
//!
//! [`Transport`] is the one primitive the proxy needs: hand an envelope to the
//! other process. [`FrameSender`] implements it over any async byte stream by
//! queueing envelopes for a single writer task, which keeps per-connection
//! message order equal to post order.

use super::protocol::{encode, write_frame, Envelope};
use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Posts envelopes across the process boundary.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Fails with `Transport` when the other side is unreachable.
    async fn post(&self, envelope: Envelope) -> Result<()>;
}

/// Queue in front of a framed writer. Cheap to clone; the writer task ends
/// once every clone is dropped or the stream fails.
#[derive(Debug, Clone)]
pub struct FrameSender {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl FrameSender {
    /// Create a sender whose envelopes land in the returned receiver instead
    /// of a byte stream.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Start a writer task that frames every posted envelope onto `writer`.
    pub fn spawn<W>(writer: W) -> (Self, JoinHandle<()>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (sender, rx) = Self::channel();
        let task = tokio::spawn(Self::write_loop(writer, rx));
        (sender, task)
    }

    async fn write_loop<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<Envelope>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        while let Some(envelope) = rx.recv().await {
            let bytes = match encode(&envelope) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Dropping outbound {}: {}", envelope.kind_name(), e);
                    continue;
                }
            };
            if let Err(e) = write_frame(&mut writer, &bytes).await {
                debug!("IPC writer stopped: {}", e);
                break;
            }
        }
        // Closing the receiver makes every later post fail fast.
        rx.close();
    }

    /// Queue an envelope without waiting.
    pub fn post_now(&self, envelope: Envelope) -> Result<()> {
        self.tx
            .send(envelope)
            .map_err(|_| BridgeError::transport("IPC connection is closed"))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[async_trait]
impl Transport for FrameSender {
    async fn post(&self, envelope: Envelope) -> Result<()> {
        self.post_now(envelope)
    }
}
