//! Envelope types and framing shared by both sides of the bridge.
//!
//! Every message is one JSON envelope, internally tagged by `type`, sent as a
//! length-prefixed frame:
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```

use crate::config::IpcConfig;
use crate::error::{BridgeError, ErrorDescriptor, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Correlation id, unique among a proxy's in-flight calls and never reused.
pub type RequestId = u64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationRequest {
    pub id: RequestId,
    pub channel: String,
    #[serde(default)]
    pub args: Value,
}

/// Result of one invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(Value),
    Failure(ErrorDescriptor),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    pub fn into_result(self) -> Result<Value> {
        match self {
            Outcome::Success(value) => Ok(value),
            Outcome::Failure(descriptor) => Err(BridgeError::from_descriptor(descriptor)),
        }
    }
}

/// `{ id, ok: true, result } | { id, ok: false, error }` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ResponseWire", into = "ResponseWire")]
pub struct InvocationResponse {
    pub id: RequestId,
    pub outcome: Outcome,
}

impl InvocationResponse {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            id,
            outcome: Outcome::Success(result),
        }
    }

    pub fn failure(id: RequestId, error: ErrorDescriptor) -> Self {
        Self {
            id,
            outcome: Outcome::Failure(error),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct ResponseWire {
    id: RequestId,
    ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<ErrorDescriptor>,
}

impl From<InvocationResponse> for ResponseWire {
    fn from(response: InvocationResponse) -> Self {
        match response.outcome {
            Outcome::Success(result) => ResponseWire {
                id: response.id,
                ok: true,
                result: Some(result),
                error: None,
            },
            Outcome::Failure(error) => ResponseWire {
                id: response.id,
                ok: false,
                result: None,
                error: Some(error),
            },
        }
    }
}

impl TryFrom<ResponseWire> for InvocationResponse {
    type Error = String;

    fn try_from(wire: ResponseWire) -> std::result::Result<Self, Self::Error> {
        if wire.ok {
            // `null` results deserialize as a missing field
            return Ok(InvocationResponse::success(
                wire.id,
                wire.result.unwrap_or(Value::Null),
            ));
        }
        match wire.error {
            Some(error) => Ok(InvocationResponse::failure(wire.id, error)),
            None => Err(format!("response {} has ok=false but no error", wire.id)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    pub channel: String,
    #[serde(default)]
    pub payload: Value,
}

/// One-way renderer-to-backend notification. Never answered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalMessage {
    pub channel: String,
    #[serde(default)]
    pub args: Value,
}

/// Everything that crosses the boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    Request(InvocationRequest),
    Response(InvocationResponse),
    Event(EventMessage),
    Signal(SignalMessage),
    Subscribe { channel: String },
    Unsubscribe { channel: String },
}

impl Envelope {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Envelope::Request(_) => "request",
            Envelope::Response(_) => "response",
            Envelope::Event(_) => "event",
            Envelope::Signal(_) => "signal",
            Envelope::Subscribe { .. } => "subscribe",
            Envelope::Unsubscribe { .. } => "unsubscribe",
        }
    }
}

pub fn encode(envelope: &Envelope) -> Result<Vec<u8>> {
    serde_json::to_vec(envelope).map_err(|e| {
        BridgeError::serialization(format!(
            "Failed to encode {} envelope: {}",
            envelope.kind_name(),
            e
        ))
    })
}

pub fn decode(frame: &[u8]) -> Result<Envelope> {
    serde_json::from_slice(frame)
        .map_err(|e| BridgeError::serialization(format!("Malformed envelope: {}", e)))
}

/// Pull the correlation id out of a request frame that failed to decode, so
/// the caller can still be answered.
pub fn recover_request_id(frame: &[u8]) -> Option<RequestId> {
    recover_id(frame, "request")
}

/// Same as [`recover_request_id`] for responses, so the waiting call fails
/// instead of hanging.
pub fn recover_response_id(frame: &[u8]) -> Option<RequestId> {
    recover_id(frame, "response")
}

fn recover_id(frame: &[u8], kind: &str) -> Option<RequestId> {
    let value: Value = serde_json::from_slice(frame).ok()?;
    if value.get("type").and_then(Value::as_str) != Some(kind) {
        return None;
    }
    value.get("id").and_then(Value::as_u64)
}

/// Read a length-prefixed frame from an async reader.
///
/// Returns `None` on clean EOF (peer closed connection).
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    if len > IpcConfig::MAX_MESSAGE_SIZE {
        return Err(BridgeError::serialization(format!(
            "IPC message size {} exceeds maximum {}",
            len,
            IpcConfig::MAX_MESSAGE_SIZE
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > IpcConfig::MAX_MESSAGE_SIZE {
        return Err(BridgeError::serialization(format!(
            "IPC message size {} exceeds maximum {}",
            payload.len(),
            IpcConfig::MAX_MESSAGE_SIZE
        )));
    }
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}
