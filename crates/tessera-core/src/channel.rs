//! Channel contracts shared by the backend and the renderer.
//!
//! A channel is a flat, case-sensitive name agreed on out of band. Declaring
//! it as a type pins the argument and result shapes at compile time on both
//! sides of the boundary:
//!
//! ```rust
//! use serde::{Deserialize, Serialize};
//! use tessera_core::Channel;
//!
//! #[derive(Serialize, Deserialize)]
//! struct Project {
//!     id: u64,
//!     name: String,
//! }
//!
//! struct ListProjects;
//!
//! impl Channel for ListProjects {
//!     const NAME: &'static str = "listProjects";
//!     type Args = ();
//!     type Output = Vec<Project>;
//! }
//! ```

use crate::config::IpcConfig;
use crate::error::{BridgeError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// A request/response contract.
pub trait Channel: Send + Sync + 'static {
    const NAME: &'static str;
    type Args: Serialize + DeserializeOwned + Send + 'static;
    type Output: Serialize + DeserializeOwned + Send + 'static;
}

/// A backend-pushed event stream.
pub trait EventChannel: Send + Sync + 'static {
    const NAME: &'static str;
    type Payload: Serialize + DeserializeOwned + Send + 'static;
}

/// Reject names that could never be agreed on: empty, too long, or holding
/// whitespace/control characters.
pub fn validate_channel_name(channel: &str) -> Result<()> {
    let reason = if channel.is_empty() {
        Some("name is empty".to_string())
    } else if channel.len() > IpcConfig::MAX_CHANNEL_NAME_LEN {
        Some(format!(
            "name exceeds {} bytes",
            IpcConfig::MAX_CHANNEL_NAME_LEN
        ))
    } else if channel
        .chars()
        .any(|c| c.is_whitespace() || c.is_control())
    {
        Some("name contains whitespace or control characters".to_string())
    } else {
        None
    };

    match reason {
        Some(reason) => Err(BridgeError::InvalidChannel {
            channel: channel.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}
