//! Management protocol messages.
//!
//! Every frame is a JSON object tagged by `method`:
//!
//! ```text
//! → {"method":"capability_report","capabilities":{"shell":true}}
//! ← {"method":"alert","alert":{"message":"..."}}
//! ← {"method":"shell_attach","mac_addr":"AA:BB:...","uuid":"..."}
//! ```
//!
//! Unknown methods decode to `None` so newer servers can add messages
//! without breaking older devices.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ChannelError;

/// Body of an `alert` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum ManagementMessage {
    CapabilityReport {
        capabilities: BTreeMap<String, bool>,
    },
    Alert {
        alert: Alert,
    },
    ShellAttach {
        mac_addr: String,
        uuid: String,
    },
}

const KNOWN_METHODS: &[&str] = &["capability_report", "alert", "shell_attach"];

impl ManagementMessage {
    /// Capability report announcing the optional features this agent supports.
    pub fn capability_report(shell: bool) -> Self {
        ManagementMessage::CapabilityReport {
            capabilities: BTreeMap::from([("shell".to_string(), shell)]),
        }
    }

    pub fn encode(&self) -> String {
        // Serializing a tagged enum of strings and bools cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Decode one text frame.
    ///
    /// Returns `Ok(None)` for well-formed messages with an unknown `method`,
    /// and [`ChannelError::ProtocolViolation`] for anything that is not a
    /// JSON object with a string `method` or that is missing required fields.
    pub fn decode(text: &str) -> Result<Option<Self>, ChannelError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| ChannelError::ProtocolViolation(format!("invalid JSON: {e}")))?;
        let Some(method) = value.get("method").and_then(Value::as_str) else {
            return Err(ChannelError::ProtocolViolation(
                "message has no method".to_string(),
            ));
        };
        if !KNOWN_METHODS.contains(&method) {
            return Ok(None);
        }
        let method = method.to_string();
        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| ChannelError::ProtocolViolation(format!("malformed {method}: {e}")))
    }
}
