//! Structured records carried inside logical messages.
//!
//! The payload of a logical message is the base64 encoding of one of these
//! records serialised as UTF-8 JSON. Records are discriminated by `kind`,
//! matching the message-kind byte of the frames that carried them.

use serde::{Deserialize, Serialize};

use crate::error::ProtoError;

/// One logical wire record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WireRecord {
    /// Client-originated operation for the host-side executor.
    Command {
        /// Correlation id, monotonically increasing per connection.
        id: u32,
        /// Wire name, e.g. `plugins.set_param`.
        name: String,
        #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
        params: serde_json::Value,
    },
    /// Host-originated reply, paired to a command by `id` alone.
    Response {
        id: u32,
        status: ResponseStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<HostError>,
    },
    /// Unsolicited host notification (e.g. a plugin change).
    Event {
        name: String,
        #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
        data: serde_json::Value,
    },
}

impl WireRecord {
    /// Serialise to the UTF-8 JSON form that gets base64-encoded on the wire.
    pub fn to_wire_bytes(&self) -> Result<Vec<u8>, ProtoError> {
        serde_json::to_vec(self)
            .map_err(|e| ProtoError::ProtocolViolation(format!("record serialisation: {e}")))
    }

    /// Parse a reassembled payload back into a record.
    pub fn from_wire_bytes(bytes: &[u8]) -> Result<Self, ProtoError> {
        serde_json::from_slice(bytes)
            .map_err(|e| ProtoError::ProtocolViolation(format!("malformed record: {e}")))
    }
}

/// Response outcome as reported by the host executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Ok,
    Error,
}

/// Error body of a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostError {
    /// Stable machine-readable code.
    pub code: String,
    /// Human-readable reason.
    pub message: String,
}

impl HostError {
    /// Classify a host error code onto the bridge error taxonomy.
    pub fn kind(&self) -> HostErrorKind {
        match self.code.as_str() {
            "host_unsafe" => HostErrorKind::Unsafe,
            "unknown_command" => HostErrorKind::UnknownCommand,
            _ => HostErrorKind::Failed,
        }
    }
}

/// Taxonomy buckets for host-reported errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostErrorKind {
    /// Host guards were unset; the write is retryable later.
    Unsafe,
    /// The executor does not know the command name.
    UnknownCommand,
    /// Any other executor failure.
    Failed,
}
