//! Typed views over response records.
//!
//! Responses travel as JSON objects inside the `result` field of a
//! [`crate::record::WireRecord::Response`]. Most inventories stay opaque
//! (`serde_json::Value`) and pass through unchanged; the types here exist
//! for the responses the runtime itself consumes (directory seeding, shadow
//! writes, health probes).

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtoError;

/// Parse a response `result` object into a typed view.
///
/// A response that reassembled fine but does not match its expected shape
/// is a protocol violation, not a host error.
pub fn parse_result<T: DeserializeOwned>(result: &Value) -> Result<T, ProtoError> {
    serde_json::from_value(result.clone())
        .map_err(|e| ProtoError::ProtocolViolation(format!("unexpected response shape: {e}")))
}

/// `transport.state` reply; doubles as the handshake/heartbeat probe.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TransportState {
    pub playing: bool,
    pub recording: bool,
    pub position_ticks: u64,
}

/// One row of a `plugins.discover` dump. The executor has already filtered
/// blank-named slots out of the host's fixed-size table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredParameter {
    pub index: u32,
    pub name: String,
    pub value: f64,
}

/// Full `plugins.discover` reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginInventory {
    pub plugin_name: String,
    pub channel_index: u32,
    pub parameters: Vec<DiscoveredParameter>,
}

/// `plugins.get_param` reply. The host read API is known to lag or lie for
/// some plugins; consumers pair this with the shadow value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamValue {
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_string: Option<String>,
}

/// `plugins.set_param` acknowledgement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetParamAck {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_back: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_string: Option<String>,
}

/// `plugins.next_preset` / `plugins.prev_preset` reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresetInfo {
    pub preset_name: String,
    pub preset_index: i64,
}

/// `project.get_tempo` reply.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TempoInfo {
    pub bpm: f64,
}

/// `project.get_position` reply.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionInfo {
    pub bars: f64,
    pub ticks: u64,
    pub seconds: f64,
}
