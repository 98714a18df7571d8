//! Command contracts for the host-side executor.
//!
//! This module is the agreement between the bridge and the script running
//! inside the host: which operations exist, what parameters they take, how
//! long they may reasonably run, and whether the host is allowed to refuse
//! them while its internal guards are unset. Anything outside this set is
//! rejected as unknown on both ends.
//!
//! The engine never inspects command names; timing lives here as data and
//! is resolved into a concrete deadline before submission.

use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtoError;
use crate::record::WireRecord;

/// Host control-event id for tempo. Tempo has no dedicated setter in the
/// host API; `project.set_tempo` is routed through the generic control-event
/// pathway at this id by the executor.
pub const TEMPO_EVENT_ID: u32 = 0x11000;

/// How long a command may reasonably run before the engine gives up.
///
/// Discovery walks the host's full fixed-size parameter table (thousands of
/// slots) on its cooperative main thread, so its default deadline is an
/// order of magnitude above the interactive one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutClass {
    /// Transport toggles, single reads/writes.
    Interactive,
    /// Full-table parameter enumeration.
    Discovery,
}

impl TimeoutClass {
    /// Built-in default deadline for the class. Config and callers may
    /// override; this is the last resort.
    pub fn default_timeout(self) -> Duration {
        match self {
            TimeoutClass::Interactive => Duration::from_secs(5),
            TimeoutClass::Discovery => Duration::from_secs(60),
        }
    }
}

/// Every operation the host-side executor understands.
///
/// Serialises as `{"name": "<wire name>", "params": {…}}`; unit variants
/// omit `params`. Note payloads for the piano roll are opaque values: the
/// core validates that they are an array and passes them through unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "name", content = "params")]
pub enum HostCommand {
    // === Transport ===
    #[serde(rename = "transport.start")]
    TransportStart,
    #[serde(rename = "transport.stop")]
    TransportStop,
    #[serde(rename = "transport.record")]
    TransportRecord,
    #[serde(rename = "transport.state")]
    TransportState,

    // === Read-only inventories ===
    #[serde(rename = "state.channels")]
    StateChannels,
    #[serde(rename = "state.mixer")]
    StateMixer,
    #[serde(rename = "state.patterns")]
    StatePatterns,

    // === Patterns ===
    #[serde(rename = "pattern.select")]
    PatternSelect { index: u32 },
    #[serde(rename = "pattern.create")]
    PatternCreate,
    #[serde(rename = "pattern.rename")]
    PatternRename {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        index: Option<u32>,
        name: String,
    },

    // === Piano roll ===
    #[serde(rename = "pianoroll.add_notes")]
    PianorollAddNotes {
        /// Opaque note records produced by the generation layers.
        notes: Vec<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        clear_first: Option<bool>,
    },
    #[serde(rename = "pianoroll.clear_notes")]
    PianorollClearNotes {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<u32>,
    },

    // === Plugins ===
    #[serde(rename = "plugins.discover")]
    PluginsDiscover {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        index: Option<u32>,
        slot_index: i32,
    },
    #[serde(rename = "plugins.get_param")]
    PluginsGetParam {
        index: u32,
        slot_index: i32,
        param_index: u32,
    },
    #[serde(rename = "plugins.set_param")]
    PluginsSetParam {
        index: u32,
        slot_index: i32,
        param_index: u32,
        /// Absolute normalised value in `[0, 1]`; relative adjustments are
        /// not part of the contract.
        value: f64,
    },
    #[serde(rename = "plugins.next_preset")]
    PluginsNextPreset {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        index: Option<u32>,
        slot_index: i32,
    },
    #[serde(rename = "plugins.prev_preset")]
    PluginsPrevPreset {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        index: Option<u32>,
        slot_index: i32,
    },

    // === Mixer writes (queries go through state.mixer) ===
    #[serde(rename = "mixer.set_volume")]
    MixerSetVolume { track: u32, value: f64 },
    #[serde(rename = "mixer.set_pan")]
    MixerSetPan { track: u32, value: f64 },
    #[serde(rename = "mixer.set_mute")]
    MixerSetMute { track: u32, mute: bool },
    #[serde(rename = "mixer.set_solo")]
    MixerSetSolo { track: u32, solo: bool },
    #[serde(rename = "mixer.set_name")]
    MixerSetName { track: u32, name: String },
    #[serde(rename = "mixer.set_color")]
    MixerSetColor { track: u32, color: u32 },
    #[serde(rename = "mixer.set_routing")]
    MixerSetRouting { track: u32, dest: u32, enabled: bool },
    #[serde(rename = "mixer.set_send")]
    MixerSetSend { track: u32, dest: u32, level: f64 },
    #[serde(rename = "mixer.set_eq")]
    MixerSetEq {
        track: u32,
        band: u32,
        gain: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        frequency: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bandwidth: Option<f64>,
    },

    // === Playlist (no clip placement: the host exposes none) ===
    #[serde(rename = "playlist.mute_track")]
    PlaylistMuteTrack { track: u32, mute: bool },
    #[serde(rename = "playlist.solo_track")]
    PlaylistSoloTrack { track: u32, solo: bool },
    #[serde(rename = "playlist.set_track_name")]
    PlaylistSetTrackName { track: u32, name: String },
    #[serde(rename = "playlist.set_track_color")]
    PlaylistSetTrackColor { track: u32, color: u32 },
    #[serde(rename = "playlist.get_tracks")]
    PlaylistGetTracks,

    // === Project ===
    #[serde(rename = "project.get_tempo")]
    ProjectGetTempo,
    #[serde(rename = "project.set_tempo")]
    ProjectSetTempo { bpm: f64 },
    #[serde(rename = "project.get_position")]
    ProjectGetPosition,
    #[serde(rename = "project.set_position")]
    ProjectSetPosition {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bars: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ticks: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ms: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seconds: Option<f64>,
    },
}

impl HostCommand {
    /// The name carried on the wire.
    pub fn wire_name(&self) -> &'static str {
        match self {
            HostCommand::TransportStart => "transport.start",
            HostCommand::TransportStop => "transport.stop",
            HostCommand::TransportRecord => "transport.record",
            HostCommand::TransportState => "transport.state",
            HostCommand::StateChannels => "state.channels",
            HostCommand::StateMixer => "state.mixer",
            HostCommand::StatePatterns => "state.patterns",
            HostCommand::PatternSelect { .. } => "pattern.select",
            HostCommand::PatternCreate => "pattern.create",
            HostCommand::PatternRename { .. } => "pattern.rename",
            HostCommand::PianorollAddNotes { .. } => "pianoroll.add_notes",
            HostCommand::PianorollClearNotes { .. } => "pianoroll.clear_notes",
            HostCommand::PluginsDiscover { .. } => "plugins.discover",
            HostCommand::PluginsGetParam { .. } => "plugins.get_param",
            HostCommand::PluginsSetParam { .. } => "plugins.set_param",
            HostCommand::PluginsNextPreset { .. } => "plugins.next_preset",
            HostCommand::PluginsPrevPreset { .. } => "plugins.prev_preset",
            HostCommand::MixerSetVolume { .. } => "mixer.set_volume",
            HostCommand::MixerSetPan { .. } => "mixer.set_pan",
            HostCommand::MixerSetMute { .. } => "mixer.set_mute",
            HostCommand::MixerSetSolo { .. } => "mixer.set_solo",
            HostCommand::MixerSetName { .. } => "mixer.set_name",
            HostCommand::MixerSetColor { .. } => "mixer.set_color",
            HostCommand::MixerSetRouting { .. } => "mixer.set_routing",
            HostCommand::MixerSetSend { .. } => "mixer.set_send",
            HostCommand::MixerSetEq { .. } => "mixer.set_eq",
            HostCommand::PlaylistMuteTrack { .. } => "playlist.mute_track",
            HostCommand::PlaylistSoloTrack { .. } => "playlist.solo_track",
            HostCommand::PlaylistSetTrackName { .. } => "playlist.set_track_name",
            HostCommand::PlaylistSetTrackColor { .. } => "playlist.set_track_color",
            HostCommand::PlaylistGetTracks => "playlist.get_tracks",
            HostCommand::ProjectGetTempo => "project.get_tempo",
            HostCommand::ProjectSetTempo { .. } => "project.set_tempo",
            HostCommand::ProjectGetPosition => "project.get_position",
            HostCommand::ProjectSetPosition { .. } => "project.set_position",
        }
    }

    /// Timing class; resolved to a deadline by the caller, never by name
    /// inside the engine.
    pub fn timeout_class(&self) -> TimeoutClass {
        self.contract().timeout_class
    }

    /// Whether the host may refuse this while its guards are unset.
    pub fn is_mutating(&self) -> bool {
        self.contract().mutating
    }

    /// The static contract entry for this command.
    ///
    /// Indexed per variant so the lookup cannot fail; the tests assert the
    /// index order stays aligned with the table and the wire names.
    pub fn contract(&self) -> &'static CommandContract {
        &CONTRACTS[self.contract_index()]
    }

    fn contract_index(&self) -> usize {
        match self {
            HostCommand::TransportStart => 0,
            HostCommand::TransportStop => 1,
            HostCommand::TransportRecord => 2,
            HostCommand::TransportState => 3,
            HostCommand::StateChannels => 4,
            HostCommand::StateMixer => 5,
            HostCommand::StatePatterns => 6,
            HostCommand::PatternSelect { .. } => 7,
            HostCommand::PatternCreate => 8,
            HostCommand::PatternRename { .. } => 9,
            HostCommand::PianorollAddNotes { .. } => 10,
            HostCommand::PianorollClearNotes { .. } => 11,
            HostCommand::PluginsDiscover { .. } => 12,
            HostCommand::PluginsGetParam { .. } => 13,
            HostCommand::PluginsSetParam { .. } => 14,
            HostCommand::PluginsNextPreset { .. } => 15,
            HostCommand::PluginsPrevPreset { .. } => 16,
            HostCommand::MixerSetVolume { .. } => 17,
            HostCommand::MixerSetPan { .. } => 18,
            HostCommand::MixerSetMute { .. } => 19,
            HostCommand::MixerSetSolo { .. } => 20,
            HostCommand::MixerSetName { .. } => 21,
            HostCommand::MixerSetColor { .. } => 22,
            HostCommand::MixerSetRouting { .. } => 23,
            HostCommand::MixerSetSend { .. } => 24,
            HostCommand::MixerSetEq { .. } => 25,
            HostCommand::PlaylistMuteTrack { .. } => 26,
            HostCommand::PlaylistSoloTrack { .. } => 27,
            HostCommand::PlaylistSetTrackName { .. } => 28,
            HostCommand::PlaylistSetTrackColor { .. } => 29,
            HostCommand::PlaylistGetTracks => 30,
            HostCommand::ProjectGetTempo => 31,
            HostCommand::ProjectSetTempo { .. } => 32,
            HostCommand::ProjectGetPosition => 33,
            HostCommand::ProjectSetPosition { .. } => 34,
        }
    }

    /// Build the wire record for this command under a correlation id.
    pub fn to_record(&self, id: u32) -> Result<WireRecord, ProtoError> {
        let value = serde_json::to_value(self)
            .map_err(|e| ProtoError::ProtocolViolation(format!("command serialisation: {e}")))?;
        let Value::Object(mut map) = value else {
            return Err(ProtoError::ProtocolViolation(
                "command did not serialise to an object".into(),
            ));
        };
        let name = map
            .remove("name")
            .and_then(|v| v.as_str().map(str::to_owned))
            .ok_or_else(|| ProtoError::ProtocolViolation("command without name tag".into()))?;
        let params = map.remove("params").unwrap_or(Value::Null);
        Ok(WireRecord::Command { id, name, params })
    }

    /// Parse a `(name, params)` pair as received by the executor side.
    ///
    /// Unknown names are rejected with [`ProtoError::UnknownCommand`];
    /// known names with ill-typed parameters are protocol violations.
    pub fn from_name_params(name: &str, params: Value) -> Result<Self, ProtoError> {
        if CommandContract::find(name).is_none() {
            return Err(ProtoError::UnknownCommand(name.to_string()));
        }
        let mut map = serde_json::Map::new();
        map.insert("name".into(), Value::String(name.to_string()));
        if !params.is_null() {
            map.insert("params".into(), params);
        }
        serde_json::from_value(Value::Object(map)).map_err(|e| {
            ProtoError::ProtocolViolation(format!("bad parameters for {name}: {e}"))
        })
    }
}

/// One row of the published command table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandContract {
    pub name: &'static str,
    pub timeout_class: TimeoutClass,
    /// Mutating commands may be refused while host guards are unset.
    pub mutating: bool,
    pub description: &'static str,
}

impl CommandContract {
    /// Look up a contract by wire name.
    pub fn find(name: &str) -> Option<&'static CommandContract> {
        CONTRACTS.iter().find(|c| c.name == name)
    }

    /// Whether a wire name belongs to the published set.
    pub fn is_known(name: &str) -> bool {
        Self::find(name).is_some()
    }

    /// The full table, for adapter-side tool publication.
    pub fn all() -> &'static [CommandContract] {
        CONTRACTS
    }
}

/// JSON schema for the full command surface.
///
/// The agent adapter publishes this (per tool or whole) so callers can
/// validate parameters before anything reaches the wire; the diagnostics
/// CLI prints it under `contracts --schema`.
pub fn command_schema() -> schemars::Schema {
    schemars::schema_for!(HostCommand)
}

macro_rules! contract {
    ($name:literal, $class:ident, $mutating:literal, $desc:literal) => {
        CommandContract {
            name: $name,
            timeout_class: TimeoutClass::$class,
            mutating: $mutating,
            description: $desc,
        }
    };
}

/// Source of truth for per-command behaviour. Order matches the enum.
static CONTRACTS: &[CommandContract] = &[
    contract!("transport.start", Interactive, true, "Start playback"),
    contract!("transport.stop", Interactive, true, "Stop playback"),
    contract!("transport.record", Interactive, true, "Toggle recording"),
    contract!("transport.state", Interactive, false, "Query playing/recording/position"),
    contract!("state.channels", Interactive, false, "Channel rack inventory"),
    contract!("state.mixer", Interactive, false, "Mixer inventory"),
    contract!("state.patterns", Interactive, false, "Pattern inventory"),
    contract!("pattern.select", Interactive, true, "Select a pattern"),
    contract!("pattern.create", Interactive, true, "Create a new pattern"),
    contract!("pattern.rename", Interactive, true, "Rename a pattern"),
    contract!("pianoroll.add_notes", Interactive, true, "Stage notes into the piano roll"),
    contract!("pianoroll.clear_notes", Interactive, true, "Clear staged notes"),
    contract!("plugins.discover", Discovery, false, "Enumerate plugin parameters"),
    contract!("plugins.get_param", Interactive, false, "Read one parameter (may be unreliable)"),
    contract!("plugins.set_param", Interactive, true, "Write one parameter, absolute [0,1]"),
    contract!("plugins.next_preset", Interactive, true, "Step to the next preset"),
    contract!("plugins.prev_preset", Interactive, true, "Step to the previous preset"),
    contract!("mixer.set_volume", Interactive, true, "Set mixer track volume"),
    contract!("mixer.set_pan", Interactive, true, "Set mixer track pan"),
    contract!("mixer.set_mute", Interactive, true, "Mute/unmute a mixer track"),
    contract!("mixer.set_solo", Interactive, true, "Solo/unsolo a mixer track"),
    contract!("mixer.set_name", Interactive, true, "Name a mixer track"),
    contract!("mixer.set_color", Interactive, true, "Colour a mixer track"),
    contract!("mixer.set_routing", Interactive, true, "Route a mixer track to a destination"),
    contract!("mixer.set_send", Interactive, true, "Set a send level"),
    contract!("mixer.set_eq", Interactive, true, "Set a track EQ band"),
    contract!("playlist.mute_track", Interactive, true, "Mute/unmute a playlist track"),
    contract!("playlist.solo_track", Interactive, true, "Solo/unsolo a playlist track"),
    contract!("playlist.set_track_name", Interactive, true, "Name a playlist track"),
    contract!("playlist.set_track_color", Interactive, true, "Colour a playlist track"),
    contract!("playlist.get_tracks", Interactive, false, "Playlist track inventory"),
    contract!("project.get_tempo", Interactive, false, "Read project tempo"),
    contract!("project.set_tempo", Interactive, true, "Write tempo via the control-event pathway"),
    contract!("project.get_position", Interactive, false, "Read song position"),
    contract!("project.set_position", Interactive, true, "Seek the song position"),
];
