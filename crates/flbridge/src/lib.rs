//! flbridge - drive FL Studio through its MIDI port.
//!
//! The host imposes every inconvenient constraint at once: a fixed, small
//! receive buffer for in-band messages; an unreliable parameter read-back
//! API; no push notifications; no programmatic audio export; cooperative
//! single-threaded execution of the host-side script; and parameter
//! addresses that drift across versions. This crate is the runtime that
//! absorbs all of that behind an ordinary async request/response surface:
//!
//! - [`transport`]: two unidirectional MIDI endpoints (request-out,
//!   response-in) moving whole SysEx envelopes
//! - [`engine`]: correlation ids, pending-request tracking, per-command
//!   deadlines, chunked-response reassembly, cancellation
//! - [`directory`]: plugin-parameter discovery cache with alias / exact /
//!   prefix / substring resolution - numeric indices never reach callers
//! - [`shadow`]: the ledger of last-written values, masking the host's
//!   unreliable reads
//! - [`render`]: file-watch plus write-stability debounce that turns the
//!   user's manual export into an asynchronous completion event
//! - [`session`]: connection lifecycle (handshake, heartbeat, shutdown)
//!   and the high-level operation facade
//!
//! Wire framing and command contracts live in the `flproto` crate;
//! configuration loading in `flconf`.

pub mod directory;
pub mod engine;
pub mod lifecycle;
pub mod render;
pub mod session;
pub mod shadow;
pub mod transport;

mod error;

pub use directory::{ParameterDirectory, ParameterRecord, PluginAddress, GENERATOR_SLOT};
pub use engine::{BridgeEvent, EngineConfig, RequestEngine};
pub use error::BridgeError;
pub use lifecycle::{ConnectionState, HealthTracker};
pub use render::{AwaitOutcome, RenderArtifact, RenderRegistry, RenderWatcher};
pub use session::{BridgeSession, ParamReading, SeekTarget};
pub use shadow::{ShadowEntry, ShadowSource, ShadowStore};
pub use transport::{list_input_ports, list_output_ports, MidiPortInfo, WirePort};
