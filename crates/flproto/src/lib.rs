//! flproto - Wire protocol for the FL Studio MIDI bridge
//!
//! FL Studio's only external interface is a MIDI port, so every message
//! between the agent side and the host-side script travels inside a
//! System-Exclusive envelope. This crate defines that wire layer:
//!
//! - [`sysex`]: the frame codec (one SysEx envelope = one chunk of one
//!   logical message)
//! - [`chunk`]: splitting payloads that would overflow the host receive
//!   buffer, and per-client reassembly of inbound chunks
//! - [`record`]: the structured records carried in payloads (commands,
//!   responses, events), serialised as base64(JSON)
//! - [`command`]: the closed set of operations the host-side script
//!   executes, with per-command timeout classes and safety flags
//! - [`response`]: typed views over response records
//!
//! The crate is transport-agnostic: it deals in byte buffers and leaves
//! MIDI port handling to the runtime layer.

pub mod chunk;
pub mod command;
pub mod record;
pub mod response;
pub mod sysex;

mod error;

pub use chunk::{encode_message, split_payload, LogicalMessage, Reassembler};
pub use command::{command_schema, CommandContract, HostCommand, TimeoutClass, TEMPO_EVENT_ID};
pub use error::ProtoError;
pub use record::{HostError, HostErrorKind, ResponseStatus, WireRecord};
pub use sysex::{Continuation, Frame, MessageKind, Origin, Status};
