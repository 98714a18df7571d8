//! Protocol-level errors.

/// Errors surfaced by the wire layer.
///
/// The frame codec itself never errors on decode (unrecognisable frames are
/// dropped silently); these cover encode-side violations and failures after
/// successful reassembly.
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    /// A payload or accumulator exceeded its configured maximum.
    #[error("payload of {size} bytes exceeds limit of {limit}")]
    PayloadTooLarge { size: usize, limit: usize },

    /// A fully reassembled payload could not be interpreted.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A command name outside the published contract set.
    #[error("unknown command: {0}")]
    UnknownCommand(String),
}
