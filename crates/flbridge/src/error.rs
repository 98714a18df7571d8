//! Bridge error taxonomy.

use flproto::ProtoError;

use crate::directory::PluginAddress;

/// Every failure a bridge caller can observe.
///
/// Nothing below the wire codec is recovered silently: the codec drops
/// unrecognisable frames, everything above surfaces here.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Endpoint disconnected; fails all in-flight requests. The lifecycle
    /// layer may reconnect; caches survive.
    #[error("transport lost: {0}")]
    TransportLost(String),

    /// Named MIDI endpoints not present at startup. Fatal to the session.
    #[error("MIDI endpoint missing: {0}")]
    EndpointMissing(String),

    /// Outbound payload over the per-frame budget after serialisation, or
    /// an inbound accumulator past its cap.
    #[error("payload of {size} bytes exceeds limit of {limit}")]
    PayloadTooLarge { size: usize, limit: usize },

    /// Deadline elapsed. The host may still complete the work; its late
    /// response is discarded on arrival.
    #[error("command {command} timed out after {elapsed_ms} ms")]
    Timeout { command: String, elapsed_ms: u64 },

    /// Caller aborted. The in-flight host-side operation is not chased.
    #[error("request cancelled: {command}")]
    Cancelled { command: String },

    /// Command name outside the published contract set.
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    /// Host executed and reported failure.
    #[error("host rejected {command}: {reason}")]
    CommandFailed { command: String, reason: String },

    /// Directory resolution exhausted every tier, including the
    /// post-discovery retry.
    #[error("no parameter matching {query:?} on plugin at {address}")]
    ParameterNotFound {
        address: PluginAddress,
        query: String,
    },

    /// Host guards were unset for a mutating command; retryable later.
    #[error("host unsafe, write refused: {0}")]
    HostUnsafe(String),

    /// Unparseable response after successful reassembly.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The render watch directory could not be observed.
    #[error("render watch failed: {0}")]
    RenderWatch(String),
}

impl From<ProtoError> for BridgeError {
    fn from(err: ProtoError) -> Self {
        match err {
            ProtoError::PayloadTooLarge { size, limit } => {
                BridgeError::PayloadTooLarge { size, limit }
            }
            ProtoError::ProtocolViolation(msg) => BridgeError::ProtocolViolation(msg),
            ProtoError::UnknownCommand(name) => BridgeError::UnknownCommand(name),
        }
    }
}

impl BridgeError {
    /// True for failures worth retrying at a later moment without any
    /// state change on this side.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BridgeError::HostUnsafe(_) | BridgeError::Timeout { .. }
        )
    }
}
