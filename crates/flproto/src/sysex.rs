//! System-Exclusive frame codec.
//!
//! One frame carries at most one chunk of one logical message inside a MIDI
//! SysEx envelope. Every byte between the sentinels must stay in the 7-bit
//! range, so payloads are base64 text produced by the chunking layer.
//!
//! ## Wire format
//!
//! ```text
//! Byte 0: 0xF0       start sentinel (SysEx begin)
//! Byte 1: 0x7D       manufacturer tag (educational/non-commercial)
//! Byte 2: origin     0x01 client / 0x02 server
//! Byte 3: client id  7-bit, chosen at connection init
//! Byte 4: continuation  0x00 final / 0x01 more chunks follow
//! Byte 5: message kind  0x01 command / 0x02 response / 0x03 event
//! Byte 6: status        0x00 ok / 0x01 error (meaningful for responses)
//! Bytes 7..n-1: payload (base64 text, at most the per-frame maximum)
//! Byte n: 0xF7       end sentinel (SysEx end)
//! ```
//!
//! ## Receiver behaviour
//!
//! `decode` returns `None` for anything it does not recognise: missing
//! sentinels, wrong manufacturer tag, unknown origin/kind/status bytes, or
//! payload bytes outside the base64 alphabet. On a shared MIDI bus a stray
//! frame is indistinguishable from a foreign device, so unrecognised frames
//! are dropped rather than reported.

use serde::{Deserialize, Serialize};

use crate::error::ProtoError;

/// SysEx begin.
pub const SYSEX_START: u8 = 0xF0;

/// SysEx end.
pub const SYSEX_END: u8 = 0xF7;

/// MIDI educational/non-commercial manufacturer id. Distinguishes bridge
/// frames from commercial gear sharing the bus.
pub const MANUFACTURER_TAG: u8 = 0x7D;

/// Fixed header bytes before the payload (start sentinel through status).
pub const HEADER_LEN: usize = 7;

/// Receive buffer of the hardest host target. The per-frame payload maximum
/// must leave headroom under this.
pub const HOST_RECV_BUFFER: usize = 2048;

/// Default per-frame payload maximum (base64 bytes). Comfortably below
/// [`HOST_RECV_BUFFER`] even with the envelope around it.
pub const MAX_PAYLOAD_PER_FRAME: usize = 1800;

/// Which end of the bridge emitted a frame.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// The agent-facing side.
    Client = 0x01,
    /// The host-side script.
    Server = 0x02,
}

impl Origin {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Origin::Client),
            0x02 => Some(Origin::Server),
            _ => None,
        }
    }
}

/// What the logical message is once reassembled.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Command = 0x01,
    Response = 0x02,
    Event = 0x03,
}

impl MessageKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(MessageKind::Command),
            0x02 => Some(MessageKind::Response),
            0x03 => Some(MessageKind::Event),
            _ => None,
        }
    }
}

/// Outcome flag. Only meaningful on response frames; commands and events
/// carry [`Status::Ok`].
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Ok = 0x00,
    Error = 0x01,
}

impl Status {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Status::Ok),
            0x01 => Some(Status::Error),
            _ => None,
        }
    }
}

/// Whether more chunks of the same logical message follow.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuation {
    /// This frame completes the logical message.
    Final = 0x00,
    /// More chunks follow.
    More = 0x01,
}

impl Continuation {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Continuation::Final),
            0x01 => Some(Continuation::More),
            _ => None,
        }
    }
}

/// True for bytes the payload is allowed to carry: the base64 alphabet plus
/// padding. Everything else marks the frame as foreign.
fn is_base64_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'+' || b == b'/' || b == b'='
}

/// A single parsed wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub origin: Origin,
    /// 7-bit peer id chosen at connection init.
    pub client_id: u8,
    pub continuation: Continuation,
    pub kind: MessageKind,
    pub status: Status,
    /// One chunk of base64 text.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Build a frame, masking the client id into the 7-bit range.
    pub fn new(
        origin: Origin,
        client_id: u8,
        continuation: Continuation,
        kind: MessageKind,
        status: Status,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            origin,
            client_id: client_id & 0x7F,
            continuation,
            kind,
            status,
            payload,
        }
    }

    /// Serialise to envelope bytes.
    ///
    /// Fails if the payload exceeds `max_payload` or carries a byte outside
    /// the base64 alphabet (the envelope must stay 7-bit clean).
    pub fn encode(&self, max_payload: usize) -> Result<Vec<u8>, ProtoError> {
        if self.payload.len() > max_payload {
            return Err(ProtoError::PayloadTooLarge {
                size: self.payload.len(),
                limit: max_payload,
            });
        }
        if let Some(bad) = self.payload.iter().find(|b| !is_base64_byte(**b)) {
            return Err(ProtoError::ProtocolViolation(format!(
                "payload byte {bad:#04x} is not 7-bit-safe base64 text"
            )));
        }

        let mut bytes = Vec::with_capacity(HEADER_LEN + self.payload.len() + 1);
        bytes.push(SYSEX_START);
        bytes.push(MANUFACTURER_TAG);
        bytes.push(self.origin as u8);
        bytes.push(self.client_id);
        bytes.push(self.continuation as u8);
        bytes.push(self.kind as u8);
        bytes.push(self.status as u8);
        bytes.extend_from_slice(&self.payload);
        bytes.push(SYSEX_END);
        Ok(bytes)
    }

    /// Parse envelope bytes. Returns `None` for anything unrecognisable;
    /// never errors.
    pub fn decode(bytes: &[u8]) -> Option<Frame> {
        if bytes.len() < HEADER_LEN + 1 {
            return None;
        }
        if bytes[0] != SYSEX_START || *bytes.last()? != SYSEX_END {
            return None;
        }
        if bytes[1] != MANUFACTURER_TAG {
            return None;
        }

        let origin = Origin::from_u8(bytes[2])?;
        let client_id = bytes[3];
        if client_id > 0x7F {
            return None;
        }
        let continuation = Continuation::from_u8(bytes[4])?;
        let kind = MessageKind::from_u8(bytes[5])?;
        let status = Status::from_u8(bytes[6])?;

        let payload = &bytes[HEADER_LEN..bytes.len() - 1];
        if !payload.iter().all(|b| is_base64_byte(*b)) {
            return None;
        }

        Some(Frame {
            origin,
            client_id,
            continuation,
            kind,
            status,
            payload: payload.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn frame(payload: &[u8]) -> Frame {
        Frame::new(
            Origin::Client,
            0x2A,
            Continuation::Final,
            MessageKind::Command,
            Status::Ok,
            payload.to_vec(),
        )
    }

    #[test]
    fn roundtrip_all_header_fields() {
        for origin in [Origin::Client, Origin::Server] {
            for kind in [MessageKind::Command, MessageKind::Response, MessageKind::Event] {
                for status in [Status::Ok, Status::Error] {
                    for cont in [Continuation::Final, Continuation::More] {
                        let f = Frame::new(origin, 0x11, cont, kind, status, b"aGk=".to_vec());
                        let bytes = f.encode(MAX_PAYLOAD_PER_FRAME).unwrap();
                        let parsed = Frame::decode(&bytes).unwrap();
                        assert_eq!(parsed, f);
                    }
                }
            }
        }
    }

    #[test]
    fn roundtrip_empty_payload() {
        let f = frame(b"");
        let bytes = f.encode(MAX_PAYLOAD_PER_FRAME).unwrap();
        assert_eq!(bytes.len(), HEADER_LEN + 1);
        assert_eq!(Frame::decode(&bytes).unwrap(), f);
    }

    #[test]
    fn roundtrip_payload_at_maximum() {
        let payload = vec![b'A'; MAX_PAYLOAD_PER_FRAME];
        let f = frame(&payload);
        let bytes = f.encode(MAX_PAYLOAD_PER_FRAME).unwrap();
        assert_eq!(Frame::decode(&bytes).unwrap().payload, payload);
    }

    #[test]
    fn encode_rejects_oversized_payload() {
        let payload = vec![b'A'; MAX_PAYLOAD_PER_FRAME + 1];
        let err = frame(&payload).encode(MAX_PAYLOAD_PER_FRAME).unwrap_err();
        assert!(matches!(
            err,
            ProtoError::PayloadTooLarge { size, limit }
                if size == MAX_PAYLOAD_PER_FRAME + 1 && limit == MAX_PAYLOAD_PER_FRAME
        ));
    }

    #[test]
    fn encode_rejects_eight_bit_payload() {
        let err = frame(&[0x80]).encode(MAX_PAYLOAD_PER_FRAME).unwrap_err();
        assert!(matches!(err, ProtoError::ProtocolViolation(_)));
    }

    #[test]
    fn client_id_is_masked_to_seven_bits() {
        let f = Frame::new(
            Origin::Client,
            0xFF,
            Continuation::Final,
            MessageKind::Command,
            Status::Ok,
            Vec::new(),
        );
        assert_eq!(f.client_id, 0x7F);
    }

    #[test]
    fn decode_drops_foreign_frames() {
        let good = frame(b"aGk=").encode(MAX_PAYLOAD_PER_FRAME).unwrap();

        // Too short
        assert!(Frame::decode(&good[..HEADER_LEN]).is_none());

        // Missing end sentinel
        let mut truncated = good.clone();
        truncated.pop();
        assert!(Frame::decode(&truncated).is_none());

        // Missing start sentinel
        let mut no_start = good.clone();
        no_start[0] = 0x00;
        assert!(Frame::decode(&no_start).is_none());

        // Commercial manufacturer tag
        let mut foreign = good.clone();
        foreign[1] = 0x43;
        assert!(Frame::decode(&foreign).is_none());

        // Unknown origin / continuation / kind / status bytes
        for idx in [2, 4, 5, 6] {
            let mut bad = good.clone();
            bad[idx] = 0x7E;
            assert!(Frame::decode(&bad).is_none(), "byte {idx} should invalidate");
        }

        // Client id outside the 7-bit range
        let mut bad_client = good.clone();
        bad_client[3] = 0x80;
        assert!(Frame::decode(&bad_client).is_none());

        // Payload byte outside the base64 alphabet
        let mut bad_payload = good.clone();
        bad_payload[HEADER_LEN] = b'!';
        assert!(Frame::decode(&bad_payload).is_none());
    }
}
