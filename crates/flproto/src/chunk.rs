//! Payload chunking and per-client reassembly.
//!
//! The host receive buffer is fixed and small, so a serialised record may
//! need several frames. This module is the only place aware of the split:
//! outbound, [`encode_message`] turns a record into a contiguous run of
//! frame byte buffers; inbound, [`Reassembler`] accumulates chunks per
//! client id until a final frame closes the logical message.

use std::collections::HashMap;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

use crate::error::ProtoError;
use crate::record::WireRecord;
use crate::sysex::{Continuation, Frame, MessageKind, Origin, Status};

/// Default cap on a single reassembly accumulator. Large enough for a
/// realistic parameter dump (thousands of slots), small enough to bound a
/// misbehaving sender.
pub const MAX_MESSAGE_BYTES: usize = 1 << 20;

/// Split an already base64-encoded payload into chunks of at most
/// `max_chunk` bytes, tagged with their continuation flag.
///
/// An empty payload yields a single final empty chunk; a payload of exactly
/// `max_chunk` bytes yields one frame; one byte more yields two. Emission
/// order is reassembly order.
pub fn split_payload(encoded: &[u8], max_chunk: usize) -> Vec<(Vec<u8>, Continuation)> {
    if encoded.is_empty() {
        return vec![(Vec::new(), Continuation::Final)];
    }
    let mut chunks: Vec<(Vec<u8>, Continuation)> = encoded
        .chunks(max_chunk)
        .map(|c| (c.to_vec(), Continuation::More))
        .collect();
    if let Some(last) = chunks.last_mut() {
        last.1 = Continuation::Final;
    }
    chunks
}

/// Serialise a record into one or more encoded frames, ready for the wire.
///
/// Frames of one message must be sent contiguously; interleaving chunks of
/// different messages under the same client id corrupts reassembly on the
/// far side.
pub fn encode_message(
    origin: Origin,
    client_id: u8,
    kind: MessageKind,
    status: Status,
    record: &WireRecord,
    max_chunk: usize,
) -> Result<Vec<Vec<u8>>, ProtoError> {
    let raw = record.to_wire_bytes()?;
    let encoded = BASE64.encode(&raw).into_bytes();

    split_payload(&encoded, max_chunk)
        .into_iter()
        .map(|(payload, continuation)| {
            Frame::new(origin, client_id, continuation, kind, status, payload).encode(max_chunk)
        })
        .collect()
}

/// A reassembled inbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct LogicalMessage {
    /// Client id the chunks were keyed by.
    pub client_id: u8,
    /// Kind byte of the closing frame.
    pub kind: MessageKind,
    /// Status byte of the closing frame.
    pub status: Status,
    pub record: WireRecord,
}

/// Per-client chunk accumulator.
///
/// Reassembly is keyed by client id, so concurrent senders on a shared bus
/// never collide. Accumulators are bounded; overflow discards the partial
/// message and surfaces [`ProtoError::PayloadTooLarge`].
#[derive(Debug)]
pub struct Reassembler {
    max_message_bytes: usize,
    accumulators: HashMap<u8, Vec<u8>>,
}

impl Reassembler {
    pub fn new(max_message_bytes: usize) -> Self {
        Self {
            max_message_bytes,
            accumulators: HashMap::new(),
        }
    }

    /// Feed one frame. Returns a message when the frame closes one.
    ///
    /// A final frame with an empty accumulator is a single-frame message.
    pub fn accept(&mut self, frame: &Frame) -> Result<Option<LogicalMessage>, ProtoError> {
        let accumulated = self
            .accumulators
            .get(&frame.client_id)
            .map_or(0, Vec::len);
        if accumulated + frame.payload.len() > self.max_message_bytes {
            self.accumulators.remove(&frame.client_id);
            return Err(ProtoError::PayloadTooLarge {
                size: accumulated + frame.payload.len(),
                limit: self.max_message_bytes,
            });
        }

        match frame.continuation {
            Continuation::More => {
                self.accumulators
                    .entry(frame.client_id)
                    .or_default()
                    .extend_from_slice(&frame.payload);
                Ok(None)
            }
            Continuation::Final => {
                let mut encoded = self.accumulators.remove(&frame.client_id).unwrap_or_default();
                encoded.extend_from_slice(&frame.payload);

                let raw = BASE64.decode(&encoded).map_err(|e| {
                    ProtoError::ProtocolViolation(format!("reassembled payload is not base64: {e}"))
                })?;
                let record = WireRecord::from_wire_bytes(&raw)?;

                Ok(Some(LogicalMessage {
                    client_id: frame.client_id,
                    kind: frame.kind,
                    status: frame.status,
                    record,
                }))
            }
        }
    }

    /// Bytes currently buffered for a client id.
    pub fn pending_bytes(&self, client_id: u8) -> usize {
        self.accumulators.get(&client_id).map_or(0, Vec::len)
    }

    /// Drop every partial message. Used at connection teardown.
    pub fn clear(&mut self) {
        self.accumulators.clear();
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(MAX_MESSAGE_BYTES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn inbound_frames(record: &WireRecord, client_id: u8, max_chunk: usize) -> Vec<Frame> {
        encode_message(
            Origin::Server,
            client_id,
            MessageKind::Response,
            Status::Ok,
            record,
            max_chunk,
        )
        .unwrap()
        .iter()
        .map(|bytes| Frame::decode(bytes).unwrap())
        .collect()
    }

    fn big_response(id: u32, payload_chars: usize) -> WireRecord {
        WireRecord::Response {
            id,
            status: crate::record::ResponseStatus::Ok,
            result: Some(json!({"blob": "x".repeat(payload_chars)})),
            error: None,
        }
    }

    #[test]
    fn split_boundaries() {
        assert_eq!(split_payload(b"", 8), vec![(Vec::new(), Continuation::Final)]);

        let exact = split_payload(&vec![b'A'; 8], 8);
        assert_eq!(exact.len(), 1);
        assert_eq!(exact[0].1, Continuation::Final);

        let over = split_payload(&vec![b'A'; 9], 8);
        assert_eq!(over.len(), 2);
        assert_eq!(over[0].1, Continuation::More);
        assert_eq!(over[0].0.len(), 8);
        assert_eq!(over[1].1, Continuation::Final);
        assert_eq!(over[1].0.len(), 1);
    }

    #[test]
    fn reassemble_inverts_split_for_any_chunk_size() {
        let record = big_response(3, 500);
        for max_chunk in [1, 7, 64, 1800] {
            let frames = inbound_frames(&record, 9, max_chunk);
            let mut reassembler = Reassembler::default();
            let mut emitted = Vec::new();
            for frame in &frames {
                if let Some(msg) = reassembler.accept(frame).unwrap() {
                    emitted.push(msg);
                }
            }
            assert_eq!(emitted.len(), 1, "chunk size {max_chunk}");
            assert_eq!(emitted[0].record, record);
            assert_eq!(reassembler.pending_bytes(9), 0);
        }
    }

    #[test]
    fn single_frame_message_with_empty_accumulator() {
        let record = WireRecord::Response {
            id: 1,
            status: crate::record::ResponseStatus::Ok,
            result: None,
            error: None,
        };
        let frames = inbound_frames(&record, 4, 1800);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].continuation, Continuation::Final);

        let mut reassembler = Reassembler::default();
        let msg = reassembler.accept(&frames[0]).unwrap().unwrap();
        assert_eq!(msg.record, record);
    }

    #[test]
    fn chunked_response_emits_once_and_empties_accumulator() {
        // A response whose base64 form needs three frames: flags more, more, final.
        let record = big_response(11, 2600);
        let frames = inbound_frames(&record, 5, 1200);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].continuation, Continuation::More);
        assert_eq!(frames[1].continuation, Continuation::More);
        assert_eq!(frames[2].continuation, Continuation::Final);

        let mut reassembler = Reassembler::default();
        assert!(reassembler.accept(&frames[0]).unwrap().is_none());
        assert!(reassembler.accept(&frames[1]).unwrap().is_none());
        assert!(reassembler.pending_bytes(5) > 0);

        let msg = reassembler.accept(&frames[2]).unwrap().unwrap();
        assert_eq!(msg.client_id, 5);
        assert_eq!(msg.record, record);
        assert_eq!(reassembler.pending_bytes(5), 0);
    }

    #[test]
    fn interleaved_clients_do_not_collide() {
        let record_a = big_response(1, 300);
        let record_b = big_response(2, 300);
        let frames_a = inbound_frames(&record_a, 1, 100);
        let frames_b = inbound_frames(&record_b, 2, 100);
        assert!(frames_a.len() > 1 && frames_b.len() > 1);

        let mut reassembler = Reassembler::default();
        let mut emitted = Vec::new();

        // Alternate frames from the two senders.
        let mut iter_a = frames_a.iter();
        let mut iter_b = frames_b.iter();
        loop {
            let mut progressed = false;
            for frame in [iter_a.next(), iter_b.next()].into_iter().flatten() {
                progressed = true;
                if let Some(msg) = reassembler.accept(frame).unwrap() {
                    emitted.push(msg);
                }
            }
            if !progressed {
                break;
            }
        }

        assert_eq!(emitted.len(), 2);
        let by_client: HashMap<u8, &WireRecord> =
            emitted.iter().map(|m| (m.client_id, &m.record)).collect();
        assert_eq!(by_client[&1], &record_a);
        assert_eq!(by_client[&2], &record_b);
    }

    #[test]
    fn accumulator_overflow_discards_and_errors() {
        let mut reassembler = Reassembler::new(100);
        let chunk = Frame::new(
            Origin::Server,
            3,
            Continuation::More,
            MessageKind::Response,
            Status::Ok,
            vec![b'A'; 80],
        );
        assert!(reassembler.accept(&chunk).unwrap().is_none());

        let err = reassembler.accept(&chunk).unwrap_err();
        assert!(matches!(err, ProtoError::PayloadTooLarge { size: 160, limit: 100 }));
        // Accumulator was discarded; the client can start over.
        assert_eq!(reassembler.pending_bytes(3), 0);
        assert!(reassembler.accept(&chunk).unwrap().is_none());
        assert_eq!(reassembler.pending_bytes(3), 80);
    }

    #[test]
    fn malformed_final_payload_is_a_protocol_violation() {
        // Valid base64 that does not decode to a record.
        let garbage = BASE64.encode(b"definitely not json").into_bytes();
        let frame = Frame::new(
            Origin::Server,
            6,
            Continuation::Final,
            MessageKind::Response,
            Status::Ok,
            garbage,
        );
        let mut reassembler = Reassembler::default();
        let err = reassembler.accept(&frame).unwrap_err();
        assert!(matches!(err, ProtoError::ProtocolViolation(_)));
        assert_eq!(reassembler.pending_bytes(6), 0);
    }

    #[test]
    fn truncated_base64_is_a_protocol_violation() {
        // An odd number of base64 chars cannot decode.
        let frame = Frame::new(
            Origin::Server,
            6,
            Continuation::Final,
            MessageKind::Response,
            Status::Ok,
            b"abcde".to_vec(),
        );
        let mut reassembler = Reassembler::default();
        let err = reassembler.accept(&frame).unwrap_err();
        assert!(matches!(err, ProtoError::ProtocolViolation(_)));
    }
}
