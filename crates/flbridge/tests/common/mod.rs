//! Scripted in-memory host for driving the engine and session without MIDI
//! hardware. Implements the outbound port seam, reassembles the client's
//! command frames, and answers through the same raw-frame channel the real
//! response listener would feed.

// Each test binary compiles its own copy; not every helper is used in all.
#![allow(dead_code)]

use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use flbridge::{BridgeError, WirePort};
use flproto::chunk::{encode_message, Reassembler};
use flproto::record::{HostError, ResponseStatus, WireRecord};
use flproto::sysex::{Frame, MessageKind, Origin, Status, MAX_PAYLOAD_PER_FRAME};

/// What the script does with one received command.
pub enum ScriptedReply {
    /// Answer immediately.
    Respond(WireRecord),
    /// Answer after a delay (host still "working").
    RespondAfter(Duration, WireRecord),
    /// Never answer.
    Silence,
}

pub type Script = Box<dyn FnMut(&WireRecord) -> Vec<ScriptedReply> + Send>;

/// In-memory stand-in for the host side of the wire.
pub struct ScriptedHost {
    raw_tx: mpsc::Sender<Vec<u8>>,
    reassembler: Reassembler,
    script: Script,
    /// Per-frame budget for replies; shrink it to force chunked responses.
    pub reply_max_payload: usize,
    /// When set, the next send fails as a lost transport.
    pub fail_sends: std::sync::Arc<std::sync::atomic::AtomicBool>,
    connected: bool,
}

impl ScriptedHost {
    pub fn new(raw_tx: mpsc::Sender<Vec<u8>>, script: Script) -> Self {
        Self {
            raw_tx,
            reassembler: Reassembler::default(),
            script,
            reply_max_payload: MAX_PAYLOAD_PER_FRAME,
            fail_sends: std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false)),
            connected: true,
        }
    }

    fn deliver(&self, record: WireRecord, client_id: u8, delay: Option<Duration>) {
        let (kind, status) = match &record {
            WireRecord::Response { status, .. } => (
                MessageKind::Response,
                match status {
                    ResponseStatus::Ok => Status::Ok,
                    ResponseStatus::Error => Status::Error,
                },
            ),
            WireRecord::Event { .. } => (MessageKind::Event, Status::Ok),
            WireRecord::Command { .. } => (MessageKind::Command, Status::Ok),
        };
        let frames = encode_message(
            Origin::Server,
            client_id,
            kind,
            status,
            &record,
            self.reply_max_payload,
        )
        .expect("scripted reply encodes");

        let raw_tx = self.raw_tx.clone();
        match delay {
            None => {
                for frame in frames {
                    raw_tx.try_send(frame).expect("raw channel has capacity");
                }
            }
            Some(delay) => {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    for frame in frames {
                        let _ = raw_tx.send(frame).await;
                    }
                });
            }
        }
    }
}

impl WirePort for ScriptedHost {
    fn send(&mut self, bytes: &[u8]) -> Result<(), BridgeError> {
        if self.fail_sends.load(std::sync::atomic::Ordering::Relaxed) {
            self.connected = false;
            return Err(BridgeError::TransportLost("scripted failure".into()));
        }

        let frame = Frame::decode(bytes).expect("client frames decode");
        assert_eq!(frame.origin, Origin::Client, "client frames carry client origin");
        let client_id = frame.client_id;

        if let Some(message) = self
            .reassembler
            .accept(&frame)
            .expect("client frames reassemble")
        {
            let replies = (self.script)(&message.record);
            for reply in replies {
                match reply {
                    ScriptedReply::Respond(record) => self.deliver(record, client_id, None),
                    ScriptedReply::RespondAfter(delay, record) => {
                        self.deliver(record, client_id, Some(delay));
                    }
                    ScriptedReply::Silence => {}
                }
            }
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn close(&mut self) {
        self.connected = false;
    }
}

pub fn ok_response(id: u32, result: Value) -> WireRecord {
    WireRecord::Response {
        id,
        status: ResponseStatus::Ok,
        result: Some(result),
        error: None,
    }
}

pub fn err_response(id: u32, code: &str, message: &str) -> WireRecord {
    WireRecord::Response {
        id,
        status: ResponseStatus::Error,
        result: None,
        error: Some(HostError {
            code: code.to_string(),
            message: message.to_string(),
        }),
    }
}

pub fn transport_state_response(id: u32) -> WireRecord {
    ok_response(
        id,
        json!({"playing": false, "recording": false, "position_ticks": 0}),
    )
}

pub fn discover_response(
    id: u32,
    plugin_name: &str,
    channel_index: u32,
    parameters: &[(u32, &str, f64)],
) -> WireRecord {
    let rows: Vec<Value> = parameters
        .iter()
        .map(|(index, name, value)| json!({"index": index, "name": name, "value": value}))
        .collect();
    ok_response(
        id,
        json!({
            "plugin_name": plugin_name,
            "channel_index": channel_index,
            "parameters": rows,
        }),
    )
}

/// Correlation id of a command record.
pub fn command_id(record: &WireRecord) -> u32 {
    match record {
        WireRecord::Command { id, .. } => *id,
        _ => panic!("expected a command record"),
    }
}

/// Wire name of a command record.
pub fn command_name(record: &WireRecord) -> &str {
    match record {
        WireRecord::Command { name, .. } => name,
        _ => panic!("expected a command record"),
    }
}
