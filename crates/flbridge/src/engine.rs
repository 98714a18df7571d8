//! Correlated request/response engine.
//!
//! Architecture: reactor pattern to avoid lock contention. The outbound
//! port, the pending-request map and the chunk reassembler are owned by a
//! dedicated reactor task; requests flow through an mpsc channel and
//! responses return via oneshot channels keyed by correlation id. The
//! handle is cheap to clone, and because callers are resolved through
//! oneshot completion the engine is reentrant: a caller may submit a new
//! request from a completion path without touching reactor state inline.
//!
//! Responses may arrive in any order; pairing is by correlation id alone,
//! never by sequence. Deadlines are absolute, set at submission; the
//! reactor sleeps until the earliest one and expires whatever is due.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use flproto::chunk::{encode_message, Reassembler};
use flproto::record::{HostErrorKind, ResponseStatus, WireRecord};
use flproto::sysex::{Frame, MessageKind, Origin, Status, MAX_PAYLOAD_PER_FRAME};
use flproto::HostCommand;

use crate::error::BridgeError;
use crate::transport::WirePort;

/// Buffer for reactor commands; ample for a single-event-loop caller.
const COMMAND_CHANNEL_CAPACITY: usize = 256;

/// Buffer for the host-event broadcast.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Engine wiring parameters.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// 7-bit peer id stamped into every outbound frame.
    pub client_id: u8,
    /// Per-frame payload budget (base64 bytes).
    pub max_payload_per_frame: usize,
    /// Inbound accumulator cap.
    pub max_message_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            client_id: 0,
            max_payload_per_frame: MAX_PAYLOAD_PER_FRAME,
            max_message_bytes: flproto::chunk::MAX_MESSAGE_BYTES,
        }
    }
}

/// Asynchronous notifications surfaced alongside request/response traffic.
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    /// Unsolicited host event (e.g. `plugin_changed`).
    Host { name: String, data: Value },
    /// Inbound protocol fault with no correlated caller (oversized
    /// accumulator, unparseable reassembly).
    ProtocolError(String),
}

enum ReactorCommand {
    Submit {
        id: u32,
        command: String,
        frames: Vec<Vec<u8>>,
        deadline: Instant,
        response_tx: oneshot::Sender<Result<Value, BridgeError>>,
    },
    Cancel {
        id: u32,
    },
    Shutdown,
}

struct PendingRequest {
    command: String,
    response_tx: oneshot::Sender<Result<Value, BridgeError>>,
    deadline: Instant,
    submitted: Instant,
}

/// Handle to the reactor. Clone freely; all clones feed one task.
#[derive(Clone)]
pub struct RequestEngine {
    cmd_tx: mpsc::Sender<ReactorCommand>,
    events_tx: broadcast::Sender<BridgeEvent>,
    next_id: Arc<AtomicU32>,
    client_id: u8,
    max_payload_per_frame: usize,
}

impl RequestEngine {
    /// Spawn the reactor over an outbound port and an inbound raw-frame
    /// stream. The raw channel closing is how the engine observes
    /// transport loss.
    pub fn start(
        port: Box<dyn WirePort>,
        raw_rx: mpsc::Receiver<Vec<u8>>,
        config: EngineConfig,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let reactor_events = events_tx.clone();
        let client_id = config.client_id & 0x7F;
        let max_message_bytes = config.max_message_bytes;
        tokio::spawn(async move {
            reactor_task(
                port,
                cmd_rx,
                raw_rx,
                client_id,
                max_message_bytes,
                reactor_events,
            )
            .await;
        });

        Self {
            cmd_tx,
            events_tx,
            next_id: Arc::new(AtomicU32::new(1)),
            client_id,
            max_payload_per_frame: config.max_payload_per_frame,
        }
    }

    /// Submit a command and await its response or failure.
    pub async fn execute(
        &self,
        command: &HostCommand,
        timeout: Duration,
    ) -> Result<Value, BridgeError> {
        let (_id, response_rx) = self.submit(command, timeout).await?;
        response_rx
            .await
            .map_err(|_| BridgeError::TransportLost("engine stopped".into()))?
    }

    /// Submit a command with a caller-held abort signal.
    ///
    /// Cancellation resolves the caller immediately and drops the pending
    /// entry; the host will still finish its work and the late response is
    /// discarded on arrival.
    pub async fn execute_with_cancel(
        &self,
        command: &HostCommand,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Value, BridgeError> {
        let (id, response_rx) = self.submit(command, timeout).await?;

        tokio::select! {
            result = response_rx => {
                result.map_err(|_| BridgeError::TransportLost("engine stopped".into()))?
            }
            () = cancel.cancelled() => {
                let _ = self.cmd_tx.send(ReactorCommand::Cancel { id }).await;
                Err(BridgeError::Cancelled {
                    command: command.wire_name().to_string(),
                })
            }
        }
    }

    async fn submit(
        &self,
        command: &HostCommand,
        timeout: Duration,
    ) -> Result<(u32, oneshot::Receiver<Result<Value, BridgeError>>), BridgeError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let record = command.to_record(id)?;
        let frames = encode_message(
            Origin::Client,
            self.client_id,
            MessageKind::Command,
            Status::Ok,
            &record,
            self.max_payload_per_frame,
        )?;

        let (response_tx, response_rx) = oneshot::channel();
        self.cmd_tx
            .send(ReactorCommand::Submit {
                id,
                command: command.wire_name().to_string(),
                frames,
                deadline: Instant::now() + timeout,
                response_tx,
            })
            .await
            .map_err(|_| BridgeError::TransportLost("engine stopped".into()))?;

        Ok((id, response_rx))
    }

    /// Subscribe to unsolicited host events and protocol faults.
    pub fn subscribe_events(&self) -> broadcast::Receiver<BridgeEvent> {
        self.events_tx.subscribe()
    }

    /// Stop the reactor, failing every outstanding request with
    /// `TransportLost` and clearing chunk accumulators.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(ReactorCommand::Shutdown).await;
    }

    /// The client id stamped into outbound frames.
    pub fn client_id(&self) -> u8 {
        self.client_id
    }
}

async fn deadline_sleep(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

fn fail_all(pending: &mut HashMap<u32, PendingRequest>, reason: &str) {
    for (id, req) in pending.drain() {
        trace!("failing pending request {id} ({}): {reason}", req.command);
        let _ = req
            .response_tx
            .send(Err(BridgeError::TransportLost(reason.to_string())));
    }
}

async fn reactor_task(
    mut port: Box<dyn WirePort>,
    mut cmd_rx: mpsc::Receiver<ReactorCommand>,
    mut raw_rx: mpsc::Receiver<Vec<u8>>,
    client_id: u8,
    max_message_bytes: usize,
    events_tx: broadcast::Sender<BridgeEvent>,
) {
    let mut pending: HashMap<u32, PendingRequest> = HashMap::new();
    let mut reassembler = Reassembler::new(max_message_bytes);

    debug!("engine reactor started (client id {client_id:#04x})");

    loop {
        let next_deadline = pending.values().map(|p| p.deadline).min();

        tokio::select! {
            // Bias towards submissions so frames of a message stay
            // contiguous ahead of bursty inbound traffic.
            biased;

            cmd = cmd_rx.recv() => match cmd {
                Some(ReactorCommand::Submit { id, command, frames, deadline, response_tx }) => {
                    trace!("sending {command} as request {id} ({} frames)", frames.len());

                    // All frames of one message leave back-to-back; the
                    // far side reassembles per client id in arrival order.
                    let mut send_failure = None;
                    for frame in &frames {
                        if let Err(e) = port.send(frame) {
                            send_failure = Some(e);
                            break;
                        }
                    }

                    if let Some(e) = send_failure {
                        warn!("send failed for request {id}: {e}");
                        let reason = e.to_string();
                        let _ = response_tx.send(Err(e));
                        fail_all(&mut pending, &reason);
                        reassembler.clear();
                        break;
                    }

                    pending.insert(id, PendingRequest {
                        command,
                        response_tx,
                        deadline,
                        submitted: Instant::now(),
                    });
                }
                Some(ReactorCommand::Cancel { id }) => {
                    if let Some(req) = pending.remove(&id) {
                        debug!("request {id} ({}) cancelled", req.command);
                        let _ = req.response_tx.send(Err(BridgeError::Cancelled {
                            command: req.command.clone(),
                        }));
                    }
                }
                Some(ReactorCommand::Shutdown) | None => {
                    debug!("engine shutting down, failing {} pending requests", pending.len());
                    fail_all(&mut pending, "engine shut down");
                    reassembler.clear();
                    break;
                }
            },

            raw = raw_rx.recv() => match raw {
                Some(bytes) => {
                    handle_raw_frame(&bytes, client_id, &mut reassembler, &mut pending, &events_tx);
                }
                None => {
                    warn!("response endpoint closed, failing {} pending requests", pending.len());
                    fail_all(&mut pending, "response endpoint closed");
                    reassembler.clear();
                    break;
                }
            },

            () = deadline_sleep(next_deadline) => {
                let now = Instant::now();
                let expired: Vec<u32> = pending
                    .iter()
                    .filter(|(_, req)| req.deadline <= now)
                    .map(|(id, _)| *id)
                    .collect();
                for id in expired {
                    if let Some(req) = pending.remove(&id) {
                        let elapsed_ms = req.submitted.elapsed().as_millis() as u64;
                        debug!("request {id} ({}) timed out after {elapsed_ms} ms", req.command);
                        let _ = req.response_tx.send(Err(BridgeError::Timeout {
                            command: req.command,
                            elapsed_ms,
                        }));
                    }
                }
            }
        }
    }

    debug!("engine reactor exited");
}

fn handle_raw_frame(
    bytes: &[u8],
    client_id: u8,
    reassembler: &mut Reassembler,
    pending: &mut HashMap<u32, PendingRequest>,
    events_tx: &broadcast::Sender<BridgeEvent>,
) {
    // Unrecognisable frames are foreign devices on a shared bus: silence.
    let Some(frame) = Frame::decode(bytes) else {
        trace!("dropped unrecognisable frame ({} bytes)", bytes.len());
        return;
    };
    // Our own frames looped back, or another client's origin byte.
    if frame.origin != Origin::Server {
        return;
    }
    if frame.client_id != client_id {
        debug!(
            "dropped frame for peer {:#04x} (we are {:#04x})",
            frame.client_id, client_id
        );
        return;
    }

    let message = match reassembler.accept(&frame) {
        Ok(Some(message)) => message,
        Ok(None) => return,
        // PayloadTooLarge or a malformed record: the accumulator is gone
        // and there is no correlation id to fail, so surface as an event.
        Err(err) => {
            warn!("inbound reassembly failed: {err}");
            let _ = events_tx.send(BridgeEvent::ProtocolError(err.to_string()));
            return;
        }
    };

    match message.record {
        WireRecord::Response { id, status, result, error } => {
            let Some(req) = pending.remove(&id) else {
                // Timed out, cancelled, or never ours: drop on arrival.
                debug!("discarding late/orphan response {id}");
                return;
            };

            let outcome = match status {
                ResponseStatus::Ok => Ok(result.unwrap_or(Value::Null)),
                ResponseStatus::Error => {
                    let command = req.command.clone();
                    match error {
                        Some(host_error) => match host_error.kind() {
                            HostErrorKind::Unsafe => {
                                Err(BridgeError::HostUnsafe(host_error.message))
                            }
                            HostErrorKind::UnknownCommand => {
                                Err(BridgeError::UnknownCommand(command))
                            }
                            HostErrorKind::Failed => Err(BridgeError::CommandFailed {
                                command,
                                reason: format!("{}: {}", host_error.code, host_error.message),
                            }),
                        },
                        None => Err(BridgeError::CommandFailed {
                            command,
                            reason: "unspecified host error".to_string(),
                        }),
                    }
                }
            };
            let _ = req.response_tx.send(outcome);
        }
        WireRecord::Event { name, data } => {
            trace!("host event: {name}");
            let _ = events_tx.send(BridgeEvent::Host { name, data });
        }
        WireRecord::Command { id, name, .. } => {
            debug!("ignoring host-originated command {name} ({id})");
        }
    }
}
