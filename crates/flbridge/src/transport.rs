//! MIDI transport: two unidirectional endpoints.
//!
//! Commands leave through an output port; responses arrive on an input
//! port whose callback (on the OS MIDI thread) pushes whole SysEx buffers
//! into a tokio channel. The transport makes no framing decisions - it
//! moves envelope-byte units and surfaces connection state. Endpoints are
//! matched by name substring because OS backends decorate port names with
//! client ids that differ between boots.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use midir::{Ignore, MidiInput, MidiInputConnection, MidiOutput, MidiOutputConnection};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::BridgeError;

/// Client name the bridge registers with the OS MIDI subsystem.
const MIDI_CLIENT_NAME: &str = "flbridge";

/// Capacity of the inbound raw-frame channel. The host-side script is
/// single-threaded, so bursts are short.
pub const RAW_CHANNEL_CAPACITY: usize = 256;

/// Information about a discovered MIDI port.
#[derive(Debug, Clone)]
pub struct MidiPortInfo {
    pub index: usize,
    pub name: String,
}

/// Sink for encoded frames headed to the host.
///
/// A trait seam so the engine can run against an in-memory port in tests
/// and against [`MidiRequestPort`] in production.
pub trait WirePort: Send {
    /// Write one whole envelope. Failing writes mean the transport is gone.
    fn send(&mut self, bytes: &[u8]) -> Result<(), BridgeError>;

    /// Whether the underlying endpoint is still open.
    fn is_connected(&self) -> bool;

    /// Release the endpoint.
    fn close(&mut self);
}

/// List available MIDI input ports.
pub fn list_input_ports() -> Result<Vec<MidiPortInfo>, BridgeError> {
    let midi_in = MidiInput::new(MIDI_CLIENT_NAME)
        .map_err(|e| BridgeError::EndpointMissing(format!("MIDI init: {e}")))?;
    Ok(midi_in
        .ports()
        .iter()
        .enumerate()
        .filter_map(|(i, port)| {
            midi_in
                .port_name(port)
                .ok()
                .map(|name| MidiPortInfo { index: i, name })
        })
        .collect())
}

/// List available MIDI output ports.
pub fn list_output_ports() -> Result<Vec<MidiPortInfo>, BridgeError> {
    let midi_out = MidiOutput::new(MIDI_CLIENT_NAME)
        .map_err(|e| BridgeError::EndpointMissing(format!("MIDI init: {e}")))?;
    Ok(midi_out
        .ports()
        .iter()
        .enumerate()
        .filter_map(|(i, port)| {
            midi_out
                .port_name(port)
                .ok()
                .map(|name| MidiPortInfo { index: i, name })
        })
        .collect())
}

/// The request-out endpoint.
pub struct MidiRequestPort {
    connection: Option<MidiOutputConnection>,
    pub port_name: String,
    connected: Arc<AtomicBool>,
    frames_sent: AtomicU64,
}

impl MidiRequestPort {
    /// Open an output port whose name contains `pattern`.
    pub fn open(pattern: &str) -> Result<Self, BridgeError> {
        let midi_out = MidiOutput::new(MIDI_CLIENT_NAME)
            .map_err(|e| BridgeError::EndpointMissing(format!("MIDI init: {e}")))?;

        let ports = midi_out.ports();
        let port = ports
            .iter()
            .find(|p| {
                midi_out
                    .port_name(p)
                    .map(|n| n.contains(pattern))
                    .unwrap_or(false)
            })
            .ok_or_else(|| BridgeError::EndpointMissing(pattern.to_string()))?;

        let port_name = midi_out
            .port_name(port)
            .map_err(|e| BridgeError::EndpointMissing(format!("{pattern}: {e}")))?;

        let connection = midi_out
            .connect(port, "flbridge-request")
            .map_err(|e| BridgeError::EndpointMissing(format!("{port_name}: {e}")))?;

        info!("opened MIDI request port: {}", port_name);

        Ok(Self {
            connection: Some(connection),
            port_name,
            connected: Arc::new(AtomicBool::new(true)),
            frames_sent: AtomicU64::new(0),
        })
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }
}

impl WirePort for MidiRequestPort {
    fn send(&mut self, bytes: &[u8]) -> Result<(), BridgeError> {
        match self.connection.as_mut() {
            Some(conn) => {
                conn.send(bytes).map_err(|e| {
                    self.connected.store(false, Ordering::Relaxed);
                    BridgeError::TransportLost(format!("{}: {e}", self.port_name))
                })?;
                self.frames_sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            None => Err(BridgeError::TransportLost(format!(
                "{}: port closed",
                self.port_name
            ))),
        }
    }

    fn is_connected(&self) -> bool {
        self.connection.is_some() && self.connected.load(Ordering::Relaxed)
    }

    fn close(&mut self) {
        if let Some(conn) = self.connection.take() {
            self.connected.store(false, Ordering::Relaxed);
            conn.close();
            info!("closed MIDI request port: {}", self.port_name);
        }
    }
}

impl Drop for MidiRequestPort {
    fn drop(&mut self) {
        self.close();
    }
}

/// The response-in endpoint. Holding this keeps the input callback alive;
/// dropping it closes the connection, which in turn closes the raw channel
/// and lets the engine observe transport loss.
pub struct MidiResponseListener {
    connection: Option<MidiInputConnection<()>>,
    pub port_name: String,
    frames_received: Arc<AtomicU64>,
}

impl MidiResponseListener {
    /// Open an input port whose name contains `pattern`, delivering raw
    /// SysEx buffers into `raw_tx`.
    pub fn open(pattern: &str, raw_tx: mpsc::Sender<Vec<u8>>) -> Result<Self, BridgeError> {
        let mut midi_in = MidiInput::new(MIDI_CLIENT_NAME)
            .map_err(|e| BridgeError::EndpointMissing(format!("MIDI init: {e}")))?;
        // SysEx is filtered by default; the whole protocol rides on it.
        midi_in.ignore(Ignore::None);

        let ports = midi_in.ports();
        let port = ports
            .iter()
            .find(|p| {
                midi_in
                    .port_name(p)
                    .map(|n| n.contains(pattern))
                    .unwrap_or(false)
            })
            .ok_or_else(|| BridgeError::EndpointMissing(pattern.to_string()))?;

        let port_name = midi_in
            .port_name(port)
            .map_err(|e| BridgeError::EndpointMissing(format!("{pattern}: {e}")))?;

        let frames_received = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&frames_received);

        let connection = midi_in
            .connect(
                port,
                "flbridge-response",
                move |_timestamp_us, data, _| {
                    counter.fetch_add(1, Ordering::Relaxed);
                    // Never block the OS MIDI thread; a full channel means
                    // the reactor is wedged and the frame is lost anyway.
                    if let Err(e) = raw_tx.try_send(data.to_vec()) {
                        warn!("inbound frame dropped: {e}");
                    }
                },
                (),
            )
            .map_err(|e| BridgeError::EndpointMissing(format!("{port_name}: {e}")))?;

        info!("opened MIDI response port: {}", port_name);

        Ok(Self {
            connection: Some(connection),
            port_name,
            frames_received,
        })
    }

    pub fn frames_received(&self) -> u64 {
        self.frames_received.load(Ordering::Relaxed)
    }

    pub fn close(&mut self) {
        if let Some(conn) = self.connection.take() {
            conn.close();
            debug!("closed MIDI response port: {}", self.port_name);
        }
    }
}

impl Drop for MidiResponseListener {
    fn drop(&mut self) {
        self.close();
    }
}
