//! Connection liveness tracking and the heartbeat task.
//!
//! The MIDI layer gives no connection semantics: an output port happily
//! accepts writes into the void. Liveness therefore means "the host-side
//! script is answering", tracked by round-tripping the read-only
//! `transport.state` probe. Failures only count once a first contact has
//! been made; during startup the tracker waits silently.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

use flproto::HostCommand;

use crate::engine::RequestEngine;

/// Consecutive probe failures before the peer is declared dead.
pub const DEFAULT_MAX_FAILURES: u32 = 5;

/// Peer responsiveness, not socket state.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Never heard from the peer.
    Unknown = 0,
    /// Peer is answering probes.
    Connected = 1,
    /// Peer stopped answering.
    Dead = 2,
}

impl ConnectionState {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => ConnectionState::Connected,
            2 => ConnectionState::Dead,
            _ => ConnectionState::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Unknown => "unknown",
            ConnectionState::Connected => "connected",
            ConnectionState::Dead => "dead",
        }
    }
}

/// Health tracking based on probe and request success.
#[derive(Debug)]
pub struct HealthTracker {
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    last_success: RwLock<Option<Instant>>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ConnectionState::Unknown as u8),
            consecutive_failures: AtomicU32::new(0),
            last_success: RwLock::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub async fn record_success(&self) {
        *self.last_success.write().await = Some(Instant::now());
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.set_state(ConnectionState::Connected);
    }

    /// Returns the new consecutive failure count.
    pub fn record_failure(&self) -> u32 {
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub async fn seconds_since_success(&self) -> Option<u64> {
        self.last_success.read().await.map(|t| t.elapsed().as_secs())
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn the heartbeat task: a periodic `transport.state` round-trip.
///
/// Failures only count after the first successful contact; before that the
/// task waits quietly for the host script to come up.
pub fn spawn_heartbeat(
    engine: RequestEngine,
    health: Arc<HealthTracker>,
    interval: Duration,
    probe_timeout: Duration,
    max_failures: u32,
    mut shutdown: broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut ever_connected = health.is_connected();

        debug!("heartbeat task started (interval {interval:?})");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match engine.execute(&HostCommand::TransportState, probe_timeout).await {
                        Ok(_) => {
                            let was_connected = health.is_connected();
                            health.record_success().await;
                            if !was_connected {
                                if ever_connected {
                                    info!("host reconnected");
                                } else {
                                    info!("host connection established");
                                }
                            }
                            ever_connected = true;
                        }
                        Err(e) => {
                            if ever_connected {
                                let failures = health.record_failure();
                                if failures == 1 || failures % 5 == 0 {
                                    debug!("host not answering (failures={failures}): {e}");
                                }
                                if failures >= max_failures
                                    && health.state() != ConnectionState::Dead
                                {
                                    health.set_state(ConnectionState::Dead);
                                    warn!("host marked dead after {failures} failed probes");
                                }
                            } else {
                                debug!("waiting for host: {e}");
                            }
                        }
                    }
                }
                _ = shutdown.recv() => {
                    debug!("heartbeat task shutting down");
                    break;
                }
            }
        }
    });
}
