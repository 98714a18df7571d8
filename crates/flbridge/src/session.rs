//! The bridge session: lifecycle plus the high-level operation surface.
//!
//! A session owns everything stateful: the request engine, the parameter
//! directory, the shadow ledger and the render watcher. The agent adapter
//! talks to this facade only; numeric parameter indices never cross it -
//! plugin parameters are addressed by `(address, name)` and resolved
//! through the directory, discovering lazily on first touch.
//!
//! Lifecycle: `connect` opens both endpoints, performs a handshake
//! round-trip and starts the heartbeat. Transport loss fails in-flight
//! requests but leaves the directory and shadow intact for a reconnect to
//! the same host session; `shutdown` clears everything.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use flconf::BridgeConfig;
use flproto::response::{
    parse_result, ParamValue, PluginInventory, PositionInfo, PresetInfo, SetParamAck, TempoInfo,
    TransportState,
};
use flproto::{HostCommand, TimeoutClass};

use crate::directory::{ParameterDirectory, ParameterRecord, PluginAddress};
use crate::engine::{BridgeEvent, EngineConfig, RequestEngine};
use crate::error::BridgeError;
use crate::lifecycle::{spawn_heartbeat, HealthTracker, DEFAULT_MAX_FAILURES};
use crate::render::{AwaitOutcome, RenderArtifact, RenderWatcher, RenderWatcherConfig};
use crate::shadow::ShadowStore;
use crate::transport::{
    MidiRequestPort, MidiResponseListener, WirePort, RAW_CHANNEL_CAPACITY,
};

/// A live parameter read paired with the shadow ledger's view.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamReading {
    /// What the host reported. May be stale or wrong for some plugins.
    pub value: f64,
    pub value_string: Option<String>,
    /// What we last wrote, if anything.
    pub shadow: Option<f64>,
    /// True when host and shadow disagree beyond tolerance: external
    /// change or reporting lag. Never reconciled automatically.
    pub diverged: bool,
}

/// Seek target for `project.set_position`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SeekTarget {
    Bars(f64),
    Ticks(u64),
    Ms(u64),
    Seconds(f64),
}

impl SeekTarget {
    fn into_command(self) -> HostCommand {
        let (bars, ticks, ms, seconds) = match self {
            SeekTarget::Bars(v) => (Some(v), None, None, None),
            SeekTarget::Ticks(v) => (None, Some(v), None, None),
            SeekTarget::Ms(v) => (None, None, Some(v), None),
            SeekTarget::Seconds(v) => (None, None, None, Some(v)),
        };
        HostCommand::ProjectSetPosition { bars, ticks, ms, seconds }
    }
}

#[derive(Debug, Deserialize)]
struct PluginChangedEvent {
    index: u32,
    slot_index: i32,
}

/// An active bridge connection.
pub struct BridgeSession {
    config: BridgeConfig,
    engine: RequestEngine,
    health: Arc<HealthTracker>,
    directory: Arc<RwLock<ParameterDirectory>>,
    shadow: Arc<RwLock<ShadowStore>>,
    render: Option<RenderWatcher>,
    /// Keeps the response-port callback alive for the session's lifetime.
    _listener: Option<MidiResponseListener>,
    shutdown_tx: broadcast::Sender<()>,
}

impl std::fmt::Debug for BridgeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeSession").finish_non_exhaustive()
    }
}

impl BridgeSession {
    /// Open both MIDI endpoints and bring the session up.
    ///
    /// Missing endpoints are fatal ([`BridgeError::EndpointMissing`]); the
    /// caller decides whether to schedule a bounded retry.
    pub async fn connect(config: BridgeConfig) -> Result<Self, BridgeError> {
        if !config.ports.is_complete() {
            return Err(BridgeError::EndpointMissing(
                "request/response port names not configured".to_string(),
            ));
        }

        let (raw_tx, raw_rx) = mpsc::channel(RAW_CHANNEL_CAPACITY);
        let listener = MidiResponseListener::open(&config.ports.response_port, raw_tx)?;
        let port = MidiRequestPort::open(&config.ports.request_port)?;

        Self::connect_inner(Box::new(port), raw_rx, Some(listener), config).await
    }

    /// Bring a session up over an already-open transport.
    ///
    /// This is the seam the tests (and any in-process host) use; `connect`
    /// is the same path with real MIDI endpoints.
    pub async fn connect_over(
        port: Box<dyn WirePort>,
        raw_rx: mpsc::Receiver<Vec<u8>>,
        config: BridgeConfig,
    ) -> Result<Self, BridgeError> {
        Self::connect_inner(port, raw_rx, None, config).await
    }

    /// Bounded-retry connect for callers that want the lifecycle layer to
    /// absorb a host that is still starting up.
    pub async fn connect_with_retry(
        config: BridgeConfig,
        max_attempts: u32,
        backoff: Duration,
    ) -> Result<Self, BridgeError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match Self::connect(config.clone()).await {
                Ok(session) => return Ok(session),
                Err(e) if attempt < max_attempts => {
                    warn!("connect attempt {attempt}/{max_attempts} failed: {e}");
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn connect_inner(
        port: Box<dyn WirePort>,
        raw_rx: mpsc::Receiver<Vec<u8>>,
        listener: Option<MidiResponseListener>,
        config: BridgeConfig,
    ) -> Result<Self, BridgeError> {
        // 7-bit peer id: pinned in config, or derived fresh per connection.
        let client_id = config
            .client_id
            .unwrap_or_else(|| Uuid::new_v4().as_bytes()[0])
            & 0x7F;

        let engine = RequestEngine::start(
            port,
            raw_rx,
            EngineConfig {
                client_id,
                ..EngineConfig::default()
            },
        );

        let health = Arc::new(HealthTracker::new());
        let (shutdown_tx, _) = broadcast::channel(1);

        let session = Self {
            directory: Arc::new(RwLock::new(ParameterDirectory::new(config.aliases.clone()))),
            shadow: Arc::new(RwLock::new(ShadowStore::new())),
            render: match &config.render.watch_dir {
                Some(dir) => Some(RenderWatcher::start(RenderWatcherConfig::from_config(
                    dir.clone(),
                    &config.render,
                ))?),
                None => None,
            },
            engine,
            health,
            _listener: listener,
            shutdown_tx,
            config,
        };

        // Handshake: one read-only round-trip proves the host script is
        // listening and seeds the health tracker.
        let probe_timeout = session.effective_timeout(&HostCommand::TransportState, None);
        match session
            .engine
            .execute(&HostCommand::TransportState, probe_timeout)
            .await
        {
            Ok(_) => {
                session.health.record_success().await;
                info!("handshake complete (client id {client_id:#04x})");
            }
            Err(e) => {
                session.engine.shutdown().await;
                return Err(e);
            }
        }

        session.spawn_event_listener();
        spawn_heartbeat(
            session.engine.clone(),
            Arc::clone(&session.health),
            Duration::from_millis(session.config.timeouts.heartbeat_ms),
            probe_timeout,
            DEFAULT_MAX_FAILURES,
            session.shutdown_tx.subscribe(),
        );

        Ok(session)
    }

    /// Watch for unsolicited host events; a plugin change invalidates the
    /// affected directory entry (the shadow ledger is untouched).
    fn spawn_event_listener(&self) {
        let mut events = self.engine.subscribe_events();
        let mut shutdown = self.shutdown_tx.subscribe();
        let directory = Arc::clone(&self.directory);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    event = events.recv() => match event {
                        Ok(BridgeEvent::Host { name, data }) if name == "plugin_changed" => {
                            match serde_json::from_value::<PluginChangedEvent>(data) {
                                Ok(changed) => {
                                    let address =
                                        PluginAddress::new(changed.index, changed.slot_index);
                                    let dropped =
                                        directory.write().await.invalidate(address);
                                    if dropped {
                                        info!("plugin changed at {address}, directory entry dropped");
                                    }
                                }
                                Err(e) => debug!("unparseable plugin_changed event: {e}"),
                            }
                        }
                        Ok(BridgeEvent::Host { name, .. }) => {
                            debug!("unhandled host event: {name}");
                        }
                        Ok(BridgeEvent::ProtocolError(msg)) => {
                            warn!("protocol fault on inbound traffic: {msg}");
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!("event listener lagged by {n}");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });
    }

    /// Effective deadline: caller > per-command config override > class
    /// default from config.
    fn effective_timeout(&self, command: &HostCommand, caller: Option<Duration>) -> Duration {
        if let Some(timeout) = caller {
            return timeout;
        }
        if let Some(ms) = self.config.timeouts.per_command.get(command.wire_name()) {
            return Duration::from_millis(*ms);
        }
        match command.timeout_class() {
            TimeoutClass::Interactive => {
                Duration::from_millis(self.config.timeouts.interactive_ms)
            }
            TimeoutClass::Discovery => Duration::from_millis(self.config.timeouts.discovery_ms),
        }
    }

    /// Submit one command with contract timeouts applied.
    pub async fn execute(&self, command: HostCommand) -> Result<Value, BridgeError> {
        self.execute_with(command, None, None).await
    }

    /// Submit with an explicit timeout and/or abort signal.
    pub async fn execute_with(
        &self,
        command: HostCommand,
        timeout: Option<Duration>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value, BridgeError> {
        let deadline = self.effective_timeout(&command, timeout);
        match cancel {
            Some(token) => self.engine.execute_with_cancel(&command, deadline, token).await,
            None => self.engine.execute(&command, deadline).await,
        }
    }

    // === Transport ===

    pub async fn transport_start(&self) -> Result<(), BridgeError> {
        self.execute(HostCommand::TransportStart).await.map(|_| ())
    }

    pub async fn transport_stop(&self) -> Result<(), BridgeError> {
        self.execute(HostCommand::TransportStop).await.map(|_| ())
    }

    pub async fn transport_record(&self) -> Result<(), BridgeError> {
        self.execute(HostCommand::TransportRecord).await.map(|_| ())
    }

    pub async fn transport_state(&self) -> Result<TransportState, BridgeError> {
        let result = self.execute(HostCommand::TransportState).await?;
        Ok(parse_result(&result)?)
    }

    // === Read-only inventories (opaque pass-throughs) ===

    pub async fn channels(&self) -> Result<Value, BridgeError> {
        self.execute(HostCommand::StateChannels).await
    }

    pub async fn mixer_state(&self) -> Result<Value, BridgeError> {
        self.execute(HostCommand::StateMixer).await
    }

    pub async fn patterns(&self) -> Result<Value, BridgeError> {
        self.execute(HostCommand::StatePatterns).await
    }

    pub async fn playlist_tracks(&self) -> Result<Value, BridgeError> {
        self.execute(HostCommand::PlaylistGetTracks).await
    }

    // === Patterns ===

    pub async fn pattern_select(&self, index: u32) -> Result<(), BridgeError> {
        self.execute(HostCommand::PatternSelect { index }).await.map(|_| ())
    }

    pub async fn pattern_create(&self) -> Result<(), BridgeError> {
        self.execute(HostCommand::PatternCreate).await.map(|_| ())
    }

    pub async fn pattern_rename(
        &self,
        index: Option<u32>,
        name: impl Into<String>,
    ) -> Result<(), BridgeError> {
        self.execute(HostCommand::PatternRename { index, name: name.into() })
            .await
            .map(|_| ())
    }

    // === Piano roll (note data stays opaque) ===

    pub async fn add_notes(
        &self,
        notes: Vec<Value>,
        channel: Option<u32>,
        clear_first: bool,
    ) -> Result<(), BridgeError> {
        self.execute(HostCommand::PianorollAddNotes {
            notes,
            channel,
            clear_first: clear_first.then_some(true),
        })
        .await
        .map(|_| ())
    }

    pub async fn clear_notes(&self, channel: Option<u32>) -> Result<(), BridgeError> {
        self.execute(HostCommand::PianorollClearNotes { channel })
            .await
            .map(|_| ())
    }

    // === Plugin parameters ===

    /// Run discovery for one plugin address, refresh the directory entry
    /// and seed the shadow ledger (never demoting user writes).
    pub async fn discover_plugin(
        &self,
        address: PluginAddress,
    ) -> Result<PluginInventory, BridgeError> {
        let result = self
            .execute(HostCommand::PluginsDiscover {
                index: Some(address.index),
                slot_index: address.slot,
            })
            .await?;
        let inventory: PluginInventory = parse_result(&result)?;

        let entry_params = {
            let mut directory = self.directory.write().await;
            directory
                .populate(address, inventory.plugin_name.clone(), inventory.parameters.clone())
                .parameters()
                .to_vec()
        };
        self.shadow
            .write()
            .await
            .seed_discovered(address, &entry_params);

        Ok(inventory)
    }

    /// Resolve a symbolic parameter name, discovering lazily.
    ///
    /// On a miss the directory is (re)discovered exactly once and the
    /// lookup retried; a second miss is [`BridgeError::ParameterNotFound`].
    pub async fn resolve_param(
        &self,
        address: PluginAddress,
        query: &str,
    ) -> Result<ParameterRecord, BridgeError> {
        {
            let directory = self.directory.read().await;
            if let Some(param) = directory.resolve(address, query) {
                return Ok(param.clone());
            }
        }

        debug!("resolution miss for {query:?} at {address}, running discovery");
        self.discover_plugin(address).await?;

        let directory = self.directory.read().await;
        directory
            .resolve(address, query)
            .cloned()
            .ok_or_else(|| BridgeError::ParameterNotFound {
                address,
                query: query.to_string(),
            })
    }

    /// Write a parameter by symbolic name. Values are absolute in `[0, 1]`
    /// (clamped); a successful write lands in the shadow ledger as the
    /// authority for "what we last wrote".
    pub async fn set_param(
        &self,
        address: PluginAddress,
        query: &str,
        value: f64,
    ) -> Result<SetParamAck, BridgeError> {
        let param = self.resolve_param(address, query).await?;
        let value = value.clamp(0.0, 1.0);

        let result = self
            .execute(HostCommand::PluginsSetParam {
                index: address.index,
                slot_index: address.slot,
                param_index: param.index,
                value,
            })
            .await?;

        self.shadow
            .write()
            .await
            .record_write(address, param.index, value);

        Ok(parse_result(&result)?)
    }

    /// Read a parameter by symbolic name, pairing the (possibly lying)
    /// host value with the shadow ledger.
    pub async fn get_param(
        &self,
        address: PluginAddress,
        query: &str,
    ) -> Result<ParamReading, BridgeError> {
        let param = self.resolve_param(address, query).await?;

        let result = self
            .execute(HostCommand::PluginsGetParam {
                index: address.index,
                slot_index: address.slot,
                param_index: param.index,
            })
            .await?;
        let live: ParamValue = parse_result(&result)?;

        let shadow = self.shadow.read().await;
        let shadow_value = shadow.get(address, param.index).map(|e| e.value);
        let diverged = shadow
            .diverges(address, param.index, live.value)
            .unwrap_or(false);

        Ok(ParamReading {
            value: live.value,
            value_string: live.value_string,
            shadow: shadow_value,
            diverged,
        })
    }

    pub async fn next_preset(&self, address: PluginAddress) -> Result<PresetInfo, BridgeError> {
        let result = self
            .execute(HostCommand::PluginsNextPreset {
                index: Some(address.index),
                slot_index: address.slot,
            })
            .await?;
        Ok(parse_result(&result)?)
    }

    pub async fn prev_preset(&self, address: PluginAddress) -> Result<PresetInfo, BridgeError> {
        let result = self
            .execute(HostCommand::PluginsPrevPreset {
                index: Some(address.index),
                slot_index: address.slot,
            })
            .await?;
        Ok(parse_result(&result)?)
    }

    // === Mixer writes ===

    pub async fn set_mixer_volume(&self, track: u32, value: f64) -> Result<(), BridgeError> {
        self.execute(HostCommand::MixerSetVolume { track, value: value.clamp(0.0, 1.0) })
            .await
            .map(|_| ())
    }

    pub async fn set_mixer_pan(&self, track: u32, value: f64) -> Result<(), BridgeError> {
        self.execute(HostCommand::MixerSetPan { track, value: value.clamp(0.0, 1.0) })
            .await
            .map(|_| ())
    }

    pub async fn set_mixer_mute(&self, track: u32, mute: bool) -> Result<(), BridgeError> {
        self.execute(HostCommand::MixerSetMute { track, mute }).await.map(|_| ())
    }

    pub async fn set_mixer_solo(&self, track: u32, solo: bool) -> Result<(), BridgeError> {
        self.execute(HostCommand::MixerSetSolo { track, solo }).await.map(|_| ())
    }

    pub async fn set_mixer_name(
        &self,
        track: u32,
        name: impl Into<String>,
    ) -> Result<(), BridgeError> {
        self.execute(HostCommand::MixerSetName { track, name: name.into() })
            .await
            .map(|_| ())
    }

    pub async fn set_mixer_color(&self, track: u32, color: u32) -> Result<(), BridgeError> {
        self.execute(HostCommand::MixerSetColor { track, color }).await.map(|_| ())
    }

    pub async fn set_mixer_routing(
        &self,
        track: u32,
        dest: u32,
        enabled: bool,
    ) -> Result<(), BridgeError> {
        self.execute(HostCommand::MixerSetRouting { track, dest, enabled })
            .await
            .map(|_| ())
    }

    pub async fn set_mixer_send(
        &self,
        track: u32,
        dest: u32,
        level: f64,
    ) -> Result<(), BridgeError> {
        self.execute(HostCommand::MixerSetSend { track, dest, level: level.clamp(0.0, 1.0) })
            .await
            .map(|_| ())
    }

    pub async fn set_mixer_eq(
        &self,
        track: u32,
        band: u32,
        gain: f64,
        frequency: Option<f64>,
        bandwidth: Option<f64>,
    ) -> Result<(), BridgeError> {
        self.execute(HostCommand::MixerSetEq { track, band, gain, frequency, bandwidth })
            .await
            .map(|_| ())
    }

    // === Playlist ===

    pub async fn playlist_mute_track(&self, track: u32, mute: bool) -> Result<(), BridgeError> {
        self.execute(HostCommand::PlaylistMuteTrack { track, mute })
            .await
            .map(|_| ())
    }

    pub async fn playlist_solo_track(&self, track: u32, solo: bool) -> Result<(), BridgeError> {
        self.execute(HostCommand::PlaylistSoloTrack { track, solo })
            .await
            .map(|_| ())
    }

    pub async fn playlist_set_track_name(
        &self,
        track: u32,
        name: impl Into<String>,
    ) -> Result<(), BridgeError> {
        self.execute(HostCommand::PlaylistSetTrackName { track, name: name.into() })
            .await
            .map(|_| ())
    }

    pub async fn playlist_set_track_color(
        &self,
        track: u32,
        color: u32,
    ) -> Result<(), BridgeError> {
        self.execute(HostCommand::PlaylistSetTrackColor { track, color })
            .await
            .map(|_| ())
    }

    // === Project ===

    pub async fn get_tempo(&self) -> Result<f64, BridgeError> {
        let result = self.execute(HostCommand::ProjectGetTempo).await?;
        let tempo: TempoInfo = parse_result(&result)?;
        Ok(tempo.bpm)
    }

    /// Tempo write; routed by the executor through the host's generic
    /// control-event pathway at [`flproto::TEMPO_EVENT_ID`].
    pub async fn set_tempo(&self, bpm: f64) -> Result<(), BridgeError> {
        self.execute(HostCommand::ProjectSetTempo { bpm }).await.map(|_| ())
    }

    pub async fn get_position(&self) -> Result<PositionInfo, BridgeError> {
        let result = self.execute(HostCommand::ProjectGetPosition).await?;
        Ok(parse_result(&result)?)
    }

    pub async fn set_position(&self, target: SeekTarget) -> Result<(), BridgeError> {
        self.execute(target.into_command()).await.map(|_| ())
    }

    // === Renders ===

    fn watcher(&self) -> Result<&RenderWatcher, BridgeError> {
        self.render
            .as_ref()
            .ok_or_else(|| BridgeError::RenderWatch("no render directory configured".to_string()))
    }

    /// Actively wait for the next render to stabilise.
    pub async fn await_render(
        &self,
        timeout: Option<Duration>,
    ) -> Result<AwaitOutcome, BridgeError> {
        let timeout = timeout
            .unwrap_or_else(|| Duration::from_millis(self.config.render.await_timeout_ms));
        Ok(self.watcher()?.await_render(timeout).await)
    }

    /// Register a render that existed before watching began.
    pub async fn resolve_render(
        &self,
        file_name: &str,
    ) -> Result<Option<RenderArtifact>, BridgeError> {
        Ok(self.watcher()?.resolve_existing(file_name).await)
    }

    /// Every artifact registered this session.
    pub async fn renders(&self) -> Vec<RenderArtifact> {
        match &self.render {
            Some(watcher) => watcher.registry().all().await,
            None => Vec::new(),
        }
    }

    pub async fn latest_render(&self) -> Option<RenderArtifact> {
        match &self.render {
            Some(watcher) => watcher.registry().latest().await,
            None => None,
        }
    }

    // === Introspection ===

    pub fn health(&self) -> &HealthTracker {
        &self.health
    }

    pub fn client_id(&self) -> u8 {
        self.engine.client_id()
    }

    /// Read-only view of the parameter directory.
    pub async fn directory(&self) -> tokio::sync::RwLockReadGuard<'_, ParameterDirectory> {
        self.directory.read().await
    }

    /// Read-only view of the shadow ledger.
    pub async fn shadow(&self) -> tokio::sync::RwLockReadGuard<'_, ShadowStore> {
        self.shadow.read().await
    }

    /// Tear the session down: fail outstanding requests with
    /// `TransportLost`, stop the heartbeat and watcher, close endpoints
    /// and clear every cache. This is adapter shutdown - unlike transport
    /// loss, nothing survives it.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(());
        self.engine.shutdown().await;
        if let Some(listener) = self._listener.as_mut() {
            listener.close();
        }
        if let Some(watcher) = &self.render {
            watcher.shutdown().await;
        }
        self.directory.write().await.invalidate_all();
        self.shadow.write().await.clear();
        info!("bridge session shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seek_target_maps_to_exactly_one_field() {
        let cases = [
            (SeekTarget::Bars(4.0), "bars"),
            (SeekTarget::Ticks(960), "ticks"),
            (SeekTarget::Ms(1500), "ms"),
            (SeekTarget::Seconds(2.5), "seconds"),
        ];
        for (target, field) in cases {
            let record = target.into_command().to_record(1).unwrap();
            let flproto::WireRecord::Command { params, .. } = record else {
                panic!("expected command record");
            };
            let object = params.as_object().unwrap();
            assert_eq!(object.len(), 1, "{field} should be the only key");
            assert!(object.contains_key(field));
        }
    }
}
