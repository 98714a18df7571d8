//! Render detection: observation, not control.
//!
//! The host has no programmatic audio-export API; the user triggers the
//! export by hand. This module turns the resulting file into an
//! asynchronous event: a watcher notices candidates appearing in the
//! configured directory, a poller waits until a candidate's size has been
//! stable for the configured threshold, and only then is the artifact
//! registered and broadcast. Files still being written are never emitted.
//!
//! Files already present when watching begins are snapshotted and not
//! re-emitted; [`RenderWatcher::resolve_existing`] registers those on
//! demand. The session registry is append-only and queryable by filename
//! (case-insensitive), by latest, or in full. Several artifacts landing in
//! the same directory all register; there is no single-file assumption.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::BridgeError;

/// Buffer for candidate paths flowing from the notify thread.
const CANDIDATE_CHANNEL_CAPACITY: usize = 64;

/// Buffer for detected-artifact broadcasts.
const ARTIFACT_CHANNEL_CAPACITY: usize = 32;

/// A finalised audio file observed on disk. Immutable after registration;
/// the core never opens it.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderArtifact {
    pub path: PathBuf,
    pub file_name: String,
    pub detected_at: DateTime<Utc>,
    /// The filename pattern that resolved this artifact, when it was
    /// registered through [`RenderWatcher::resolve_existing`].
    pub source_pattern: Option<String>,
}

/// Outcome of an active render wait.
///
/// `Abandoned` only ends the active wait; passive detection continues and
/// a late artifact still registers.
#[derive(Debug, Clone, PartialEq)]
pub enum AwaitOutcome {
    Detected(RenderArtifact),
    Abandoned,
}

/// Append-only session registry of detected artifacts.
#[derive(Debug, Clone, Default)]
pub struct RenderRegistry {
    inner: Arc<RwLock<Vec<RenderArtifact>>>,
}

impl RenderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    async fn register(&self, artifact: RenderArtifact) {
        self.inner.write().await.push(artifact);
    }

    /// Case-insensitive filename lookup; most recent registration wins.
    pub async fn by_name(&self, file_name: &str) -> Option<RenderArtifact> {
        let wanted = file_name.to_lowercase();
        self.inner
            .read()
            .await
            .iter()
            .rev()
            .find(|a| a.file_name.to_lowercase() == wanted)
            .cloned()
    }

    /// The most recently registered artifact.
    pub async fn latest(&self) -> Option<RenderArtifact> {
        self.inner.read().await.last().cloned()
    }

    /// Every artifact registered this session, in registration order.
    pub async fn all(&self) -> Vec<RenderArtifact> {
        self.inner.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Cleared at session shutdown only.
    pub async fn clear(&self) {
        self.inner.write().await.clear();
    }
}

/// Watcher settings, normally derived from [`flconf::RenderConfig`].
#[derive(Debug, Clone)]
pub struct RenderWatcherConfig {
    pub dir: PathBuf,
    /// Rendered-audio extension, without the dot.
    pub extension: String,
    /// Size must be unchanged this long before an artifact counts.
    pub stability: Duration,
    /// Size polling cadence while a candidate settles.
    pub poll_interval: Duration,
}

impl RenderWatcherConfig {
    pub fn from_config(dir: PathBuf, render: &flconf::RenderConfig) -> Self {
        Self {
            dir,
            extension: render.extension.clone(),
            stability: Duration::from_millis(render.stability_ms),
            poll_interval: Duration::from_millis(render.poll_ms),
        }
    }
}

/// True when the path's final segment carries the rendered-audio extension,
/// compared case-insensitively.
pub fn matches_extension(path: &Path, extension: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(extension))
}

/// Directory watcher plus write-stability debounce.
pub struct RenderWatcher {
    dir: PathBuf,
    extension: String,
    registry: RenderRegistry,
    /// Paths that must not (re-)emit: pre-existing at startup or already
    /// registered.
    seen: Arc<Mutex<HashSet<PathBuf>>>,
    artifacts_tx: broadcast::Sender<RenderArtifact>,
    shutdown: CancellationToken,
    /// Keeps the notify backend alive; dropped on shutdown.
    _watcher: RecommendedWatcher,
}

impl RenderWatcher {
    /// Start watching. Pre-existing matching files are snapshotted so the
    /// watcher never re-emits them.
    pub fn start(config: RenderWatcherConfig) -> Result<Self, BridgeError> {
        let dir = config.dir.clone();
        if !dir.is_dir() {
            return Err(BridgeError::RenderWatch(format!(
                "{} is not a directory",
                dir.display()
            )));
        }

        let mut seen = HashSet::new();
        let entries = std::fs::read_dir(&dir)
            .map_err(|e| BridgeError::RenderWatch(format!("{}: {e}", dir.display())))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if matches_extension(&path, &config.extension) {
                trace!("pre-existing render ignored by watcher: {}", path.display());
                seen.insert(path);
            }
        }
        let seen = Arc::new(Mutex::new(seen));

        let (candidates_tx, candidates_rx) = mpsc::channel(CANDIDATE_CHANNEL_CAPACITY);
        let mut watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
            match result {
                Ok(event) => {
                    for path in event.paths {
                        // Full channel means the tracker is wedged; the
                        // poller would re-spot the file on the next event.
                        let _ = candidates_tx.try_send(path);
                    }
                }
                Err(e) => warn!("render watch error: {e}"),
            }
        })
        .map_err(|e| BridgeError::RenderWatch(e.to_string()))?;

        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| BridgeError::RenderWatch(format!("{}: {e}", dir.display())))?;

        let (artifacts_tx, _) = broadcast::channel(ARTIFACT_CHANNEL_CAPACITY);
        let registry = RenderRegistry::new();
        let shutdown = CancellationToken::new();

        info!(
            "watching {} for *.{} renders (stability {:?})",
            dir.display(),
            config.extension,
            config.stability
        );

        tokio::spawn(track_candidates(
            candidates_rx,
            config.clone(),
            registry.clone(),
            Arc::clone(&seen),
            artifacts_tx.clone(),
            shutdown.clone(),
        ));

        Ok(Self {
            dir,
            extension: config.extension,
            registry,
            seen,
            artifacts_tx,
            shutdown,
            _watcher: watcher,
        })
    }

    /// The session registry.
    pub fn registry(&self) -> &RenderRegistry {
        &self.registry
    }

    /// Subscribe to artifacts as they stabilise.
    pub fn subscribe(&self) -> broadcast::Receiver<RenderArtifact> {
        self.artifacts_tx.subscribe()
    }

    /// Actively wait for the next artifact.
    pub async fn await_render(&self, timeout: Duration) -> AwaitOutcome {
        let mut rx = self.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Ok(artifact)) => return AwaitOutcome::Detected(artifact),
                // Lagged: skip to the registry's view of the world.
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => {
                    if let Some(artifact) = self.registry.latest().await {
                        return AwaitOutcome::Detected(artifact);
                    }
                }
                Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => {
                    return AwaitOutcome::Abandoned;
                }
            }
        }
    }

    /// Register a file that existed before watching began.
    ///
    /// Matching is case-insensitive on the final path segment. Idempotent:
    /// an already-registered artifact is returned as-is.
    pub async fn resolve_existing(&self, file_name: &str) -> Option<RenderArtifact> {
        if let Some(existing) = self.registry.by_name(file_name).await {
            return Some(existing);
        }

        let wanted = file_name.to_lowercase();
        let entries = std::fs::read_dir(&self.dir).ok()?;
        let path = entries
            .flatten()
            .map(|e| e.path())
            .find(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.to_lowercase() == wanted)
            })?;

        if !matches_extension(&path, &self.extension) {
            return None;
        }

        let artifact = RenderArtifact {
            file_name: path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or(file_name)
                .to_string(),
            path: path.clone(),
            detected_at: Utc::now(),
            source_pattern: Some(file_name.to_string()),
        };
        self.seen.lock().await.insert(path);
        self.registry.register(artifact.clone()).await;
        info!("resolved pre-existing render: {}", artifact.file_name);
        Some(artifact)
    }

    /// Stop watching and clear the session registry.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.registry.clear().await;
        self.seen.lock().await.clear();
    }
}

impl Drop for RenderWatcher {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Fan candidate paths out to per-file stability pollers.
async fn track_candidates(
    mut candidates_rx: mpsc::Receiver<PathBuf>,
    config: RenderWatcherConfig,
    registry: RenderRegistry,
    seen: Arc<Mutex<HashSet<PathBuf>>>,
    artifacts_tx: broadcast::Sender<RenderArtifact>,
    shutdown: CancellationToken,
) {
    // Paths with a poller currently attached.
    let in_flight: Arc<Mutex<HashSet<PathBuf>>> = Arc::new(Mutex::new(HashSet::new()));

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            candidate = candidates_rx.recv() => {
                let Some(path) = candidate else { break };
                if !matches_extension(&path, &config.extension) {
                    continue;
                }
                if seen.lock().await.contains(&path) {
                    continue;
                }
                if !in_flight.lock().await.insert(path.clone()) {
                    continue;
                }

                debug!("render candidate: {}", path.display());
                tokio::spawn(poll_until_stable(
                    path,
                    config.clone(),
                    registry.clone(),
                    Arc::clone(&seen),
                    Arc::clone(&in_flight),
                    artifacts_tx.clone(),
                    shutdown.clone(),
                ));
            }
        }
    }
}

/// Poll one candidate until its size has been stable for the threshold,
/// then register and broadcast it. A vanished file simply ends the poll.
async fn poll_until_stable(
    path: PathBuf,
    config: RenderWatcherConfig,
    registry: RenderRegistry,
    seen: Arc<Mutex<HashSet<PathBuf>>>,
    in_flight: Arc<Mutex<HashSet<PathBuf>>>,
    artifacts_tx: broadcast::Sender<RenderArtifact>,
    shutdown: CancellationToken,
) {
    let mut last_size: Option<u64> = None;
    let mut last_change = tokio::time::Instant::now();

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            () = tokio::time::sleep(config.poll_interval) => {}
        }

        match tokio::fs::metadata(&path).await {
            Ok(meta) => {
                let size = meta.len();
                if last_size != Some(size) {
                    last_size = Some(size);
                    last_change = tokio::time::Instant::now();
                } else if last_change.elapsed() >= config.stability {
                    if seen.lock().await.insert(path.clone()) {
                        let artifact = RenderArtifact {
                            file_name: path
                                .file_name()
                                .and_then(|n| n.to_str())
                                .unwrap_or_default()
                                .to_string(),
                            path: path.clone(),
                            detected_at: Utc::now(),
                            source_pattern: None,
                        };
                        info!("render detected: {} ({} bytes)", artifact.file_name, size);
                        registry.register(artifact.clone()).await;
                        let _ = artifacts_tx.send(artifact);
                    }
                    break;
                }
            }
            Err(_) => {
                debug!("render candidate vanished: {}", path.display());
                break;
            }
        }
    }

    in_flight.lock().await.remove(&path);
}
