//! Shadow store: the ledger of last-written parameter values.
//!
//! The host's parameter read API returns stale or wrong values for some
//! plugins, so the bridge never trusts reads for its own bookkeeping. Every
//! write that succeeds through the engine lands here as the authority for
//! "what we last wrote". Discovery may seed values for parameters we never
//! touched, but a user-sourced entry is never demoted or overwritten by
//! discovery.
//!
//! Writes are absolute values in `[0, 1]` by contract; the store tracks the
//! ledger, not the host's current schema, so entries outlive directory
//! invalidation.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::directory::{ParameterRecord, PluginAddress};

/// Tolerance under which a live read and the shadow value count as equal.
pub const DIVERGENCE_TOLERANCE: f64 = 1e-3;

/// Where a shadow value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShadowSource {
    /// Written through the engine by a caller.
    User,
    /// Seeded from a discovery dump.
    Discovered,
}

/// Last known value for one parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShadowEntry {
    pub value: f64,
    pub written_at: DateTime<Utc>,
    pub source: ShadowSource,
}

/// In-process cache of last-written values, keyed by plugin address and
/// parameter index. Owned by the session; consumers read.
#[derive(Debug, Default)]
pub struct ShadowStore {
    entries: HashMap<(PluginAddress, u32), ShadowEntry>,
}

impl ShadowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful write. Always stamps `source = User`.
    pub fn record_write(&mut self, address: PluginAddress, param_index: u32, value: f64) {
        self.entries.insert(
            (address, param_index),
            ShadowEntry {
                value,
                written_at: Utc::now(),
                source: ShadowSource::User,
            },
        );
    }

    /// Seed values from a discovery dump.
    ///
    /// Only fills slots without a user-sourced entry; a user write is never
    /// overwritten by what the (unreliable) host reported.
    pub fn seed_discovered(&mut self, address: PluginAddress, parameters: &[ParameterRecord]) {
        for param in parameters {
            let slot = self.entries.entry((address, param.index));
            match slot {
                std::collections::hash_map::Entry::Occupied(mut occupied) => {
                    if occupied.get().source == ShadowSource::Discovered {
                        occupied.insert(ShadowEntry {
                            value: param.value,
                            written_at: Utc::now(),
                            source: ShadowSource::Discovered,
                        });
                    }
                }
                std::collections::hash_map::Entry::Vacant(vacant) => {
                    vacant.insert(ShadowEntry {
                        value: param.value,
                        written_at: Utc::now(),
                        source: ShadowSource::Discovered,
                    });
                }
            }
        }
    }

    /// Last known value for a parameter, if any.
    pub fn get(&self, address: PluginAddress, param_index: u32) -> Option<&ShadowEntry> {
        self.entries.get(&(address, param_index))
    }

    /// Whether a live read disagrees with the shadow beyond tolerance.
    ///
    /// `None` when no shadow entry exists. A `true` answer means "external
    /// change or reporting lag"; the store never reconciles.
    pub fn diverges(&self, address: PluginAddress, param_index: u32, live: f64) -> Option<bool> {
        self.get(address, param_index)
            .map(|entry| (entry.value - live).abs() > DIVERGENCE_TOLERANCE)
    }

    /// Cleared only at adapter shutdown, never on transport loss.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
