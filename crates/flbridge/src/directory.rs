//! Parameter directory: discovery cache and symbolic name resolution.
//!
//! The host reports a fixed-size parameter table (thousands of slots) for
//! every plugin; only a minority of slots carry meaningful names, numeric
//! indices drift across plugin versions, and the same human concept is
//! phrased differently across plugins. Nothing user-facing ever handles a
//! numeric index: every lookup flows through `(address, name)` with
//! alias -> exact -> prefix -> substring tiers, which localises version
//! drift to this one layer.
//!
//! The directory is a pure lookup structure. Issuing discovery commands and
//! the retry-after-discovery step live in the session facade, which owns
//! the only await point.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use flproto::response::DiscoveredParameter;

/// Generator position on a channel, as opposed to an effect slot.
pub const GENERATOR_SLOT: i32 = -1;

/// Identifies a plugin instance in the current host session.
///
/// `slot == GENERATOR_SLOT` is the generator position on the owner;
/// non-negative slots are effect positions. Addresses are not stable across
/// host sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PluginAddress {
    pub index: u32,
    pub slot: i32,
}

impl PluginAddress {
    pub fn new(index: u32, slot: i32) -> Self {
        Self { index, slot }
    }

    /// The generator plugin on a channel.
    pub fn generator(index: u32) -> Self {
        Self::new(index, GENERATOR_SLOT)
    }
}

impl fmt::Display for PluginAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.slot == GENERATOR_SLOT {
            write!(f, "channel {} generator", self.index)
        } else {
            write!(f, "channel {} slot {}", self.index, self.slot)
        }
    }
}

/// One named parameter as reported at discovery time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterRecord {
    pub index: u32,
    /// Display name as reported; never blank after the populate filter.
    pub name: String,
    /// Normalised value at discovery time, not a live read.
    pub value: f64,
}

/// Cached discovery result for one plugin address.
#[derive(Debug, Clone)]
pub struct DirectoryEntry {
    pub address: PluginAddress,
    pub plugin_name: String,
    /// Parameters in the host's reported order; never reordered.
    parameters: Vec<ParameterRecord>,
    /// Lowercase-trimmed name -> position in `parameters`. First occurrence
    /// wins for case-insensitive duplicates.
    by_name: HashMap<String, usize>,
    pub discovered_at: DateTime<Utc>,
}

impl DirectoryEntry {
    /// Parameters in stored (host) order.
    pub fn parameters(&self) -> &[ParameterRecord] {
        &self.parameters
    }
}

/// Lowercase-trimmed lookup key.
fn key(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Owns every cached discovery result plus the semantic alias table.
///
/// Consumers get read-only views; only the owning session mutates.
#[derive(Debug, Default)]
pub struct ParameterDirectory {
    entries: HashMap<PluginAddress, DirectoryEntry>,
    /// Alias -> canonical query name, both sides matched case-insensitively.
    aliases: HashMap<String, String>,
}

impl ParameterDirectory {
    pub fn new(aliases: HashMap<String, String>) -> Self {
        let aliases = aliases
            .into_iter()
            .map(|(alias, canonical)| (key(&alias), canonical))
            .collect();
        Self {
            entries: HashMap::new(),
            aliases,
        }
    }

    /// Store a discovery result, replacing any previous entry.
    ///
    /// Blank or whitespace-only names are filtered here and never surfaced,
    /// whatever the executor sent. Reported order is preserved; it is the
    /// tie-break for every fuzzy match.
    pub fn populate(
        &mut self,
        address: PluginAddress,
        plugin_name: impl Into<String>,
        reported: Vec<DiscoveredParameter>,
    ) -> &DirectoryEntry {
        let parameters: Vec<ParameterRecord> = reported
            .into_iter()
            .filter(|p| !p.name.trim().is_empty())
            .map(|p| ParameterRecord {
                index: p.index,
                name: p.name,
                value: p.value,
            })
            .collect();

        let mut by_name = HashMap::with_capacity(parameters.len());
        for (pos, param) in parameters.iter().enumerate() {
            by_name.entry(key(&param.name)).or_insert(pos);
        }

        let plugin_name = plugin_name.into();
        debug!(
            "directory: {} at {} with {} named parameters",
            plugin_name,
            address,
            parameters.len()
        );

        let entry = DirectoryEntry {
            address,
            plugin_name,
            parameters,
            by_name,
            discovered_at: Utc::now(),
        };
        match self.entries.entry(address) {
            std::collections::hash_map::Entry::Occupied(mut slot) => {
                slot.insert(entry);
                slot.into_mut()
            }
            std::collections::hash_map::Entry::Vacant(slot) => slot.insert(entry),
        }
    }

    /// Whether an address has a cached entry.
    pub fn contains(&self, address: PluginAddress) -> bool {
        self.entries.contains_key(&address)
    }

    /// Read-only view of a cached entry.
    pub fn entry(&self, address: PluginAddress) -> Option<&DirectoryEntry> {
        self.entries.get(&address)
    }

    /// Resolve a symbolic name against a cached entry.
    ///
    /// Tiers, first hit wins: alias substitution, exact match, prefix match
    /// in either direction, substring match in either direction. Fuzzy
    /// tiers scan in stored order so ties are deterministic. Returns `None`
    /// when the address is undiscovered or nothing matches; triggering
    /// discovery and retrying is the caller's job.
    pub fn resolve(&self, address: PluginAddress, query: &str) -> Option<&ParameterRecord> {
        let entry = self.entries.get(&address)?;

        let mut needle = key(query);
        if let Some(canonical) = self.aliases.get(&needle) {
            needle = key(canonical);
        }

        if let Some(&pos) = entry.by_name.get(&needle) {
            return entry.parameters.get(pos);
        }

        if let Some(param) = entry.parameters.iter().find(|p| {
            let stored = key(&p.name);
            stored.starts_with(&needle) || needle.starts_with(&stored)
        }) {
            return Some(param);
        }

        entry.parameters.iter().find(|p| {
            let stored = key(&p.name);
            stored.contains(&needle) || needle.contains(&stored)
        })
    }

    /// Drop one cached entry (e.g. on a plugin-change event). Idempotent.
    pub fn invalidate(&mut self, address: PluginAddress) -> bool {
        self.entries.remove(&address).is_some()
    }

    /// Drop everything.
    pub fn invalidate_all(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
