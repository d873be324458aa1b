//! Per-exit-IP rate accounting
//!
//! The store keeps an append-only series of action timestamps per (exit IP,
//! action) pair and answers rolling-window availability queries against the
//! registered limits. It is owned by the coordinator; multiple circuits can
//! transit the same exit IP, and one circuit's exit IP changes over time, so
//! the store is keyed by IP rather than by circuit.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::circuit::now_ms;
use crate::error::{GiroError, Result};

/// Rolling window applied to actions registered without one (24 h)
pub const DEFAULT_WINDOW_MS: i64 = 86_400_000;

/// Key used when an action is reported while no exit IP is known
pub const UNATTRIBUTED_IP: &str = "unknown";

/// Registered limit for a named action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionLimit {
    /// Max actions per window
    pub limit: usize,
    /// Rolling window length in milliseconds
    pub window_ms: i64,
}

type UsageMap = HashMap<String, HashMap<String, Vec<i64>>>;

/// Per-IP, per-action rolling-window rate store
#[derive(Debug)]
pub struct RateStore {
    actions: HashMap<String, ActionLimit>,
    usage: UsageMap,
    blacklist: HashSet<String>,
    compact_threshold: usize,
}

impl RateStore {
    pub fn new(compact_threshold: usize, blacklist: impl IntoIterator<Item = String>) -> Self {
        Self {
            actions: HashMap::new(),
            usage: HashMap::new(),
            blacklist: blacklist.into_iter().collect(),
            compact_threshold,
        }
    }

    /// Register (or overwrite) a named action limit
    pub fn register_action(&mut self, name: &str, limit: usize, window_ms: Option<i64>) {
        let window_ms = window_ms.unwrap_or(DEFAULT_WINDOW_MS);
        self.actions
            .insert(name.to_string(), ActionLimit { limit, window_ms });
    }

    pub fn action(&self, name: &str) -> Option<ActionLimit> {
        self.actions.get(name).copied()
    }

    pub fn action_names(&self) -> Vec<String> {
        self.actions.keys().cloned().collect()
    }

    pub fn is_blacklisted(&self, ip: &str) -> bool {
        self.blacklist.contains(ip)
    }

    pub fn blacklist_ip(&mut self, ip: &str) {
        self.blacklist.insert(ip.to_string());
    }

    /// Number of IPs currently tracked
    pub fn tracked_ips(&self) -> usize {
        self.usage.len()
    }

    /// Create the entry for an IP, keyed with every registered action
    pub fn ensure_ip(&mut self, ip: &str) {
        let series = self.usage.entry(ip.to_string()).or_default();
        for action in self.actions.keys() {
            series.entry(action.clone()).or_default();
        }
    }

    /// Append a timestamp for (ip, action), creating entries as needed
    pub fn record_action(&mut self, ip: &str, action: &str) -> Result<()> {
        self.record_action_at(ip, action, now_ms())
    }

    pub(crate) fn record_action_at(&mut self, ip: &str, action: &str, at_ms: i64) -> Result<()> {
        if !self.actions.contains_key(action) {
            return Err(GiroError::UnknownAction {
                name: action.to_string(),
            });
        }
        self.ensure_ip(ip);
        self.usage
            .get_mut(ip)
            .and_then(|series| series.get_mut(action))
            .map(|timestamps| timestamps.push(at_ms));
        Ok(())
    }

    /// Whether (ip, action) is still under its limit
    ///
    /// Unknown IPs are fresh and always available; blacklisted IPs are
    /// exhausted regardless of counts.
    pub fn is_available(&mut self, ip: &str, action: &str) -> Result<bool> {
        let limit = self.actions.get(action).copied().ok_or_else(|| {
            GiroError::UnknownAction {
                name: action.to_string(),
            }
        })?;

        if self.is_blacklisted(ip) {
            debug!(ip, "blacklisted exit IP treated as exhausted");
            return Ok(false);
        }
        if !self.usage.contains_key(ip) {
            return Ok(true);
        }

        self.preen(ip);
        let used = self
            .usage
            .get(ip)
            .and_then(|series| series.get(action))
            .map(|timestamps| timestamps.len())
            .unwrap_or(0);
        Ok(used < limit.limit)
    }

    /// Drop leading timestamps that have aged out of their action's window
    pub fn preen(&mut self, ip: &str) {
        self.preen_at(ip, now_ms());
    }

    pub(crate) fn preen_at(&mut self, ip: &str, now: i64) {
        let Some(series) = self.usage.get_mut(ip) else {
            return;
        };
        for (action, limit) in &self.actions {
            if let Some(timestamps) = series.get_mut(action) {
                // Strict comparison: an entry exactly at the window edge survives.
                let cutoff = timestamps
                    .iter()
                    .position(|&t| (now - t) <= limit.window_ms)
                    .unwrap_or(timestamps.len());
                timestamps.drain(..cutoff);
            }
        }
    }

    /// Preen everything and evict idle IPs once the store grows past the
    /// configured threshold. IPs currently presented by a live circuit are
    /// kept even when empty.
    pub fn compact(&mut self, live_ips: &HashSet<String>) {
        if self.usage.len() <= self.compact_threshold {
            return;
        }

        let ips: Vec<String> = self.usage.keys().cloned().collect();
        for ip in &ips {
            self.preen(ip);
        }
        let before = self.usage.len();
        self.usage.retain(|ip, series| {
            live_ips.contains(ip) || series.values().any(|timestamps| !timestamps.is_empty())
        });
        debug!(
            evicted = before - self.usage.len(),
            tracked = self.usage.len(),
            "compacted rate cache"
        );
    }

    /// Copy the timestamps recorded after `since_ms` from one IP's series to
    /// another's. Entries are copied, not moved: across the race window the
    /// action may have landed on either exit, so both are charged.
    pub fn copy_ambiguous(&mut self, from_ip: &str, to_ip: &str, since_ms: i64) {
        if from_ip == to_ip {
            return;
        }
        self.ensure_ip(to_ip);
        for action in self.action_names() {
            let ambiguous: Vec<i64> = self
                .usage
                .get(from_ip)
                .and_then(|series| series.get(&action))
                .map(|timestamps| {
                    timestamps
                        .iter()
                        .copied()
                        .filter(|&t| t > since_ms)
                        .collect()
                })
                .unwrap_or_default();
            if ambiguous.is_empty() {
                continue;
            }
            if let Some(timestamps) = self
                .usage
                .get_mut(to_ip)
                .and_then(|series| series.get_mut(&action))
            {
                timestamps.extend(ambiguous);
                timestamps.sort_unstable();
            }
        }
    }

    /// Serialize the usage map: `{ "<ip>": { "<action>": [ms, ...] } }`
    pub fn serialize(&self) -> Result<String> {
        serde_json::to_string(&self.usage)
            .map_err(|e| GiroError::Persistence(format!("failed to serialize rate cache: {}", e)))
    }

    /// Load a previously serialized usage map, replacing the current one.
    /// Unreadable input leaves the store empty.
    pub fn load(&mut self, json: &str) {
        match serde_json::from_str::<UsageMap>(json) {
            Ok(usage) => {
                debug!(tracked = usage.len(), "loaded rate cache");
                self.usage = usage;
            }
            Err(e) => {
                warn!("unreadable rate cache, starting empty: {}", e);
                self.usage = UsageMap::new();
            }
        }
    }

    /// Load the usage map from a file; an absent file yields an empty store
    pub fn load_from_path(&mut self, path: &Path) {
        match std::fs::read_to_string(path) {
            Ok(json) => self.load(&json),
            Err(_) => debug!(path = %path.display(), "no rate cache on disk, starting empty"),
        }
    }

    #[cfg(test)]
    pub(crate) fn series_len(&self, ip: &str, action: &str) -> usize {
        self.usage
            .get(ip)
            .and_then(|series| series.get(action))
            .map(|timestamps| timestamps.len())
            .unwrap_or(0)
    }

    #[cfg(test)]
    pub(crate) fn series(&self, ip: &str, action: &str) -> Vec<i64> {
        self.usage
            .get(ip)
            .and_then(|series| series.get(action))
            .cloned()
            .unwrap_or_default()
    }
}
