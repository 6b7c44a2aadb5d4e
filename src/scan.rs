// Peripheral discovery model
//
// Scans are unfiltered at the adapter level: CoreBluetooth does not reliably
// match 128-bit UUIDs carried in scan response data, so matching happens on
// the application side against whatever each advertisement exposes.

use std::collections::HashSet;
use uuid::Uuid;

/// A peripheral seen during the current scan window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPeripheral {
    /// Platform-assigned handle, stable for the lifetime of the adapter.
    pub id: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub services: Vec<Uuid>,
}

impl DiscoveredPeripheral {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// How a peripheral is recognised as provisionable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchRule {
    /// Advertised service list (or service data) contains this UUID.
    Service(Uuid),
    /// Advertised local name equals this exactly.
    Name(String),
}

impl MatchRule {
    pub fn matches(&self, peripheral: &DiscoveredPeripheral) -> bool {
        match self {
            MatchRule::Service(uuid) => peripheral.services.contains(uuid),
            MatchRule::Name(name) => peripheral.name.as_deref() == Some(name.as_str()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    /// Stop at the first match and connect to it.
    FirstMatch,
    /// Accumulate every match until the window closes.
    Collect,
}

/// Accumulates matches across polls of the adapter's peripheral list.
#[derive(Debug)]
pub struct ScanCollector {
    rule: MatchRule,
    mode: ScanMode,
    seen_ids: HashSet<String>,
    matches: Vec<DiscoveredPeripheral>,
}

impl ScanCollector {
    pub fn new(rule: MatchRule, mode: ScanMode) -> Self {
        Self {
            rule,
            mode,
            seen_ids: HashSet::new(),
            matches: Vec::new(),
        }
    }

    /// Offer one observed peripheral. Returns true if it was a new match.
    pub fn offer(&mut self, peripheral: DiscoveredPeripheral) -> bool {
        if self.is_done() || self.seen_ids.contains(&peripheral.id) {
            return false;
        }
        if !self.rule.matches(&peripheral) {
            return false;
        }
        self.seen_ids.insert(peripheral.id.clone());
        self.matches.push(peripheral);
        true
    }

    /// True once a single-target scan has its target.
    pub fn is_done(&self) -> bool {
        self.mode == ScanMode::FirstMatch && !self.matches.is_empty()
    }

    /// Matches, strongest signal first (unknown RSSI last).
    pub fn finish(mut self) -> Vec<DiscoveredPeripheral> {
        self.matches
            .sort_by_key(|p| std::cmp::Reverse(p.rssi.unwrap_or(i16::MIN)));
        self.matches
    }
}
