//! Net roster
//!
//! Read-mostly view of the nets configured by external admin tooling. The
//! core never writes records back; it only accepts pushes and replacements.

use dashmap::DashMap;

use crate::protocol::{NetId, VoiceNet};

#[derive(Default)]
pub struct NetRoster {
    nets: DashMap<NetId, VoiceNet>,
}

impl NetRoster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_nets(nets: impl IntoIterator<Item = VoiceNet>) -> Self {
        let roster = Self::new();
        for net in nets {
            roster.upsert(net);
        }
        roster
    }

    /// Insert or replace a net, returning the previous record
    pub fn upsert(&self, net: VoiceNet) -> Option<VoiceNet> {
        tracing::debug!("Roster upsert {} ({})", net.code, net.discipline);
        self.nets.insert(net.code.clone(), net)
    }

    pub fn remove(&self, code: &NetId) -> Option<VoiceNet> {
        self.nets.remove(code).map(|(_, net)| net)
    }

    /// Swap in a whole new roster, returning the codes that disappeared
    pub fn replace_all(&self, nets: Vec<VoiceNet>) -> Vec<NetId> {
        let incoming: std::collections::HashSet<NetId> =
            nets.iter().map(|n| n.code.clone()).collect();
        let removed: Vec<NetId> = self
            .nets
            .iter()
            .filter(|entry| !incoming.contains(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();

        for code in &removed {
            self.nets.remove(code);
        }
        for net in nets {
            self.nets.insert(net.code.clone(), net);
        }
        removed
    }

    /// Snapshot of one record
    pub fn get(&self, code: &NetId) -> Option<VoiceNet> {
        self.nets.get(code).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, code: &NetId) -> bool {
        self.nets.contains_key(code)
    }

    pub fn len(&self) -> usize {
        self.nets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nets.is_empty()
    }

    /// All nets, highest priority first, then by code
    pub fn list(&self) -> Vec<VoiceNet> {
        let mut nets: Vec<VoiceNet> = self.nets.iter().map(|e| e.value().clone()).collect();
        nets.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.code.cmp(&b.code)));
        nets
    }
}
