//! Per-net floor state shared by the discipline policy, the PTT controller
//! and the priority arbiter.

use dashmap::{DashMap, DashSet};
use std::collections::HashSet;

use crate::protocol::{NetId, PriorityOverride};

#[derive(Default)]
pub struct FloorState {
    /// Nets whose PTT control is currently held by the local user
    ptt_held: DashSet<NetId>,
    /// Speaking tokens granted by the administrative grantor, per net
    tokens: DashMap<NetId, HashSet<String>>,
    /// At most one active override per net
    overrides: DashMap<NetId, PriorityOverride>,
}

impl FloorState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ptt_held(&self, net: &NetId, held: bool) {
        if held {
            self.ptt_held.insert(net.clone());
        } else {
            self.ptt_held.remove(net);
        }
    }

    pub fn is_ptt_held(&self, net: &NetId) -> bool {
        self.ptt_held.contains(net)
    }

    pub fn grant_token(&self, net: &NetId, user_id: &str) {
        self.tokens
            .entry(net.clone())
            .or_default()
            .insert(user_id.to_string());
    }

    /// Returns true if the user held a token
    pub fn revoke_token(&self, net: &NetId, user_id: &str) -> bool {
        let removed = self
            .tokens
            .get_mut(net)
            .map_or(false, |mut holders| holders.remove(user_id));
        self.tokens.remove_if(net, |_, holders| holders.is_empty());
        removed
    }

    pub fn holds_token(&self, net: &NetId, user_id: &str) -> bool {
        self.tokens
            .get(net)
            .map_or(false, |holders| holders.contains(user_id))
    }

    /// Install an override, replacing any previous one on the same net
    pub fn set_override(&self, issued: PriorityOverride) -> Option<PriorityOverride> {
        self.overrides.insert(issued.issued_by_net_id.clone(), issued)
    }

    pub fn active_override(&self, net: &NetId) -> Option<PriorityOverride> {
        self.overrides.get(net).map(|entry| entry.value().clone())
    }

    pub fn clear_override(&self, net: &NetId) -> Option<PriorityOverride> {
        self.overrides.remove(net).map(|(_, issued)| issued)
    }

    /// Nets with an override issued by `user_id`
    pub fn overrides_issued_by(&self, user_id: &str) -> Vec<NetId> {
        self.overrides
            .iter()
            .filter(|entry| entry.value().issued_by_user_id == user_id)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Forget everything about a net that left the roster
    pub fn clear_net(&self, net: &NetId) {
        self.ptt_held.remove(net);
        self.tokens.remove(net);
        self.overrides.remove(net);
    }
}
