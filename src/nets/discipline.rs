//! Discipline policy
//!
//! Decides whether an operator may transmit on a net. Nothing is cached; every
//! call reads the net record, the operator and the shared floor state as they
//! are right now.
//!
//! Checks run in this order:
//!
//! ```text
//!   active override?  ──► non-command staff denied
//!   rank gate?        ──► below minRankToTransmit denied
//!   discipline        ──► OPEN / PTT / REQUEST_TO_SPEAK / COMMAND_ONLY
//!                         anything else denied
//! ```

use std::sync::Arc;

use super::floor::FloorState;
use crate::protocol::{DenyReason, Discipline, Operator, VoiceNet};

/// Outcome of a transmit check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransmitDecision {
    Permitted,
    Denied(DenyReason),
}

impl TransmitDecision {
    pub fn is_permitted(&self) -> bool {
        matches!(self, TransmitDecision::Permitted)
    }

    pub fn denied(self) -> Option<DenyReason> {
        match self {
            TransmitDecision::Permitted => None,
            TransmitDecision::Denied(reason) => Some(reason),
        }
    }
}

#[derive(Clone)]
pub struct DisciplinePolicy {
    floor: Arc<FloorState>,
}

impl DisciplinePolicy {
    pub fn new(floor: Arc<FloorState>) -> Self {
        Self { floor }
    }

    pub fn floor(&self) -> &Arc<FloorState> {
        &self.floor
    }

    pub fn can_transmit(&self, user: &Operator, net: &VoiceNet) -> bool {
        self.evaluate(user, net).is_permitted()
    }

    /// Full decision using the live PTT state of the net
    pub fn evaluate(&self, user: &Operator, net: &VoiceNet) -> TransmitDecision {
        let held = self.floor.is_ptt_held(&net.code);
        self.decide(user, net, held)
    }

    /// Decision for selecting `net` as TX bus: PTT nets are judged as if the
    /// key were held, the key itself is checked at press time
    pub fn evaluate_selection(&self, user: &Operator, net: &VoiceNet) -> TransmitDecision {
        self.decide(user, net, true)
    }

    pub fn can_receive(&self, user: &Operator, net: &VoiceNet) -> bool {
        net.min_rank_to_receive
            .map_or(true, |required| user.rank >= required)
    }

    fn decide(&self, user: &Operator, net: &VoiceNet, ptt_held: bool) -> TransmitDecision {
        let is_command = user.is_command_for(&net.code);

        if let Some(issued) = self.floor.active_override(&net.code) {
            if !is_command {
                return TransmitDecision::Denied(DenyReason::PriorityOverride {
                    issued_by_user_id: issued.issued_by_user_id,
                    message: issued.message,
                });
            }
        }

        if let Some(required) = net.min_rank_to_transmit {
            if user.rank < required {
                return TransmitDecision::Denied(DenyReason::RankTooLow {
                    required,
                    actual: user.rank,
                });
            }
        }

        match &net.discipline {
            Discipline::Open => TransmitDecision::Permitted,
            Discipline::PushToTalk if ptt_held => TransmitDecision::Permitted,
            Discipline::PushToTalk => TransmitDecision::Denied(DenyReason::PttNotHeld),
            Discipline::RequestToSpeak => {
                if self.floor.holds_token(&net.code, &user.user_id) {
                    TransmitDecision::Permitted
                } else {
                    TransmitDecision::Denied(DenyReason::NoSpeakingToken)
                }
            }
            Discipline::CommandOnly if is_command => TransmitDecision::Permitted,
            Discipline::CommandOnly => TransmitDecision::Denied(DenyReason::NotCommandStaff),
            Discipline::Unsupported(raw) => {
                TransmitDecision::Denied(DenyReason::UnsupportedDiscipline {
                    discipline: raw.clone(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{NetId, PriorityLevel, PriorityOverride};
    use proptest::prelude::*;

    fn policy() -> DisciplinePolicy {
        DisciplinePolicy::new(Arc::new(FloorState::new()))
    }

    fn user() -> Operator {
        Operator::new("u1", "Raven").with_rank(3)
    }

    #[test]
    fn test_open_always_permits() {
        let net = VoiceNet::new("GENERAL", "General", Discipline::Open);
        assert!(policy().can_transmit(&user(), &net));
    }

    #[test]
    fn test_ptt_requires_held_key() {
        let policy = policy();
        let net = VoiceNet::new("ALPHA", "Alpha", Discipline::PushToTalk);

        assert_eq!(
            policy.evaluate(&user(), &net),
            TransmitDecision::Denied(DenyReason::PttNotHeld)
        );
        assert!(policy.evaluate_selection(&user(), &net).is_permitted());

        policy.floor().set_ptt_held(&net.code, true);
        assert!(policy.can_transmit(&user(), &net));
        policy.floor().set_ptt_held(&net.code, false);
        assert!(!policy.can_transmit(&user(), &net));
    }

    #[test]
    fn test_request_to_speak_checks_token() {
        let policy = policy();
        let net = VoiceNet::new("BRIEF", "Briefing", Discipline::RequestToSpeak);

        assert!(!policy.can_transmit(&user(), &net));
        policy.floor().grant_token(&net.code, "u1");
        assert!(policy.can_transmit(&user(), &net));
        // Holding the key does not stand in for a token
        assert!(!policy.evaluate_selection(&Operator::new("u2", "Hawk"), &net).is_permitted());
    }

    #[test]
    fn test_command_only() {
        let policy = policy();
        let net = VoiceNet::new("COMMAND", "Command", Discipline::CommandOnly);

        assert_eq!(
            policy.evaluate(&user(), &net),
            TransmitDecision::Denied(DenyReason::NotCommandStaff)
        );
        assert!(policy.can_transmit(&user().with_command_net("COMMAND"), &net));

        let mut admiral = Operator::new("u9", "Anchor");
        admiral.fleet_command = true;
        assert!(policy.can_transmit(&admiral, &net));
    }

    #[test]
    fn test_rank_gate_applies_to_open_nets() {
        let net = VoiceNet::new("OPS", "Ops", Discipline::Open).with_min_rank_to_transmit(5);
        assert_eq!(
            policy().evaluate(&user(), &net),
            TransmitDecision::Denied(DenyReason::RankTooLow { required: 5, actual: 3 })
        );
        assert!(policy().can_transmit(&user().with_rank(5), &net));
    }

    #[test]
    fn test_receive_rank_gate() {
        let net = VoiceNet::new("INTEL", "Intel", Discipline::Open).with_min_rank_to_receive(4);
        assert!(!policy().can_receive(&user(), &net));
        assert!(policy().can_receive(&user().with_rank(4), &net));
    }

    #[test]
    fn test_override_denies_non_command() {
        let policy = policy();
        let net = VoiceNet::new("ALPHA", "Alpha", Discipline::Open);
        policy.floor().set_override(PriorityOverride {
            message: "Break break".to_string(),
            priority: PriorityLevel::Normal,
            issued_by_net_id: NetId::from("ALPHA"),
            issued_by_user_id: "cmd".to_string(),
            issued_at: chrono::Utc::now(),
        });

        assert!(matches!(
            policy.evaluate(&user(), &net),
            TransmitDecision::Denied(DenyReason::PriorityOverride { .. })
        ));
        assert!(policy.can_transmit(&user().with_command_net("ALPHA"), &net));
    }

    proptest! {
        #[test]
        fn test_unknown_discipline_fails_closed(
            raw in "[A-Z_]{1,16}",
            rank in 0u8..=255,
            command in any::<bool>(),
            held in any::<bool>(),
            token in any::<bool>(),
        ) {
            let discipline = Discipline::from(raw.as_str());
            prop_assume!(matches!(discipline, Discipline::Unsupported(_)));

            let policy = policy();
            let net = VoiceNet::new("X", "X", discipline);
            let mut user = Operator::new("u1", "Raven").with_rank(rank);
            user.fleet_command = command;
            policy.floor().set_ptt_held(&net.code, held);
            if token {
                policy.floor().grant_token(&net.code, "u1");
            }

            prop_assert!(!policy.can_transmit(&user, &net));
            prop_assert!(!policy.evaluate_selection(&user, &net).is_permitted());
        }
    }
}
