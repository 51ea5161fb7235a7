//! Data model and wire shapes shared by the transport, routing and UI layers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique, human-readable net identity (the net `code`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetId(String);

impl NetId {
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NetId {
    fn from(code: &str) -> Self {
        Self(code.to_string())
    }
}

impl From<String> for NetId {
    fn from(code: String) -> Self {
        Self(code)
    }
}

/// Net category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NetType {
    Command,
    Squad,
    Support,
    #[default]
    General,
}

/// Floor discipline of a net.
///
/// Anything that is not one of the four known modes deserializes into
/// [`Discipline::Unsupported`], which never permits transmission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(from = "String", into = "String")]
pub enum Discipline {
    #[default]
    Open,
    PushToTalk,
    RequestToSpeak,
    CommandOnly,
    Unsupported(String),
}

impl Discipline {
    pub fn as_str(&self) -> &str {
        match self {
            Discipline::Open => "OPEN",
            Discipline::PushToTalk => "PTT",
            Discipline::RequestToSpeak => "REQUEST_TO_SPEAK",
            Discipline::CommandOnly => "COMMAND_ONLY",
            Discipline::Unsupported(raw) => raw,
        }
    }
}

impl From<String> for Discipline {
    fn from(raw: String) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "OPEN" => Discipline::Open,
            "PTT" => Discipline::PushToTalk,
            "REQUEST_TO_SPEAK" => Discipline::RequestToSpeak,
            "COMMAND_ONLY" => Discipline::CommandOnly,
            _ => Discipline::Unsupported(raw),
        }
    }
}

impl From<&str> for Discipline {
    fn from(raw: &str) -> Self {
        Discipline::from(raw.to_string())
    }
}

impl From<Discipline> for String {
    fn from(discipline: Discipline) -> Self {
        discipline.as_str().to_string()
    }
}

impl fmt::Display for Discipline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Highest and lowest net priority (1 is the highest)
pub const NET_PRIORITY_RANGE: std::ops::RangeInclusive<u8> = 1..=5;

/// Voice net configuration, owned by external admin tooling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceNet {
    pub code: NetId,
    pub label: String,
    #[serde(rename = "type", default)]
    pub net_type: NetType,
    #[serde(default)]
    pub discipline: Discipline,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_rank_to_transmit: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_rank_to_receive: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linked_squad_id: Option<String>,
}

fn default_priority() -> u8 {
    3
}

impl VoiceNet {
    pub fn new(code: impl Into<NetId>, label: impl Into<String>, discipline: Discipline) -> Self {
        Self {
            code: code.into(),
            label: label.into(),
            net_type: NetType::General,
            discipline,
            priority: default_priority(),
            min_rank_to_transmit: None,
            min_rank_to_receive: None,
            linked_squad_id: None,
        }
    }

    pub fn with_type(mut self, net_type: NetType) -> Self {
        self.net_type = net_type;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_min_rank_to_transmit(mut self, rank: u8) -> Self {
        self.min_rank_to_transmit = Some(rank);
        self
    }

    pub fn with_min_rank_to_receive(mut self, rank: u8) -> Self {
        self.min_rank_to_receive = Some(rank);
        self
    }

    /// Check that the record is usable by the core
    pub fn validate(&self) -> Result<(), String> {
        if self.code.as_str().trim().is_empty() {
            return Err("net code must not be empty".to_string());
        }
        if !NET_PRIORITY_RANGE.contains(&self.priority) {
            return Err(format!(
                "net {} has priority {} outside {}..={}",
                self.code,
                self.priority,
                NET_PRIORITY_RANGE.start(),
                NET_PRIORITY_RANGE.end()
            ));
        }
        Ok(())
    }
}

/// The local user as seen by the discipline policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Operator {
    pub user_id: String,
    pub callsign: String,
    /// Ordinal rank; higher is more senior
    pub rank: u8,
    pub roles: Vec<String>,
    /// Nets on which this user is assigned as command staff
    pub command_nets: Vec<NetId>,
    /// Command staff on every net
    pub fleet_command: bool,
    pub squad_id: Option<String>,
}

impl Operator {
    pub fn new(user_id: impl Into<String>, callsign: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            callsign: callsign.into(),
            ..Default::default()
        }
    }

    pub fn with_rank(mut self, rank: u8) -> Self {
        self.rank = rank;
        self
    }

    pub fn with_command_net(mut self, net: impl Into<NetId>) -> Self {
        self.command_nets.push(net.into());
        self
    }

    pub fn is_command_for(&self, net: &NetId) -> bool {
        self.fleet_command || self.command_nets.iter().any(|n| n == net)
    }
}

/// A remote or local participant, owned by the transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub user_id: String,
    pub callsign: String,
    pub client_id: String,
    pub is_speaking: bool,
}

/// Health of the transport session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    #[default]
    Idle,
    Joining,
    Connected,
    Reconnecting,
    Error,
}

impl ConnectionState {
    /// A session exists (or is being established) in this state
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ConnectionState::Joining | ConnectionState::Connected | ConnectionState::Reconnecting
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "IDLE",
            ConnectionState::Joining => "JOINING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Reconnecting => "RECONNECTING",
            ConnectionState::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Error codes surfaced through the `error` event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ConnectionFailed,
    ConnectionLost,
    MicControlFailed,
    PttControlFailed,
    DeviceChangeFailed,
}

/// Audio publish destination: a net, or a transient whisper scope
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "bus", content = "target", rename_all = "kebab-case")]
pub enum Bus {
    Net(NetId),
    Whisper(WhisperTarget),
}

/// Scope of a whisper side-channel
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "scope", content = "id", rename_all = "lowercase")]
pub enum WhisperTarget {
    User(String),
    Role(String),
    Squad(String),
    Wing(String),
    Fleet(String),
}

impl fmt::Display for WhisperTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WhisperTarget::User(id) => write!(f, "user:{}", id),
            WhisperTarget::Role(id) => write!(f, "role:{}", id),
            WhisperTarget::Squad(id) => write!(f, "squad:{}", id),
            WhisperTarget::Wing(id) => write!(f, "wing:{}", id),
            WhisperTarget::Fleet(id) => write!(f, "fleet:{}", id),
        }
    }
}

/// An active (or just ended) whisper
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WhisperSession {
    pub target: WhisperTarget,
    pub label: String,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PriorityLevel {
    #[default]
    Normal,
    Critical,
}

/// Command-level interrupt on a net. Lives until the issuing transmission ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriorityOverride {
    pub message: String,
    pub priority: PriorityLevel,
    pub issued_by_net_id: NetId,
    pub issued_by_user_id: String,
    pub issued_at: DateTime<Utc>,
}

/// Events emitted by the transport adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum TransportEvent {
    Connected {
        net_id: NetId,
        room_name: String,
        participants: Vec<Participant>,
    },
    Disconnected,
    ParticipantJoined {
        user_id: String,
        callsign: String,
        client_id: String,
    },
    ParticipantLeft {
        user_id: String,
    },
    SpeakingChanged {
        user_id: String,
        is_speaking: bool,
    },
    Reconnecting,
    Reconnected {
        participants: Vec<Participant>,
    },
    MicEnabled {
        enabled: bool,
    },
    PttActive {
        active: bool,
    },
    DeviceChanged {
        device_id: String,
    },
    Error {
        message: String,
        code: ErrorCode,
    },
}

/// Subscription key for [`TransportEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    Disconnected,
    ParticipantJoined,
    ParticipantLeft,
    SpeakingChanged,
    Reconnecting,
    Reconnected,
    MicEnabled,
    PttActive,
    DeviceChanged,
    Error,
}

impl TransportEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            TransportEvent::Connected { .. } => EventKind::Connected,
            TransportEvent::Disconnected => EventKind::Disconnected,
            TransportEvent::ParticipantJoined { .. } => EventKind::ParticipantJoined,
            TransportEvent::ParticipantLeft { .. } => EventKind::ParticipantLeft,
            TransportEvent::SpeakingChanged { .. } => EventKind::SpeakingChanged,
            TransportEvent::Reconnecting => EventKind::Reconnecting,
            TransportEvent::Reconnected { .. } => EventKind::Reconnected,
            TransportEvent::MicEnabled { .. } => EventKind::MicEnabled,
            TransportEvent::PttActive { .. } => EventKind::PttActive,
            TransportEvent::DeviceChanged { .. } => EventKind::DeviceChanged,
            TransportEvent::Error { .. } => EventKind::Error,
        }
    }
}

/// Why the discipline policy refused a transmission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum DenyReason {
    RankTooLow { required: u8, actual: u8 },
    PttNotHeld,
    NoSpeakingToken,
    NotCommandStaff,
    UnsupportedDiscipline { discipline: String },
    PriorityOverride { issued_by_user_id: String, message: String },
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::RankTooLow { required, actual } => {
                write!(f, "rank {} is below the required rank {}", actual, required)
            }
            DenyReason::PttNotHeld => f.write_str("push-to-talk is not held"),
            DenyReason::NoSpeakingToken => f.write_str("no speaking token granted"),
            DenyReason::NotCommandStaff => f.write_str("net is restricted to command staff"),
            DenyReason::UnsupportedDiscipline { discipline } => {
                write!(f, "unsupported discipline {:?}", discipline)
            }
            DenyReason::PriorityOverride { issued_by_user_id, .. } => {
                write!(f, "priority override in effect by {}", issued_by_user_id)
            }
        }
    }
}

/// Why a routing request was not applied
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum RejectReason {
    Discipline { denied: DenyReason },
    UnknownNet,
    WhisperActive,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::Discipline { denied } => write!(f, "{}", denied),
            RejectReason::UnknownNet => f.write_str("net is not in the roster"),
            RejectReason::WhisperActive => f.write_str("a whisper is holding the transmit bus"),
        }
    }
}

/// Notices fanned out to UI observers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum SessionNotice {
    Transport {
        event: TransportEvent,
    },
    RoutingChanged {
        transmit_net_id: Option<NetId>,
        monitored_net_ids: Vec<NetId>,
    },
    TransmitRejected {
        net_id: Option<NetId>,
        reason: RejectReason,
    },
    WhisperStarted {
        session: WhisperSession,
    },
    WhisperEnded {
        session: WhisperSession,
        restored_net_id: Option<NetId>,
    },
    PriorityOverride {
        issued: PriorityOverride,
    },
    OverrideCleared {
        net_id: NetId,
    },
    ForceSilenced {
        net_id: NetId,
        issued_by_user_id: String,
    },
}

/// Capture or playback device as offered to device-selection controls
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioDeviceInfo {
    pub id: String,
    pub name: String,
    pub is_input: bool,
    pub is_output: bool,
    pub is_default: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discipline_parsing() {
        assert_eq!(Discipline::from("OPEN"), Discipline::Open);
        assert_eq!(Discipline::from("ptt"), Discipline::PushToTalk);
        assert_eq!(Discipline::from("REQUEST_TO_SPEAK"), Discipline::RequestToSpeak);
        assert_eq!(Discipline::from("COMMAND_ONLY"), Discipline::CommandOnly);
        assert_eq!(
            Discipline::from("RADIO_SILENCE"),
            Discipline::Unsupported("RADIO_SILENCE".to_string())
        );
    }

    #[test]
    fn test_voice_net_from_admin_json() {
        let json = r#"{
            "code": "ALPHA",
            "label": "Alpha Squad",
            "type": "squad",
            "discipline": "SOMETHING_NEW",
            "priority": 2,
            "minRankToTransmit": 3
        }"#;
        let net: VoiceNet = serde_json::from_str(json).unwrap();
        assert_eq!(net.code, NetId::from("ALPHA"));
        assert_eq!(net.net_type, NetType::Squad);
        assert_eq!(
            net.discipline,
            Discipline::Unsupported("SOMETHING_NEW".to_string())
        );
        assert_eq!(net.min_rank_to_transmit, Some(3));
        assert!(net.validate().is_ok());
    }

    #[test]
    fn test_priority_validation() {
        let net = VoiceNet::new("X", "X", Discipline::Open).with_priority(0);
        assert!(net.validate().is_err());
        let net = VoiceNet::new("X", "X", Discipline::Open).with_priority(6);
        assert!(net.validate().is_err());
    }

    #[test]
    fn test_event_wire_names() {
        let event = TransportEvent::SpeakingChanged {
            user_id: "u1".to_string(),
            is_speaking: true,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "speaking-changed");
        assert_eq!(json["userId"], "u1");
        assert_eq!(json["isSpeaking"], true);

        let error = TransportEvent::Error {
            message: "boom".to_string(),
            code: ErrorCode::ConnectionFailed,
        };
        let json = serde_json::to_value(&error).unwrap();
        assert_eq!(json["code"], "CONNECTION_FAILED");
    }
}
