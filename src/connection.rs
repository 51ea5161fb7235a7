//! Connection state machine and reconnect policy
//!
//! ```text
//!            connect()              join ok
//!   IDLE ───────────────► JOINING ───────────► CONNECTED ◄──────┐
//!    ▲                       │                  │   ▲           │
//!    │                       │ join failed      │   │ link       │ rejoin ok
//!    │                       ▼                  │   │ lost       │
//!    │                     ERROR ◄──────────────┼───┼──── RECONNECTING
//!    │   disconnect()        ▲   fatal / retries│   │           │
//!    └───────────────────────┴──────────────────┴───┘◄──────────┘
//! ```
//!
//! ERROR has no automatic exit; only a new `connect()` moves it back to JOINING.

use std::time::Duration;
use thiserror::Error;

use crate::config::ReconnectConfig;
use crate::protocol::ConnectionState;

/// Inputs that drive the connection state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionInput {
    /// Caller invoked `connect()`
    ConnectRequested,
    /// Transport reported a successful join
    JoinSucceeded,
    /// Transport reported a failed join
    JoinFailed,
    /// Transport reported a network blip
    LinkLost,
    /// Transport rejoined after a blip
    LinkRestored,
    /// Explicit `disconnect()` or an unsolicited close from the transport
    Disconnected,
    /// Reconnect attempts ran out
    RetriesExhausted,
    /// Transport reported a fatal error
    Fatal,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("invalid connection transition: {input:?} in state {from}")]
pub struct InvalidTransition {
    pub from: ConnectionState,
    pub input: ConnectionInput,
}

/// Holds the one [`ConnectionState`] of a session
#[derive(Debug, Default)]
pub struct ConnectionMachine {
    state: ConnectionState,
}

impl ConnectionMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Compute the next state without applying it
    pub fn next(from: ConnectionState, input: ConnectionInput) -> Option<ConnectionState> {
        use ConnectionInput as I;
        use ConnectionState as S;

        match (from, input) {
            (S::Idle | S::Error, I::ConnectRequested) => Some(S::Joining),
            (S::Joining, I::JoinSucceeded) => Some(S::Connected),
            (S::Joining, I::JoinFailed) => Some(S::Error),
            (S::Connected, I::LinkLost) => Some(S::Reconnecting),
            (S::Reconnecting, I::LinkRestored) => Some(S::Connected),
            (S::Reconnecting, I::RetriesExhausted) => Some(S::Error),
            (S::Joining | S::Connected | S::Reconnecting | S::Error, I::Disconnected) => {
                Some(S::Idle)
            }
            (_, I::Fatal) => Some(S::Error),
            _ => None,
        }
    }

    /// Apply an input, returning the new state
    pub fn apply(&mut self, input: ConnectionInput) -> Result<ConnectionState, InvalidTransition> {
        match Self::next(self.state, input) {
            Some(next) => {
                if next != self.state {
                    tracing::info!("Connection state {} -> {} ({:?})", self.state, next, input);
                }
                self.state = next;
                Ok(next)
            }
            None => Err(InvalidTransition {
                from: self.state,
                input,
            }),
        }
    }
}

/// Bounded exponential backoff for the adapter's reconnect loop
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl ReconnectPolicy {
    /// Delay to wait before the given attempt (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16) as i32;
        let factor = self.multiplier.max(1.0).powi(exp);
        let delay = self.initial_delay.as_secs_f64() * factor;
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectConfig::default().into()
    }
}

impl From<ReconnectConfig> for ReconnectPolicy {
    fn from(config: ReconnectConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms.max(config.initial_delay_ms)),
            multiplier: config.multiplier,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionInput as I;
    use ConnectionState as S;

    #[test]
    fn test_happy_path() {
        let mut machine = ConnectionMachine::new();
        assert_eq!(machine.apply(I::ConnectRequested).unwrap(), S::Joining);
        assert_eq!(machine.apply(I::JoinSucceeded).unwrap(), S::Connected);
        assert_eq!(machine.apply(I::LinkLost).unwrap(), S::Reconnecting);
        assert_eq!(machine.apply(I::LinkRestored).unwrap(), S::Connected);
        assert_eq!(machine.apply(I::Disconnected).unwrap(), S::Idle);
    }

    #[test]
    fn test_error_has_no_automatic_exit() {
        let mut machine = ConnectionMachine::new();
        machine.apply(I::ConnectRequested).unwrap();
        assert_eq!(machine.apply(I::JoinFailed).unwrap(), S::Error);

        for input in [I::JoinSucceeded, I::LinkLost, I::LinkRestored, I::RetriesExhausted] {
            assert!(machine.apply(input).is_err());
            assert_eq!(machine.state(), S::Error);
        }

        assert_eq!(machine.apply(I::ConnectRequested).unwrap(), S::Joining);
    }

    #[test]
    fn test_connect_rejected_while_active() {
        for state in [S::Joining, S::Connected, S::Reconnecting] {
            assert_eq!(ConnectionMachine::next(state, I::ConnectRequested), None);
        }
    }

    #[test]
    fn test_fatal_from_any_state() {
        for state in [S::Idle, S::Joining, S::Connected, S::Reconnecting, S::Error] {
            assert_eq!(ConnectionMachine::next(state, I::Fatal), Some(S::Error));
        }
    }

    #[test]
    fn test_disconnect_from_idle_is_invalid() {
        let mut machine = ConnectionMachine::new();
        let err = machine.apply(I::Disconnected).unwrap_err();
        assert_eq!(err.from, S::Idle);
    }

    #[test]
    fn test_backoff_delays() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(30), Duration::from_secs(30));
    }
}
