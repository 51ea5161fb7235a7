//! # Voice Net
//!
//! Push-to-talk voice-net core: net routing, transmit discipline, whispers
//! and priority overrides on top of one real-time media session.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                           CONTROL SURFACE (ui)                               │
//! │        HTTP /api/*  ·  WebSocket /ws (notices out, PTT input in)             │
//! └──────────────────────────────────────┬──────────────────────────────────────┘
//!                                        │
//!                                        ▼
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                          VoiceSession (session)                              │
//! │                                                                             │
//! │  ┌───────────────┐   ┌───────────────┐   ┌───────────────────────────┐     │
//! │  │ PttController │   │WhisperManager │   │     PriorityArbiter       │     │
//! │  │ (control::ptt)│   │  (whisper)    │   │     (priority)            │     │
//! │  └───────┬───────┘   └───────┬───────┘   └─────────────┬─────────────┘     │
//! │          │                   │                         │                   │
//! │          ▼                   ▼                         ▼                   │
//! │  ┌─────────────────────────────────────────────────────────────────────┐   │
//! │  │                  NetRouter (nets::routing)                          │   │
//! │  │     one TX bus · monitored nets · whisper bus swap                  │   │
//! │  └──────────┬───────────────────────────────────────────┬──────────────┘   │
//! │             │                                           │                  │
//! │  ┌──────────▼──────────┐  ┌──────────────────┐  ┌───────▼──────────┐       │
//! │  │  DisciplinePolicy   │◄─┤   FloorState     │  │    NetRoster     │       │
//! │  │  (nets::discipline) │  │ PTT · tokens ·   │  │  (nets::roster)  │       │
//! │  └─────────────────────┘  │ overrides        │  └──────────────────┘       │
//! │                           └──────────────────┘                             │
//! └──────────────────────────────────────┬──────────────────────────────────────┘
//!                                        │
//!                                        ▼
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                  TransportAdapter (transport::adapter)                       │
//! │   FIFO operation queue · ConnectionMachine · reconnect backoff · EventBus    │
//! │                                        │                                    │
//! │                                        ▼                                    │
//! │                      dyn MediaSession (transport::media)                     │
//! │             real-time room: track, capture, publish bus, subscriptions       │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod config;
pub mod connection;
pub mod control;
pub mod error;
pub mod nets;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod ui;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
pub use session::VoiceSession;

/// Application-wide constants
pub mod constants {
    /// Reconnect attempts after an unexpected link loss
    pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

    /// Delay before the first reconnect attempt
    pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 1000;

    /// Upper bound on the reconnect backoff
    pub const MAX_RECONNECT_DELAY_MS: u64 = 30_000;

    /// Keyboard key bound to PTT out of the box
    pub const DEFAULT_PTT_KEY: &str = "Space";

    /// Default HTTP port for the control surface
    pub const DEFAULT_HTTP_PORT: u16 = 8080;

    /// Media endpoint used when a connect request names none
    pub const DEFAULT_ENDPOINT_URL: &str = "wss://localhost:7880";

    /// Buffered session notices per observer
    pub const NOTICE_CHANNEL_CAPACITY: usize = 256;
}
