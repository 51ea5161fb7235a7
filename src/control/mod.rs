//! Control surfaces: push-to-talk, whisper and priority override

pub mod priority;
pub mod ptt;
pub mod whisper;

pub use priority::{OverrideOutcome, OverrideRejection, PriorityArbiter};
pub use ptt::{Edge, InputEvent, PttController, PttOutcome};
pub use whisper::WhisperManager;
