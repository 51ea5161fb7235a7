//! Transport layer
//!
//! [`TransportAdapter`] drives a [`MediaSession`] and reports everything that
//! happens to it through an [`EventBus`].

pub mod adapter;
pub mod events;
pub mod loopback;
pub mod media;

pub use adapter::{MicState, TransportAdapter};
pub use events::{EventBus, Subscription};
pub use loopback::LoopbackSession;
pub use media::{JoinRequest, JoinedRoom, MediaSession, SessionSignal, SessionUser};
