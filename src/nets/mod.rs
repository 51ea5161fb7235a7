//! Nets: roster, shared floor state, discipline policy and routing

pub mod discipline;
pub mod floor;
pub mod roster;
pub mod routing;

pub use discipline::{DisciplinePolicy, TransmitDecision};
pub use floor::FloorState;
pub use roster::NetRoster;
pub use routing::{
    NetRouter, RoutingOutcome, RoutingSnapshot, RoutingState, SharedOperator, SubmixRequest,
};
