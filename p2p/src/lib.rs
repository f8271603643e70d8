//! Implementation of the liftnet order protocol: the replicated hall-call
//! state machine, peer liveness tracking, cost-based assignment and the
//! motion planner, all behind a single deterministic reducer.

pub mod fsm;

pub use fsm::{Config, Event, ExitReason, Io, StateMachine};
