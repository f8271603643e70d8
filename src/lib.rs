//! Liftnet is a fault-tolerant distributed controller for a cooperating
//! fleet of elevators. Each elevator runs an identical peer that talks to
//! the others over a broadcast LAN, so that every hall call is served
//! exactly once even under peer crashes, partitions and restarts.
//!
//! This crate is a facade over the workspace members.

#[cfg(feature = "liftnet-common")]
pub use liftnet_common as common;

#[cfg(feature = "liftnet-p2p")]
pub use liftnet_p2p as p2p;

#[cfg(feature = "liftnet-net")]
pub use liftnet_net as net;

#[cfg(feature = "liftnet-node")]
pub use liftnet_node as node;
