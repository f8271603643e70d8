//! Events emitted by the state machine.
use std::fmt;

use liftnet_common::elevator::{Floor, HallButton};
use liftnet_common::PeerId;

/// Significant protocol occurrences, for logging and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The state machine is initializing.
    Initializing,
    /// A peer entered (or re-entered) the active set.
    PeerActive(PeerId),
    /// A peer missed too many beacons and left the active set.
    PeerLost(PeerId),
    /// A hall call was claimed and is awaiting fleet acknowledgement.
    CallAccepted {
        /// Floor of the call.
        floor: Floor,
        /// Direction of the call.
        button: HallButton,
        /// The peer picked to serve it.
        assigned_to: PeerId,
    },
    /// A hall call entered execution.
    CallConfirmed {
        /// Floor of the call.
        floor: Floor,
        /// Direction of the call.
        button: HallButton,
        /// The peer serving it.
        assigned_to: PeerId,
    },
    /// A hall call was served.
    CallCompleted {
        /// Floor of the call.
        floor: Floor,
        /// Direction of the call.
        button: HallButton,
        /// The peer that served it.
        assigned_to: PeerId,
    },
    /// An execution watchdog fired and the call was handed over.
    CallReassigned {
        /// Floor of the call.
        floor: Floor,
        /// Direction of the call.
        button: HallButton,
        /// The new assignee.
        assigned_to: PeerId,
    },
    /// A peer answered our state request.
    StateRestored(PeerId),
    /// The doors opened at a floor.
    DoorOpened(Floor),
    /// The doors closed at a floor.
    DoorClosed(Floor),
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initializing => write!(f, "initializing"),
            Self::PeerActive(id) => write!(f, "{}: peer is active", id),
            Self::PeerLost(id) => write!(f, "{}: peer stopped responding", id),
            Self::CallAccepted {
                floor,
                button,
                assigned_to,
            } => write!(f, "{} at floor {} accepted for {}", button, floor, assigned_to),
            Self::CallConfirmed {
                floor,
                button,
                assigned_to,
            } => write!(f, "{} at floor {} confirmed for {}", button, floor, assigned_to),
            Self::CallCompleted {
                floor,
                button,
                assigned_to,
            } => write!(f, "{} at floor {} completed by {}", button, floor, assigned_to),
            Self::CallReassigned {
                floor,
                button,
                assigned_to,
            } => write!(f, "{} at floor {} reassigned to {}", button, floor, assigned_to),
            Self::StateRestored(id) => write!(f, "{}: returned our previous state", id),
            Self::DoorOpened(floor) => write!(f, "doors opened at floor {}", floor),
            Self::DoorClosed(floor) => write!(f, "doors closed at floor {}", floor),
        }
    }
}
