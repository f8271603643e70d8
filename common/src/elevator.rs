//! Cabin-level elevator state.
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::PeerId;

/// A floor number, starting at zero.
pub type Floor = usize;

/// Travel direction of a cabin.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Moving towards higher floors.
    Up,
    /// Not moving.
    Stop,
    /// Moving towards lower floors.
    Down,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Up => write!(f, "up"),
            Self::Stop => write!(f, "stop"),
            Self::Down => write!(f, "down"),
        }
    }
}

/// Direction of a hall-call button. Encoded as `0` (up) or `1` (down) on
/// the wire.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum HallButton {
    /// The "up" hall button.
    Up,
    /// The "down" hall button.
    Down,
}

impl HallButton {
    /// Both hall buttons, in wire order.
    pub const ALL: [HallButton; 2] = [HallButton::Up, HallButton::Down];

    /// Index of this button within a per-floor cell pair.
    pub fn index(&self) -> usize {
        match self {
            Self::Up => 0,
            Self::Down => 1,
        }
    }

    /// The travel direction this button asks for.
    pub fn direction(&self) -> Direction {
        match self {
            Self::Up => Direction::Up,
            Self::Down => Direction::Down,
        }
    }
}

impl fmt::Display for HallButton {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Up => write!(f, "hall-up"),
            Self::Down => write!(f, "hall-down"),
        }
    }
}

impl From<HallButton> for u8 {
    fn from(button: HallButton) -> u8 {
        button.index() as u8
    }
}

impl TryFrom<u8> for HallButton {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Up),
            1 => Ok(Self::Down),
            other => Err(format!("invalid hall button {:?}", other)),
        }
    }
}

/// Cabin call registry: one bit per floor.
///
/// Cabin calls are private to the owning peer. They are never acted on by
/// other peers, only remembered, so that they can be returned verbatim when
/// the owner restarts.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CabinCalls(u32);

impl CabinCalls {
    /// Register a call at the given floor.
    pub fn set(&mut self, floor: Floor) {
        self.0 |= 1 << floor;
    }

    /// Clear the call at the given floor.
    pub fn clear(&mut self, floor: Floor) {
        self.0 &= !(1 << floor);
    }

    /// Whether a call is registered at the given floor.
    pub fn contains(&self, floor: Floor) -> bool {
        self.0 & (1 << floor) != 0
    }

    /// Merge another call set into this one.
    pub fn merge(&mut self, other: CabinCalls) {
        self.0 |= other.0;
    }

    /// Whether no calls are registered.
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Floors with a registered call, lowest first.
    pub fn iter(&self) -> impl Iterator<Item = Floor> + '_ {
        (0..u32::BITS as Floor).filter(|floor| self.contains(*floor))
    }
}

/// Per-peer cabin state, as carried by liveness beacons and state backups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElevState {
    /// The owning peer.
    pub id: PeerId,
    /// Last floor the cabin was detected at.
    pub last_floor: Floor,
    /// Current travel direction.
    pub direction: Direction,
    /// Whether the motor is running.
    pub is_moving: bool,
    /// Whether the doors are open.
    pub door_open: bool,
    /// The peer's private cabin calls.
    pub cabin_calls: CabinCalls,
}

impl ElevState {
    /// A stationary cabin at the given floor with no calls.
    pub fn new(id: PeerId, floor: Floor) -> Self {
        Self {
            id,
            last_floor: floor,
            direction: Direction::Stop,
            is_moving: false,
            door_open: false,
            cabin_calls: CabinCalls::default(),
        }
    }

    /// Stationary with no direction.
    pub fn is_idle(&self) -> bool {
        !self.is_moving && self.direction == Direction::Stop
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cabin_calls() {
        let mut calls = CabinCalls::default();
        assert!(calls.is_empty());

        calls.set(1);
        calls.set(3);
        assert!(calls.contains(1));
        assert!(!calls.contains(2));
        assert_eq!(calls.iter().collect::<Vec<_>>(), vec![1, 3]);

        calls.clear(1);
        assert!(!calls.contains(1));
    }

    #[test]
    fn test_cabin_calls_merge() {
        let mut ours = CabinCalls::default();
        ours.set(0);

        let mut theirs = CabinCalls::default();
        theirs.set(0);
        theirs.set(2);

        ours.merge(theirs);
        assert_eq!(ours.iter().collect::<Vec<_>>(), vec![0, 2]);
    }
}
