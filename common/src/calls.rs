//! Hall-call cells, as shared between peers.
use serde::{Deserialize, Serialize};

use crate::elevator::{Floor, HallButton};
use crate::PeerId;

/// Lifecycle of a hall call.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallStatus {
    /// No call outstanding.
    #[default]
    NotActive,
    /// A call was claimed and is being acknowledged by the fleet.
    Awaiting,
    /// The fleet agreed on an assignee, which is now serving the call.
    UnderExecution,
}

/// A single hall-call cell as seen on the wire: its status and, when
/// outstanding, the peer responsible for serving it.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSummary {
    /// Where the call is in its lifecycle.
    pub status: CallStatus,
    /// The peer serving the call, when one is outstanding.
    pub assigned_to: Option<PeerId>,
}

impl CallSummary {
    /// Whether this call is being executed by the given peer.
    pub fn executed_by(&self, id: PeerId) -> bool {
        self.status == CallStatus::UnderExecution && self.assigned_to == Some(id)
    }
}

/// All hall-call cells of a building: one per (floor, direction).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallMap {
    cells: Vec<[CallSummary; 2]>,
}

impl CallMap {
    /// An all-inactive map for a building with the given number of floors.
    pub fn new(floors: usize) -> Self {
        Self {
            cells: vec![<[CallSummary; 2]>::default(); floors],
        }
    }

    /// Number of floors covered by this map.
    pub fn floors(&self) -> usize {
        self.cells.len()
    }

    /// The cell for the given floor and button.
    pub fn get(&self, floor: Floor, button: HallButton) -> &CallSummary {
        &self.cells[floor][button.index()]
    }

    /// Mutable access to the cell for the given floor and button.
    pub fn get_mut(&mut self, floor: Floor, button: HallButton) -> &mut CallSummary {
        &mut self.cells[floor][button.index()]
    }

    /// Shorthand for the status of a cell.
    pub fn status(&self, floor: Floor, button: HallButton) -> CallStatus {
        self.get(floor, button).status
    }

    /// Iterate over all cells, lowest floor first.
    pub fn iter(&self) -> impl Iterator<Item = (Floor, HallButton, &CallSummary)> + '_ {
        self.cells.iter().enumerate().flat_map(|(floor, pair)| {
            HallButton::ALL
                .iter()
                .map(move |button| (floor, *button, &pair[button.index()]))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn test_call_map_cells() {
        let peer = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let mut map = CallMap::new(4);

        assert_eq!(map.floors(), 4);
        assert_eq!(map.status(2, HallButton::Up), CallStatus::NotActive);

        *map.get_mut(2, HallButton::Up) = CallSummary {
            status: CallStatus::UnderExecution,
            assigned_to: Some(peer),
        };
        assert!(map.get(2, HallButton::Up).executed_by(peer));
        assert!(!map.get(2, HallButton::Down).executed_by(peer));

        let outstanding: Vec<_> = map
            .iter()
            .filter(|(_, _, cell)| cell.status != CallStatus::NotActive)
            .collect();
        assert_eq!(outstanding.len(), 1);
        assert_eq!(outstanding[0].0, 2);
        assert_eq!(outstanding[0].1, HallButton::Up);
    }
}
