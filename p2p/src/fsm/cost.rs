//! Cost-based hall-call assignment.
//!
//! Every peer evaluates the same function over the same eventually-consistent
//! view of the fleet, so independent evaluations agree once the protocol has
//! quiesced. Ties are broken by peer id, which makes the result deterministic
//! across peers given identical inputs.
use log::*;
use thiserror::Error;

use liftnet_common::calls::CallMap;
use liftnet_common::elevator::{ElevState, Floor, HallButton};
use liftnet_common::PeerId;

use super::motion;

/// Cost of traversing one floor.
const TRAVEL_TIME: usize = 2;
/// Cost of one intermediate stop.
const STOP_TIME: usize = 3;

/// Assignment failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AssignError {
    /// There is no active peer to assign the call to.
    #[error("cannot assign a hall call with no active peers")]
    NoActivePeers,
}

/// Pick the cheapest active peer to serve the given hall call.
pub fn assign<'a>(
    peers: impl Iterator<Item = (&'a PeerId, &'a ElevState)>,
    calls: &CallMap,
    floor: Floor,
    button: HallButton,
) -> Result<PeerId, AssignError> {
    let mut best: Option<(usize, PeerId)> = None;

    for (id, state) in peers {
        let (traveled, stops) = motion::distance_to_call(state, calls, floor, button);
        let cost = traveled * TRAVEL_TIME + stops * STOP_TIME;

        debug!(target: "cost", "{}: cost {} for {} at floor {}", id, cost, button, floor);

        if best.map_or(true, |(c, b)| (cost, *id) < (c, b)) {
            best = Some((cost, *id));
        }
    }
    match best {
        Some((_, id)) => {
            info!(target: "cost", "assigning {} at floor {} to {}", button, floor, id);
            Ok(id)
        }
        None => Err(AssignError::NoActivePeers),
    }
}
