//! Cabin motion planning.
//!
//! Pure functions over a cabin state and the shared hall-call map. A cabin's
//! *commitments* are its private cabin calls plus the hall calls under
//! execution that are assigned to it; everything here is derived from those.
use liftnet_common::calls::CallMap;
use liftnet_common::elevator::{Direction, ElevState, Floor, HallButton};

fn committed_at(state: &ElevState, calls: &CallMap, floor: Floor) -> bool {
    state.cabin_calls.contains(floor)
        || HallButton::ALL
            .iter()
            .any(|button| calls.get(floor, *button).executed_by(state.id))
}

/// Whether the cabin has commitments above its last floor.
pub fn have_orders_above(state: &ElevState, calls: &CallMap) -> bool {
    (state.last_floor + 1..calls.floors()).any(|floor| committed_at(state, calls, floor))
}

/// Whether the cabin has commitments below its last floor.
pub fn have_orders_below(state: &ElevState, calls: &CallMap) -> bool {
    (0..state.last_floor).any(|floor| committed_at(state, calls, floor))
}

/// Whether the cabin has any commitments at all.
pub fn have_orders(state: &ElevState, calls: &CallMap) -> bool {
    have_orders_above(state, calls)
        || have_orders_below(state, calls)
        || committed_at(state, calls, state.last_floor)
}

/// Whether the cabin should stop at the floor it just reached.
pub fn should_stop(state: &ElevState, calls: &CallMap) -> bool {
    let floor = state.last_floor;

    match state.direction {
        Direction::Stop => true,
        Direction::Up => {
            !have_orders_above(state, calls)
                || state.cabin_calls.contains(floor)
                || calls.get(floor, HallButton::Up).executed_by(state.id)
                || floor == calls.floors() - 1
        }
        Direction::Down => {
            !have_orders_below(state, calls)
                || state.cabin_calls.contains(floor)
                || calls.get(floor, HallButton::Down).executed_by(state.id)
                || floor == 0
        }
    }
}

/// The direction the cabin should take next. Keeps going the way it was
/// headed while commitments remain on that side, turns around otherwise.
pub fn next_direction(state: &ElevState, calls: &CallMap) -> Direction {
    if !have_orders(state, calls) {
        return Direction::Stop;
    }
    let top = calls.floors() - 1;

    if state.direction == Direction::Up && have_orders_above(state, calls) && state.last_floor != top
    {
        Direction::Up
    } else if state.direction == Direction::Down
        && have_orders_below(state, calls)
        && state.last_floor != 0
    {
        Direction::Down
    } else if have_orders_above(state, calls) {
        Direction::Up
    } else if have_orders_below(state, calls) {
        Direction::Down
    } else {
        Direction::Stop
    }
}

/// Hall button matching the next travel direction, if the cabin is going
/// anywhere.
pub fn next_call_direction(state: &ElevState, calls: &CallMap) -> Option<HallButton> {
    match next_direction(state, calls) {
        Direction::Up => Some(HallButton::Up),
        Direction::Down => Some(HallButton::Down),
        Direction::Stop => None,
    }
}

/// How far the cabin is from being able to serve a hall call: floors
/// traversed and own commitments passed on the way, given its current
/// direction. An idle cabin at the target is at distance zero.
pub fn distance_to_call(
    state: &ElevState,
    calls: &CallMap,
    target: Floor,
    button: HallButton,
) -> (usize, usize) {
    let top = calls.floors() - 1;
    let mut dir = state.direction;
    let mut floor = state.last_floor;

    if state.is_idle() && floor == target {
        return (0, 0);
    }
    if target > floor && !(dir == Direction::Down && have_orders_below(state, calls)) {
        dir = Direction::Up;
    } else if target < floor && !(dir == Direction::Up && have_orders_above(state, calls)) {
        dir = Direction::Down;
    }
    if dir == Direction::Stop {
        return (0, 0);
    }
    // An inconsistent state can claim to be moving off the end of the
    // shaft; there is nowhere to walk from there.
    if (dir == Direction::Up && floor == top) || (dir == Direction::Down && floor == 0) {
        return (0, 0);
    }

    let mut traveled = 0;
    let mut stops = 0;

    loop {
        floor = match dir {
            Direction::Up => floor + 1,
            Direction::Down => floor - 1,
            Direction::Stop => unreachable!("walk direction is never stop"),
        };
        traveled += 1;

        if floor == target {
            if floor == 0 || floor == top {
                break;
            }
            if dir == button.direction() {
                break;
            }
            // Passing the call's floor against its direction: stop here only
            // if nothing further along would make us continue.
            let mut there = state.clone();
            there.last_floor = target;
            if dir == Direction::Up && !have_orders_above(&there, calls) {
                break;
            }
            if dir == Direction::Down && !have_orders_below(&there, calls) {
                break;
            }
        }
        if committed_at(state, calls, floor) {
            stops += 1;
        }
        if floor == top {
            dir = Direction::Down;
        } else if floor == 0 {
            dir = Direction::Up;
        }
    }
    (traveled, stops)
}

#[cfg(test)]
mod tests {
    use super::*;
    use liftnet_common::calls::{CallStatus, CallSummary};
    use liftnet_common::PeerId;
    use std::net::{IpAddr, Ipv4Addr};

    fn peer(n: u8) -> PeerId {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, n))
    }

    fn executing(calls: &mut CallMap, floor: Floor, button: HallButton, id: PeerId) {
        *calls.get_mut(floor, button) = CallSummary {
            status: CallStatus::UnderExecution,
            assigned_to: Some(id),
        };
    }

    #[test]
    fn test_idle_cabin_at_target_is_free() {
        let state = ElevState::new(peer(1), 2);
        let calls = CallMap::new(4);

        assert_eq!(distance_to_call(&state, &calls, 2, HallButton::Up), (0, 0));
    }

    #[test]
    fn test_distance_counts_floors_and_stops() {
        let mut state = ElevState::new(peer(1), 0);
        state.cabin_calls.set(1);
        let mut calls = CallMap::new(4);
        executing(&mut calls, 2, HallButton::Down, peer(1));

        // Floor 3 up: three floors of travel, two commitments passed.
        assert_eq!(distance_to_call(&state, &calls, 3, HallButton::Up), (3, 2));
    }

    #[test]
    fn test_distance_passes_opposing_call() {
        let mut state = ElevState::new(peer(1), 0);
        state.direction = Direction::Up;
        state.is_moving = true;
        state.cabin_calls.set(3);
        let calls = CallMap::new(4);

        // A down call at floor 2 is served on the way back: up to 3, down to 2.
        assert_eq!(distance_to_call(&state, &calls, 2, HallButton::Down), (4, 1));
    }

    #[test]
    fn test_should_stop_for_own_commitments() {
        let mut state = ElevState::new(peer(1), 2);
        state.direction = Direction::Up;
        state.is_moving = true;
        let mut calls = CallMap::new(4);
        executing(&mut calls, 3, HallButton::Down, peer(1));

        // Nothing at floor 2: ride through.
        assert!(!should_stop(&state, &calls));

        // A matching hall call at the current floor: stop.
        executing(&mut calls, 2, HallButton::Up, peer(1));
        assert!(should_stop(&state, &calls));
    }

    #[test]
    fn test_should_stop_ignores_other_peers_calls() {
        let mut state = ElevState::new(peer(1), 1);
        state.direction = Direction::Up;
        state.is_moving = true;
        let mut calls = CallMap::new(4);
        executing(&mut calls, 1, HallButton::Up, peer(2));
        executing(&mut calls, 3, HallButton::Up, peer(1));

        assert!(!should_stop(&state, &calls));
    }

    #[test]
    fn test_next_direction_prefers_current_heading() {
        let mut state = ElevState::new(peer(1), 1);
        state.direction = Direction::Up;
        state.cabin_calls.set(0);
        state.cabin_calls.set(3);
        let calls = CallMap::new(4);

        assert_eq!(next_direction(&state, &calls), Direction::Up);

        state.direction = Direction::Down;
        assert_eq!(next_direction(&state, &calls), Direction::Down);
    }

    #[test]
    fn test_next_direction_idle_without_orders() {
        let state = ElevState::new(peer(1), 1);
        let calls = CallMap::new(4);

        assert_eq!(next_direction(&state, &calls), Direction::Stop);
        assert_eq!(next_call_direction(&state, &calls), None);
    }
}
