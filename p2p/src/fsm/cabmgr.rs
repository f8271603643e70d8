//! Local cabin control.
//!
//! Owns the local [`ElevState`]: floor tracking, direction, door state and
//! cabin calls. Translates planner decisions into motor and lamp commands at
//! floor-arrival and door-timeout events. Material state changes raise a
//! dirty flag which the state machine turns into `BackupState` broadcasts.
use log::*;

use liftnet_common::calls::CallMap;
use liftnet_common::elevator::{Direction, ElevState, Floor};
use liftnet_common::hardware::Light;
use liftnet_common::time::{Clock, LocalDuration, LocalTime};
use liftnet_common::PeerId;

use super::event::Event;
use super::motion;
use super::output::{Io, Outbox};

/// Manages the local cabin.
#[derive(Debug)]
pub struct CabinManager<C> {
    state: ElevState,
    door_hold: LocalDuration,
    door_deadline: Option<LocalTime>,
    dirty: bool,
    outbox: Outbox,
    clock: C,
}

impl<C> Iterator for CabinManager<C> {
    type Item = Io;

    fn next(&mut self) -> Option<Io> {
        self.outbox.next()
    }
}

impl<C: Clock> CabinManager<C> {
    /// Create a new cabin manager.
    pub fn new(id: PeerId, door_hold: LocalDuration, clock: C) -> Self {
        Self {
            state: ElevState::new(id, 0),
            door_hold,
            door_deadline: None,
            dirty: false,
            outbox: Outbox::default(),
            clock,
        }
    }

    /// Record the floor the cabin starts out at. Must be called once.
    pub fn initialize(&mut self, floor: Floor) {
        self.state.last_floor = floor;
    }

    /// The local cabin state.
    pub fn state(&self) -> &ElevState {
        &self.state
    }

    /// Take the dirty flag, clearing it.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    /// An in-cabin floor button was pressed.
    pub fn cabin_button(&mut self, floor: Floor) {
        if !self.state.is_moving && self.state.last_floor == floor {
            info!(target: "cab", "opening doors");
            self.open_doors();
        } else {
            debug!(target: "cab", "queueing cabin call for floor {}", floor);
            self.state.cabin_calls.set(floor);
            self.outbox.light(Light::Cabin { floor, on: true });
            self.dirty = true;

            if self.state.is_idle() && !self.state.door_open {
                self.replan();
            }
        }
    }

    /// Open the doors at the current floor and start the hold timer.
    pub fn open_doors(&mut self) {
        self.state.door_open = true;
        self.door_deadline = Some(self.clock.local_time() + self.door_hold);
        self.outbox.light(Light::Door { on: true });
        self.outbox.set_timer(self.door_hold);
        self.outbox.event(Event::DoorOpened(self.state.last_floor));
        self.dirty = true;
    }

    /// Schedule an immediate planning pass, by expiring the door timer right
    /// away. The door-timeout path picks a direction from the remaining
    /// orders.
    pub fn replan(&mut self) {
        self.door_deadline = Some(self.clock.local_time());
        self.outbox.set_timer(LocalDuration::from_millis(0));
    }

    /// The cabin reached a floor. Returns true if it stopped there, in which
    /// case the caller completes any of our hall calls at that floor.
    pub fn floor_reached(&mut self, floor: Floor, calls: &CallMap) -> bool {
        self.state.last_floor = floor;
        self.dirty = true;

        if !motion::should_stop(&self.state, calls) {
            return false;
        }
        self.outbox.motor(Direction::Stop);
        self.state.is_moving = false;

        self.state.cabin_calls.clear(floor);
        self.outbox.light(Light::Cabin { floor, on: false });

        info!(target: "cab", "opening doors");
        self.open_doors();
        true
    }

    /// Merge cabin calls remembered by a peer into our own, lighting the
    /// lamps and waking the planner if the cabin is sitting idle.
    pub fn restore_cabin_calls(&mut self, restored: &ElevState) {
        self.state.cabin_calls.merge(restored.cabin_calls);
        for floor in self.state.cabin_calls.iter() {
            self.outbox.light(Light::Cabin { floor, on: true });
        }
        self.dirty = true;

        if self.state.is_idle() && !self.state.door_open {
            self.replan();
        }
    }

    /// A wake was received.
    pub fn timer_expired(&mut self, calls: &CallMap) {
        if let Some(deadline) = self.door_deadline {
            if deadline <= self.clock.local_time() {
                self.door_deadline = None;
                self.door_timeout(calls);
            }
        }
    }

    /// The door-hold timer ran out: close up and move on.
    fn door_timeout(&mut self, calls: &CallMap) {
        info!(target: "cab", "closing doors");
        self.state.door_open = false;
        self.outbox.light(Light::Door { on: false });
        self.outbox.event(Event::DoorClosed(self.state.last_floor));

        if motion::have_orders(&self.state, calls) {
            let direction = motion::next_direction(&self.state, calls);
            self.state.direction = direction;
            self.state.is_moving = direction != Direction::Stop;

            if direction != Direction::Stop {
                info!(target: "cab", "going {}", direction);
                self.outbox.motor(direction);
            }
        } else {
            self.state.direction = Direction::Stop;
            self.state.is_moving = false;
        }
        self.dirty = true;
    }
}
