//! Elevator fleet protocol state machine.
//!
//! A single reducer owns all mutable core state: the hall-call map, the peer
//! registry, and the local cabin. Inputs (network messages, hardware events,
//! timer wakes) are folded into state transitions; effects come out as
//! [`Io`] values drained by a reactor. Broadcasts are delivered back to the
//! local machine as they are drained, so a peer participates in its own
//! acknowledgement rounds exactly like everyone else.
#![warn(missing_docs)]
use log::*;

use liftnet_common::config as shared;
use liftnet_common::elevator::{Direction, Floor, HallButton};
use liftnet_common::hardware::{ButtonKind, Light};
use liftnet_common::message::{Message, RestoreKind, RestoreMessage};
use liftnet_common::time::{Clock, LocalDuration, LocalTime};
use liftnet_common::PeerId;

mod cabmgr;
mod cost;
mod motion;
mod ordermgr;
mod peermgr;

pub mod event;
pub mod output;

#[cfg(test)]
mod tests;

use cabmgr::CabinManager;
use ordermgr::OrderManager;
use peermgr::PeerManager;

pub use cost::AssignError;
pub use event::Event;
pub use output::{ExitReason, Io, Outbox};

/// State machine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Local peer identity: our broadcast-reachable address.
    pub id: PeerId,
    /// Number of floors served.
    pub floors: usize,
    /// How often liveness beacons are broadcast.
    pub beacon_interval: LocalDuration,
    /// Beacon age beyond which a peer is considered gone.
    pub alive_limit: LocalDuration,
    /// Acknowledgement round timeout.
    pub ack_timeout: LocalDuration,
    /// Base execution watchdog timeout.
    pub order_timeout: LocalDuration,
    /// Upper bound on the per-peer execution timeout jitter.
    pub order_timeout_jitter: LocalDuration,
    /// How long the doors stay open at a floor.
    pub door_hold: LocalDuration,
}

impl Config {
    /// Build a protocol configuration from the shared one plus our identity.
    pub fn from(config: &shared::Config, id: PeerId) -> Self {
        Self {
            id,
            floors: config.floors,
            beacon_interval: config.beacon_interval,
            alive_limit: config.alive_limit,
            ack_timeout: config.ack_timeout,
            order_timeout: config.order_timeout,
            order_timeout_jitter: config.order_timeout_jitter,
            door_hold: config.door_hold,
        }
    }
}

/// An instance of the fleet protocol for one elevator.
#[derive(Debug)]
pub struct StateMachine<C> {
    /// Local peer id.
    id: PeerId,
    /// Peer registry and liveness tracking.
    peermgr: PeerManager<C>,
    /// Hall-call cells and acknowledgement rounds.
    ordermgr: OrderManager<C>,
    /// The local cabin.
    cab: CabinManager<C>,
    /// Top-level output queue.
    outbox: Outbox,
    clock: C,
}

impl<C: Clock> StateMachine<C> {
    /// Construct a new protocol instance. The execution timeout is jittered
    /// per peer so that reassignment watchdogs don't stampede.
    pub fn new(config: Config, clock: C, rng: fastrand::Rng) -> Self {
        let jitter = match config.order_timeout_jitter.as_millis() {
            0 => LocalDuration::default(),
            max => LocalDuration::from_millis(rng.u64(..max)),
        };
        let order_timeout = config.order_timeout + jitter;

        Self {
            id: config.id,
            peermgr: PeerManager::new(
                config.id,
                config.beacon_interval,
                config.alive_limit,
                clock.clone(),
            ),
            ordermgr: OrderManager::new(
                ordermgr::Config {
                    id: config.id,
                    floors: config.floors,
                    ack_timeout: config.ack_timeout,
                    order_timeout,
                },
                clock.clone(),
            ),
            cab: CabinManager::new(config.id, config.door_hold, clock.clone()),
            outbox: Outbox::default(),
            clock,
        }
    }

    /// Initialize the state machine with the cabin's starting floor. Must be
    /// called once; asks the fleet for our pre-restart state.
    pub fn initialize(&mut self, time: LocalTime, floor: Floor) {
        self.clock.set(time);
        self.outbox.event(Event::Initializing);
        self.cab.initialize(floor);
        self.peermgr.initialize(self.cab.state().clone());

        self.outbox.broadcast(RestoreMessage {
            kind: RestoreKind::RequestingState,
            asker: Some(self.id),
            responder: None,
            state: None,
            calls: None,
        });
        info!(target: "fsm", "starting from floor {}", floor);
    }

    /// Advance the clock.
    pub fn tick(&mut self, now: LocalTime) {
        self.clock.set(now);
    }

    /// A validated message arrived from the network. Our own broadcasts are
    /// already handled on send and dropped here.
    pub fn message_received(&mut self, message: Message) {
        if message.sender() == Some(self.id) {
            return;
        }
        self.deliver(message);
    }

    /// A button press reported by the motion subsystem.
    pub fn button_pressed(&mut self, kind: ButtonKind, floor: Floor) {
        info!(target: "fsm", "{:?} pressed at floor {}", kind, floor);

        match kind {
            ButtonKind::HallUp | ButtonKind::HallDown => {
                let button = if kind == ButtonKind::HallUp {
                    HallButton::Up
                } else {
                    HallButton::Down
                };
                if !self.peermgr.is_active(&self.id) {
                    warn!(target: "fsm", "cannot accept hall calls while offline");
                } else {
                    match self.assign(floor, button) {
                        Ok(assigned_to) => self.ordermgr.claim(floor, button, assigned_to),
                        Err(err) => error!(target: "fsm", "rejecting hall call: {}", err),
                    }
                }
            }
            ButtonKind::Cabin => self.cab.cabin_button(floor),
            ButtonKind::Stop => {
                self.outbox.motor(Direction::Stop);
                self.outbox.light(Light::Stop { on: true });
                self.outbox.shutdown(ExitReason::StopButton);
            }
        }
        self.flush_backup();
    }

    /// The cabin arrived at a floor.
    pub fn floor_reached(&mut self, floor: Floor) {
        info!(target: "fsm", "reached floor {}", floor);

        if self.cab.floor_reached(floor, self.ordermgr.calls()) {
            self.ordermgr.complete_at_floor(floor);
        }
        self.flush_backup();
    }

    /// A requested wake fired: give every sub-system a chance to act on its
    /// expired deadlines.
    pub fn timer_expired(&mut self) {
        self.peermgr.timer_expired(self.cab.state());
        self.ordermgr.timer_expired(&self.peermgr, self.cab.state());
        self.cab.timer_expired(self.ordermgr.calls());
        self.flush_backup();
    }

    /// Create a draining iterator over the protocol outputs.
    pub fn drain(&mut self) -> Box<dyn Iterator<Item = Io> + '_> {
        Box::new(std::iter::from_fn(|| self.next()))
    }

    /// Pick an assignee for a hall call from the active fleet.
    fn assign(&self, floor: Floor, button: HallButton) -> Result<PeerId, AssignError> {
        cost::assign(
            self.peermgr.active_states(self.cab.state()),
            self.ordermgr.calls(),
            floor,
            button,
        )
    }

    /// Fold a message into the state, whether it came from the network or
    /// from our own broadcast loopback.
    fn deliver(&mut self, message: Message) {
        match message {
            Message::Restore(msg) => self.restore_received(msg),
            Message::Order(msg) => self.ordermgr.received(msg, &self.peermgr, &mut self.cab),
        }
        self.flush_backup();
    }

    fn restore_received(&mut self, msg: RestoreMessage) {
        match msg.kind {
            RestoreKind::IAmAlive => {
                if let Some(state) = msg.state {
                    self.peermgr.received_beacon(state);
                }
            }
            RestoreKind::BackupState => {
                if let (Some(responder), Some(state)) = (msg.responder, msg.state) {
                    if responder != state.id {
                        debug!(target: "fsm", "rejecting backup with inconsistent sender");
                        return;
                    }
                    self.ordermgr.backup_received(responder);
                    self.peermgr.received_backup(state);
                }
            }
            RestoreKind::RequestingState => {
                let Some(asker) = msg.asker else { return };
                if asker == self.id {
                    return;
                }
                info!(target: "fsm", "{}: asked for its previous state", asker);
                if let Some(record) = self.peermgr.record(&asker) {
                    info!(target: "fsm", "returning stored state to {}", asker);
                    self.outbox.write(
                        asker,
                        RestoreMessage {
                            kind: RestoreKind::RestoredStateReturned,
                            asker: Some(asker),
                            responder: Some(self.id),
                            state: Some(record.state.clone()),
                            calls: Some(self.ordermgr.calls().clone()),
                        },
                    );
                } else {
                    info!(target: "fsm", "no stored state for {}", asker);
                }
            }
            RestoreKind::RestoredStateReturned => {
                if msg.asker != Some(self.id) {
                    return;
                }
                let Some(responder) = msg.responder else { return };
                info!(target: "fsm", "{}: returned our previous state", responder);

                if let Some(calls) = &msg.calls {
                    self.ordermgr.restore(calls);
                }
                if let Some(state) = &msg.state {
                    self.cab.restore_cabin_calls(state);
                }
                self.outbox.event(Event::StateRestored(responder));
            }
        }
    }

    /// Broadcast a state backup whenever the cabin changed materially.
    fn flush_backup(&mut self) {
        if self.cab.take_dirty() {
            self.outbox.broadcast(RestoreMessage {
                kind: RestoreKind::BackupState,
                asker: None,
                responder: Some(self.id),
                state: Some(self.cab.state().clone()),
                calls: Some(self.ordermgr.calls().clone()),
            });
        }
    }
}

impl<C: Clock> Iterator for StateMachine<C> {
    type Item = Io;

    fn next(&mut self) -> Option<Io> {
        let next = self
            .outbox
            .next()
            .or_else(|| self.peermgr.next())
            .or_else(|| self.ordermgr.next())
            .or_else(|| self.cab.next());

        match next {
            Some(Io::Broadcast(message)) => {
                // A broadcast is also addressed to ourselves.
                self.deliver(message.clone());
                Some(Io::Broadcast(message))
            }
            other => other,
        }
    }
}
