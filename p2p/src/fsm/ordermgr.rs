//! Replicated hall-call order management.
//!
//! One cell exists per (floor, hall direction). A cell moves `NotActive` →
//! `Awaiting` → `UnderExecution` → `NotActive`, driven by three
//! acknowledgement rounds over broadcast: the originator claims the call
//! with `NewOrder`, commits it with `OrderConfirmed` once every active peer
//! acked the claim, and then watches for `OrderDone` from the assignee.
//! Every transition is guarded by the cell's current status, which makes
//! message delivery idempotent and lets ack-round timeouts retransmit the
//! same message without advancing a phase.
//!
//! Execution watchdogs are asymmetric: the assignee times out after one
//! order timeout, everyone else after two. A stuck assignee therefore
//! declares itself dead before any peer tries to reassign its call, and the
//! first remaining peer to time out becomes the originator of a
//! `ReassignOrder` round.
use std::collections::{BTreeSet, HashMap};

use log::*;

use liftnet_common::calls::{CallMap, CallStatus, CallSummary};
use liftnet_common::elevator::{Direction, ElevState, Floor, HallButton};
use liftnet_common::hardware::Light;
use liftnet_common::message::{OrderKind, OrderMessage};
use liftnet_common::time::{Clock, LocalDuration, LocalTime};
use liftnet_common::PeerId;

use super::cabmgr::CabinManager;
use super::cost;
use super::event::Event;
use super::motion;
use super::output::{ExitReason, Io, Outbox};
use super::peermgr::PeerManager;

/// Order manager configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Local peer id.
    pub id: PeerId,
    /// Number of floors served.
    pub floors: usize,
    /// Acknowledgement round timeout.
    pub ack_timeout: LocalDuration,
    /// Execution watchdog timeout, jitter already applied.
    pub order_timeout: LocalDuration,
}

/// What an armed cell deadline is waiting for.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Await {
    /// `AckNewOrder` from every active peer.
    NewOrderAcks,
    /// `AckOrderConfirmed` from every active peer.
    ConfirmedAcks,
    /// `OrderDone` from the assignee.
    Execution,
}

#[derive(Debug, Copy, Clone)]
struct Deadline {
    at: LocalTime,
    awaiting: Await,
}

/// Retransmit state for a served call whose `OrderDone` has not yet been
/// acknowledged by every active peer. Kept outside the cells: the cell
/// itself is already `NotActive` at this point.
#[derive(Debug, Clone)]
struct DoneRetry {
    assigned_to: PeerId,
    origin: PeerId,
    acked: BTreeSet<PeerId>,
    at: LocalTime,
}

type CellId = (Floor, HallButton);

/// Manages the hall-call cells and their acknowledgement rounds.
#[derive(Debug)]
pub struct OrderManager<C> {
    config: Config,
    calls: CallMap,
    acks: HashMap<CellId, BTreeSet<PeerId>>,
    deadlines: HashMap<CellId, Deadline>,
    done_retries: HashMap<CellId, DoneRetry>,
    outbox: Outbox,
    clock: C,
}

impl<C> Iterator for OrderManager<C> {
    type Item = Io;

    fn next(&mut self) -> Option<Io> {
        self.outbox.next()
    }
}

impl<C: Clock> OrderManager<C> {
    /// Create a new order manager.
    pub fn new(config: Config, clock: C) -> Self {
        let calls = CallMap::new(config.floors);

        Self {
            config,
            calls,
            acks: HashMap::new(),
            deadlines: HashMap::new(),
            done_retries: HashMap::new(),
            outbox: Outbox::default(),
            clock,
        }
    }

    /// The shared hall-call map.
    pub fn calls(&self) -> &CallMap {
        &self.calls
    }

    /// Start a claim round for a hall call, as its originator. The claim
    /// timer is armed when our own broadcast is delivered back and moves the
    /// cell to `Awaiting`; a claim for an already-active cell dies quietly.
    pub fn claim(&mut self, floor: Floor, button: HallButton, assigned_to: PeerId) {
        let message = self.message(OrderKind::NewOrder, floor, button, assigned_to, self.config.id);
        self.outbox.broadcast(message);
    }

    /// Handle an inbound order-protocol message. Called for our own
    /// broadcasts too, as they are delivered back to us on send.
    pub fn received(
        &mut self,
        msg: OrderMessage,
        peers: &PeerManager<C>,
        cab: &mut CabinManager<C>,
    ) {
        let cell = (msg.floor, msg.button);

        match msg.kind {
            OrderKind::NewOrder => self.new_order(cell, &msg),
            OrderKind::AckNewOrder => self.ack_new_order(cell, &msg, peers),
            OrderKind::OrderConfirmed => self.order_confirmed(cell, &msg, cab),
            OrderKind::AckOrderConfirmed => self.ack_order_confirmed(cell, &msg, peers),
            OrderKind::OrderDone => self.order_done(cell, &msg),
            OrderKind::AckOrderDone => self.ack_order_done(cell, &msg, peers),
            OrderKind::ReassignOrder => self.reassign_order(cell, msg, peers, cab),
        }
    }

    fn new_order(&mut self, cell: CellId, msg: &OrderMessage) {
        match self.calls.status(msg.floor, msg.button) {
            CallStatus::NotActive => {
                debug!(
                    target: "order",
                    "claiming {} at floor {} for {}", msg.button, msg.floor, msg.assigned_to
                );
                *self.calls.get_mut(msg.floor, msg.button) = CallSummary {
                    status: CallStatus::Awaiting,
                    assigned_to: Some(msg.assigned_to),
                };
                self.acks.remove(&cell);

                if msg.origin == self.config.id {
                    self.arm(cell, Await::NewOrderAcks, self.config.ack_timeout);
                    self.outbox.event(Event::CallAccepted {
                        floor: msg.floor,
                        button: msg.button,
                        assigned_to: msg.assigned_to,
                    });
                }
                let ack = self.ack(OrderKind::AckNewOrder, msg);
                self.outbox.broadcast(ack);
            }
            CallStatus::Awaiting | CallStatus::UnderExecution => {
                debug!(
                    target: "order",
                    "ignoring claim of already-active {} at floor {}", msg.button, msg.floor
                );
            }
        }
    }

    fn ack_new_order(&mut self, cell: CellId, msg: &OrderMessage, peers: &PeerManager<C>) {
        if msg.origin != self.config.id {
            return;
        }
        match self.calls.status(msg.floor, msg.button) {
            CallStatus::Awaiting => {
                self.acks.entry(cell).or_default().insert(msg.sender);

                if self.all_acked(cell, peers.active()) {
                    debug!(
                        target: "order",
                        "claim of {} at floor {} acked by all active peers; confirming",
                        msg.button, msg.floor
                    );
                    self.acks.remove(&cell);
                    self.arm(cell, Await::ConfirmedAcks, self.config.ack_timeout);
                    let message = self.message(
                        OrderKind::OrderConfirmed,
                        msg.floor,
                        msg.button,
                        msg.assigned_to,
                        msg.origin,
                    );
                    self.outbox.broadcast(message);
                }
            }
            status => {
                debug!(target: "order", "stale claim ack for {:?} cell; dropping", status);
            }
        }
    }

    fn order_confirmed(&mut self, cell: CellId, msg: &OrderMessage, cab: &mut CabinManager<C>) {
        match self.calls.status(msg.floor, msg.button) {
            CallStatus::NotActive => {
                // We missed the claim round. Catch up, unless the call is
                // ours to serve, in which case the originator's watchdog
                // will hand it back eventually.
                if msg.sender != self.config.id && msg.assigned_to != self.config.id {
                    debug!(
                        target: "order",
                        "catching up on confirmed {} at floor {}", msg.button, msg.floor
                    );
                    *self.calls.get_mut(msg.floor, msg.button) = CallSummary {
                        status: CallStatus::UnderExecution,
                        assigned_to: Some(msg.assigned_to),
                    };
                    self.acks.remove(&cell);
                    self.arm(cell, Await::Execution, self.config.order_timeout * 2);
                }
            }
            CallStatus::Awaiting => {
                let ack = self.ack(OrderKind::AckOrderConfirmed, msg);
                self.outbox.broadcast(ack);

                *self.calls.get_mut(msg.floor, msg.button) = CallSummary {
                    status: CallStatus::UnderExecution,
                    assigned_to: Some(msg.assigned_to),
                };
                self.acks.remove(&cell);
                self.outbox.event(Event::CallConfirmed {
                    floor: msg.floor,
                    button: msg.button,
                    assigned_to: msg.assigned_to,
                });

                if msg.assigned_to == self.config.id {
                    self.serve_or_light(msg, cab);
                } else {
                    self.outbox.light(Light::Hall {
                        button: msg.button,
                        floor: msg.floor,
                        on: true,
                    });
                }

                // The originator arms its watchdog once the commit round is
                // fully acked; everyone else starts watching now.
                if msg.origin != self.config.id
                    && self.calls.status(msg.floor, msg.button) == CallStatus::UnderExecution
                {
                    self.arm(cell, Await::Execution, self.exec_timeout(msg.assigned_to));
                }
            }
            CallStatus::UnderExecution => {
                let ack = self.ack(OrderKind::AckOrderConfirmed, msg);
                self.outbox.broadcast(ack);

                let assigned_to = self.calls.get(msg.floor, msg.button).assigned_to;
                if assigned_to != Some(msg.assigned_to) {
                    warn!(
                        target: "order",
                        "{} at floor {} is executed by {:?} but {} confirmed it for {}",
                        msg.button, msg.floor, assigned_to, msg.sender, msg.assigned_to
                    );
                }
            }
        }
    }

    /// A call assigned to us was confirmed: serve it on the spot when the
    /// cabin is already where it should be, otherwise light the lamp and
    /// make sure an idle cabin starts moving.
    fn serve_or_light(&mut self, msg: &OrderMessage, cab: &mut CabinManager<C>) {
        let cell = (msg.floor, msg.button);
        let at_floor = cab.state().last_floor == msg.floor;
        let standing_here = !cab.state().is_moving
            && at_floor
            && (motion::next_direction(cab.state(), &self.calls) == Direction::Stop
                || motion::next_call_direction(cab.state(), &self.calls) == Some(msg.button));

        if (cab.state().is_idle() && at_floor) || standing_here {
            self.clear_cell(cell);
            cab.open_doors();
            debug!(
                target: "order",
                "serving {} at floor {} on the spot", msg.button, msg.floor
            );
            let done = self.message(
                OrderKind::OrderDone,
                msg.floor,
                msg.button,
                msg.assigned_to,
                msg.origin,
            );
            self.outbox.broadcast(done);
        } else {
            self.outbox.light(Light::Hall {
                button: msg.button,
                floor: msg.floor,
                on: true,
            });
            if cab.state().is_idle() && !cab.state().door_open {
                cab.replan();
            }
        }
    }

    fn ack_order_confirmed(&mut self, cell: CellId, msg: &OrderMessage, peers: &PeerManager<C>) {
        if msg.origin != self.config.id {
            return;
        }
        match self.calls.status(msg.floor, msg.button) {
            CallStatus::UnderExecution => {
                self.acks.entry(cell).or_default().insert(msg.sender);

                if self.all_acked(cell, peers.active()) {
                    info!(
                        target: "order",
                        "{} at floor {} confirmed by all active peers", msg.button, msg.floor
                    );
                    self.acks.remove(&cell);
                    self.arm(cell, Await::Execution, self.exec_timeout(msg.assigned_to));
                }
            }
            status => {
                debug!(target: "order", "stale confirm ack for {:?} cell; dropping", status);
            }
        }
    }

    fn order_done(&mut self, cell: CellId, msg: &OrderMessage) {
        if self.calls.status(msg.floor, msg.button) != CallStatus::NotActive {
            info!(
                target: "order",
                "{} is done with {} at floor {}", msg.assigned_to, msg.button, msg.floor
            );
            self.outbox.event(Event::CallCompleted {
                floor: msg.floor,
                button: msg.button,
                assigned_to: msg.assigned_to,
            });
        }
        self.clear_cell(cell);
        self.outbox.light(Light::Hall {
            button: msg.button,
            floor: msg.floor,
            on: false,
        });
        let ack = self.ack(OrderKind::AckOrderDone, msg);
        self.outbox.broadcast(ack);

        if msg.assigned_to == self.config.id {
            // Keep resending the completion until every active peer acked.
            let at = self.clock.local_time() + self.config.ack_timeout;
            self.done_retries
                .entry(cell)
                .and_modify(|retry| retry.at = at)
                .or_insert(DoneRetry {
                    assigned_to: msg.assigned_to,
                    origin: msg.origin,
                    acked: BTreeSet::new(),
                    at,
                });
            self.outbox.set_timer(self.config.ack_timeout);
        }
    }

    fn ack_order_done(&mut self, cell: CellId, msg: &OrderMessage, peers: &PeerManager<C>) {
        if msg.assigned_to != self.config.id {
            return;
        }
        if let Some(retry) = self.done_retries.get_mut(&cell) {
            retry.acked.insert(msg.sender);

            if peers.active().iter().all(|id| retry.acked.contains(id)) {
                debug!(
                    target: "order",
                    "completion of {} at floor {} acked by all active peers",
                    msg.button, msg.floor
                );
                self.done_retries.remove(&cell);
            }
        }
    }

    fn reassign_order(
        &mut self,
        cell: CellId,
        msg: OrderMessage,
        peers: &PeerManager<C>,
        cab: &mut CabinManager<C>,
    ) {
        match self.calls.status(msg.floor, msg.button) {
            CallStatus::NotActive | CallStatus::Awaiting => {
                debug!(
                    target: "order",
                    "ignoring reassignment of inactive {} at floor {}", msg.button, msg.floor
                );
            }
            CallStatus::UnderExecution => {
                info!(
                    target: "order",
                    "{} at floor {} reassigned to {}", msg.button, msg.floor, msg.assigned_to
                );
                self.clear_cell(cell);
                self.outbox.event(Event::CallReassigned {
                    floor: msg.floor,
                    button: msg.button,
                    assigned_to: msg.assigned_to,
                });
                // Re-enter the claim round as if the reassigner had just
                // claimed the call afresh.
                self.received(
                    OrderMessage {
                        kind: OrderKind::NewOrder,
                        ..msg
                    },
                    peers,
                    cab,
                );
            }
        }
    }

    /// The cabin stopped at a floor: complete every hall call there that is
    /// ours to serve.
    pub fn complete_at_floor(&mut self, floor: Floor) {
        for button in HallButton::ALL {
            if self.calls.get(floor, button).executed_by(self.config.id) {
                let done = self.message(
                    OrderKind::OrderDone,
                    floor,
                    button,
                    self.config.id,
                    self.config.id,
                );
                self.outbox.broadcast(done);
            }
        }
    }

    /// Adopt outstanding calls reported by a restore reply: cells another
    /// peer is executing get lit and watched here, with the conservative
    /// double timeout.
    pub fn restore(&mut self, map: &CallMap) {
        for (floor, button, summary) in map.iter() {
            if summary.status != CallStatus::UnderExecution {
                continue;
            }
            if summary.assigned_to == Some(self.config.id) {
                continue;
            }
            if self.calls.status(floor, button) != CallStatus::NotActive {
                continue;
            }
            debug!(
                target: "order",
                "adopting restored {} at floor {} executed by {:?}",
                button, floor, summary.assigned_to
            );
            *self.calls.get_mut(floor, button) = *summary;
            self.acks.remove(&(floor, button));
            self.outbox.light(Light::Hall {
                button,
                floor,
                on: true,
            });
            self.arm((floor, button), Await::Execution, self.config.order_timeout * 2);
        }
    }

    /// A state backup from `responder` landed: the calls it still executes
    /// are making progress, so their watchdogs start over.
    pub fn backup_received(&mut self, responder: PeerId) {
        let refresh: Vec<CellId> = self
            .calls
            .iter()
            .filter(|(floor, button, summary)| {
                summary.executed_by(responder)
                    && self
                        .deadlines
                        .get(&(*floor, *button))
                        .map_or(false, |deadline| deadline.awaiting == Await::Execution)
            })
            .map(|(floor, button, _)| (floor, button))
            .collect();

        for cell in refresh {
            debug!(
                target: "order",
                "refreshing execution watchdog on {} at floor {}", cell.1, cell.0
            );
            self.arm(cell, Await::Execution, self.exec_timeout(responder));
        }
    }

    /// A wake was received: act on every expired deadline.
    pub fn timer_expired(&mut self, peers: &PeerManager<C>, cab: &ElevState) {
        let now = self.clock.local_time();

        let due: Vec<(CellId, Await)> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| deadline.at <= now)
            .map(|(cell, deadline)| (*cell, deadline.awaiting))
            .collect();

        for (cell, awaiting) in due {
            self.deadlines.remove(&cell);
            let (floor, button) = cell;

            match awaiting {
                Await::NewOrderAcks => {
                    if self.calls.status(floor, button) != CallStatus::Awaiting {
                        debug!(target: "order", "claim round overtaken; dropping retry");
                        continue;
                    }
                    if let Some(assigned_to) = self.calls.get(floor, button).assigned_to {
                        warn!(
                            target: "order",
                            "claim of {} at floor {} not acked by all active peers; resending",
                            button, floor
                        );
                        self.arm(cell, Await::NewOrderAcks, self.config.ack_timeout);
                        let message = self.message(
                            OrderKind::NewOrder,
                            floor,
                            button,
                            assigned_to,
                            self.config.id,
                        );
                        self.outbox.broadcast(message);
                    }
                }
                Await::ConfirmedAcks => {
                    if self.calls.status(floor, button) != CallStatus::UnderExecution {
                        debug!(target: "order", "confirm round overtaken; dropping retry");
                        continue;
                    }
                    if let Some(assigned_to) = self.calls.get(floor, button).assigned_to {
                        warn!(
                            target: "order",
                            "confirmation of {} at floor {} not acked by all active peers; resending",
                            button, floor
                        );
                        self.arm(cell, Await::ConfirmedAcks, self.config.ack_timeout);
                        let message = self.message(
                            OrderKind::OrderConfirmed,
                            floor,
                            button,
                            assigned_to,
                            self.config.id,
                        );
                        self.outbox.broadcast(message);
                    }
                }
                Await::Execution => self.execution_expired(cell, peers, cab),
            }
        }

        let due_done: Vec<CellId> = self
            .done_retries
            .iter()
            .filter(|(_, retry)| retry.at <= now)
            .map(|(cell, _)| *cell)
            .collect();

        for cell in due_done {
            let retry = &self.done_retries[&cell];
            if peers.active().iter().all(|id| retry.acked.contains(id)) {
                self.done_retries.remove(&cell);
                continue;
            }
            warn!(
                target: "order",
                "completion of {} at floor {} not acked by all active peers; resending",
                cell.1, cell.0
            );
            let message = self.message(
                OrderKind::OrderDone,
                cell.0,
                cell.1,
                retry.assigned_to,
                retry.origin,
            );
            let at = now + self.config.ack_timeout;
            if let Some(retry) = self.done_retries.get_mut(&cell) {
                retry.at = at;
            }
            self.outbox.set_timer(self.config.ack_timeout);
            self.outbox.broadcast(message);
        }
    }

    /// An execution watchdog fired. A stuck assignee takes itself out of the
    /// fleet; everyone else hands the call to the cheapest remaining peer.
    fn execution_expired(&mut self, cell: CellId, peers: &PeerManager<C>, cab: &ElevState) {
        let (floor, button) = cell;
        if self.calls.status(floor, button) != CallStatus::UnderExecution {
            return;
        }
        let assigned_to = self.calls.get(floor, button).assigned_to;

        if assigned_to == Some(self.config.id) {
            error!(
                target: "order",
                "failed to serve {} at floor {} in time; shutting down", button, floor
            );
            self.outbox.motor(Direction::Stop);
            self.outbox.shutdown(ExitReason::WatchdogExpired);
            return;
        }
        info!(
            target: "order",
            "{} at floor {} was not served in time; picking a new assignee", button, floor
        );
        match cost::assign(peers.active_states(cab), &self.calls, floor, button) {
            Ok(assigned_to) => {
                let message = self.message(
                    OrderKind::ReassignOrder,
                    floor,
                    button,
                    assigned_to,
                    self.config.id,
                );
                self.outbox.broadcast(message);
            }
            Err(err) => {
                // Nobody to hand it to right now; try again in a while.
                error!(target: "order", "cannot reassign {} at floor {}: {}", button, floor, err);
                self.arm(cell, Await::Execution, self.config.order_timeout);
            }
        }
    }

    fn all_acked(&self, cell: CellId, active: &BTreeSet<PeerId>) -> bool {
        let acked = self.acks.get(&cell);
        active
            .iter()
            .all(|id| acked.map_or(false, |set| set.contains(id)))
    }

    fn arm(&mut self, cell: CellId, awaiting: Await, timeout: LocalDuration) {
        self.deadlines.insert(
            cell,
            Deadline {
                at: self.clock.local_time() + timeout,
                awaiting,
            },
        );
        self.outbox.set_timer(timeout);
    }

    fn clear_cell(&mut self, cell: CellId) {
        *self.calls.get_mut(cell.0, cell.1) = CallSummary::default();
        self.acks.remove(&cell);
        self.deadlines.remove(&cell);
    }

    fn exec_timeout(&self, assigned_to: PeerId) -> LocalDuration {
        if assigned_to == self.config.id {
            self.config.order_timeout
        } else {
            self.config.order_timeout * 2
        }
    }

    fn message(
        &self,
        kind: OrderKind,
        floor: Floor,
        button: HallButton,
        assigned_to: PeerId,
        origin: PeerId,
    ) -> OrderMessage {
        OrderMessage {
            kind,
            floor,
            button,
            assigned_to,
            origin,
            sender: self.config.id,
        }
    }

    fn ack(&self, kind: OrderKind, msg: &OrderMessage) -> OrderMessage {
        self.message(kind, msg.floor, msg.button, msg.assigned_to, msg.origin)
    }
}
