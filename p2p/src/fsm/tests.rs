//! Protocol tests, driven through a simulated fleet: several state machines
//! wired back-to-back with instant broadcast delivery and a manually
//! advanced clock. Hardware is played by the tests themselves.
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};
use std::net::{IpAddr, Ipv4Addr};

use proptest::prelude::*;

use liftnet_common::calls::{CallMap, CallStatus, CallSummary};
use liftnet_common::elevator::{CabinCalls, Direction, ElevState, Floor, HallButton};
use liftnet_common::hardware::{ButtonKind, Light};
use liftnet_common::message::{Message, OrderKind, OrderMessage};
use liftnet_common::time::{Clock, LocalDuration, LocalTime, RefClock};
use liftnet_common::PeerId;

use super::{cost, Config, Event, ExitReason, Io, StateMachine};

fn ip(n: u8) -> PeerId {
    IpAddr::V4(Ipv4Addr::new(10, 0, 0, n))
}

fn ms(millis: u64) -> LocalDuration {
    LocalDuration::from_millis(millis)
}

fn config(id: PeerId) -> Config {
    Config {
        id,
        floors: 4,
        beacon_interval: ms(100),
        alive_limit: ms(310),
        ack_timeout: ms(500),
        order_timeout: LocalDuration::from_secs(5),
        order_timeout_jitter: ms(0),
        door_hold: LocalDuration::from_secs(3),
    }
}

struct Peer {
    sm: StateMachine<RefClock>,
    clock: RefClock,
    wakes: BinaryHeap<Reverse<LocalTime>>,
    motors: Vec<Direction>,
    lights: Vec<Light>,
    events: Vec<Event>,
    shutdown: Option<ExitReason>,
}

impl Peer {
    fn new(id: PeerId, time: LocalTime, floor: Floor) -> Self {
        let clock = RefClock::from(time);
        let mut sm = StateMachine::new(config(id), clock.clone(), fastrand::Rng::with_seed(7));
        sm.initialize(time, floor);

        Self {
            sm,
            clock,
            wakes: BinaryHeap::new(),
            motors: Vec::new(),
            lights: Vec::new(),
            events: Vec::new(),
            shutdown: None,
        }
    }
}

/// A simulated fleet on a lossless broadcast LAN.
struct Fleet {
    peers: BTreeMap<PeerId, Peer>,
    down: BTreeSet<PeerId>,
    time: LocalTime,
}

impl Fleet {
    fn new(count: u8) -> Self {
        let time = LocalTime::from_millis(1_000_000);
        let peers = (1..=count)
            .map(|n| (ip(n), Peer::new(ip(n), time, 0)))
            .collect();

        let mut fleet = Self {
            peers,
            down: BTreeSet::new(),
            time,
        };
        fleet.pump();
        // Let a couple of beacon rounds go out so everyone is active.
        fleet.elapse(ms(250));
        fleet
    }

    fn peer(&self, id: PeerId) -> &Peer {
        &self.peers[&id]
    }

    fn peer_mut(&mut self, id: PeerId) -> &mut Peer {
        self.peers.get_mut(&id).unwrap()
    }

    /// Route outputs between machines until the fleet is quiet.
    fn pump(&mut self) {
        enum Delivery {
            All,
            To(PeerId),
        }

        loop {
            let mut mail: Vec<(Delivery, Message)> = Vec::new();

            for (id, peer) in self.peers.iter_mut() {
                if self.down.contains(id) {
                    continue;
                }
                while let Some(io) = peer.sm.next() {
                    match io {
                        Io::Broadcast(message) => mail.push((Delivery::All, message)),
                        Io::Write(to, message) => mail.push((Delivery::To(to), message)),
                        Io::SetTimer(duration) => {
                            peer.wakes.push(Reverse(self.time + duration));
                        }
                        Io::Motor(direction) => peer.motors.push(direction),
                        Io::Light(light) => peer.lights.push(light),
                        Io::Event(event) => peer.events.push(event),
                        Io::Shutdown(reason) => peer.shutdown = Some(reason),
                    }
                }
            }
            if mail.is_empty() {
                break;
            }
            for (delivery, message) in mail {
                match delivery {
                    Delivery::To(target) => {
                        if !self.down.contains(&target) {
                            if let Some(peer) = self.peers.get_mut(&target) {
                                peer.sm.message_received(message);
                            }
                        }
                    }
                    Delivery::All => {
                        for (id, peer) in self.peers.iter_mut() {
                            if self.down.contains(id) {
                                continue;
                            }
                            peer.sm.message_received(message.clone());
                        }
                    }
                }
            }
        }
    }

    /// Advance simulated time, firing wakes as they come due.
    fn elapse(&mut self, duration: LocalDuration) {
        let deadline = self.time + duration;

        loop {
            let next = self
                .peers
                .iter()
                .filter(|(id, _)| !self.down.contains(*id))
                .filter_map(|(_, peer)| peer.wakes.peek().map(|Reverse(at)| *at))
                .min();

            match next {
                Some(at) if at <= deadline => {
                    if at > self.time {
                        self.time = at;
                    }
                    self.fire_wakes();
                }
                _ => break,
            }
        }
        self.time = deadline;
        for (id, peer) in self.peers.iter_mut() {
            if !self.down.contains(id) {
                peer.clock.set(deadline);
            }
        }
        self.pump();
    }

    fn fire_wakes(&mut self) {
        for (id, peer) in self.peers.iter_mut() {
            if self.down.contains(id) {
                continue;
            }
            peer.clock.set(self.time);

            let mut fired = false;
            while let Some(Reverse(at)) = peer.wakes.peek().copied() {
                if at > self.time {
                    break;
                }
                peer.wakes.pop();
                fired = true;
            }
            if fired {
                peer.sm.timer_expired();
            }
        }
        self.pump();
    }

    fn press(&mut self, id: PeerId, kind: ButtonKind, floor: Floor) {
        self.peer_mut(id).sm.button_pressed(kind, floor);
        self.pump();
    }

    fn arrive(&mut self, id: PeerId, floor: Floor) {
        self.peer_mut(id).sm.floor_reached(floor);
        self.pump();
    }

    /// Park a cabin at a floor: ride there, then wait out the doors.
    fn park(&mut self, id: PeerId, floor: Floor) {
        self.arrive(id, floor);
        self.elapse(LocalDuration::from_secs(4));
        self.peer_mut(id).motors.clear();
    }

    /// Take the peer off the network without telling anyone.
    fn crash(&mut self, id: PeerId) {
        self.down.insert(id);
    }

    fn revive(&mut self, id: PeerId) {
        self.down.remove(&id);
    }

    /// Replace a crashed peer with a freshly booted one at the given floor.
    fn restart(&mut self, id: PeerId, floor: Floor) {
        self.down.remove(&id);
        let peer = Peer::new(id, self.time, floor);
        self.peers.insert(id, peer);
        self.pump();
    }

    fn cell(&self, at: PeerId, floor: Floor, button: HallButton) -> CallSummary {
        *self.peer(at).sm.ordermgr.calls().get(floor, button)
    }

    fn state(&self, id: PeerId) -> ElevState {
        self.peer(id).sm.cab.state().clone()
    }

    fn last_motor(&self, id: PeerId) -> Option<Direction> {
        self.peer(id).motors.last().copied()
    }

    fn completions(&self, id: PeerId) -> usize {
        self.peer(id)
            .events
            .iter()
            .filter(|event| matches!(event, Event::CallCompleted { .. }))
            .count()
    }
}

#[test]
fn test_single_peer_serves_hall_call() {
    let mut fleet = Fleet::new(1);
    let a = ip(1);

    fleet.press(a, ButtonKind::HallUp, 2);
    let cell = fleet.cell(a, 2, HallButton::Up);
    assert_eq!(cell.status, CallStatus::UnderExecution);
    assert_eq!(cell.assigned_to, Some(a));

    // The idle cabin is kicked into motion via an immediate planning pass.
    fleet.elapse(ms(10));
    assert_eq!(fleet.last_motor(a), Some(Direction::Up));

    fleet.arrive(a, 1);
    assert_eq!(fleet.cell(a, 2, HallButton::Up).status, CallStatus::UnderExecution);

    fleet.arrive(a, 2);
    assert_eq!(fleet.last_motor(a), Some(Direction::Stop));
    assert_eq!(fleet.cell(a, 2, HallButton::Up).status, CallStatus::NotActive);
    assert!(fleet.peer(a).lights.contains(&Light::Hall {
        button: HallButton::Up,
        floor: 2,
        on: false,
    }));
    assert!(fleet.peer(a).lights.contains(&Light::Door { on: true }));
    assert_eq!(fleet.completions(a), 1);

    // Doors close after the hold time; no orders remain.
    fleet.elapse(LocalDuration::from_secs(4));
    assert!(fleet.state(a).is_idle());
    assert!(fleet.peer(a).events.contains(&Event::DoorClosed(2)));
}

#[test]
fn test_two_peer_assignment_picks_cheapest() {
    let mut fleet = Fleet::new(2);
    let (a, b) = (ip(1), ip(2));
    fleet.park(b, 3);

    // Floor 2 down: a is two floors away, b one.
    fleet.press(a, ButtonKind::HallDown, 2);

    for id in [a, b] {
        let cell = fleet.cell(id, 2, HallButton::Down);
        assert_eq!(cell.status, CallStatus::UnderExecution);
        assert_eq!(cell.assigned_to, Some(b));
    }

    fleet.elapse(ms(10));
    assert_eq!(fleet.last_motor(b), Some(Direction::Down));
    assert_eq!(fleet.last_motor(a), None);

    fleet.arrive(b, 2);
    for id in [a, b] {
        assert_eq!(fleet.cell(id, 2, HallButton::Down).status, CallStatus::NotActive);
        assert!(fleet.peer(id).lights.contains(&Light::Hall {
            button: HallButton::Down,
            floor: 2,
            on: false,
        }));
    }
}

#[test]
fn test_assignee_crash_triggers_reassignment() {
    let mut fleet = Fleet::new(2);
    let (a, b) = (ip(1), ip(2));
    fleet.park(b, 2);

    fleet.press(a, ButtonKind::HallUp, 3);
    assert_eq!(fleet.cell(a, 3, HallButton::Up).assigned_to, Some(b));

    fleet.crash(b);

    // b misses its beacons, a's doubled execution watchdog fires, and the
    // call is claimed again with a as the only candidate.
    fleet.elapse(LocalDuration::from_secs(11));
    assert!(!fleet.peer(a).sm.peermgr.is_active(&b));
    assert!(fleet
        .peer(a)
        .events
        .iter()
        .any(|event| matches!(event, Event::CallReassigned { assigned_to, .. } if *assigned_to == a)));

    let cell = fleet.cell(a, 3, HallButton::Up);
    assert_eq!(cell.status, CallStatus::UnderExecution);
    assert_eq!(cell.assigned_to, Some(a));
    assert_eq!(fleet.last_motor(a), Some(Direction::Up));

    fleet.arrive(a, 1);
    fleet.arrive(a, 2);
    fleet.arrive(a, 3);
    assert_eq!(fleet.cell(a, 3, HallButton::Up).status, CallStatus::NotActive);
    assert_eq!(fleet.completions(a), 1);
}

#[test]
fn test_beacon_flap_updates_membership() {
    let mut fleet = Fleet::new(3);
    let (a, c) = (ip(1), ip(3));

    assert!(fleet.peer(a).sm.peermgr.is_active(&c));

    fleet.crash(c);
    fleet.elapse(ms(400));
    assert!(!fleet.peer(a).sm.peermgr.is_active(&c));
    assert!(fleet.peer(a).events.contains(&Event::PeerLost(c)));

    fleet.revive(c);
    fleet.elapse(ms(200));
    assert!(fleet.peer(a).sm.peermgr.is_active(&c));
    assert_eq!(
        fleet
            .peer(a)
            .events
            .iter()
            .filter(|event| **event == Event::PeerActive(c))
            .count(),
        2
    );
}

#[test]
fn test_call_survives_assignee_beacon_flap() {
    let mut fleet = Fleet::new(3);
    let (a, c) = (ip(1), ip(3));
    fleet.park(c, 1);

    // c is closest to floor 2 and gets the call.
    fleet.press(a, ButtonKind::HallUp, 2);
    assert_eq!(fleet.cell(a, 2, HallButton::Up).assigned_to, Some(c));
    fleet.elapse(ms(10));

    // A short network flap: c drops out of the active set and returns. Its
    // backups then refresh the execution watchdogs, and the call resolves.
    fleet.crash(c);
    fleet.elapse(ms(400));
    assert!(!fleet.peer(a).sm.peermgr.is_active(&c));
    fleet.revive(c);
    fleet.elapse(ms(200));
    assert!(fleet.peer(a).sm.peermgr.is_active(&c));

    fleet.arrive(c, 2);
    for id in [a, c] {
        assert_eq!(fleet.cell(id, 2, HallButton::Up).status, CallStatus::NotActive);
    }
}

#[test]
fn test_restart_restores_cabin_calls_and_hall_map() {
    let mut fleet = Fleet::new(2);
    let (a, b) = (ip(1), ip(2));
    fleet.park(a, 2);
    fleet.park(b, 3);

    // a queues two cabin calls; b remembers them via backups.
    fleet.press(a, ButtonKind::Cabin, 1);
    fleet.press(a, ButtonKind::Cabin, 3);

    // A hall call served by b, so the restarted a has something to adopt.
    fleet.press(b, ButtonKind::HallUp, 0);
    assert_eq!(fleet.cell(b, 0, HallButton::Up).assigned_to, Some(b));

    fleet.crash(a);
    fleet.restart(a, 2);

    let restored = fleet.state(a).cabin_calls;
    assert!(restored.contains(1));
    assert!(restored.contains(3));
    assert!(fleet
        .peer(a)
        .events
        .iter()
        .any(|event| matches!(event, Event::StateRestored(by) if *by == b)));
    assert!(fleet.peer(a).lights.contains(&Light::Cabin { floor: 1, on: true }));

    // The cell b is executing was adopted and lit.
    let cell = fleet.cell(a, 0, HallButton::Up);
    assert_eq!(cell.status, CallStatus::UnderExecution);
    assert_eq!(cell.assigned_to, Some(b));
    assert!(fleet.peer(a).lights.contains(&Light::Hall {
        button: HallButton::Up,
        floor: 0,
        on: true,
    }));
}

#[test]
fn test_duplicate_press_serves_once() {
    let mut fleet = Fleet::new(2);
    let (a, b) = (ip(1), ip(2));

    // a's claim reaches everyone first; b presses the same button while the
    // call is already outstanding.
    fleet.press(a, ButtonKind::HallUp, 1);
    fleet.press(b, ButtonKind::HallUp, 1);

    let assigned = fleet.cell(a, 1, HallButton::Up).assigned_to;
    assert_eq!(fleet.cell(b, 1, HallButton::Up).assigned_to, assigned);
    assert_eq!(assigned, Some(a));

    // b's stray claim is ignored by every cell that has already advanced;
    // nothing retransmits and nothing double-assigns.
    fleet.elapse(ms(600));
    assert_eq!(fleet.cell(a, 1, HallButton::Up).status, CallStatus::UnderExecution);

    fleet.arrive(a, 1);
    assert_eq!(fleet.completions(a), 1);
    assert_eq!(fleet.completions(b), 1);
    assert_eq!(fleet.cell(b, 1, HallButton::Up).status, CallStatus::NotActive);
}

#[test]
fn test_duplicate_delivery_is_idempotent() {
    let mut fleet = Fleet::new(2);
    let (a, b) = (ip(1), ip(2));

    let claim = Message::Order(OrderMessage {
        kind: OrderKind::NewOrder,
        floor: 2,
        button: HallButton::Up,
        assigned_to: b,
        origin: b,
        sender: b,
    });

    fleet.peer_mut(a).sm.message_received(claim.clone());
    fleet.pump();
    let calls_before = fleet.peer(a).sm.ordermgr.calls().clone();
    let state_before = fleet.state(a);

    fleet.peer_mut(a).sm.message_received(claim);
    fleet.pump();
    assert_eq!(*fleet.peer(a).sm.ordermgr.calls(), calls_before);
    assert_eq!(fleet.state(a), state_before);
}

#[test]
fn test_late_ack_for_passed_phase_is_dropped() {
    let mut fleet = Fleet::new(2);
    let (a, b) = (ip(1), ip(2));

    fleet.press(a, ButtonKind::HallUp, 3);
    let before = fleet.cell(a, 3, HallButton::Up);
    assert_eq!(before.status, CallStatus::UnderExecution);

    // A claim ack arriving after the commit round must not restart it.
    let stale = Message::Order(OrderMessage {
        kind: OrderKind::AckNewOrder,
        floor: 3,
        button: HallButton::Up,
        assigned_to: before.assigned_to.unwrap(),
        origin: a,
        sender: b,
    });
    fleet.peer_mut(a).sm.message_received(stale);
    fleet.pump();

    assert_eq!(fleet.cell(a, 3, HallButton::Up), before);
}

#[test]
fn test_confirmed_catch_up_for_missed_claim() {
    let mut fleet = Fleet::new(2);
    let (a, b) = (ip(1), ip(2));

    // a never saw the claim round; a confirmation for a call assigned to b
    // still lands in its map.
    let confirm = Message::Order(OrderMessage {
        kind: OrderKind::OrderConfirmed,
        floor: 1,
        button: HallButton::Down,
        assigned_to: b,
        origin: b,
        sender: b,
    });
    fleet.peer_mut(a).sm.message_received(confirm);
    fleet.pump();

    let cell = fleet.cell(a, 1, HallButton::Down);
    assert_eq!(cell.status, CallStatus::UnderExecution);
    assert_eq!(cell.assigned_to, Some(b));
}

#[test]
fn test_stuck_assignee_declares_itself_dead() {
    let mut fleet = Fleet::new(2);
    let (a, b) = (ip(1), ip(2));
    fleet.park(b, 2);

    fleet.press(a, ButtonKind::HallUp, 3);
    assert_eq!(fleet.cell(b, 3, HallButton::Up).assigned_to, Some(b));

    // Cut b off so its backups stop refreshing its own watchdog, then let
    // its single execution timeout expire without the cabin moving. The
    // reactor stops dispatching at the shutdown, and so do we.
    fleet.crash(b);
    let time = fleet.time + LocalDuration::from_secs(6);
    let b_peer = fleet.peers.get_mut(&b).unwrap();
    b_peer.clock.set(time);
    b_peer.wakes.clear();
    b_peer.sm.timer_expired();
    while let Some(io) = b_peer.sm.next() {
        match io {
            Io::Motor(direction) => b_peer.motors.push(direction),
            Io::Shutdown(reason) => {
                b_peer.shutdown = Some(reason);
                break;
            }
            _ => {}
        }
    }

    assert_eq!(fleet.peer(b).shutdown, Some(ExitReason::WatchdogExpired));
    assert_eq!(fleet.peer(b).motors.last(), Some(&Direction::Stop));
}

#[test]
fn test_stop_button_halts_and_exits() {
    let mut fleet = Fleet::new(1);
    let a = ip(1);

    fleet.press(a, ButtonKind::Stop, 0);
    assert_eq!(fleet.peer(a).shutdown, Some(ExitReason::StopButton));
    assert_eq!(fleet.last_motor(a), Some(Direction::Stop));
    assert!(fleet.peer(a).lights.contains(&Light::Stop { on: true }));
}

#[test]
fn test_offline_peer_rejects_hall_calls() {
    let mut fleet = Fleet::new(2);
    let a = ip(1);

    // Freeze a long enough for it to fall out of its own active set.
    fleet.crash(a);
    let frozen = fleet.time + LocalDuration::from_secs(2);
    {
        let peer = fleet.peers.get_mut(&a).unwrap();
        peer.clock.set(frozen);
        peer.sm.timer_expired();
        peer.sm.button_pressed(ButtonKind::HallUp, 2);
        while peer.sm.next().is_some() {}
    }
    assert_eq!(
        fleet.cell(a, 2, HallButton::Up).status,
        CallStatus::NotActive
    );
}

fn arbitrary_state(rng: &mut fastrand::Rng, id: PeerId, floors: usize) -> ElevState {
    let mut cabin_calls = CabinCalls::default();
    for floor in 0..floors {
        if rng.bool() {
            cabin_calls.set(floor);
        }
    }
    let direction = match rng.u8(..3) {
        0 => Direction::Up,
        1 => Direction::Stop,
        _ => Direction::Down,
    };

    ElevState {
        id,
        last_floor: rng.usize(..floors),
        direction,
        is_moving: rng.bool(),
        door_open: rng.bool(),
        cabin_calls,
    }
}

fn arbitrary_calls(rng: &mut fastrand::Rng, peers: &[PeerId], floors: usize) -> CallMap {
    let mut calls = CallMap::new(floors);
    for floor in 0..floors {
        for button in HallButton::ALL {
            if rng.u8(..4) == 0 {
                *calls.get_mut(floor, button) = CallSummary {
                    status: CallStatus::UnderExecution,
                    assigned_to: Some(peers[rng.usize(..peers.len())]),
                };
            }
        }
    }
    calls
}

proptest! {
    /// The assignment function returns the same peer no matter what order
    /// the candidates are offered in: the property every peer relies on to
    /// agree without coordination.
    #[test]
    fn prop_assignment_is_deterministic(seed in any::<u64>(), count in 1u8..5) {
        let mut rng = fastrand::Rng::with_seed(seed);
        let floors = 4;
        let ids: Vec<PeerId> = (1..=count).map(ip).collect();
        let states: Vec<(PeerId, ElevState)> = ids
            .iter()
            .map(|id| (*id, arbitrary_state(&mut rng, *id, floors)))
            .collect();
        let calls = arbitrary_calls(&mut rng, &ids, floors);
        let floor = rng.usize(..floors);
        let button = if rng.bool() { HallButton::Up } else { HallButton::Down };

        let forward = cost::assign(states.iter().map(|(id, s)| (id, s)), &calls, floor, button);
        let reverse = cost::assign(states.iter().rev().map(|(id, s)| (id, s)), &calls, floor, button);

        prop_assert_eq!(forward, reverse);
    }

    /// Delivering the same order message twice leaves the hall-call map
    /// exactly where one delivery left it.
    #[test]
    fn prop_order_messages_are_idempotent(seed in any::<u64>(), kind in 0u8..7) {
        let mut rng = fastrand::Rng::with_seed(seed);
        let mut fleet = Fleet::new(2);
        let (a, b) = (ip(1), ip(2));

        let message = Message::Order(OrderMessage {
            kind: OrderKind::try_from(kind + 4).unwrap(),
            floor: rng.usize(..4),
            button: if rng.bool() { HallButton::Up } else { HallButton::Down },
            assigned_to: if rng.bool() { a } else { b },
            origin: b,
            sender: b,
        });

        fleet.peer_mut(a).sm.message_received(message.clone());
        fleet.pump();
        let calls = fleet.peer(a).sm.ordermgr.calls().clone();
        let state = fleet.state(a);

        fleet.peer_mut(a).sm.message_received(message);
        fleet.pump();

        prop_assert_eq!(fleet.peer(a).sm.ordermgr.calls(), &calls);
        prop_assert_eq!(fleet.state(a), state);
    }
}
