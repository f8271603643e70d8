//! Peer registry and liveness tracking.
//!
//! Every peer ever heard from is remembered in `known`; the `active` set is
//! the derived subset whose last beacon is younger than the alive limit. A
//! peer record is never destroyed, so a restarted peer can get its previous
//! state back from anyone who remembers it.
use std::collections::{BTreeMap, BTreeSet};

use log::*;

use liftnet_common::elevator::ElevState;
use liftnet_common::message::{RestoreKind, RestoreMessage};
use liftnet_common::time::{Clock, LocalDuration, LocalTime};
use liftnet_common::PeerId;

use super::event::Event;
use super::output::{Io, Outbox};

/// A peer as remembered by the registry.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    /// Last cabin state the peer reported.
    pub state: ElevState,
    /// When we last heard from the peer.
    pub last_beacon: LocalTime,
}

/// Tracks known peers and derives the live subset.
#[derive(Debug)]
pub struct PeerManager<C> {
    id: PeerId,
    beacon_interval: LocalDuration,
    alive_limit: LocalDuration,
    known: BTreeMap<PeerId, PeerRecord>,
    active: BTreeSet<PeerId>,
    last_beacon_sent: LocalTime,
    last_alive_check: LocalTime,
    outbox: Outbox,
    clock: C,
}

impl<C> Iterator for PeerManager<C> {
    type Item = Io;

    fn next(&mut self) -> Option<Io> {
        self.outbox.next()
    }
}

impl<C: Clock> PeerManager<C> {
    /// Create a new peer manager.
    pub fn new(id: PeerId, beacon_interval: LocalDuration, alive_limit: LocalDuration, clock: C) -> Self {
        Self {
            id,
            beacon_interval,
            alive_limit,
            known: BTreeMap::new(),
            active: BTreeSet::new(),
            last_beacon_sent: LocalTime::default(),
            last_alive_check: LocalTime::default(),
            outbox: Outbox::default(),
            clock,
        }
    }

    /// Initialize the peer manager with our own starting state. Must be
    /// called once.
    pub fn initialize(&mut self, state: ElevState) {
        let now = self.clock.local_time();

        self.known.insert(
            self.id,
            PeerRecord {
                state,
                last_beacon: now,
            },
        );
        self.last_beacon_sent = now;
        self.last_alive_check = now;
        self.update_active();

        self.outbox.set_timer(self.beacon_interval);
        self.outbox.set_timer(self.alive_limit);
    }

    /// A liveness beacon arrived. New peers are registered with the carried
    /// state; for known peers only the beacon age is refreshed, their state
    /// is kept up to date by backups.
    pub fn received_beacon(&mut self, state: ElevState) {
        let now = self.clock.local_time();
        let id = state.id;

        self.known
            .entry(id)
            .and_modify(|record| record.last_beacon = now)
            .or_insert_with(|| {
                debug!(target: "peer", "{}: first beacon from new peer", id);
                PeerRecord {
                    state,
                    last_beacon: now,
                }
            });
        self.update_active();
    }

    /// A state backup arrived: refresh both the peer's state and its beacon
    /// age.
    pub fn received_backup(&mut self, state: ElevState) {
        let now = self.clock.local_time();
        let id = state.id;

        match self.known.entry(id) {
            std::collections::btree_map::Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                record.state = state;
                record.last_beacon = now;
            }
            std::collections::btree_map::Entry::Vacant(entry) => {
                debug!(target: "peer", "{}: first backup from new peer", id);
                entry.insert(PeerRecord {
                    state,
                    last_beacon: now,
                });
            }
        }
        self.update_active();
    }

    /// Look up a peer's record.
    pub fn record(&self, id: &PeerId) -> Option<&PeerRecord> {
        self.known.get(id)
    }

    /// Whether a peer is in the active set.
    pub fn is_active(&self, id: &PeerId) -> bool {
        self.active.contains(id)
    }

    /// The currently active peers.
    pub fn active(&self) -> &BTreeSet<PeerId> {
        &self.active
    }

    /// Cabin states of all active peers, with our own record substituted by
    /// the live local state.
    pub fn active_states<'a>(
        &'a self,
        own: &'a ElevState,
    ) -> impl Iterator<Item = (&'a PeerId, &'a ElevState)> {
        self.known
            .iter()
            .filter(|(id, _)| self.active.contains(*id))
            .map(move |(id, record)| {
                if *id == self.id {
                    (id, own)
                } else {
                    (id, &record.state)
                }
            })
    }

    /// A wake was received: broadcast a beacon and re-derive the active set
    /// when their intervals have elapsed. `own` is the live local cabin
    /// state to put in the beacon.
    pub fn timer_expired(&mut self, own: &ElevState) {
        let now = self.clock.local_time();

        if now - self.last_beacon_sent >= self.beacon_interval {
            self.last_beacon_sent = now;
            self.outbox.broadcast(RestoreMessage {
                kind: RestoreKind::IAmAlive,
                asker: None,
                responder: Some(self.id),
                state: Some(own.clone()),
                calls: None,
            });
            self.outbox.set_timer(self.beacon_interval);
        }
        if now - self.last_alive_check >= self.alive_limit {
            self.last_alive_check = now;
            self.update_active();
            self.outbox.set_timer(self.alive_limit);
        }
    }

    /// Re-derive the active set from beacon ages.
    fn update_active(&mut self) {
        let now = self.clock.local_time();

        for (id, record) in &self.known {
            let live = now - record.last_beacon <= self.alive_limit;

            if live && !self.active.contains(id) {
                self.active.insert(*id);
                info!(target: "peer", "{}: added to active peers", id);
                self.outbox.event(Event::PeerActive(*id));
            } else if !live && self.active.contains(id) {
                self.active.remove(id);
                info!(target: "peer", "{}: removed from active peers", id);
                self.outbox.event(Event::PeerLost(*id));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use liftnet_common::time::RefClock;
    use std::net::{IpAddr, Ipv4Addr};

    fn peer(n: u8) -> PeerId {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, n))
    }

    fn manager(clock: RefClock) -> PeerManager<RefClock> {
        let mut mgr = PeerManager::new(
            peer(1),
            LocalDuration::from_millis(100),
            LocalDuration::from_millis(310),
            clock,
        );
        mgr.initialize(ElevState::new(peer(1), 0));
        mgr
    }

    #[test]
    fn test_active_tracks_beacon_age() {
        let mut clock = RefClock::from(LocalTime::from_millis(1_000));
        let mut mgr = manager(clock.clone());

        mgr.received_beacon(ElevState::new(peer(2), 0));
        assert!(mgr.is_active(&peer(1)));
        assert!(mgr.is_active(&peer(2)));

        // Beacons go quiet: the peer drops out once past the alive limit.
        clock.set(LocalTime::from_millis(1_400));
        mgr.timer_expired(&ElevState::new(peer(1), 0));
        assert!(!mgr.is_active(&peer(2)));
        assert!(mgr.record(&peer(2)).is_some());

        // A new beacon brings it straight back.
        mgr.received_beacon(ElevState::new(peer(2), 0));
        assert!(mgr.is_active(&peer(2)));
    }

    #[test]
    fn test_backup_refreshes_state() {
        let clock = RefClock::from(LocalTime::from_millis(1_000));
        let mut mgr = manager(clock);

        mgr.received_beacon(ElevState::new(peer(2), 0));
        mgr.received_backup(ElevState::new(peer(2), 3));
        assert_eq!(mgr.record(&peer(2)).unwrap().state.last_floor, 3);

        // Beacons alone never touch the remembered state.
        mgr.received_beacon(ElevState::new(peer(2), 1));
        assert_eq!(mgr.record(&peer(2)).unwrap().state.last_floor, 3);
    }
}
