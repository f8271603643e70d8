//! The event loop driving a state machine.
//!
//! This is the single-threaded reducer: it blocks on its inputs (network
//! messages, hardware events, the interrupt channel) with a timeout derived
//! from the earliest pending wake, folds each input into the state machine,
//! and dispatches the resulting outputs. No protocol state lives here.
use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crossbeam_channel as chan;
use log::*;

use liftnet_common::elevator::Direction;
use liftnet_common::hardware::{HardwareCommand, HardwareEvent};
use liftnet_common::message::Message;
use liftnet_common::time::{Clock, LocalTime};
use liftnet_p2p::fsm::{Io, StateMachine};

use crate::udp::Target;
use crate::Error;

/// Longest the loop sleeps when no wake is pending.
const IDLE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(1);

/// Drives a [`StateMachine`] from channels.
pub struct Reactor {
    inbound: chan::Receiver<Message>,
    outbound: chan::Sender<(Target, Message)>,
    hw_events: chan::Receiver<HardwareEvent>,
    hw_commands: chan::Sender<HardwareCommand>,
    interrupt: chan::Receiver<()>,
    wakes: BinaryHeap<Reverse<LocalTime>>,
}

impl Reactor {
    /// Create a new reactor over the given channels.
    pub fn new(
        inbound: chan::Receiver<Message>,
        outbound: chan::Sender<(Target, Message)>,
        hw_events: chan::Receiver<HardwareEvent>,
        hw_commands: chan::Sender<HardwareCommand>,
        interrupt: chan::Receiver<()>,
    ) -> Self {
        Self {
            inbound,
            outbound,
            hw_events,
            hw_commands,
            interrupt,
            wakes: BinaryHeap::new(),
        }
    }

    /// Run the reducer loop. Returns only on a terminal condition, always an
    /// error: the daemon has no successful exit.
    pub fn run<C: Clock>(mut self, mut sm: StateMachine<C>) -> Result<(), Error> {
        // The driver reports the starting floor once the cabin is homed.
        let floor = loop {
            match self.hw_events.recv()? {
                HardwareEvent::FloorReached(floor) => break floor,
                event => debug!(target: "reactor", "ignoring {:?} before initialization", event),
            }
        };
        sm.initialize(LocalTime::now(), floor);
        self.dispatch(&mut sm)?;

        loop {
            let now = LocalTime::now();
            sm.tick(now);

            let mut fired = false;
            while let Some(Reverse(at)) = self.wakes.peek().copied() {
                if at > now {
                    break;
                }
                self.wakes.pop();
                fired = true;
            }
            if fired {
                sm.timer_expired();
            }
            self.dispatch(&mut sm)?;

            let timeout = self
                .wakes
                .peek()
                .map(|Reverse(at)| (*at - now).into())
                .unwrap_or(IDLE_TIMEOUT);

            chan::select! {
                recv(self.inbound) -> message => sm.message_received(message?),
                recv(self.hw_events) -> event => match event? {
                    HardwareEvent::Button { kind, floor } => sm.button_pressed(kind, floor),
                    HardwareEvent::FloorReached(floor) => sm.floor_reached(floor),
                },
                recv(self.interrupt) -> _msg => {
                    self.hw_commands
                        .send(HardwareCommand::Motor(Direction::Stop))
                        .ok();
                    return Err(Error::Interrupted);
                }
                default(timeout) => {}
            }
            self.dispatch(&mut sm)?;
        }
    }

    /// Drain the state machine's outputs.
    fn dispatch<C: Clock>(&mut self, sm: &mut StateMachine<C>) -> Result<(), Error> {
        let now = LocalTime::now();

        while let Some(io) = sm.next() {
            match io {
                Io::Broadcast(message) => {
                    self.outbound.send((Target::Broadcast, message)).ok();
                }
                Io::Write(to, message) => {
                    self.outbound.send((Target::Peer(to), message)).ok();
                }
                Io::SetTimer(duration) => {
                    self.wakes.push(Reverse(now + duration));
                }
                Io::Motor(direction) => {
                    self.hw_commands.send(HardwareCommand::Motor(direction)).ok();
                }
                Io::Light(light) => {
                    self.hw_commands.send(HardwareCommand::Light(light)).ok();
                }
                Io::Event(event) => {
                    debug!(target: "reactor", "{}", event);
                }
                Io::Shutdown(reason) => {
                    self.hw_commands
                        .send(HardwareCommand::Motor(Direction::Stop))
                        .ok();
                    return Err(Error::Terminated(reason));
                }
            }
        }
        Ok(())
    }
}
