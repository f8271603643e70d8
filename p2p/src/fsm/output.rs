//! State-machine output. Used to communicate protocol effects with a reactor.
use std::collections::VecDeque;
use std::fmt;

use liftnet_common::elevator::Direction;
use liftnet_common::hardware::Light;
use liftnet_common::message::Message;
use liftnet_common::time::LocalDuration;
use liftnet_common::PeerId;

use super::event::Event;

/// Why the state machine asked the process to terminate.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// The stop button was pressed.
    StopButton,
    /// Our own execution watchdog fired: the cabin failed to serve an
    /// accepted hall call in time. The rest of the fleet will reassign it.
    WatchdogExpired,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StopButton => write!(f, "stop button pressed"),
            Self::WatchdogExpired => write!(f, "execution watchdog expired on own hall call"),
        }
    }
}

/// Output of a state transition.
#[derive(Debug, Clone)]
pub enum Io {
    /// Broadcast a message to the whole fleet, ourselves included.
    Broadcast(Message),
    /// Send a message to a single peer over the unicast socket.
    Write(PeerId, Message),
    /// Ask the reactor for a wake-up after the given duration.
    SetTimer(LocalDuration),
    /// Drive the motor.
    Motor(Direction),
    /// Switch a lamp.
    Light(Light),
    /// Emit an event.
    Event(Event),
    /// Terminate the process with a non-zero exit status.
    Shutdown(ExitReason),
}

/// Holds protocol outputs until drained by the reactor.
#[derive(Debug, Clone, Default)]
pub struct Outbox {
    outbound: VecDeque<Io>,
}

impl Outbox {
    /// Queue a broadcast.
    pub fn broadcast(&mut self, message: impl Into<Message>) {
        self.outbound.push_back(Io::Broadcast(message.into()));
    }

    /// Queue a unicast message.
    pub fn write(&mut self, to: PeerId, message: impl Into<Message>) {
        self.outbound.push_back(Io::Write(to, message.into()));
    }

    /// Request a wake-up.
    pub fn set_timer(&mut self, duration: LocalDuration) {
        self.outbound.push_back(Io::SetTimer(duration));
    }

    /// Queue a motor command.
    pub fn motor(&mut self, direction: Direction) {
        self.outbound.push_back(Io::Motor(direction));
    }

    /// Queue a lamp switch.
    pub fn light(&mut self, light: Light) {
        self.outbound.push_back(Io::Light(light));
    }

    /// Queue an event.
    pub fn event(&mut self, event: Event) {
        self.outbound.push_back(Io::Event(event));
    }

    /// Queue a process shutdown.
    pub fn shutdown(&mut self, reason: ExitReason) {
        self.outbound.push_back(Io::Shutdown(reason));
    }
}

impl Iterator for Outbox {
    type Item = Io;

    fn next(&mut self) -> Option<Io> {
        self.outbound.pop_front()
    }
}
