//! Daemon wiring for a liftnet peer.
//!
//! Connects the motion subsystem, the UDP transport and the protocol state
//! machine into a running elevator controller. [`run`] returns only on a
//! fatal condition; callers should map any return into a non-zero process
//! exit. The low-level driver (or a simulator) stays outside: it talks to
//! the node through the [`Hardware`] channel pair.
use std::thread;

use crossbeam_channel as chan;
use log::*;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use thiserror::Error;

use liftnet_common::config::Config;
use liftnet_common::hardware::{HardwareCommand, HardwareEvent};
use liftnet_common::message::Message;
use liftnet_common::time::{LocalTime, RefClock};
use liftnet_net::udp::Target;
use liftnet_net::{Reactor, UdpTransport};
use liftnet_p2p::fsm::{self, StateMachine};

/// Node errors. All of them are fatal.
#[derive(Error, Debug)]
pub enum Error {
    /// A network subsystem error.
    #[error(transparent)]
    Net(#[from] liftnet_net::Error),
    /// An I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Channels to the motion subsystem.
pub struct Hardware {
    /// Button presses and floor arrivals, produced by the driver.
    pub events: chan::Receiver<HardwareEvent>,
    /// Motor and lamp commands, consumed by the driver.
    pub commands: chan::Sender<HardwareCommand>,
}

/// Run a liftnet peer until a fatal condition.
pub fn run(config: Config, hardware: Hardware) -> Result<(), Error> {
    info!(target: "node", "initializing daemon..");

    let transport = UdpTransport::bind(&config)?;
    let id = transport.local_id();
    info!(target: "node", "local peer id is {}", id);

    let (inbound_tx, inbound_rx) = chan::bounded::<Message>(16);
    let (outbound_tx, outbound_rx) = chan::bounded::<(Target, Message)>(16);
    transport.spawn(config.floors, inbound_tx, outbound_rx)?;

    let (interrupt_tx, interrupt_rx) = chan::bounded(1);
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    thread::spawn(move || {
        if signals.forever().next().is_some() {
            interrupt_tx.send(()).ok();
        }
    });

    let clock = RefClock::from(LocalTime::now());
    let sm = StateMachine::new(
        fsm::Config::from(&config, id),
        clock,
        fastrand::Rng::new(),
    );
    let reactor = Reactor::new(
        inbound_rx,
        outbound_tx,
        hardware.events,
        hardware.commands,
        interrupt_rx,
    );
    reactor.run(sm)?;

    Ok(())
}
