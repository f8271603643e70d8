//! Broadcast datagram transport.
//!
//! Two sockets per peer: one bound to the well-known broadcast port for
//! fleet-wide fan-out, one bound to the unicast port for targeted replies.
//! Reader threads decode and validate datagrams before anything reaches the
//! reducer; invalid traffic is dropped here. A writer thread drains the
//! outgoing queue, so no protocol step ever blocks on the network.
use std::io;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::thread;
use std::time::Duration;

use crossbeam_channel as chan;
use log::*;

use liftnet_common::config::Config;
use liftnet_common::message::Message;
use liftnet_common::PeerId;

use crate::Error;

/// Largest datagram we will read.
const MAX_DATAGRAM_SIZE: usize = 4096;
/// Pause between transport bind attempts.
const RETRY_DELAY: Duration = Duration::from_secs(3);

/// Where an outgoing message goes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Target {
    /// The whole fleet, over the broadcast socket.
    Broadcast,
    /// One peer, over its unicast port.
    Peer(PeerId),
}

/// The pair of UDP sockets a peer talks through.
#[derive(Debug)]
pub struct UdpTransport {
    local: PeerId,
    broadcast: UdpSocket,
    unicast: UdpSocket,
    broadcast_addr: SocketAddr,
    unicast_port: u16,
}

impl UdpTransport {
    /// Bind the transport sockets, retrying a few times before giving up.
    pub fn bind(config: &Config) -> Result<Self, Error> {
        let mut attempt = 0;

        loop {
            match Self::try_bind(config) {
                Ok(transport) => return Ok(transport),
                Err(source) if attempt >= config.connect_attempts => {
                    return Err(Error::Bind {
                        attempts: attempt + 1,
                        source,
                    });
                }
                Err(err) => {
                    warn!(target: "net", "transport init failed ({}); retrying..", err);
                    attempt += 1;
                    thread::sleep(RETRY_DELAY);
                }
            }
        }
    }

    fn try_bind(config: &Config) -> io::Result<Self> {
        let broadcast_addr = SocketAddr::from((Ipv4Addr::BROADCAST, config.broadcast_port));
        let local = local_ip(broadcast_addr)?;

        let broadcast = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, config.broadcast_port))?;
        broadcast.set_broadcast(true)?;
        let unicast = UdpSocket::bind((local, config.unicast_port))?;

        Ok(Self {
            local,
            broadcast,
            unicast,
            broadcast_addr,
            unicast_port: config.unicast_port,
        })
    }

    /// Our peer identity: the address we are reachable at.
    pub fn local_id(&self) -> PeerId {
        self.local
    }

    /// Spawn the reader and writer threads. Readers feed decoded messages
    /// into `inbound`; the writer drains `outbound`.
    pub fn spawn(
        self,
        floors: usize,
        inbound: chan::Sender<Message>,
        outbound: chan::Receiver<(Target, Message)>,
    ) -> io::Result<()> {
        for socket in [self.broadcast.try_clone()?, self.unicast.try_clone()?] {
            let inbound = inbound.clone();
            thread::spawn(move || read_loop(socket, floors, inbound));
        }
        // All sends go out through the unicast socket, broadcasts included.
        let socket = self.unicast;
        let broadcast_addr = self.broadcast_addr;
        let unicast_port = self.unicast_port;
        thread::spawn(move || write_loop(socket, broadcast_addr, unicast_port, outbound));

        Ok(())
    }
}

/// Discover the address this host is reachable at on the broadcast LAN, by
/// asking the routing table which source address a broadcast would use.
fn local_ip(broadcast_addr: SocketAddr) -> io::Result<PeerId> {
    let probe = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    probe.set_broadcast(true)?;
    probe.connect(broadcast_addr)?;

    Ok(probe.local_addr()?.ip())
}

fn read_loop(socket: UdpSocket, floors: usize, inbound: chan::Sender<Message>) {
    let mut buf = [0; MAX_DATAGRAM_SIZE];

    loop {
        match socket.recv_from(&mut buf) {
            Ok((len, from)) => match Message::decode(&buf[..len], floors) {
                Ok(message) => {
                    if inbound.send(message).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    debug!(target: "net", "dropping datagram from {}: {}", from, err);
                }
            },
            Err(err) => {
                error!(target: "net", "receive failed: {}", err);
            }
        }
    }
}

fn write_loop(
    socket: UdpSocket,
    broadcast_addr: SocketAddr,
    unicast_port: u16,
    outbound: chan::Receiver<(Target, Message)>,
) {
    for (target, message) in outbound {
        let data = message.encode();
        let result = match target {
            Target::Broadcast => socket.send_to(&data, broadcast_addr),
            Target::Peer(ip) => socket.send_to(&data, SocketAddr::new(ip, unicast_port)),
        };
        if let Err(err) = result {
            warn!(target: "net", "failed to send datagram: {}", err);
        }
    }
}
