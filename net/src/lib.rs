//! UDP broadcast transport and the reactor that drives a liftnet state
//! machine from it.
pub mod reactor;
pub mod udp;

pub use reactor::Reactor;
pub use udp::{Target, UdpTransport};

use liftnet_p2p::fsm::ExitReason;
use thiserror::Error;

/// Network subsystem errors. All of them are fatal to the peer.
#[derive(Error, Debug)]
pub enum Error {
    /// An I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// The transport could not be initialized.
    #[error("transport init failed after {attempts} attempt(s): {source}")]
    Bind {
        /// How many times binding was attempted.
        attempts: usize,
        /// The last bind error.
        source: std::io::Error,
    },
    /// The state machine asked the process to terminate.
    #[error("terminating: {0}")]
    Terminated(ExitReason),
    /// An input channel closed underneath the reactor.
    #[error("event source disconnected")]
    Disconnected(#[from] crossbeam_channel::RecvError),
    /// The process received an interrupt signal.
    #[error("interrupted")]
    Interrupted,
}
