//! Runtime configuration.
use crate::time::LocalDuration;

/// Number of floors served by default.
pub const DEFAULT_FLOORS: usize = 4;
/// Well-known port all peers broadcast on.
pub const BROADCAST_PORT: u16 = 22302;
/// Well-known port for targeted unicast replies.
pub const UNICAST_PORT: u16 = 22301;

/// Peer configuration. [`Config::default`] gives the documented defaults;
/// all peers of a fleet must agree on `floors` and the ports.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of floors served.
    pub floors: usize,
    /// How often liveness beacons are broadcast.
    pub beacon_interval: LocalDuration,
    /// Beacon age beyond which a peer is considered gone. Must be at least
    /// three beacon intervals plus some slack.
    pub alive_limit: LocalDuration,
    /// How long to wait for a protocol phase to be acknowledged by every
    /// active peer before retransmitting.
    pub ack_timeout: LocalDuration,
    /// How long an assignee gets to serve a call before watchdogs fire.
    /// Each peer adds up to `order_timeout_jitter` of random slack so that
    /// reassignments don't stampede.
    pub order_timeout: LocalDuration,
    /// Upper bound on the per-peer execution timeout jitter.
    pub order_timeout_jitter: LocalDuration,
    /// How long the doors stay open at a floor.
    pub door_hold: LocalDuration,
    /// Hardware polling interval, for drivers that poll.
    pub poll_interval: LocalDuration,
    /// How many times transport initialization is attempted before giving up.
    pub connect_attempts: usize,
    /// Port all peers broadcast on.
    pub broadcast_port: u16,
    /// Port for targeted unicast replies.
    pub unicast_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        let beacon_interval = LocalDuration::from_millis(100);

        Self {
            floors: DEFAULT_FLOORS,
            beacon_interval,
            alive_limit: beacon_interval * 3 + LocalDuration::from_millis(10),
            ack_timeout: LocalDuration::from_millis(500),
            order_timeout: LocalDuration::from_secs(5),
            order_timeout_jitter: LocalDuration::from_secs(2),
            door_hold: LocalDuration::from_secs(3),
            poll_interval: LocalDuration::from_millis(50),
            connect_attempts: 10,
            broadcast_port: BROADCAST_PORT,
            unicast_port: UNICAST_PORT,
        }
    }
}
