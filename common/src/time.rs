//! Wall-clock time, as seen by the protocol.
use std::cell::RefCell;
use std::fmt;
use std::ops::{Add, Mul, Sub};
use std::rc::Rc;
use std::time::{Duration, SystemTime};

/// A point in time, with millisecond precision.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LocalTime {
    millis: u64,
}

impl LocalTime {
    /// The current system time.
    pub fn now() -> Self {
        SystemTime::now().into()
    }

    /// Construct from milliseconds since the UNIX epoch.
    pub const fn from_millis(millis: u64) -> Self {
        Self { millis }
    }

    /// Milliseconds since the UNIX epoch.
    pub const fn as_millis(&self) -> u64 {
        self.millis
    }
}

impl From<SystemTime> for LocalTime {
    fn from(time: SystemTime) -> Self {
        let duration = time
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);

        Self {
            millis: duration.as_millis() as u64,
        }
    }
}

impl fmt::Display for LocalTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.millis)
    }
}

impl Add<LocalDuration> for LocalTime {
    type Output = LocalTime;

    fn add(self, other: LocalDuration) -> Self {
        Self {
            millis: self.millis + other.0,
        }
    }
}

impl Sub<LocalTime> for LocalTime {
    type Output = LocalDuration;

    fn sub(self, other: LocalTime) -> LocalDuration {
        LocalDuration(self.millis.saturating_sub(other.millis))
    }
}

/// A span of time, with millisecond precision.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LocalDuration(u64);

impl LocalDuration {
    /// Construct from milliseconds.
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Construct from seconds.
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs * 1000)
    }

    /// The duration in milliseconds.
    pub const fn as_millis(&self) -> u64 {
        self.0
    }

    /// Whether this is the zero duration.
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for LocalDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            millis if millis < 1000 => write!(f, "{} millisecond(s)", millis),
            millis => write!(f, "{} second(s)", millis / 1000),
        }
    }
}

impl Add<LocalDuration> for LocalDuration {
    type Output = LocalDuration;

    fn add(self, other: LocalDuration) -> Self {
        Self(self.0 + other.0)
    }
}

impl Mul<u64> for LocalDuration {
    type Output = LocalDuration;

    fn mul(self, other: u64) -> Self {
        Self(self.0 * other)
    }
}

impl From<LocalDuration> for Duration {
    fn from(duration: LocalDuration) -> Self {
        Duration::from_millis(duration.0)
    }
}

/// Tells the local time.
pub trait Clock: Clone {
    /// The current protocol time.
    fn local_time(&self) -> LocalTime;
    /// Advance the clock.
    fn set(&mut self, time: LocalTime);
}

/// A clock backed by a shared mutable cell, so that the reactor and every
/// sub-system it drives observe the same instant.
#[derive(Debug, Clone, Default)]
pub struct RefClock {
    inner: Rc<RefCell<LocalTime>>,
}

impl Clock for RefClock {
    fn local_time(&self) -> LocalTime {
        *self.inner.borrow()
    }

    fn set(&mut self, time: LocalTime) {
        *self.inner.borrow_mut() = time;
    }
}

impl From<LocalTime> for RefClock {
    fn from(time: LocalTime) -> Self {
        Self {
            inner: Rc::new(RefCell::new(time)),
        }
    }
}
