//! Interface to the motion subsystem.
//!
//! The low-level driver (or a simulator standing in for it) lives outside
//! the core. It feeds [`HardwareEvent`]s into the reducer and executes
//! [`HardwareCommand`]s on its behalf.
use crate::elevator::{Direction, Floor, HallButton};

/// Physical button classes reported by the driver.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ButtonKind {
    /// An "up" hall button.
    HallUp,
    /// A "down" hall button.
    HallDown,
    /// An in-cabin floor button.
    Cabin,
    /// The stop button.
    Stop,
}

/// Input events from the motion subsystem.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HardwareEvent {
    /// A button was pressed. The floor is meaningless for [`ButtonKind::Stop`].
    Button {
        /// Which class of button.
        kind: ButtonKind,
        /// Which floor the button belongs to.
        floor: Floor,
    },
    /// The cabin arrived at a floor.
    FloorReached(Floor),
}

/// A lamp controlled by the core.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Light {
    /// A hall-call button lamp.
    Hall {
        /// Which hall button.
        button: HallButton,
        /// Which floor.
        floor: Floor,
        /// On or off.
        on: bool,
    },
    /// An in-cabin floor button lamp.
    Cabin {
        /// Which floor.
        floor: Floor,
        /// On or off.
        on: bool,
    },
    /// The door-open indicator.
    Door {
        /// On or off.
        on: bool,
    },
    /// The stop button lamp.
    Stop {
        /// On or off.
        on: bool,
    },
}

/// Output commands to the motion subsystem. The reducer guarantees that a
/// [`Direction::Stop`] motor command precedes any door-open indication.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HardwareCommand {
    /// Drive the motor.
    Motor(Direction),
    /// Switch a lamp.
    Light(Light),
}
