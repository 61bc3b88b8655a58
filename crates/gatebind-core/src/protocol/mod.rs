//! Protocol module - framing, command numbering and constants.

pub mod commands;
pub mod constants;
pub mod frame;

pub use commands::CommandSet;
pub use constants::*;
pub use frame::{FrameError, Fragment, Notification};
