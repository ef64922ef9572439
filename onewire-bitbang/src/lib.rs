#![no_std]
#![deny(missing_docs)]
#![doc = include_str!("../README.md")]

pub mod consts;
mod bus;
mod crc;
mod port;
#[cfg(feature = "search")]
mod search;

pub use bus::{Busy, OneWireBus, OneWireResult, PresenceCallback};
pub use crc::OneWireCrc;
pub use port::{PinDirection, PinState, Port};
#[cfg(feature = "search")]
pub use search::SearchCallback;
