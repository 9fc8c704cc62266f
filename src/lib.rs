//! Wirebus: a multi-drop communication stack for cheap embedded nodes
//! sharing a handful of open-collector wires.
//!
//! The stack transmits forward-error-coded frames as differential wire
//! states, arbitrates bus access by priority with collision backoff,
//! negotiates node addresses from factory serials, frames messages over a
//! point-to-point serial link, and offers a reliable ordered stream on
//! top of any of these transports.

pub mod bus;
pub mod core;
pub mod network;
pub mod protocol;
pub mod util;

// Re-export commonly used items
pub use crate::core::{Addr, Error, Priority, Result, Serial};
pub use crate::protocol::{Message, MessagePool};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
