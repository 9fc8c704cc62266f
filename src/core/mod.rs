//! Core types and constants for the wirebus stack
//!
//! This module contains the fundamental building blocks used throughout the library.

pub mod error;
pub mod types;

pub use self::error::{Error, Result};
pub use self::types::{Addr, Priority, Serial};

/// Command code reserved for address negotiation and bus control traffic
pub const CONTROL_CODE: u8 = 0;

/// Smallest supported wire count
pub const MIN_WIRES: u8 = 2;

/// Largest wire count the chunk tables cover
pub const MAX_WIRES: u8 = 6;

/// Default number of signal wires
pub const DEFAULT_WIRES: u8 = 3;

/// Serial-line acknowledgement byte
pub const ACK_BYTE: u8 = 0x06;
