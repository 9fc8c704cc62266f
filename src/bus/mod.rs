//! Bus-side machinery: the access arbiter and address negotiation.

pub mod arbiter;
pub mod negotiator;

pub use self::arbiter::{Arbiter, BusConfig, BusEvent, SendOutcome, Wire};
pub use self::negotiator::{AddrClient, AddrConfig, AddrEvent, AddrRecord, AddrServer};
