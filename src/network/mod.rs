//! Host-side transports: the simulated bus for tests and multi-process
//! setups, and the async reliable-stream driver.

pub mod fakebus;
pub mod link;

pub use self::fakebus::{BusHub, BusPort, SimBus};
pub use self::link::{LinkHandle, StreamLink};
