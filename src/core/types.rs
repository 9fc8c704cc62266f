use serde::{Deserialize, Serialize};

/// A bus address.
///
/// Unicast addresses are `0..=127`. Negative values are reserved:
/// `-1..=-3` for controller (server) nodes, `-4` for broadcast and for
/// nodes that have not yet acquired an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Addr(pub i8);

impl Addr {
    /// The broadcast / unassigned address
    pub const BROADCAST: Addr = Addr(-4);

    /// Creates a unicast client address
    pub fn client(addr: u8) -> Self {
        Addr((addr & 0x7F) as i8)
    }

    /// Creates a controller (server) address, `id` in `1..=3`
    pub fn server(id: u8) -> Self {
        Addr(-(id.clamp(1, 3) as i8))
    }

    /// Returns true for controller addresses
    pub fn is_server(&self) -> bool {
        (-3..0).contains(&self.0)
    }

    /// Returns true for the broadcast/unassigned address
    pub fn is_broadcast(&self) -> bool {
        self.0 == -4
    }

    /// Returns true for a regular unicast client address
    pub fn is_client(&self) -> bool {
        self.0 >= 0
    }
}

impl std::fmt::Display for Addr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_broadcast() {
            write!(f, "*")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Message priority, `0` (highest) through `3`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Priority(u8);

impl Priority {
    /// Creates a priority, clamped to the valid range
    pub fn new(prio: u8) -> Self {
        Priority(prio.min(3))
    }

    /// Returns the priority level
    pub fn level(&self) -> u8 {
        self.0
    }

    /// The serial-frame start byte for this priority
    pub fn start_byte(&self) -> u8 {
        self.0 + 1
    }

    /// The wire bit asserted during bus acquisition
    pub fn acquire_bit(&self) -> u8 {
        1 << self.0
    }

    /// Recovers a priority from a serial start byte (`0x01..=0x04`)
    pub fn from_start_byte(byte: u8) -> Option<Self> {
        if (1..=4).contains(&byte) {
            Some(Priority(byte - 1))
        } else {
            None
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority(1)
    }
}

/// A node's globally-unique serial number, used during address negotiation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Serial(Vec<u8>);

impl Serial {
    /// Maximum serial length on the wire (4-bit length field, minus one)
    pub const MAX_LEN: usize = 16;

    /// Wraps raw serial bytes; fails on empty or oversized input
    pub fn new(bytes: impl Into<Vec<u8>>) -> Option<Self> {
        let bytes = bytes.into();
        if bytes.is_empty() || bytes.len() > Self::MAX_LEN {
            None
        } else {
            Some(Serial(bytes))
        }
    }

    /// Generates a random 8-byte serial
    pub fn random() -> Self {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let mut bytes = vec![0u8; 8];
        rng.fill(&mut bytes[..]);
        Serial(bytes)
    }

    /// Returns the serial bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns the serial length in bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the serial is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_addr_classes() {
        assert!(Addr::BROADCAST.is_broadcast());
        assert!(Addr::server(1).is_server());
        assert!(Addr::client(5).is_client());
        assert!(!Addr::client(5).is_server());
        assert_eq!(Addr::server(9), Addr(-3));
    }

    #[test]
    fn test_priority_bytes() {
        for p in 0..4 {
            let prio = Priority::new(p);
            assert_eq!(Priority::from_start_byte(prio.start_byte()), Some(prio));
            assert_eq!(prio.acquire_bit(), 1 << p);
        }
        assert_eq!(Priority::from_start_byte(0x06), None);
        assert_eq!(Priority::new(200).level(), 3);
    }

    #[test]
    fn test_serial_random() {
        let s1 = Serial::random();
        let s2 = Serial::random();
        assert_ne!(s1, s2);
        assert!(Serial::new(vec![]).is_none());
        assert!(Serial::new(vec![0; 17]).is_none());
    }
}
