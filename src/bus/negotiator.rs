//! Address negotiation.
//!
//! Nodes ship with a factory serial number and no bus address. On boot a
//! node broadcasts its serial on control code 0 and a controller replies
//! with an assigned unicast address; the assignment is the destination
//! address of the reply, the echoed serial tells the node the reply is
//! for it. Requests that go unanswered are repeated from a widening
//! random window so that many nodes booting at once sort themselves out.
//!
//! Control payload layout, both directions:
//!
//! ```text
//! byte 0   high nibble: serial length - 1
//!          0x08: a flags byte follows the serial
//! serial   1..=16 bytes
//! flags    0x01: settle timer byte follows (minifloat encoded)
//! ```
//!
//! A controller broadcast with an empty payload asks every node to
//! re-announce itself.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::{Addr, Error, Result, Serial, CONTROL_CODE};
use crate::protocol::message::Message;
use crate::util::minifloat::{self, Minifloat};

/// Negotiation tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddrConfig {
    /// Poll attempts before the client goes dormant
    pub max_attempts: u8,
    /// Base of the per-attempt response window, in ticks
    pub window_ticks: u32,
}

impl Default for AddrConfig {
    fn default() -> Self {
        AddrConfig {
            max_attempts: 5,
            window_ticks: 40,
        }
    }
}

/// Wire form of a control-code-0 payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddrRecord {
    pub serial: Serial,
    /// Settle delay the controller asks the node to observe, minifloat
    /// encoded
    pub timer: Option<u8>,
}

impl AddrRecord {
    /// Parses a payload; garbled or short data yields `None` so a
    /// collision-mangled request is simply ignored
    pub fn unpack(data: &[u8]) -> Option<Self> {
        let head = *data.first()?;
        let serial_len = (head >> 4) as usize + 1;
        let serial = Serial::new(data.get(1..1 + serial_len)?)?;
        let mut pos = 1 + serial_len;
        let mut timer = None;
        if head & 0x08 != 0 {
            let flags = *data.get(pos)?;
            pos += 1;
            if flags & 0x01 != 0 {
                timer = Some(*data.get(pos)?);
                pos += 1;
            }
            if flags & !0x01 != 0 {
                return None;
            }
        }
        if data.len() != pos {
            return None;
        }
        Some(AddrRecord { serial, timer })
    }

    /// Serializes the payload
    pub fn pack(&self) -> Vec<u8> {
        let mut head = ((self.serial.len() - 1) as u8) << 4;
        if self.timer.is_some() {
            head |= 0x08;
        }
        let mut out = vec![head];
        out.extend_from_slice(self.serial.as_bytes());
        if let Some(t) = self.timer {
            out.push(0x01);
            out.push(t);
        }
        out
    }

    fn into_message(self, src: Addr, dst: Addr) -> Message {
        let payload = self.pack();
        let mut msg = Message::new(payload.len() + 4);
        // control payloads are tiny, the capacity always suffices
        let _ = msg.set_header(src, dst, CONTROL_CODE);
        let _ = msg.start_send();
        let _ = msg.append_bytes(&payload);
        msg
    }
}

/// Client-side events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddrEvent {
    /// An address was acquired (or confirmed)
    Assigned(Addr),
    /// The controller moved us to a different address; sessions keyed on
    /// the old address are dead
    AddressChanged { old: Addr, new: Addr },
    /// All poll attempts exhausted; dormant until the controller polls
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    /// Waiting out the initial dither before the first request
    Unassigned,
    /// Request sent, waiting for a reply inside the attempt window
    Polling,
    /// Assignment received, waiting out the controller's settle delay
    SettleDelay,
    Assigned,
    /// Gave up; a controller poll restarts the cycle
    Dormant,
}

/// Address negotiation, client side.
///
/// Tick-driven: [`AddrClient::tick`] returns the request message to put
/// on the bus whenever one is due; replies go into
/// [`AddrClient::handle`].
#[derive(Debug)]
pub struct AddrClient {
    cfg: AddrConfig,
    serial: Serial,
    state: ClientState,
    addr: Option<Addr>,
    attempt: u8,
    timer: Minifloat,
    events: std::collections::VecDeque<AddrEvent>,
}

impl AddrClient {
    pub fn new(cfg: AddrConfig, serial: Serial) -> Self {
        let mut timer = Minifloat::new();
        // initial dither so freshly powered nodes do not poll in unison
        timer.set(minifloat::random_between(8, 60));
        AddrClient {
            cfg,
            serial,
            state: ClientState::Unassigned,
            addr: None,
            attempt: 0,
            timer,
            events: Default::default(),
        }
    }

    /// The currently assigned address, if any
    pub fn addr(&self) -> Option<Addr> {
        self.addr
    }

    pub fn poll_event(&mut self) -> Option<AddrEvent> {
        self.events.pop_front()
    }

    fn request(&mut self) -> Message {
        let window = self.cfg.window_ticks;
        let k = self.attempt as u32;
        self.timer.set(minifloat::random_between(k * window, k * window * 3));
        self.state = ClientState::Polling;
        debug!(attempt = self.attempt, "requesting address");
        AddrRecord { serial: self.serial.clone(), timer: None }
            .into_message(Addr::BROADCAST, Addr::BROADCAST)
    }

    /// Counts a failed attempt and either re-polls or goes dormant
    fn next_attempt(&mut self) -> Option<Message> {
        self.attempt += 1;
        if self.attempt > self.cfg.max_attempts {
            warn!("no address assigned, going dormant");
            self.state = ClientState::Dormant;
            self.timer.stop();
            self.events.push_back(AddrEvent::Exhausted);
            None
        } else {
            Some(self.request())
        }
    }

    /// Advances time by one tick; returns a message to transmit if due
    pub fn tick(&mut self) -> Option<Message> {
        if !self.timer.tick() {
            return None;
        }
        self.timer.stop();
        match self.state {
            ClientState::Unassigned | ClientState::Polling => self.next_attempt(),
            ClientState::SettleDelay => {
                if let Some(addr) = self.addr {
                    self.state = ClientState::Assigned;
                    info!(%addr, "address assigned");
                    self.events.push_back(AddrEvent::Assigned(addr));
                }
                None
            }
            ClientState::Assigned | ClientState::Dormant => None,
        }
    }

    fn adopt(&mut self, addr: Addr, timer: Option<u8>) {
        self.attempt = 0;
        self.addr = Some(addr);
        match timer {
            Some(t) if t > 0 => {
                self.timer.set(t);
                self.state = ClientState::SettleDelay;
            }
            _ => {
                self.timer.stop();
                self.state = ClientState::Assigned;
                info!(%addr, "address assigned");
                self.events.push_back(AddrEvent::Assigned(addr));
            }
        }
    }

    /// Processes a control-code-0 message seen on the bus.
    ///
    /// Returns a message to transmit, if one is due immediately.
    pub fn handle(&mut self, msg: &Message) -> Result<Option<Message>> {
        if msg.code() != CONTROL_CODE || !msg.src().is_server() {
            return Ok(None);
        }

        if msg.dst().is_broadcast() {
            if msg.is_empty() {
                // controller asks everyone to re-announce
                debug!("controller poll, restarting negotiation");
                self.attempt = 0;
                self.timer.set(minifloat::random_between(8, 60));
                if self.state != ClientState::Assigned {
                    self.state = ClientState::Unassigned;
                }
                return Ok(None);
            }
            // a nack names the rejected serial
            if let Some(rec) = AddrRecord::unpack(msg.data()) {
                if rec.serial == self.serial && self.state == ClientState::Polling {
                    debug!("address request refused, widening window");
                    return Ok(self.next_attempt());
                }
            }
            return Ok(None);
        }

        if !msg.dst().is_client() {
            return Ok(None);
        }
        let Some(rec) = AddrRecord::unpack(msg.data()) else {
            return Ok(None);
        };
        if rec.serial != self.serial {
            return Ok(None);
        }

        let new = msg.dst();
        match (self.state, self.addr) {
            (ClientState::Assigned, Some(old)) if old != new => {
                // the controller reassigned us underneath our sessions
                warn!(%old, %new, "address changed by controller");
                self.events.push_back(AddrEvent::AddressChanged { old, new });
                self.adopt(new, rec.timer);
            }
            _ => self.adopt(new, rec.timer),
        }
        Ok(None)
    }
}

/// Address negotiation, controller side.
///
/// Keeps the serial-to-address table and answers requests with the
/// lowest free unicast address.
#[derive(Debug)]
pub struct AddrServer {
    addr: Addr,
    table: HashMap<Serial, u8>,
    /// settle delay handed to clients, minifloat encoded
    settle: Option<u8>,
}

impl AddrServer {
    pub fn new(addr: Addr, settle: Option<u8>) -> Result<Self> {
        if !addr.is_server() {
            return Err(Error::protocol(format!("{} is not a controller address", addr)));
        }
        Ok(AddrServer { addr, table: HashMap::new(), settle })
    }

    /// Known assignments
    pub fn assignments(&self) -> impl Iterator<Item = (&Serial, Addr)> {
        self.table.iter().map(|(s, a)| (s, Addr(*a as i8)))
    }

    fn lowest_free(&self) -> Option<u8> {
        (0..=127u8).find(|a| !self.table.values().any(|v| v == a))
    }

    /// A broadcast asking every node to re-announce itself
    pub fn poll_message(&self) -> Message {
        let mut msg = Message::new(4);
        let _ = msg.set_header(self.addr, Addr::BROADCAST, CONTROL_CODE);
        let _ = msg.start_send();
        msg
    }

    /// Processes a control-code-0 request; returns the reply to transmit
    pub fn handle(&mut self, msg: &Message) -> Result<Option<Message>> {
        if msg.code() != CONTROL_CODE
            || !msg.src().is_broadcast()
            || !msg.dst().is_broadcast()
        {
            return Ok(None);
        }
        let Some(rec) = AddrRecord::unpack(msg.data()) else {
            // mangled by a collision; the client retries anyway
            debug!("ignoring malformed address request");
            return Ok(None);
        };

        let assigned = match self.table.get(&rec.serial) {
            Some(&a) => a,
            None => match self.lowest_free() {
                Some(a) => {
                    info!(addr = a, "assigning address");
                    self.table.insert(rec.serial.clone(), a);
                    a
                }
                None => {
                    warn!("address space exhausted, refusing request");
                    let nack = AddrRecord { serial: rec.serial, timer: None }
                        .into_message(self.addr, Addr::BROADCAST);
                    return Ok(Some(nack));
                }
            },
        };

        let reply = AddrRecord { serial: rec.serial, timer: self.settle }
            .into_message(self.addr, Addr::client(assigned));
        Ok(Some(reply))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn serial(b: &[u8]) -> Serial {
        Serial::new(b.to_vec()).unwrap()
    }

    /// Runs client ticks against a server until the client settles
    fn converge(client: &mut AddrClient, server: &mut AddrServer, drop_replies: usize) -> usize {
        let mut dropped = 0;
        for tick in 0..100_000 {
            if let Some(req) = client.tick() {
                if let Some(reply) = server.handle(&req).unwrap() {
                    if dropped < drop_replies {
                        dropped += 1;
                    } else {
                        client.handle(&reply).unwrap();
                    }
                }
            }
            if matches!(client.poll_event(), Some(AddrEvent::Assigned(_))) {
                return tick;
            }
        }
        panic!("client never settled");
    }

    #[test]
    fn test_record_roundtrip() {
        for rec in [
            AddrRecord { serial: serial(b"\x42"), timer: None },
            AddrRecord { serial: serial(b"0123456789abcdef"), timer: Some(0x35) },
        ] {
            assert_eq!(AddrRecord::unpack(&rec.pack()), Some(rec));
        }
    }

    #[test]
    fn test_record_rejects_garbage() {
        assert_eq!(AddrRecord::unpack(&[]), None);
        // serial shorter than announced
        assert_eq!(AddrRecord::unpack(&[0x30, 1, 2]), None);
        // trailing junk
        assert_eq!(AddrRecord::unpack(&[0x00, 1, 2]), None);
        // flags byte promised but missing
        assert_eq!(AddrRecord::unpack(&[0x08, 1]), None);
        // unknown flag bits
        assert_eq!(AddrRecord::unpack(&[0x08, 1, 0x40]), None);
    }

    #[test]
    fn test_assignment() {
        let mut server = AddrServer::new(Addr::server(1), None).unwrap();
        let mut client = AddrClient::new(AddrConfig::default(), serial(b"node-a"));
        converge(&mut client, &mut server, 0);
        assert_eq!(client.addr(), Some(Addr(0)));
    }

    #[test]
    fn test_assignment_is_stable() {
        let mut server = AddrServer::new(Addr::server(1), None).unwrap();
        let mut a = AddrClient::new(AddrConfig::default(), serial(b"node-a"));
        let mut b = AddrClient::new(AddrConfig::default(), serial(b"node-b"));
        converge(&mut a, &mut server, 0);
        converge(&mut b, &mut server, 0);
        let addr_a = a.addr().unwrap();
        let addr_b = b.addr().unwrap();
        assert_ne!(addr_a, addr_b);

        // re-announcing keeps the same address
        let mut a2 = AddrClient::new(AddrConfig::default(), serial(b"node-a"));
        converge(&mut a2, &mut server, 0);
        assert_eq!(a2.addr(), Some(addr_a));
    }

    #[test]
    fn test_lost_replies_are_retried() {
        let mut server = AddrServer::new(Addr::server(2), None).unwrap();
        let mut client = AddrClient::new(AddrConfig::default(), serial(b"flaky"));
        // first two replies vanish on the lossy bus
        converge(&mut client, &mut server, 2);
        assert!(client.addr().is_some());
    }

    #[test]
    fn test_exhaustion_goes_dormant_until_poll() {
        let mut client = AddrClient::new(AddrConfig::default(), serial(b"alone"));
        // nobody answers
        let mut exhausted = false;
        for _ in 0..500_000 {
            client.tick();
            if matches!(client.poll_event(), Some(AddrEvent::Exhausted)) {
                exhausted = true;
                break;
            }
        }
        assert!(exhausted);
        for _ in 0..100_000 {
            assert!(client.tick().is_none());
        }

        // a controller poll restarts the cycle
        let server = AddrServer::new(Addr::server(1), None).unwrap();
        client.handle(&server.poll_message()).unwrap();
        let mut polled = false;
        for _ in 0..100_000 {
            if client.tick().is_some() {
                polled = true;
                break;
            }
        }
        assert!(polled);
    }

    #[test]
    fn test_settle_delay_observed() {
        let mut server = AddrServer::new(Addr::server(1), Some(10)).unwrap();
        let mut client = AddrClient::new(AddrConfig::default(), serial(b"slow"));
        let mut req = None;
        for _ in 0..100_000 {
            if let Some(m) = client.tick() {
                req = Some(m);
                break;
            }
        }
        let reply = server.handle(&req.unwrap()).unwrap().unwrap();
        client.handle(&reply).unwrap();
        // not assigned yet, the settle timer is running
        assert!(client.poll_event().is_none());
        let mut settled = false;
        for _ in 0..100 {
            client.tick();
            if matches!(client.poll_event(), Some(AddrEvent::Assigned(_))) {
                settled = true;
                break;
            }
        }
        assert!(settled);
    }

    #[test]
    fn test_address_churn_reported() {
        let mut server = AddrServer::new(Addr::server(1), None).unwrap();
        let mut client = AddrClient::new(AddrConfig::default(), serial(b"moved"));
        converge(&mut client, &mut server, 0);
        let old = client.addr().unwrap();

        // a rebuilt controller hands the same serial a different address
        let reply = AddrRecord { serial: serial(b"moved"), timer: None }
            .into_message(Addr::server(1), Addr::client(77));
        client.handle(&reply).unwrap();
        assert_eq!(
            client.poll_event(),
            Some(AddrEvent::AddressChanged { old, new: Addr(77) })
        );
        assert_eq!(client.addr(), Some(Addr(77)));
    }

    #[test]
    fn test_server_rejects_non_requests() {
        let mut server = AddrServer::new(Addr::server(1), None).unwrap();
        let rec = AddrRecord { serial: serial(b"x"), timer: None };
        let not_broadcast = rec.into_message(Addr(5), Addr::BROADCAST);
        assert!(server.handle(&not_broadcast).unwrap().is_none());
        assert!(AddrServer::new(Addr(3), None).is_err());
    }
}
