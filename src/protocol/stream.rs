//! Reliable ordered stream over an unreliable frame transport.
//!
//! A thin sliding-window layer: every data frame carries its own sequence
//! number plus the highest-contiguous sequence received from the peer, so
//! plain traffic acknowledges for free. Flow frames carry the same ack and
//! optionally a selective-ack bitmask of later out-of-order frames already
//! held, which keeps those off the retransmit path.
//!
//! The state machine is sans-IO: callers feed received frames in with
//! [`ReliableStream::handle_frame`], drive time with
//! [`ReliableStream::tick`], and drain outgoing frames and application
//! events with [`ReliableStream::poll_frame`] / [`ReliableStream::poll_event`].

use std::collections::{BTreeMap, HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::core::{Error, Result};

/// Control frame, low 3 bits hold the control code
const F_CTRL: u8 = 0x80;
/// Flow frame, ack plus optional selective-ack mask
const F_FLOW: u8 = 0x40;
/// Marks the second leg of a handshake
const F_REPLY: u8 = 0x20;
/// Sender is willing to accept new data
const F_READY: u8 = 0x10;
/// Deliver without waiting for more data
const F_PUSH: u8 = 0x08;

const CTRL_STOP: u8 = 0;
const CTRL_START: u8 = 1;
const CTRL_ERROR: u8 = 7;

/// Tuning knobs for a reliable stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Maximum unacknowledged frames in flight, at least 4
    pub window: u8,
    /// Ticks without an ack before the oldest frame is retransmitted
    pub retransmit_ticks: u8,
    /// Retransmissions of the same frame before the link is declared dead
    pub max_timeouts: u8,
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            window: 8,
            retransmit_ticks: 3,
            max_timeouts: 5,
        }
    }
}

/// Lifecycle of a stream endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Connecting,
    Connected,
    Disconnecting,
    TimedOut,
}

/// Application-visible stream events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Handshake completed
    Connected,
    /// In-order payload, delivered exactly once
    Received(Vec<u8>),
    /// Peer toggled its receive-readiness
    PeerReady(bool),
    /// Peer reported an error; the text is passed through verbatim
    RemoteError(String),
    /// Link gave up after repeated retransmission timeouts
    TimedOut,
    /// Session ended; queued sends have been dropped
    Disconnected,
}

#[derive(Debug)]
struct SendSlot {
    payload: Vec<u8>,
    /// ticks since (re)transmission
    age: u8,
    /// selectively acknowledged, excluded from retransmission
    sacked: bool,
}

/// Sliding-window reliable stream endpoint
#[derive(Debug)]
pub struct ReliableStream {
    cfg: StreamConfig,
    state: StreamState,
    /// next sequence number to assign
    seq_send: u8,
    /// oldest unacknowledged sequence number
    seq_ack: u8,
    /// next in-order sequence expected from the peer
    recv_tail: u8,
    unacked: BTreeMap<u8, SendSlot>,
    held: HashMap<u8, Vec<u8>>,
    pending: VecDeque<Vec<u8>>,
    out: VecDeque<Vec<u8>>,
    events: VecDeque<StreamEvent>,
    ready: bool,
    peer_ready: bool,
    timeouts: u8,
    pend_ack: bool,
}

/// Wraparound-aware ordering: is `b` within `[a, c]` going forward?
fn between(a: u8, b: u8, c: u8) -> bool {
    b.wrapping_sub(a) <= c.wrapping_sub(a)
}

impl ReliableStream {
    pub fn new(cfg: StreamConfig) -> Result<Self> {
        if cfg.window < 4 {
            return Err(Error::protocol(format!(
                "window must be at least 4, not {}",
                cfg.window
            )));
        }
        Ok(ReliableStream {
            cfg,
            state: StreamState::Idle,
            seq_send: 0,
            seq_ack: 0,
            recv_tail: 0,
            unacked: BTreeMap::new(),
            held: HashMap::new(),
            pending: VecDeque::new(),
            out: VecDeque::new(),
            events: VecDeque::new(),
            ready: true,
            peer_ready: true,
            timeouts: 0,
            pend_ack: false,
        })
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Starts the handshake from this side
    pub fn connect(&mut self) -> Result<()> {
        match self.state {
            StreamState::Idle | StreamState::TimedOut => {
                self.reset_counters();
                self.state = StreamState::Connecting;
                self.out.push_back(vec![F_CTRL | CTRL_START]);
                Ok(())
            }
            _ => Err(Error::invalid_state("connect on an active stream")),
        }
    }

    /// Queues a payload for ordered, exactly-once delivery
    pub fn send(&mut self, payload: Vec<u8>) -> Result<()> {
        match self.state {
            StreamState::Connecting | StreamState::Connected => {
                self.pending.push_back(payload);
                self.pump();
                Ok(())
            }
            _ => Err(Error::Disconnected),
        }
    }

    /// Toggles this side's willingness to accept new data.
    ///
    /// The peer keeps retransmitting in-flight frames but stops sending
    /// fresh ones until readiness returns.
    pub fn set_ready(&mut self, ready: bool) {
        if self.ready == ready {
            return;
        }
        self.ready = ready;
        if self.state == StreamState::Connected {
            self.push_flow();
        }
    }

    /// Initiates an orderly shutdown
    pub fn close(&mut self) {
        match self.state {
            StreamState::Idle | StreamState::TimedOut => {}
            StreamState::Disconnecting => {}
            _ => {
                self.out.push_back(vec![F_CTRL | CTRL_STOP]);
                self.state = StreamState::Disconnecting;
            }
        }
    }

    /// Next frame to hand to the transport, if any
    pub fn poll_frame(&mut self) -> Option<Vec<u8>> {
        self.out.pop_front()
    }

    /// Next application event, if any
    pub fn poll_event(&mut self) -> Option<StreamEvent> {
        self.events.pop_front()
    }

    fn reset_counters(&mut self) {
        self.seq_send = 0;
        self.seq_ack = 0;
        self.recv_tail = 0;
        self.unacked.clear();
        self.held.clear();
        self.timeouts = 0;
        self.pend_ack = false;
        self.peer_ready = true;
    }

    fn teardown(&mut self, terminal: StreamState) {
        if !self.pending.is_empty() || !self.unacked.is_empty() {
            debug!(
                queued = self.pending.len(),
                unacked = self.unacked.len(),
                "dropping undelivered frames on teardown"
            );
        }
        self.pending.clear();
        self.unacked.clear();
        self.held.clear();
        self.state = terminal;
        self.events.push_back(StreamEvent::Disconnected);
    }

    fn in_flight(&self) -> u8 {
        self.seq_send.wrapping_sub(self.seq_ack)
    }

    fn data_flags(&self) -> u8 {
        let mut f = F_PUSH;
        if self.ready {
            f |= F_READY;
        }
        f
    }

    /// Moves queued payloads into the window while there is room
    fn pump(&mut self) {
        if self.state != StreamState::Connected {
            return;
        }
        while self.peer_ready && self.in_flight() < self.cfg.window {
            let Some(payload) = self.pending.pop_front() else { break };
            let seq = self.seq_send;
            self.seq_send = self.seq_send.wrapping_add(1);
            let mut frame = vec![self.data_flags(), seq, self.recv_tail];
            frame.extend_from_slice(&payload);
            trace!(seq, "data frame out");
            self.out.push_back(frame);
            self.unacked.insert(seq, SendSlot { payload, age: 0, sacked: false });
            self.pend_ack = false;
        }
    }

    /// Emits a flow frame: ack plus a selective-ack mask of held frames.
    /// Mask bit `i` covers sequence `ack + 1 + i`, matching `apply_sack`.
    fn push_flow(&mut self) {
        let mut mask = 0u8;
        for i in 0..8u8 {
            let seq = self.recv_tail.wrapping_add(1).wrapping_add(i);
            if self.held.contains_key(&seq) {
                mask |= 1 << i;
            }
        }
        let mut flags = F_CTRL | F_FLOW;
        if self.ready {
            flags |= F_READY;
        }
        if mask != 0 {
            self.out.push_back(vec![flags, self.recv_tail, mask]);
        } else {
            self.out.push_back(vec![flags, self.recv_tail]);
        }
        self.pend_ack = false;
    }

    /// Drops acknowledged frames and resets the timeout ladder on progress
    fn apply_ack(&mut self, ack: u8) {
        if !between(self.seq_ack, ack, self.seq_send) {
            return;
        }
        let mut progressed = false;
        while self.seq_ack != ack {
            self.unacked.remove(&self.seq_ack);
            self.seq_ack = self.seq_ack.wrapping_add(1);
            progressed = true;
        }
        if progressed {
            self.timeouts = 0;
            self.pump();
        }
    }

    fn apply_sack(&mut self, ack: u8, mask: u8) {
        for i in 0..8u8 {
            if mask & (1 << i) != 0 {
                let seq = ack.wrapping_add(1).wrapping_add(i);
                if let Some(slot) = self.unacked.get_mut(&seq) {
                    slot.sacked = true;
                }
            }
        }
    }

    /// Delivers the in-order run starting at `recv_tail`
    fn drain_held(&mut self) {
        while let Some(payload) = self.held.remove(&self.recv_tail) {
            self.recv_tail = self.recv_tail.wrapping_add(1);
            self.events.push_back(StreamEvent::Received(payload));
            self.pend_ack = true;
        }
    }

    fn handle_ctrl(&mut self, flags: u8, rest: &[u8]) -> Result<()> {
        match flags & 0x07 {
            CTRL_START => {
                if flags & F_REPLY != 0 {
                    if self.state == StreamState::Connecting {
                        self.state = StreamState::Connected;
                        self.events.push_back(StreamEvent::Connected);
                        self.pump();
                    }
                } else {
                    match self.state {
                        StreamState::Idle | StreamState::TimedOut | StreamState::Connecting => {
                            self.reset_counters();
                            self.out.push_back(vec![F_CTRL | CTRL_START | F_REPLY]);
                            self.state = StreamState::Connected;
                            self.events.push_back(StreamEvent::Connected);
                            self.pump();
                        }
                        StreamState::Connected => {
                            // peer restarted underneath us
                            warn!("peer re-initiated handshake on a live stream");
                            self.teardown(StreamState::Idle);
                            self.reset_counters();
                            self.out.push_back(vec![F_CTRL | CTRL_START | F_REPLY]);
                            self.state = StreamState::Connected;
                            self.events.push_back(StreamEvent::Connected);
                        }
                        StreamState::Disconnecting => {}
                    }
                }
            }
            CTRL_STOP => {
                if flags & F_REPLY != 0 {
                    if self.state == StreamState::Disconnecting {
                        self.teardown(StreamState::Idle);
                    }
                } else {
                    self.out.push_back(vec![F_CTRL | CTRL_STOP | F_REPLY]);
                    if !matches!(self.state, StreamState::Idle | StreamState::TimedOut) {
                        self.teardown(StreamState::Idle);
                    }
                }
            }
            CTRL_ERROR => {
                let text = String::from_utf8_lossy(rest).into_owned();
                warn!(error = %text, "peer reported stream error");
                self.events.push_back(StreamEvent::RemoteError(text));
            }
            other => {
                return Err(Error::protocol(format!("unknown control code {}", other)));
            }
        }
        Ok(())
    }

    /// Processes one frame received from the transport
    pub fn handle_frame(&mut self, frame: &[u8]) -> Result<()> {
        let Some((&flags, rest)) = frame.split_first() else {
            return Err(Error::protocol("empty stream frame"));
        };

        if flags & F_CTRL != 0 && flags & F_FLOW == 0 {
            return self.handle_ctrl(flags, rest);
        }

        if self.state != StreamState::Connected {
            // data before the handshake finished; the retransmit covers it
            trace!(state = ?self.state, "dropping frame outside Connected");
            return Ok(());
        }

        let was_ready = self.peer_ready;
        self.peer_ready = flags & F_READY != 0;
        if was_ready != self.peer_ready {
            self.events.push_back(StreamEvent::PeerReady(self.peer_ready));
            if self.peer_ready {
                self.pump();
            }
        }

        if flags & F_FLOW != 0 {
            let Some(&ack) = rest.first() else {
                return Err(Error::protocol("flow frame without ack"));
            };
            self.apply_ack(ack);
            if let Some(&mask) = rest.get(1) {
                self.apply_sack(ack, mask);
            }
            return Ok(());
        }

        // data frame: flags, seq, ack, payload
        if rest.len() < 2 {
            return Err(Error::protocol("truncated data frame"));
        }
        let seq = rest[0];
        let ack = rest[1];
        let payload = rest[2..].to_vec();
        self.apply_ack(ack);

        let ahead = seq.wrapping_sub(self.recv_tail);
        if ahead == 0 {
            self.recv_tail = self.recv_tail.wrapping_add(1);
            self.events.push_back(StreamEvent::Received(payload));
            self.pend_ack = true;
            self.drain_held();
        } else if ahead < self.cfg.window {
            // out of order, held until the gap fills
            self.held.entry(seq).or_insert(payload);
            self.pend_ack = true;
        } else {
            // old duplicate, our ack got lost
            trace!(seq, tail = self.recv_tail, "duplicate data frame");
            self.pend_ack = true;
        }
        Ok(())
    }

    /// Advances time by one tick: retransmission, ack flushing, timeout
    /// escalation.
    pub fn tick(&mut self) {
        match self.state {
            StreamState::Connecting => {
                self.timeouts += 1;
                if self.timeouts > self.cfg.max_timeouts {
                    warn!("handshake timed out");
                    self.events.push_back(StreamEvent::TimedOut);
                    self.teardown(StreamState::TimedOut);
                    return;
                }
                self.out.push_back(vec![F_CTRL | CTRL_START]);
                return;
            }
            StreamState::Disconnecting => {
                self.teardown(StreamState::Idle);
                return;
            }
            StreamState::Connected => {}
            _ => return,
        }

        let mut retransmit = None;
        for (&seq, slot) in self.unacked.iter_mut() {
            slot.age = slot.age.saturating_add(1);
            if !slot.sacked && retransmit.is_none() && slot.age >= self.cfg.retransmit_ticks {
                retransmit = Some(seq);
            }
        }
        if let Some(seq) = retransmit {
            self.timeouts += 1;
            if self.timeouts > self.cfg.max_timeouts {
                warn!(seq, "retransmission limit reached, link dead");
                self.events.push_back(StreamEvent::TimedOut);
                self.teardown(StreamState::TimedOut);
                return;
            }
            // resend in wraparound order from the oldest hole
            let flags = self.data_flags();
            if let Some(slot) = self.unacked.get_mut(&seq) {
                slot.age = 0;
                let mut frame = vec![flags, seq, self.recv_tail];
                frame.extend_from_slice(&slot.payload);
                debug!(seq, attempt = self.timeouts, "retransmit");
                self.out.push_back(frame);
                self.pend_ack = false;
            }
        }

        if self.pend_ack {
            self.push_flow();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (ReliableStream, ReliableStream) {
        let a = ReliableStream::new(StreamConfig::default()).unwrap();
        let b = ReliableStream::new(StreamConfig::default()).unwrap();
        (a, b)
    }

    /// Shuttles frames between both endpoints until neither has output.
    /// `drop_nth` drops every n-th frame to exercise retransmission.
    fn settle(a: &mut ReliableStream, b: &mut ReliableStream, drop_nth: usize) {
        let mut n = 0usize;
        for _ in 0..200 {
            let mut quiet = true;
            while let Some(f) = a.poll_frame() {
                quiet = false;
                n += 1;
                if drop_nth == 0 || n % drop_nth != 0 {
                    b.handle_frame(&f).unwrap();
                }
            }
            while let Some(f) = b.poll_frame() {
                quiet = false;
                n += 1;
                if drop_nth == 0 || n % drop_nth != 0 {
                    a.handle_frame(&f).unwrap();
                }
            }
            if quiet {
                a.tick();
                b.tick();
                if a.out.is_empty()
                    && b.out.is_empty()
                    && a.unacked.is_empty()
                    && b.unacked.is_empty()
                {
                    break;
                }
            }
        }
    }

    fn received(s: &mut ReliableStream) -> Vec<Vec<u8>> {
        let mut got = Vec::new();
        while let Some(ev) = s.poll_event() {
            if let StreamEvent::Received(d) = ev {
                got.push(d);
            }
        }
        got
    }

    fn connect(a: &mut ReliableStream, b: &mut ReliableStream) {
        a.connect().unwrap();
        settle(a, b, 0);
        assert_eq!(a.state(), StreamState::Connected);
        assert_eq!(b.state(), StreamState::Connected);
        assert_eq!(a.poll_event(), Some(StreamEvent::Connected));
        assert_eq!(b.poll_event(), Some(StreamEvent::Connected));
    }

    #[test]
    fn test_handshake() {
        let (mut a, mut b) = pair();
        connect(&mut a, &mut b);
    }

    #[test]
    fn test_in_order_delivery() {
        let (mut a, mut b) = pair();
        connect(&mut a, &mut b);
        for i in 0..20u8 {
            a.send(vec![i]).unwrap();
        }
        settle(&mut a, &mut b, 0);
        let got = received(&mut b);
        assert_eq!(got, (0..20u8).map(|i| vec![i]).collect::<Vec<_>>());
    }

    #[test]
    fn test_exactly_once_under_drops() {
        let (mut a, mut b) = pair();
        connect(&mut a, &mut b);
        for i in 0..30u8 {
            a.send(vec![i, i ^ 0xFF]).unwrap();
        }
        // drop every third frame in both directions
        settle(&mut a, &mut b, 3);
        let got = received(&mut b);
        assert_eq!(got.len(), 30, "lost or duplicated frames");
        for (i, d) in got.iter().enumerate() {
            assert_eq!(d, &vec![i as u8, i as u8 ^ 0xFF]);
        }
    }

    #[test]
    fn test_reorder_via_sack() {
        let (mut a, mut b) = pair();
        connect(&mut a, &mut b);
        a.send(vec![0]).unwrap();
        a.send(vec![1]).unwrap();
        a.send(vec![2]).unwrap();
        let f0 = a.poll_frame().unwrap();
        let f1 = a.poll_frame().unwrap();
        let f2 = a.poll_frame().unwrap();
        // deliver 2, 0, 1
        b.handle_frame(&f2).unwrap();
        assert!(received(&mut b).is_empty());
        b.handle_frame(&f0).unwrap();
        b.handle_frame(&f1).unwrap();
        assert_eq!(received(&mut b), vec![vec![0], vec![1], vec![2]]);
    }

    #[test]
    fn test_sack_keeps_holes_on_retransmit_path() {
        let (mut a, mut b) = pair();
        connect(&mut a, &mut b);
        for i in 0..5u8 {
            a.send(vec![i]).unwrap();
        }
        // lose the first and third frames, deliver the rest
        let frames: Vec<_> = std::iter::from_fn(|| a.poll_frame()).collect();
        for (i, f) in frames.iter().enumerate() {
            if i != 0 && i != 2 {
                b.handle_frame(f).unwrap();
            }
        }
        // the receiver reports what it holds beyond the holes
        b.tick();
        while let Some(f) = b.poll_frame() {
            a.handle_frame(&f).unwrap();
        }
        // only the two holes may be retransmitted, and both must be
        settle(&mut a, &mut b, 0);
        assert_eq!(received(&mut b), (0..5u8).map(|i| vec![i]).collect::<Vec<_>>());
        assert_ne!(a.state(), StreamState::TimedOut);
    }

    #[test]
    fn test_flow_control_gates_new_data() {
        let (mut a, mut b) = pair();
        connect(&mut a, &mut b);
        b.set_ready(false);
        settle(&mut a, &mut b, 0);
        assert_eq!(a.poll_event(), Some(StreamEvent::PeerReady(false)));

        a.send(vec![9]).unwrap();
        assert!(a.poll_frame().is_none(), "sent data to a not-ready peer");

        b.set_ready(true);
        settle(&mut a, &mut b, 0);
        assert_eq!(a.poll_event(), Some(StreamEvent::PeerReady(true)));
        assert_eq!(received(&mut b), vec![vec![9]]);
    }

    #[test]
    fn test_timeout_escalates_to_disconnect() {
        let (mut a, mut b) = pair();
        connect(&mut a, &mut b);
        a.send(vec![1]).unwrap();
        while a.poll_frame().is_some() {}
        // peer never answers
        for _ in 0..40 {
            a.tick();
            while a.poll_frame().is_some() {}
        }
        assert_eq!(a.state(), StreamState::TimedOut);
        let evs: Vec<_> = std::iter::from_fn(|| a.poll_event()).collect();
        assert!(evs.contains(&StreamEvent::Disconnected));
        assert!(evs.contains(&StreamEvent::TimedOut));
        assert!(a.send(vec![2]).is_err());
    }

    #[test]
    fn test_remote_error_passthrough() {
        let (mut a, mut b) = pair();
        connect(&mut a, &mut b);
        let mut frame = vec![F_CTRL | CTRL_ERROR];
        frame.extend_from_slice(b"bus fault");
        b.handle_frame(&frame).unwrap();
        assert_eq!(
            b.poll_event(),
            Some(StreamEvent::RemoteError("bus fault".into()))
        );
    }

    #[test]
    fn test_close_drains_and_reports() {
        let (mut a, mut b) = pair();
        connect(&mut a, &mut b);
        a.send(vec![7]).unwrap();
        a.close();
        settle(&mut a, &mut b, 0);
        let evs: Vec<_> = std::iter::from_fn(|| a.poll_event()).collect();
        assert!(evs.contains(&StreamEvent::Disconnected));
        assert!(a.send(vec![8]).is_err());
    }

    #[test]
    fn test_window_rejected_below_four() {
        let cfg = StreamConfig { window: 3, ..Default::default() };
        assert!(ReliableStream::new(cfg).is_err());
    }

    #[test]
    fn test_between_wraparound() {
        assert!(between(250, 252, 4));
        assert!(between(250, 250, 4));
        assert!(between(250, 4, 4));
        assert!(!between(250, 5, 4));
        assert!(!between(250, 249, 4));
    }
}
