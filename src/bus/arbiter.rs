//! Bus access arbiter.
//!
//! One instance per node. The arbiter owns the send queues, drives wire
//! states onto the bus one per timer tick, verifies each settled state
//! against what it drove (a wired-OR mismatch is a collision) and runs the
//! receive path for frames other nodes transmit.
//!
//! The machine is sans-IO: the physical layer is behind the [`Wire`]
//! trait, time is advanced with [`Arbiter::tick`], and results are drained
//! with [`Arbiter::poll_event`]. A collision is never an error for the
//! application; the frame is re-queued and retried after a jittered
//! backoff.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::core::{Priority, Result, DEFAULT_WIRES};
use crate::protocol::codec::{WireCodec, WireDecoder};
use crate::protocol::message::{Message, MessagePool};
use crate::util::minifloat::{self, Minifloat};

/// Physical bus access, wired-OR semantics
pub trait Wire {
    /// Current settled state of all wires
    fn sense(&self) -> u8;
    /// This node's contribution to the bus state
    fn drive(&mut self, bits: u8);
}

/// Arbiter tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Number of signal wires
    pub wires: u8,
    /// Consecutive quiet ticks before the bus counts as idle
    pub idle_ticks: u8,
    /// Ticks a writer waits for an acknowledge symbol
    pub ack_ticks: u8,
    /// Receive buffer size in bytes
    pub msg_capacity: usize,
    /// Message pool slots
    pub pool_size: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        BusConfig {
            wires: DEFAULT_WIRES,
            idle_ticks: 5,
            ack_ticks: 5,
            msg_capacity: 64,
            pool_size: 8,
        }
    }
}

/// Minimum backoff window in ticks
const T_BACKOFF: u32 = 2;

/// Outcome of a transmission attempt, after retries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Receiver acknowledged
    Success,
    /// No acknowledge seen
    Missing,
    /// Receiver signalled a checksum failure
    Rejected,
    /// Unexplained bus activity in the acknowledge window
    Fatal,
}

/// Events produced by the arbiter
#[derive(Debug)]
pub enum BusEvent {
    /// A frame addressed to anyone arrived intact
    Received(Message, Priority),
    /// A queued frame is done, one way or the other
    Transmitted(Message, SendOutcome),
}

#[derive(Debug)]
enum State {
    /// Waiting for the bus to stay quiet
    WaitIdle { quiet: u8 },
    /// Bus is idle; the backoff timer may be running
    Idle,
    /// Driving the frame in `states`, position already on the wire
    Writing { pos: usize },
    /// Frame fully driven, waiting for the acknowledge symbol
    WriteAck { waited: u8, ack: u8, nack: u8 },
    /// Following another node's frame
    Reading { decoder: WireDecoder, last: u8, stalled: u8 },
    /// Frame decoded; waiting for the writer to release the bus before
    /// driving our acknowledge
    AckWait { mask: u8, waited: u8 },
    /// Driving our acknowledge symbol for one tick
    ReadAck,
}

/// Per-node bus arbiter
pub struct Arbiter<W: Wire> {
    cfg: BusConfig,
    wire: W,
    codec: WireCodec,
    state: State,
    queue: VecDeque<(Message, Priority)>,
    prio_queue: VecDeque<(Message, Priority)>,
    sending: Option<(Message, Priority)>,
    states: Vec<u8>,
    tries: u8,
    backoff: Minifloat,
    backoff_window: u32,
    pool: MessagePool,
    events: VecDeque<BusEvent>,
}

/// Acknowledge masks derived from the final settled frame state.
///
/// The ack wire must differ from whatever the bus last carried; on a
/// two-wire bus there is no third level left for a distinct nack.
fn ack_masks(wires: u8, last: u8) -> (u8, u8) {
    let ack = if last == 1 { 2 } else { 1 };
    let nack = if wires == 2 {
        if last != 0 {
            0
        } else {
            2
        }
    } else if last == 3 || last == 1 {
        4
    } else {
        2
    };
    (ack, nack)
}

impl<W: Wire> Arbiter<W> {
    pub fn new(cfg: BusConfig, wire: W) -> Result<Self> {
        let codec = WireCodec::new(cfg.wires)?;
        let pool = MessagePool::new(cfg.pool_size, cfg.msg_capacity);
        Ok(Arbiter {
            cfg,
            wire,
            codec,
            state: State::WaitIdle { quiet: 0 },
            queue: VecDeque::new(),
            prio_queue: VecDeque::new(),
            sending: None,
            states: Vec::new(),
            tries: 0,
            backoff: Minifloat::new(),
            backoff_window: T_BACKOFF,
            pool,
            events: VecDeque::new(),
        })
    }

    /// Allocates a message from the arbiter's pool
    pub fn allocate(&mut self) -> Result<Message> {
        self.pool.allocate()
    }

    /// Returns a message to the pool
    pub fn release(&mut self, msg: Message) {
        self.pool.release(msg);
    }

    /// Queues a frame for transmission
    pub fn send(&mut self, msg: Message, prio: Priority) {
        if prio.level() >= 2 {
            self.prio_queue.push_back((msg, prio));
        } else {
            self.queue.push_back((msg, prio));
        }
    }

    /// Next event, if any
    pub fn poll_event(&mut self) -> Option<BusEvent> {
        self.events.pop_front()
    }

    /// Ticks until the arbiter needs its next [`tick`](Arbiter::tick).
    ///
    /// Dense stepping while the bus is active, relaxed polling when idle
    /// with nothing queued.
    pub fn timeout_request(&self) -> u32 {
        match self.state {
            State::Idle if self.queue.is_empty()
                && self.prio_queue.is_empty()
                && self.backoff.is_stopped() =>
            {
                self.cfg.idle_ticks as u32
            }
            _ => 1,
        }
    }

    /// Releases the wire and returns all pending messages to the pool
    pub fn shutdown(&mut self) {
        self.wire.drive(0);
        if let Some((msg, _)) = self.sending.take() {
            self.pool.release(msg);
        }
        for (msg, _) in self.prio_queue.drain(..).chain(self.queue.drain(..)) {
            self.pool.release(msg);
        }
        self.states.clear();
        self.state = State::WaitIdle { quiet: 0 };
    }

    fn next_queued(&mut self) -> Option<(Message, Priority)> {
        self.prio_queue.pop_front().or_else(|| self.queue.pop_front())
    }

    /// Re-queues the in-flight frame and arms the jittered backoff.
    /// Higher priority draws from a shorter window.
    fn collide(&mut self) {
        if let Some((msg, prio)) = self.sending.take() {
            trace!(prio = prio.level(), "collision, re-queueing");
            let lo = self.backoff_window * (4 - prio.level() as u32);
            self.backoff.set(minifloat::random_between(lo, lo * 3));
            self.backoff_window = (self.backoff_window * 3 / 2).max(self.backoff_window + 1);
            if prio.level() >= 2 {
                self.prio_queue.push_front((msg, prio));
            } else {
                self.queue.push_front((msg, prio));
            }
        }
        self.wire.drive(0);
        self.states.clear();
    }

    /// Ends a transmission attempt: either another retry or a final event
    fn retry(&mut self, outcome: SendOutcome) {
        let Some((msg, prio)) = self.sending.take() else { return };
        self.states.clear();
        let budget = match outcome {
            SendOutcome::Success => {
                debug!(%msg, "transmitted");
                self.tries = 0;
                self.backoff_window = (self.backoff_window / 2).max(T_BACKOFF);
                self.events.push_back(BusEvent::Transmitted(msg, SendOutcome::Success));
                return;
            }
            SendOutcome::Missing => 2,
            SendOutcome::Rejected => 4,
            SendOutcome::Fatal => 6,
        };
        if self.tries == 0 {
            self.tries = budget;
        }
        if self.tries == 1 {
            warn!(%msg, ?outcome, "giving up on frame");
            self.tries = 0;
            self.events.push_back(BusEvent::Transmitted(msg, outcome));
        } else {
            self.tries -= 1;
            self.backoff_window = (self.backoff_window * 3 / 2).max(self.backoff_window + 1);
            if prio.level() >= 2 {
                self.prio_queue.push_front((msg, prio));
            } else {
                self.queue.push_front((msg, prio));
            }
        }
    }

    fn start_write(&mut self, mut msg: Message, prio: Priority) -> State {
        match self.codec.encode(&mut msg, prio) {
            Ok(states) => {
                self.states = states;
                self.sending = Some((msg, prio));
                self.wire.drive(self.states[0]);
                State::Writing { pos: 0 }
            }
            Err(e) => {
                warn!(%msg, error = %e, "unencodable frame dropped");
                self.events.push_back(BusEvent::Transmitted(msg, SendOutcome::Fatal));
                State::Idle
            }
        }
    }

    fn start_read(&mut self, first: u8) -> State {
        let mut decoder = self.codec.decoder(self.cfg.msg_capacity);
        match decoder.feed(first) {
            Ok(None) => State::Reading { decoder, last: first, stalled: 0 },
            Ok(Some(_)) => unreachable!("one state cannot finish a frame"),
            Err(e) => {
                trace!(error = %e, "garbage on idle bus");
                State::WaitIdle { quiet: 0 }
            }
        }
    }

    /// Advances the arbiter by one timer tick
    pub fn tick(&mut self) {
        let sensed = self.wire.sense();
        let state = std::mem::replace(&mut self.state, State::Idle);
        self.state = self.step(state, sensed);
    }

    fn step(&mut self, state: State, sensed: u8) -> State {
        match state {
            State::WaitIdle { quiet } => {
                if sensed == 0 {
                    if quiet + 1 >= self.cfg.idle_ticks {
                        State::Idle
                    } else {
                        State::WaitIdle { quiet: quiet + 1 }
                    }
                } else {
                    self.start_read(sensed)
                }
            }
            State::Idle => {
                if sensed != 0 {
                    // someone else acquired the bus first
                    return self.start_read(sensed);
                }
                if !self.backoff.is_stopped() {
                    if self.backoff.tick() {
                        self.backoff.stop();
                    } else {
                        return State::Idle;
                    }
                }
                if let Some((msg, prio)) = self.next_queued() {
                    self.start_write(msg, prio)
                } else {
                    State::Idle
                }
            }
            State::Writing { pos } => {
                let expect = self.states[pos];
                if sensed != expect {
                    debug!(sensed, expect, "wire mismatch while writing");
                    self.collide();
                    return State::WaitIdle { quiet: 0 };
                }
                if pos + 1 == self.states.len() {
                    let last = self.states[self.states.len() - 1];
                    let (ack, nack) = ack_masks(self.cfg.wires, last);
                    self.wire.drive(0);
                    State::WriteAck { waited: 0, ack, nack }
                } else {
                    self.wire.drive(self.states[pos + 1]);
                    State::Writing { pos: pos + 1 }
                }
            }
            State::WriteAck { waited, ack, nack } => {
                let masks = ack | nack;
                if sensed & nack != 0 {
                    self.retry(SendOutcome::Rejected);
                    State::WaitIdle { quiet: 0 }
                } else if sensed & ack != 0 {
                    if sensed & !masks != 0 {
                        self.retry(SendOutcome::Fatal);
                    } else {
                        self.retry(SendOutcome::Success);
                    }
                    State::WaitIdle { quiet: 0 }
                } else if sensed & !masks != 0 {
                    self.retry(SendOutcome::Fatal);
                    State::WaitIdle { quiet: 0 }
                } else if waited >= self.cfg.ack_ticks {
                    self.retry(SendOutcome::Missing);
                    State::WaitIdle { quiet: 0 }
                } else {
                    State::WriteAck { waited: waited + 1, ack, nack }
                }
            }
            State::Reading { mut decoder, last, stalled } => {
                if sensed == last {
                    if stalled + 1 > self.cfg.idle_ticks {
                        if sensed == 0 {
                            State::Idle
                        } else {
                            // a stuck driver; drop the partial frame
                            warn!(sensed, "bus held mid-frame, resetting");
                            State::WaitIdle { quiet: 0 }
                        }
                    } else {
                        State::Reading { decoder, last, stalled: stalled + 1 }
                    }
                } else {
                    match decoder.feed(sensed) {
                        Ok(None) => State::Reading { decoder, last: sensed, stalled: 0 },
                        Ok(Some(msg)) => {
                            let prio = decoder.priority().unwrap_or_default();
                            let (ack, _) = ack_masks(self.cfg.wires, sensed);
                            self.events.push_back(BusEvent::Received(msg, prio));
                            State::AckWait { mask: ack, waited: 0 }
                        }
                        Err(e) => {
                            debug!(error = %e, "frame rejected");
                            let (_, nack) = ack_masks(self.cfg.wires, last);
                            State::AckWait { mask: nack, waited: 0 }
                        }
                    }
                }
            }
            State::AckWait { mask, waited } => {
                // the ack must wait for the writer to let go of the bus
                if sensed == 0 {
                    if mask == 0 {
                        // two-wire bus has no distinct nack symbol
                        State::WaitIdle { quiet: 0 }
                    } else {
                        self.wire.drive(mask);
                        State::ReadAck
                    }
                } else if waited >= self.cfg.ack_ticks {
                    warn!(sensed, "writer never released, dropping ack");
                    State::WaitIdle { quiet: 0 }
                } else {
                    State::AckWait { mask, waited: waited + 1 }
                }
            }
            State::ReadAck => {
                self.wire.drive(0);
                State::WaitIdle { quiet: 0 }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Addr;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Wired-OR bus shared by test arbiters
    #[derive(Default)]
    struct TestBus {
        drives: Vec<u8>,
    }

    impl TestBus {
        fn state(&self) -> u8 {
            self.drives.iter().fold(0, |a, b| a | b)
        }
    }

    struct TestWire {
        bus: Rc<RefCell<TestBus>>,
        idx: usize,
    }

    impl Wire for TestWire {
        fn sense(&self) -> u8 {
            self.bus.borrow().state()
        }
        fn drive(&mut self, bits: u8) {
            self.bus.borrow_mut().drives[self.idx] = bits;
        }
    }

    fn bus_with_nodes(n: usize) -> (Rc<RefCell<TestBus>>, Vec<Arbiter<TestWire>>) {
        let bus = Rc::new(RefCell::new(TestBus { drives: vec![0; n] }));
        let nodes = (0..n)
            .map(|idx| {
                Arbiter::new(
                    BusConfig::default(),
                    TestWire { bus: bus.clone(), idx },
                )
                .unwrap()
            })
            .collect();
        (bus, nodes)
    }

    fn step_all(nodes: &mut [Arbiter<TestWire>]) {
        for n in nodes.iter_mut() {
            n.tick();
        }
    }

    fn make_msg(src: i8, dst: i8, code: u8, data: &[u8]) -> Message {
        let mut m = Message::new(64);
        m.set_header(Addr(src), Addr(dst), code).unwrap();
        m.start_send().unwrap();
        m.append_bytes(data).unwrap();
        m
    }

    #[test]
    fn test_single_frame_delivery_with_ack() {
        let (_bus, mut nodes) = bus_with_nodes(2);
        nodes[0].send(make_msg(-1, -2, 2, &[1, 2, 3, 4]), Priority::new(1));

        let mut received = None;
        let mut transmitted = None;
        for _ in 0..600 {
            step_all(&mut nodes);
            if let Some(BusEvent::Received(m, p)) = nodes[1].poll_event() {
                received = Some((m, p));
            }
            if let Some(BusEvent::Transmitted(m, o)) = nodes[0].poll_event() {
                transmitted = Some((m, o));
            }
            if received.is_some() && transmitted.is_some() {
                break;
            }
        }
        let (m, p) = received.expect("no frame received");
        assert_eq!(m.src(), Addr(-1));
        assert_eq!(m.dst(), Addr(-2));
        assert_eq!(m.code(), 2);
        assert_eq!(m.data(), &[1, 2, 3, 4]);
        assert_eq!(p, Priority::new(1));
        let (_, outcome) = transmitted.expect("no transmit outcome");
        assert_eq!(outcome, SendOutcome::Success);
    }

    #[test]
    fn test_unheard_frame_reports_missing() {
        // a single node on the bus: nobody acks
        let (_bus, mut nodes) = bus_with_nodes(1);
        nodes[0].send(make_msg(1, 2, 3, &[9]), Priority::new(0));

        let mut outcome = None;
        for _ in 0..2000 {
            step_all(&mut nodes);
            if let Some(BusEvent::Transmitted(_, o)) = nodes[0].poll_event() {
                outcome = Some(o);
                break;
            }
        }
        assert_eq!(outcome, Some(SendOutcome::Missing));
    }

    #[test]
    fn test_competing_senders_both_deliver() {
        let (_bus, mut nodes) = bus_with_nodes(3);
        nodes[0].send(make_msg(1, 3, 5, &[0xAA]), Priority::new(1));
        nodes[1].send(make_msg(2, 3, 5, &[0xBB]), Priority::new(1));

        let mut got = Vec::new();
        for _ in 0..6000 {
            step_all(&mut nodes);
            for n in nodes.iter_mut() {
                while let Some(ev) = n.poll_event() {
                    if let BusEvent::Received(m, _) = ev {
                        got.push(m.data().to_vec());
                    }
                }
            }
            if got.iter().any(|d| d == &[0xAA]) && got.iter().any(|d| d == &[0xBB]) {
                return;
            }
        }
        panic!("not all frames delivered: {:?}", got);
    }

    #[test]
    fn test_shutdown_returns_messages_to_pool() {
        let (_bus, mut nodes) = bus_with_nodes(1);
        let a = &mut nodes[0];
        let m1 = a.allocate().unwrap();
        let m2 = a.allocate().unwrap();
        assert_eq!(a.pool.in_use(), 2);
        a.send(prepared(m1), Priority::new(0));
        a.send(prepared(m2), Priority::new(3));
        a.shutdown();
        assert_eq!(a.pool.in_use(), 0);
    }

    fn prepared(mut m: Message) -> Message {
        m.set_header(Addr(1), Addr(2), 1).unwrap();
        m.start_send().unwrap();
        m.append_byte(0x55).unwrap();
        m
    }

    #[test]
    fn test_ack_masks() {
        // ack and nack never share a wire, and stay within the wire count
        for wires in 2..=4u8 {
            let max = (1u8 << wires) - 1;
            for last in 0..=max {
                let (ack, nack) = ack_masks(wires, last);
                assert_ne!(ack, 0);
                assert_eq!(ack & !max, 0);
                assert_eq!(nack & !max, 0);
                assert_eq!(ack & nack, 0, "wires {} last {:#x}", wires, last);
            }
        }
        assert_eq!(ack_masks(3, 1), (2, 4));
        assert_eq!(ack_masks(2, 3), (1, 0));
    }
}
