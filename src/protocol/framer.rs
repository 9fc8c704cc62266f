//! Serial frame transport.
//!
//! Carries bus messages over a byte-oriented serial link. A frame is a
//! start byte (`0x01..=0x04`, encoding the priority), a length (one byte,
//! or two with the `0x80` continuation bit), the header+payload bytes and
//! a big-endian CRC16 over exactly those bytes. A lone `0x06` acknowledges
//! the most recent good frame.
//!
//! Firmware consoles share the same UART, so printable runs that start
//! outside a frame are collected as text lines instead of being counted
//! byte-by-byte as noise.

use std::collections::VecDeque;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, warn};

use super::crc::Crc;
use super::message::Message;
use crate::core::{Error, Priority, Result, ACK_BYTE};

/// Partial frames stalled for more than this many idle ticks are dropped
const IDLE_LIMIT: u8 = 3;

/// Error counters kept by a framer instance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameCounters {
    /// Non-frame, non-printable bytes seen between frames
    pub spurious: usize,
    /// Frames dropped for CRC mismatch
    pub crc: usize,
    /// CRC-valid frames dropped for an unparseable header
    pub malformed: usize,
    /// Partial frames dropped by the idle watchdog
    pub lost: usize,
    /// Console text lines skipped
    pub console: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RxState {
    Idle,
    Len,
    Len2,
    Data,
    CrcHigh,
    CrcLow,
    /// Skipping a console text line
    Text,
}

/// Anything the framer can put on the wire
#[derive(Debug)]
pub enum SerialFrame {
    /// A message frame with its priority
    Msg(Message, Priority),
    /// A single acknowledgement byte
    Ack,
}

/// Sans-IO serial framer.
///
/// Doubles as a `tokio_util` codec so host-side code can wrap any
/// `AsyncRead`/`AsyncWrite` serial port in a `Framed` transport.
#[derive(Debug)]
pub struct SerialFramer {
    state: RxState,
    prio: Priority,
    len: usize,
    msg: Message,
    crc: Crc,
    crc_high: u8,
    idle: u8,
    acks: u8,
    ack_due: u8,
    max_len: usize,
    counters: FrameCounters,
    text: Vec<u8>,
    console: VecDeque<String>,
}

impl SerialFramer {
    /// Creates a framer accepting frames up to `max_len` data bytes
    pub fn new(max_len: usize) -> Self {
        SerialFramer {
            state: RxState::Idle,
            prio: Priority::default(),
            len: 0,
            msg: Message::new(max_len),
            crc: Crc::crc16(),
            crc_high: 0,
            idle: 0,
            acks: 0,
            ack_due: 0,
            max_len,
            counters: FrameCounters::default(),
            text: Vec::new(),
            console: VecDeque::new(),
        }
    }

    /// Current error counters
    pub fn counters(&self) -> FrameCounters {
        self.counters
    }

    /// Number of acknowledgement bytes received since the last call
    pub fn take_acks(&mut self) -> u8 {
        std::mem::take(&mut self.acks)
    }

    /// Acknowledgements owed to the peer, one per good frame.
    ///
    /// The transmit side sends one [`SerialFrame::Ack`] for each.
    pub fn take_acks_due(&mut self) -> u8 {
        std::mem::take(&mut self.ack_due)
    }

    /// Next skipped console line, if any
    pub fn pop_console_line(&mut self) -> Option<String> {
        self.console.pop_front()
    }

    fn restart_rx(&mut self) {
        self.state = RxState::Idle;
        self.crc.reset();
        self.msg = Message::new(self.max_len);
    }

    /// Processes one received byte.
    ///
    /// Returns a complete message with its priority once a frame passes
    /// the CRC. Bad frames are dropped and counted, never surfaced.
    pub fn push_byte(&mut self, c: u8) -> Result<Option<(Message, Priority)>> {
        self.idle = 0;
        match self.state {
            RxState::Idle => {
                if c == ACK_BYTE {
                    self.acks = self.acks.saturating_add(1);
                } else if let Some(prio) = Priority::from_start_byte(c) {
                    self.prio = prio;
                    self.msg.start_add()?;
                    self.state = RxState::Len;
                } else if c >= 0x20 && c < 0x7F {
                    self.text.push(c);
                    self.state = RxState::Text;
                } else {
                    self.counters.spurious += 1;
                }
            }
            RxState::Text => {
                if c == b'\n' || c == b'\r' {
                    let line = String::from_utf8_lossy(&self.text).into_owned();
                    debug!(line = %line, "console");
                    self.console.push_back(line);
                    self.text.clear();
                    self.counters.console += 1;
                    self.state = RxState::Idle;
                } else {
                    self.text.push(c);
                }
            }
            RxState::Len => {
                if c & 0x80 != 0 {
                    self.len = ((c & 0x7F) as usize) << 8;
                    self.state = RxState::Len2;
                } else {
                    self.len = c as usize;
                    // a zero-length frame carries no header and cannot be
                    // valid; let the CRC check throw it out
                    self.state = if self.len == 0 { RxState::CrcHigh } else { RxState::Data };
                }
            }
            RxState::Len2 => {
                self.len |= c as usize;
                self.state = if self.len == 0 { RxState::CrcHigh } else { RxState::Data };
            }
            RxState::Data => {
                if self.len > self.max_len {
                    warn!(len = self.len, "oversized frame dropped");
                    self.counters.lost += 1;
                    self.restart_rx();
                    return Ok(None);
                }
                self.msg.add_chunk(c as u16, 8)?;
                self.crc.update_byte(c);
                self.len -= 1;
                if self.len == 0 {
                    self.state = RxState::CrcHigh;
                }
            }
            RxState::CrcHigh => {
                self.crc_high = c;
                self.state = RxState::CrcLow;
            }
            RxState::CrcLow => {
                let got = ((self.crc_high as u16) << 8) | c as u16;
                if got != self.crc.finish() {
                    self.counters.crc += 1;
                    debug!("frame dropped, CRC mismatch");
                    self.restart_rx();
                    return Ok(None);
                }
                let mut msg = std::mem::replace(&mut self.msg, Message::new(self.max_len));
                let prio = self.prio;
                self.restart_rx();
                msg.align();
                if msg.read_header().is_err() {
                    // checksum fine, content nonsense; drop it like a CRC hit
                    self.counters.malformed += 1;
                    debug!("frame dropped, malformed header");
                    return Ok(None);
                }
                self.ack_due = self.ack_due.saturating_add(1);
                return Ok(Some((msg, prio)));
            }
        }
        Ok(None)
    }

    /// Advances the idle watchdog by one tick.
    ///
    /// Returns true while a partial frame is pending. A frame stalled for
    /// more than [`IDLE_LIMIT`] ticks is dropped.
    pub fn idle_tick(&mut self) -> bool {
        match self.state {
            RxState::Idle | RxState::Text => {
                self.idle = 0;
                false
            }
            _ => {
                self.idle += 1;
                if self.idle > IDLE_LIMIT {
                    self.idle = 0;
                    self.counters.lost += 1;
                    warn!("partial frame dropped by idle watchdog");
                    self.restart_rx();
                }
                true
            }
        }
    }

    /// Serializes one frame into `dst`
    pub fn frame_into(&self, mut msg: Message, prio: Priority, dst: &mut BytesMut) -> Result<()> {
        msg.start_extract()?;
        let len = (msg.total_bits() + 7) / 8;
        dst.put_u8(prio.start_byte());
        if len >= 0x80 {
            dst.put_u8(0x80 | (len >> 8) as u8);
            dst.put_u8(len as u8);
        } else {
            dst.put_u8(len as u8);
        }
        let mut crc = Crc::crc16();
        while let Some(c) = msg.extract_chunk(8)? {
            let c = c as u8;
            crc.update_byte(c);
            dst.put_u8(c);
        }
        dst.put_u16(crc.finish());
        Ok(())
    }
}

impl Decoder for SerialFramer {
    type Item = (Message, Priority);
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        while src.has_remaining() {
            let c = src.get_u8();
            if let Some(out) = self.push_byte(c)? {
                return Ok(Some(out));
            }
        }
        Ok(None)
    }
}

impl Encoder<SerialFrame> for SerialFramer {
    type Error = Error;

    fn encode(&mut self, item: SerialFrame, dst: &mut BytesMut) -> Result<()> {
        match item {
            SerialFrame::Msg(msg, prio) => self.frame_into(msg, prio, dst),
            SerialFrame::Ack => {
                dst.put_u8(ACK_BYTE);
                Ok(())
            }
        }
    }
}
