//! Forward-error-coded wire codec.
//!
//! Message bits are regrouped into chunks sized for the physical wire
//! count, each chunk is split into base-`(2^n - 1)` digits and every digit
//! is transmitted as an XOR against the previous wire state. A symbol value
//! of zero never occurs, so every transmitted symbol flips at least one
//! wire; a stuck line therefore turns into a bounded run of decodable
//! symbol errors instead of silent corruption.
//!
//! A running CRC is accumulated over the differentially-encoded states
//! (XORed with the priority bits claimed at acquisition) and appended as
//! the final digits of the frame: 6-bit for short frames, 11-bit beyond
//! the 56-bit threshold.
//!
//! Chunk geometry per wire count:
//!
//! | wires | chunk bits | digits | end marker |
//! |-------|------------|--------|------------|
//! |   2   |     11     |   7    |     3      |
//! |   3   |     14     |   5    |     2      |
//! |   4   |     11     |   3    |     1      |
//! |   5   |     14     |   3    |     1      |
//! |   6   |     11     |   2    |     1      |

use tracing::trace;

use super::crc::Crc;
use super::message::Message;
use crate::core::{Error, Priority, Result, MAX_WIRES, MIN_WIRES};

/// Chunk payload bits, indexed by wire count - 2
const BITS: [u8; 5] = [11, 14, 11, 14, 11];
/// Digits per chunk
const LEN: [u8; 5] = [7, 5, 3, 3, 2];
/// All-wires flips marking a clean end of data
const N_END: [u8; 5] = [3, 2, 1, 1, 1];

/// Frames at or below this many received bits use the 6-bit CRC
const CRC_THRESHOLD_BITS: usize = 56;

/// Per-wire-count codec parameters
#[derive(Debug, Clone, Copy)]
pub struct WireCodec {
    wires: u8,
    /// all-wires-active symbol, also the digit base minus nothing: digits run 1..=max
    max: u8,
    bits: u8,
    len: u8,
    n_end: u8,
    /// end-of-data accumulator value
    val_end: u32,
    /// first chunk value that cannot be a plain data chunk
    val_max: u32,
}

impl WireCodec {
    /// Creates a codec for a bus with the given number of signal wires
    pub fn new(wires: u8) -> Result<Self> {
        if !(MIN_WIRES..=MAX_WIRES).contains(&wires) {
            return Err(Error::protocol(format!("unsupported wire count {}", wires)));
        }
        let idx = (wires - 2) as usize;
        let max = (1u8 << wires) - 1;
        let n_end = N_END[idx];
        Ok(WireCodec {
            wires,
            max,
            bits: BITS[idx],
            len: LEN[idx],
            n_end,
            val_end: (max as u32).pow(n_end as u32) - 1,
            val_max: 1 << BITS[idx],
        })
    }

    /// Number of signal wires
    pub fn wires(&self) -> u8 {
        self.wires
    }

    /// Digits needed to carry a CRC of the given bit width
    fn crc_digits(&self, width: u8) -> u8 {
        let ceiling = 1u32 << width;
        let mut n = 0;
        let mut span = 1u32;
        while span < ceiling {
            span *= self.max as u32;
            n += 1;
        }
        n
    }

    /// Splits a chunk value into `digits` wire symbols, most significant
    /// digit transmitted first
    fn split(&self, mut val: u32, digits: u8) -> Vec<u8> {
        let mut out = vec![0u8; digits as usize];
        for slot in out.iter_mut().rev() {
            *slot = (val % self.max as u32) as u8 + 1;
            val /= self.max as u32;
        }
        debug_assert_eq!(val, 0);
        out
    }

    /// Encodes a message into the sequence of wire states, starting from an
    /// idle bus. The first state is the acquisition state carrying the
    /// priority bit; the rest are the XOR-chained data, end marker and CRC.
    pub fn encode(&self, msg: &mut Message, prio: Priority) -> Result<Vec<u8>> {
        msg.start_extract()?;

        // a narrow bus cannot express the highest priorities; clamp to the
        // top wire instead of driving a bit that does not exist
        let prio_bits = if prio.level() >= self.wires {
            1 << (self.wires - 1)
        } else {
            prio.acquire_bit()
        };
        let mut states = vec![prio_bits];
        let mut last = prio_bits;
        let mut crc6 = Crc::crc6();
        let mut crc11 = Crc::crc11();
        let mut rx_bits = 0usize;

        let mut emit = |digits: &[u8], last: &mut u8, states: &mut Vec<u8>| {
            for d in digits {
                debug_assert!(*d >= 1 && *d <= self.max);
                let state = *last ^ *d;
                crc6.update((state ^ prio_bits) as u16, self.wires);
                crc11.update((state ^ prio_bits) as u16, self.wires);
                states.push(state);
                *last = state;
            }
        };

        loop {
            match msg.extract_chunk(self.bits)? {
                Some(chunk) => {
                    let val = chunk as u32;
                    let residual = val >= self.val_max;
                    rx_bits += if residual { (self.bits - 8) as usize } else { self.bits as usize };
                    emit(&self.split(val, self.len), &mut last, &mut states);
                    if residual {
                        // a residue-marked chunk is always the last one
                        break;
                    }
                }
                None => {
                    let marker = vec![self.max; self.n_end as usize];
                    emit(&marker, &mut last, &mut states);
                    break;
                }
            }
        }

        let (crc, width) = if rx_bits <= CRC_THRESHOLD_BITS {
            (crc6.finish(), 6)
        } else {
            (crc11.finish(), 11)
        };
        // the CRC digits themselves are not covered by the CRC
        for d in self.split(crc as u32, self.crc_digits(width)) {
            let state = last ^ d;
            states.push(state);
            last = state;
        }

        trace!(states = states.len(), rx_bits, crc_width = width, "encoded frame");
        Ok(states)
    }

    /// Creates a decoder for one incoming frame
    pub fn decoder(&self, capacity: usize) -> WireDecoder {
        WireDecoder {
            codec: *self,
            msg: Message::new(capacity),
            phase: Phase::Acquire,
            prio_bits: 0,
            last: 0,
            val: 0,
            nval: 0,
            rx_bits: 0,
            crc6: Crc::crc6(),
            crc11: Crc::crc11(),
            expect_crc: 0,
            crc_digits: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Waiting for the acquisition state
    Acquire,
    /// Accumulating data digits
    Data,
    /// Accumulating CRC digits
    Crc,
}

/// Streaming decoder for one FEC frame.
///
/// Feed it the settled wire states one at a time; it yields the decoded
/// message after the final CRC digit, or an error on any inconsistency.
#[derive(Debug)]
pub struct WireDecoder {
    codec: WireCodec,
    msg: Message,
    phase: Phase,
    prio_bits: u8,
    last: u8,
    val: u32,
    nval: u8,
    rx_bits: usize,
    crc6: Crc,
    crc11: Crc,
    expect_crc: u16,
    crc_digits: u8,
}

impl WireDecoder {
    /// The priority claimed by the frame's acquisition state
    pub fn priority(&self) -> Option<Priority> {
        if self.phase == Phase::Acquire {
            None
        } else {
            Some(Priority::new(self.prio_bits.trailing_zeros() as u8))
        }
    }

    /// Processes one settled wire state.
    ///
    /// Returns the finished message once the CRC checks out, `None` while
    /// the frame is still in progress.
    pub fn feed(&mut self, state: u8) -> Result<Option<Message>> {
        let c = self.codec;
        match self.phase {
            Phase::Acquire => {
                if state == 0 || state.count_ones() != 1 || state > c.max {
                    return Err(Error::protocol(format!(
                        "invalid acquisition state {:#04x}",
                        state
                    )));
                }
                self.prio_bits = state;
                self.last = state;
                self.msg.start_add()?;
                self.phase = Phase::Data;
                return Ok(None);
            }
            Phase::Data => {
                let delta = state ^ self.last;
                self.last = state;
                if delta == 0 {
                    return Err(Error::protocol("wire state did not change"));
                }
                self.crc6.update((state ^ self.prio_bits) as u16, c.wires);
                self.crc11.update((state ^ self.prio_bits) as u16, c.wires);
                self.val = self.val * c.max as u32 + (delta - 1) as u32;
                self.nval += 1;

                if self.nval == c.n_end && self.val == c.val_end {
                    self.begin_crc();
                } else if self.nval == c.len {
                    if self.val >= c.val_max + (1 << (c.bits - 8)) {
                        return Err(Error::ChecksumMismatch);
                    }
                    let residual = self.val >= c.val_max;
                    self.rx_bits +=
                        if residual { (c.bits - 8) as usize } else { c.bits as usize };
                    self.msg.add_chunk(self.val as u16, c.bits)?;
                    self.val = 0;
                    self.nval = 0;
                    if residual {
                        self.begin_crc();
                    }
                }
            }
            Phase::Crc => {
                let delta = state ^ self.last;
                self.last = state;
                if delta == 0 {
                    return Err(Error::protocol("wire state did not change"));
                }
                self.val = self.val * c.max as u32 + (delta - 1) as u32;
                self.nval += 1;
                if self.nval == self.crc_digits {
                    if self.val != self.expect_crc as u32 {
                        return Err(Error::ChecksumMismatch);
                    }
                    let mut msg = std::mem::replace(&mut self.msg, Message::new(0));
                    msg.align();
                    msg.read_header()?;
                    trace!(%msg, rx_bits = self.rx_bits, "decoded frame");
                    return Ok(Some(msg));
                }
            }
        }
        Ok(None)
    }

    fn begin_crc(&mut self) {
        let (crc, width) = if self.rx_bits <= CRC_THRESHOLD_BITS {
            (self.crc6.finish(), 6)
        } else {
            (self.crc11.finish(), 11)
        };
        self.expect_crc = crc;
        self.crc_digits = self.codec.crc_digits(width);
        self.val = 0;
        self.nval = 0;
        self.phase = Phase::Crc;
    }
}
