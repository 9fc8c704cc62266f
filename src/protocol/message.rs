//! Bus message structure and buffer pool.
//!
//! A message carries a small header (source, destination, command code) and
//! a bit-packed payload. The header is not a separate wire field: when a
//! message is prepared for transmission the header bytes are packed in front
//! of the payload and both travel through the same chunk extraction path.
//!
//! Header forms, chosen by address sign (destination first, then source,
//! the code fills the remainder of the byte):
//!
//! ```text
//! 1 D D 1 S S C C                          both negative, 2-bit code
//! 1 D D 0 S S S S | S S S C C C C C       dst negative,   5-bit code
//! 0 D D D D D D D | 1 S S C C C C C       src negative,   5-bit code
//! 0 D D D D D D D | 0 S S S S S S S | C*8 both positive,  8-bit code
//! ```

use crate::core::{Addr, Error, Result};

/// Buffer lifecycle mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Freshly allocated, header may be set
    Idle,
    /// Payload is being appended for transmission
    Send,
    /// Chunks are being extracted; no further appends
    Extract,
    /// Chunks are being accumulated from the wire
    Recv,
}

/// A single bus message
#[derive(Debug, Clone)]
pub struct Message {
    src: Addr,
    dst: Addr,
    code: u8,
    buf: Vec<u8>,
    /// payload length in bits
    bit_len: usize,
    capacity_bits: usize,
    mode: Mode,
    /// extract cursor, in bits over header + payload
    pos: usize,
    /// packed header, present while extracting
    hdr: Vec<u8>,
}

impl Message {
    /// Creates a message with the given payload capacity in bytes
    pub fn new(capacity: usize) -> Self {
        Message {
            src: Addr::BROADCAST,
            dst: Addr::BROADCAST,
            code: 0,
            buf: Vec::with_capacity(capacity),
            bit_len: 0,
            capacity_bits: capacity * 8,
            mode: Mode::Idle,
            pos: 0,
            hdr: Vec::new(),
        }
    }

    /// Sets the header fields. Must precede `start_extract`.
    pub fn set_header(&mut self, src: Addr, dst: Addr, code: u8) -> Result<()> {
        if self.mode == Mode::Extract {
            return Err(Error::invalid_state("header is immutable once extraction began"));
        }
        self.src = src;
        self.dst = dst;
        self.code = code;
        Ok(())
    }

    /// Source address
    pub fn src(&self) -> Addr {
        self.src
    }

    /// Destination address
    pub fn dst(&self) -> Addr {
        self.dst
    }

    /// Command code
    pub fn code(&self) -> u8 {
        self.code
    }

    /// Switches the buffer into send mode and resets the payload
    pub fn start_send(&mut self) -> Result<()> {
        match self.mode {
            Mode::Idle | Mode::Send => {
                self.mode = Mode::Send;
                self.buf.clear();
                self.bit_len = 0;
                Ok(())
            }
            _ => Err(Error::invalid_state("start_send after extraction began")),
        }
    }

    /// Switches the buffer into receive mode
    pub fn start_add(&mut self) -> Result<()> {
        match self.mode {
            Mode::Idle | Mode::Recv => {
                self.mode = Mode::Recv;
                self.buf.clear();
                self.bit_len = 0;
                self.hdr.clear();
                Ok(())
            }
            _ => Err(Error::invalid_state("start_add on a send-side buffer")),
        }
    }

    /// Packs the header and positions the extraction cursor at its start
    pub fn start_extract(&mut self) -> Result<()> {
        match self.mode {
            Mode::Send | Mode::Idle | Mode::Extract => {
                self.hdr = pack_header(self.dst, self.src, self.code);
                self.mode = Mode::Extract;
                self.pos = 0;
                Ok(())
            }
            Mode::Recv => Err(Error::invalid_state("start_extract on a receive buffer")),
        }
    }

    /// Total message length in bits, header included (valid while extracting)
    pub fn total_bits(&self) -> usize {
        self.hdr.len() * 8 + self.bit_len
    }

    /// Payload length in whole bytes
    pub fn len(&self) -> usize {
        self.bit_len / 8
    }

    /// Returns true if no payload has been added
    pub fn is_empty(&self) -> bool {
        self.bit_len == 0
    }

    /// Payload bytes (complete bytes only)
    pub fn data(&self) -> &[u8] {
        &self.buf[..self.bit_len / 8]
    }

    /// Appends `bits` (≤16) bits of `value` to the payload
    pub fn append_chunk(&mut self, value: u16, bits: u8) -> Result<()> {
        if self.mode == Mode::Extract {
            return Err(Error::invalid_state("append after extraction began"));
        }
        if self.mode == Mode::Idle {
            self.start_send()?;
        }
        self.push_bits(value, bits)
    }

    /// Appends one byte to the payload
    pub fn append_byte(&mut self, byte: u8) -> Result<()> {
        self.append_chunk(byte as u16, 8)
    }

    /// Appends bytes, padding any sub-byte remainder with zero bits first
    pub fn append_bytes(&mut self, data: &[u8]) -> Result<()> {
        let rem = self.bit_len % 8;
        if rem != 0 {
            self.append_chunk(0, (8 - rem) as u8)?;
        }
        for b in data {
            self.append_byte(*b)?;
        }
        Ok(())
    }

    /// Extracts the next chunk of `frame_bits` bits from header + payload.
    ///
    /// A short final chunk is zero-padded; when at least eight bits are
    /// missing it is instead shifted and tagged with the `1 << frame_bits`
    /// residue marker so the receiver can undo the padding.
    /// Returns `None` once the message is exhausted.
    pub fn extract_chunk(&mut self, frame_bits: u8) -> Result<Option<u16>> {
        if self.mode != Mode::Extract {
            return Err(Error::invalid_state("extract_chunk before start_extract"));
        }
        debug_assert!(frame_bits <= 16);
        let total = self.total_bits();
        if self.pos >= total {
            return Ok(None);
        }
        let avail = total - self.pos;
        let take = (frame_bits as usize).min(avail) as u8;
        let mut value = self.read_bits(self.pos, take);
        self.pos += take as usize;
        if take < frame_bits {
            let missing = frame_bits - take;
            if missing >= 8 {
                debug_assert!(frame_bits < 16);
                value = (value << (missing - 8)) | (1 << frame_bits);
            } else {
                value <<= missing;
            }
        }
        Ok(Some(value))
    }

    /// Feeds a received chunk into the buffer, honoring the residue marker
    pub fn add_chunk(&mut self, mut value: u16, mut frame_bits: u8) -> Result<()> {
        if self.mode != Mode::Recv {
            self.start_add()?;
        }
        if frame_bits < 16 && value & (1 << frame_bits) != 0 {
            frame_bits -= 8;
            value &= (1 << frame_bits) - 1;
        }
        self.push_bits(value, frame_bits)
    }

    /// Drops any trailing sub-byte padding bits
    pub fn align(&mut self) {
        self.bit_len -= self.bit_len % 8;
        self.buf.truncate(self.bit_len / 8);
    }

    /// Parses and strips the packed header from a received buffer.
    ///
    /// Fails with a protocol error when the buffer is too short to contain
    /// the header it announces: the message is malformed, not truncated.
    pub fn read_header(&mut self) -> Result<()> {
        let (dst, src, code, hdr_len) = parse_header(self.data())
            .ok_or_else(|| Error::protocol("message shorter than its header"))?;
        self.dst = dst;
        self.src = src;
        self.code = code;
        self.buf.drain(..hdr_len);
        self.bit_len -= hdr_len * 8;
        Ok(())
    }

    /// Resets the buffer for reuse
    pub fn reset(&mut self) {
        self.src = Addr::BROADCAST;
        self.dst = Addr::BROADCAST;
        self.code = 0;
        self.buf.clear();
        self.bit_len = 0;
        self.mode = Mode::Idle;
        self.pos = 0;
        self.hdr.clear();
    }

    fn push_bits(&mut self, value: u16, bits: u8) -> Result<()> {
        debug_assert!(bits <= 16);
        if self.bit_len + bits as usize > self.capacity_bits {
            return Err(Error::overflow(format!(
                "{} + {} bits exceeds capacity of {}",
                self.bit_len, bits, self.capacity_bits
            )));
        }
        let mut rem = bits as usize;
        while rem > 0 {
            let byte = self.bit_len / 8;
            let off = self.bit_len % 8;
            if byte == self.buf.len() {
                self.buf.push(0);
            }
            let avail = 8 - off;
            let take = avail.min(rem);
            let piece = ((value >> (rem - take)) & ((1 << take) - 1)) as u8;
            self.buf[byte] |= piece << (avail - take);
            self.bit_len += take;
            rem -= take;
        }
        Ok(())
    }

    /// Reads `bits` bits starting at bit position `pos` of header + payload
    fn read_bits(&self, pos: usize, bits: u8) -> u16 {
        let hdr_bits = self.hdr.len() * 8;
        let mut value = 0u16;
        for i in 0..bits as usize {
            let p = pos + i;
            let bit = if p < hdr_bits {
                (self.hdr[p / 8] >> (7 - p % 8)) & 1
            } else {
                let p = p - hdr_bits;
                (self.buf[p / 8] >> (7 - p % 8)) & 1
            };
            value = (value << 1) | bit as u16;
        }
        value
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Msg<src:{} dst:{} code:{:#x} len:{}>",
            self.src,
            self.dst,
            self.code,
            self.len()
        )
    }
}

/// Packs the header bytes for the given fields
fn pack_header(dst: Addr, src: Addr, code: u8) -> Vec<u8> {
    let d = dst.0;
    let s = src.0;
    if d < 0 {
        if s < 0 {
            vec![0x80 | ((d as u8 & 0x03) << 5) | 0x10 | ((s as u8 & 0x03) << 2) | (code & 0x03)]
        } else {
            vec![
                0x80 | ((d as u8 & 0x03) << 5) | ((s as u8 >> 3) & 0x0F),
                ((s as u8 & 0x07) << 5) | (code & 0x1F),
            ]
        }
    } else if s < 0 {
        vec![d as u8, 0x80 | ((s as u8 & 0x03) << 5) | (code & 0x1F)]
    } else {
        vec![d as u8, s as u8, code]
    }
}

/// Parses a packed header. Returns (dst, src, code, header length).
fn parse_header(data: &[u8]) -> Option<(Addr, Addr, u8, usize)> {
    let b0 = *data.first()?;
    if b0 & 0x80 != 0 {
        let dst = Addr(((b0 >> 5) | 0xFC) as i8);
        if b0 & 0x10 != 0 {
            let src = Addr(((b0 >> 2) | 0xFC) as i8);
            Some((dst, src, b0 & 0x03, 1))
        } else {
            let b1 = *data.get(1)?;
            let src = Addr((((b0 & 0x0F) << 3) | (b1 >> 5)) as i8);
            Some((dst, src, b1 & 0x1F, 2))
        }
    } else {
        let dst = Addr(b0 as i8);
        let b1 = *data.get(1)?;
        if b1 & 0x80 != 0 {
            let src = Addr(((b1 >> 5) | 0xFC) as i8);
            Some((dst, src, b1 & 0x1F, 2))
        } else {
            let b2 = *data.get(2)?;
            Some((dst, Addr(b1 as i8), b2, 3))
        }
    }
}

/// A pool of reusable message buffers.
///
/// Ownership is exclusive: `allocate` moves a buffer out, `release` moves it
/// back, so a buffer lives in at most one queue at any time.
#[derive(Debug)]
pub struct MessagePool {
    free: Vec<Message>,
    outstanding: usize,
    max: usize,
    capacity: usize,
}

impl MessagePool {
    /// Creates a pool of at most `max` buffers of `capacity` payload bytes
    pub fn new(max: usize, capacity: usize) -> Self {
        MessagePool { free: Vec::new(), outstanding: 0, max, capacity }
    }

    /// Takes a buffer from the pool
    pub fn allocate(&mut self) -> Result<Message> {
        if let Some(mut msg) = self.free.pop() {
            msg.reset();
            self.outstanding += 1;
            return Ok(msg);
        }
        if self.outstanding >= self.max {
            return Err(Error::OutOfMemory);
        }
        self.outstanding += 1;
        Ok(Message::new(self.capacity))
    }

    /// Returns a buffer to the pool
    pub fn release(&mut self, mut msg: Message) {
        msg.reset();
        self.outstanding = self.outstanding.saturating_sub(1);
        if self.free.len() < self.max {
            self.free.push(msg);
        }
    }

    /// Number of buffers currently handed out
    pub fn in_use(&self) -> usize {
        self.outstanding
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_roundtrip(dst: Addr, src: Addr, code: u8) {
        let packed = pack_header(dst, src, code);
        let (d, s, c, len) = parse_header(&packed).unwrap();
        assert_eq!((d, s, c, len), (dst, src, code, packed.len()));
    }

    #[test]
    fn test_header_forms() {
        header_roundtrip(Addr(-4), Addr(-1), 2); // 1 byte, 2-bit code
        header_roundtrip(Addr(-2), Addr(127), 0x1F); // 2 bytes
        header_roundtrip(Addr(44), Addr(-3), 0x11); // 2 bytes
        header_roundtrip(Addr(1), Addr(2), 0xFE); // 3 bytes
        header_roundtrip(Addr(0), Addr(0), 0);
    }

    #[test]
    fn test_short_header_rejected() {
        assert!(parse_header(&[]).is_none());
        assert!(parse_header(&[0x05]).is_none()); // positive dst needs a src byte
        assert!(parse_header(&[0x05, 0x06]).is_none()); // and a code byte
    }

    #[test]
    fn test_send_extract_roundtrip() {
        let mut msg = Message::new(16);
        msg.set_header(Addr(-1), Addr(-2), 2).unwrap();
        msg.start_send().unwrap();
        msg.append_bytes(&[0xDE, 0xAD, 0xBE, 0xEF]).unwrap();
        msg.start_extract().unwrap();

        let mut rx = Message::new(16);
        rx.start_add().unwrap();
        while let Some(chunk) = msg.extract_chunk(11).unwrap() {
            rx.add_chunk(chunk, 11).unwrap();
        }
        rx.align();
        rx.read_header().unwrap();
        assert_eq!(rx.src(), Addr(-1));
        assert_eq!(rx.dst(), Addr(-2));
        assert_eq!(rx.code(), 2);
        assert_eq!(rx.data(), &[0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn test_append_after_extract_fails() {
        let mut msg = Message::new(4);
        msg.start_send().unwrap();
        msg.append_byte(1).unwrap();
        msg.start_extract().unwrap();
        assert!(matches!(msg.append_byte(2), Err(Error::InvalidState(_))));
        assert!(matches!(
            msg.set_header(Addr(0), Addr(1), 3),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_overflow() {
        let mut msg = Message::new(1);
        msg.start_send().unwrap();
        msg.append_byte(0xAA).unwrap();
        assert!(matches!(msg.append_chunk(1, 1), Err(Error::Overflow(_))));
    }

    #[test]
    fn test_residue_marker() {
        // 1 payload byte + 1-byte header = 16 bits; extracting 11-bit chunks
        // leaves a 5-bit tail that is zero-padded, not marked
        let mut msg = Message::new(4);
        msg.set_header(Addr(-4), Addr(-4), 0).unwrap();
        msg.start_send().unwrap();
        msg.append_byte(0xA5).unwrap();
        msg.start_extract().unwrap();
        let c1 = msg.extract_chunk(11).unwrap().unwrap();
        let c2 = msg.extract_chunk(11).unwrap().unwrap();
        assert!(msg.extract_chunk(11).unwrap().is_none());
        assert_eq!(c1 >> 11, 0);
        assert_eq!(c2 >> 11, 0);

        // a 14-bit frame over the same 16 bits leaves a 2-bit tail whose
        // chunk is missing 12 bits: residue marker set
        msg.start_extract().unwrap();
        let _ = msg.extract_chunk(14).unwrap().unwrap();
        let short = msg.extract_chunk(14).unwrap().unwrap();
        assert_ne!(short & (1 << 14), 0);
    }

    #[test]
    fn test_pool_exhaustion() {
        let mut pool = MessagePool::new(2, 8);
        let a = pool.allocate().unwrap();
        let _b = pool.allocate().unwrap();
        assert!(matches!(pool.allocate(), Err(Error::OutOfMemory)));
        pool.release(a);
        assert!(pool.allocate().is_ok());
        assert_eq!(pool.in_use(), 2);
    }
}
