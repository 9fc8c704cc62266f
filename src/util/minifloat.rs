//! Compact 8-bit timer encoding.
//!
//! Retry and backoff intervals are carried in single bytes: values up to 32
//! ticks are stored exactly, larger magnitudes use a 4-bit exponent and a
//! 4-bit mantissa with a hidden top bit. The encoding covers everything from
//! one tick to more than a day of them, which is plenty for timeouts that
//! ride along in protocol messages.

use rand::Rng;

/// Converts an absolute tick count to its encoded byte.
///
/// Values above the encoding's ceiling saturate to `0xFF`.
pub fn encode(ticks: u32) -> u8 {
    if ticks <= 0x20 {
        return ticks as u8;
    }
    let mut m = ticks;
    let mut exp = 1u8;
    while m > 0x1F {
        m >>= 1;
        exp += 1;
    }
    if exp > 0x0F {
        return 0xFF;
    }
    // The mantissa is normalized, its top bit is dropped.
    (exp << 4) | (m as u8 & 0x0F)
}

/// Converts an encoded byte back to an absolute tick count
pub fn decode(byte: u8) -> u32 {
    if byte <= 32 {
        return byte as u32;
    }
    let exp = (byte >> 4) - 1;
    let mant = 0x10 | (byte & 0x0F) as u32;
    mant << exp
}

/// An encoded interval plus its live countdown register.
///
/// The countdown reloads from the stored byte every time it reaches zero,
/// so a running minifloat fires periodically; one-shot callers stop it on
/// the firing tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Minifloat {
    encoded: u8,
    countdown: u16,
}

impl Minifloat {
    /// Creates a stopped minifloat
    pub fn new() -> Self {
        Minifloat::default()
    }

    /// Stores an encoded byte and derives the countdown
    pub fn set(&mut self, byte: u8) {
        self.encoded = byte;
        self.reset();
    }

    /// Stores an interval given in absolute ticks
    pub fn set_ticks(&mut self, ticks: u32) {
        self.set(encode(ticks));
    }

    /// Returns the stored encoded byte
    pub fn get(&self) -> u8 {
        self.encoded
    }

    /// Reloads the countdown from the stored byte
    pub fn reset(&mut self) {
        self.countdown = decode(self.encoded).min(u16::MAX as u32) as u16;
    }

    /// Stops the countdown
    pub fn stop(&mut self) {
        self.encoded = 0;
        self.countdown = 0;
    }

    /// Returns true if the minifloat is not running
    pub fn is_stopped(&self) -> bool {
        self.countdown == 0
    }

    /// Advances the countdown by one tick.
    ///
    /// Returns true exactly on the tick that reaches zero, at which point
    /// the countdown has already been reloaded from the stored byte.
    pub fn tick(&mut self) -> bool {
        if self.countdown == 0 {
            return false;
        }
        self.countdown -= 1;
        if self.countdown == 0 {
            self.reset();
            true
        } else {
            false
        }
    }
}

/// Returns an encoded byte whose absolute magnitude is uniformly
/// distributed in `[lo, hi]` ticks.
///
/// Used to jitter backoff so nodes retrying after a collision do not
/// re-collide in lock-step.
pub fn random_between(lo: u32, hi: u32) -> u8 {
    let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
    let ticks = rand::thread_rng().gen_range(lo..=hi);
    encode(ticks.max(1))
}
