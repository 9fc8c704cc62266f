//! Wire-level protocol: message model, CRCs, the FEC bus codec, the
//! serial framer and the reliable stream layer.

pub mod codec;
pub mod crc;
pub mod framer;
pub mod message;
pub mod stream;

pub use self::codec::{WireCodec, WireDecoder};
pub use self::crc::Crc;
pub use self::framer::{FrameCounters, SerialFrame, SerialFramer};
pub use self::message::{Message, MessagePool};
pub use self::stream::{ReliableStream, StreamConfig, StreamEvent, StreamState};
