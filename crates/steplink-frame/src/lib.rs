//! Byte-stuffed framing and the packet wire format for steplink.
//!
//! Every message travels as one COBS frame:
//! - the packet bytes, with every zero replaced by a stuffing distance
//! - a single trailing `0x00` terminator
//!
//! Inside the frame, a packet carries a 1-byte XOR checksum, a 2-byte
//! little-endian correlation sequence and a method/property header byte.

pub mod cobs;
pub mod error;
pub mod fields;
pub mod packet;
pub mod stream;

pub use cobs::{MAX_FRAME_LEN, MAX_PAYLOAD_LEN};
pub use error::{hex_view, FrameError, Hex, Result};
pub use fields::FieldReader;
pub use packet::{header_byte, Method, Packet, Property, BROADCAST_SEQUENCE, HEADER_SIZE, MAX_PAYLOAD};
pub use stream::Dechunker;
#[cfg(feature = "async")]
pub use stream::{frames, FrameStream};
