use std::borrow::Cow;
use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::cobs;
use crate::error::{hex_view, FrameError, Hex, Result};

/// Packet header: checksum (1) + sequence (2 LE) + method|property (1).
pub const HEADER_SIZE: usize = 4;

/// Largest payload that still fits into one frame.
pub const MAX_PAYLOAD: usize = cobs::MAX_PAYLOAD_LEN - HEADER_SIZE;

/// Sequence reserved for unsolicited device-originated traffic.
pub const BROADCAST_SEQUENCE: u16 = 0;

const METHOD_MASK: u8 = 0xF0;
const PROP_MASK: u8 = 0x0F;

/// Upper nibble of the header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Nop,
    /// Host → device.
    Get,
    Set,
    /// Device → host.
    Ack,
    Rej,
    /// Device → host, asynchronous status events.
    Syn,
    /// Device → host, free-form text.
    Log,
    /// A code this host does not know about.
    Other(u8),
}

impl Method {
    /// Header code (already shifted into the upper nibble).
    pub fn code(self) -> u8 {
        match self {
            Method::Nop => 0x00,
            Method::Get => 0x10,
            Method::Set => 0x20,
            Method::Ack => 0x30,
            Method::Rej => 0x40,
            Method::Syn => 0x80,
            Method::Log => 0xF0,
            Method::Other(code) => code & METHOD_MASK,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code & METHOD_MASK {
            0x00 => Method::Nop,
            0x10 => Method::Get,
            0x20 => Method::Set,
            0x30 => Method::Ack,
            0x40 => Method::Rej,
            0x80 => Method::Syn,
            0xF0 => Method::Log,
            other => Method::Other(other),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Method::Nop => "NOP",
            Method::Get => "GET",
            Method::Set => "SET",
            Method::Ack => "ACK",
            Method::Rej => "REJ",
            Method::Syn => "SYN",
            Method::Log => "LOG",
            Method::Other(_) => "UNKNOWN",
        }
    }

    /// Methods whose payload is UTF-8 text.
    pub fn is_textual(self) -> bool {
        matches!(self, Method::Syn | Method::Log)
    }
}

/// Lower nibble of the header byte; the device-defined property space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Property {
    Na,
    SysEna,
    MotEna,
    MotCfg,
    MotMov,
    MotHome,
    MotStat,
    LedProg,
    OdomSensor,
    ColorSensor,
    FwInfo,
    Other(u8),
}

impl Property {
    pub fn code(self) -> u8 {
        match self {
            Property::Na => 0x0,
            Property::SysEna => 0x1,
            Property::MotEna => 0x2,
            Property::MotCfg => 0x3,
            Property::MotMov => 0x4,
            Property::MotHome => 0x5,
            Property::MotStat => 0x6,
            Property::LedProg => 0xA,
            Property::OdomSensor => 0xB,
            Property::ColorSensor => 0xC,
            Property::FwInfo => 0xF,
            Property::Other(code) => code & PROP_MASK,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code & PROP_MASK {
            0x0 => Property::Na,
            0x1 => Property::SysEna,
            0x2 => Property::MotEna,
            0x3 => Property::MotCfg,
            0x4 => Property::MotMov,
            0x5 => Property::MotHome,
            0x6 => Property::MotStat,
            0xA => Property::LedProg,
            0xB => Property::OdomSensor,
            0xC => Property::ColorSensor,
            0xF => Property::FwInfo,
            other => Property::Other(other),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Property::Na => "NA",
            Property::SysEna => "SYS_ENA",
            Property::MotEna => "MOT_ENA",
            Property::MotCfg => "MOT_CFG",
            Property::MotMov => "MOT_MOV",
            Property::MotHome => "MOT_HOME",
            Property::MotStat => "MOT_STAT",
            Property::LedProg => "LED_PROG",
            Property::OdomSensor => "ODOM_SENSOR",
            Property::ColorSensor => "COLOR_SENSOR",
            Property::FwInfo => "FW_INFO",
            Property::Other(_) => "UNKNOWN",
        }
    }
}

/// Compose the header byte.
pub fn header_byte(method: Method, property: Property) -> u8 {
    method.code() | property.code()
}

/// One protocol message.
///
/// Wire layout:
/// ```text
/// ┌──────────┬────────────┬──────────────────┬─────────────┐
/// │ Checksum │ Sequence   │ Method | Property │ Payload      │
/// │ (1B)     │ (2B LE)    │ (4b | 4b)         │ (0..249B)    │
/// └──────────┴────────────┴──────────────────┴─────────────┘
/// ```
/// The checksum makes the XOR of every byte in the packet zero.
#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    bytes: Bytes,
}

impl Packet {
    /// Build an unsequenced packet from concatenated payload parts.
    pub fn encode(method: Method, property: Property, parts: &[&[u8]]) -> Self {
        Self::build(BROADCAST_SEQUENCE, method, property, parts)
    }

    /// Build a packet with an explicit correlation sequence.
    pub fn build(sequence: u16, method: Method, property: Property, parts: &[&[u8]]) -> Self {
        let payload_len: usize = parts.iter().map(|p| p.len()).sum();
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload_len);
        buf.put_u8(0);
        buf.put_u16_le(sequence);
        buf.put_u8(header_byte(method, property));
        for part in parts {
            buf.put_slice(part);
        }
        buf[0] = xor(&buf[1..]);
        Self {
            bytes: buf.freeze(),
        }
    }

    /// Re-stamp the sequence and recompute the checksum.
    pub fn with_sequence(&self, sequence: u16) -> Self {
        let mut buf = BytesMut::from(self.bytes.as_ref());
        buf[1..3].copy_from_slice(&sequence.to_le_bytes());
        buf[0] = xor(&buf[1..]);
        Self {
            bytes: buf.freeze(),
        }
    }

    /// Validate raw packet bytes.
    pub fn decode(bytes: impl Into<Bytes>) -> Result<Self> {
        let bytes = bytes.into();
        if bytes.len() < HEADER_SIZE {
            return Err(FrameError::PacketTooShort {
                len: bytes.len(),
                min: HEADER_SIZE,
            });
        }
        let residue = xor(&bytes);
        if residue != 0 {
            return Err(FrameError::Checksum {
                residue,
                raw: Hex::from(bytes.as_ref()),
            });
        }
        Ok(Self { bytes })
    }

    /// COBS-decode a zero-terminated frame and validate the packet inside.
    pub fn from_frame(frame: &[u8]) -> Result<Self> {
        Self::decode(cobs::decode(frame)?)
    }

    /// COBS-encode this packet into a zero-terminated frame.
    pub fn to_frame(&self) -> Result<Vec<u8>> {
        cobs::encode(&self.bytes)
    }

    pub fn checksum(&self) -> u8 {
        self.bytes[0]
    }

    pub fn sequence(&self) -> u16 {
        u16::from_le_bytes([self.bytes[1], self.bytes[2]])
    }

    pub fn header(&self) -> u8 {
        self.bytes[3]
    }

    pub fn method(&self) -> Method {
        Method::from_code(self.header())
    }

    pub fn property(&self) -> Property {
        Property::from_code(self.header())
    }

    /// Everything after the fixed header.
    pub fn payload(&self) -> &[u8] {
        &self.bytes[HEADER_SIZE..]
    }

    /// Payload interpreted as UTF-8 (lossy).
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.payload())
    }

    pub fn is_broadcast(&self) -> bool {
        self.sequence() == BROADCAST_SEQUENCE
    }

    /// Whether the bytes still XOR to zero.
    pub fn is_intact(&self) -> bool {
        xor(&self.bytes) == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

fn xor(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |chk, b| chk ^ b)
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let method = self.method();
        write!(
            f,
            "{}:{:<7} [{:>5}] ",
            method.name(),
            self.property().name(),
            self.sequence()
        )?;
        if method.is_textual() {
            write!(f, "{}", self.text())
        } else {
            write!(f, "{}", hex_view(self.payload()))
        }
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("method", &self.method())
            .field("property", &self.property())
            .field("sequence", &self.sequence())
            .field("payload", &Hex::from(self.payload()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::{i32, u32, u8};

    #[test]
    fn test_encode_decode_motor_move() {
        let packet = Packet::encode(
            Method::Set,
            Property::MotMov,
            &[&u8(1), &i32(-100), &u32(2000)],
        );
        let decoded = Packet::decode(packet.as_bytes().to_vec()).unwrap();

        assert_eq!(decoded.method(), Method::Set);
        assert_eq!(decoded.property(), Property::MotMov);
        assert_eq!(decoded.header(), 0x24);
        assert_eq!(
            decoded.payload(),
            &[0x01, 0x9C, 0xFF, 0xFF, 0xFF, 0xD0, 0x07, 0x00, 0x00]
        );
        assert_eq!(decoded.payload(), packet.payload());
    }

    #[test]
    fn test_checksum_xors_to_zero() {
        let packet = Packet::build(0x1234, Method::Get, Property::FwInfo, &[b"abc"]);
        assert!(packet.is_intact());
        assert_eq!(packet.sequence(), 0x1234);
        assert_eq!(packet.as_bytes()[1..3], [0x34, 0x12]);
        let expected = 0x34 ^ 0x12 ^ 0x1F ^ b'a' ^ b'b' ^ b'c';
        assert_eq!(packet.checksum(), expected);
    }

    #[test]
    fn test_single_byte_corruption_detected() {
        let packet = Packet::build(7, Method::Set, Property::MotCfg, &[&[1, 16, 50, 0xE8, 0x03]]);
        for index in 0..packet.len() {
            for flip in [0x01u8, 0x80, 0xFF] {
                let mut raw = packet.as_bytes().to_vec();
                raw[index] ^= flip;
                let err = Packet::decode(raw).unwrap_err();
                assert!(matches!(err, FrameError::Checksum { .. }), "byte {index}");
            }
        }
    }

    #[test]
    fn test_with_sequence_restamps_checksum() {
        let packet = Packet::encode(Method::Set, Property::SysEna, &[&[1]]);
        assert!(packet.is_broadcast());
        let stamped = packet.with_sequence(42);
        assert_eq!(stamped.sequence(), 42);
        assert!(stamped.is_intact());
        assert_eq!(stamped.payload(), packet.payload());
        assert_eq!(stamped.method(), Method::Set);
    }

    #[test]
    fn test_decode_too_short() {
        let err = Packet::decode(vec![0x00, 0x00, 0x00]).unwrap_err();
        assert!(matches!(err, FrameError::PacketTooShort { len: 3, min: 4 }));
    }

    #[test]
    fn test_frame_roundtrip() {
        let packet = Packet::build(255, Method::Ack, Property::MotMov, &[]);
        let frame = packet.to_frame().unwrap();
        assert_eq!(frame.len(), packet.len() + 2);
        assert_eq!(Packet::from_frame(&frame).unwrap(), packet);
    }

    #[test]
    fn test_oversized_packet_cannot_be_framed() {
        let payload = vec![0xAA; MAX_PAYLOAD + 1];
        let packet = Packet::encode(Method::Set, Property::LedProg, &[&payload]);
        assert!(matches!(
            packet.to_frame(),
            Err(FrameError::EncodeTooLong { .. })
        ));
        let fits = Packet::encode(Method::Set, Property::LedProg, &[&payload[1..]]);
        assert!(fits.to_frame().is_ok());
    }

    #[test]
    fn test_unknown_codes_survive() {
        assert_eq!(Method::from_code(0x5A), Method::Other(0x50));
        assert_eq!(Property::from_code(0x5E), Property::Other(0x0E));
        assert_eq!(header_byte(Method::Other(0x50), Property::Other(0x0E)), 0x5E);
        for method in [Method::Nop, Method::Get, Method::Set, Method::Ack, Method::Rej, Method::Syn, Method::Log] {
            assert_eq!(Method::from_code(method.code()), method);
        }
    }

    #[test]
    fn test_display_text_and_hex() {
        let log = Packet::encode(Method::Log, Property::Na, &[b"boot ok"]);
        assert!(log.to_string().ends_with("boot ok"), "{log}");
        let ack = Packet::build(3, Method::Ack, Property::SysEna, &[&[0x01]]);
        let shown = ack.to_string();
        assert!(shown.starts_with("ACK:SYS_ENA"), "{shown}");
        assert!(shown.ends_with("01"), "{shown}");
    }
}
