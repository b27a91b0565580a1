//! Fixed-width little-endian payload fields.
//!
//! Writers return byte arrays so they can be passed straight to
//! [`Packet::encode`](crate::Packet::encode) as payload parts:
//!
//! ```
//! use steplink_frame::fields::{i32, u32, u8};
//! use steplink_frame::{Method, Packet, Property};
//!
//! let packet = Packet::encode(Method::Set, Property::MotMov, &[&u8(0), &i32(-200), &u32(500)]);
//! assert_eq!(packet.payload().len(), 9);
//! ```

use bytes::Buf;

use crate::error::{FrameError, Result};

pub fn bool(value: bool) -> [u8; 1] {
    [value as u8]
}

pub fn u8(value: u8) -> [u8; 1] {
    [value]
}

pub fn i8(value: i8) -> [u8; 1] {
    value.to_le_bytes()
}

pub fn u16(value: u16) -> [u8; 2] {
    value.to_le_bytes()
}

pub fn i16(value: i16) -> [u8; 2] {
    value.to_le_bytes()
}

pub fn u32(value: u32) -> [u8; 4] {
    value.to_le_bytes()
}

pub fn i32(value: i32) -> [u8; 4] {
    value.to_le_bytes()
}

pub fn u64(value: u64) -> [u8; 8] {
    value.to_le_bytes()
}

pub fn i64(value: i64) -> [u8; 8] {
    value.to_le_bytes()
}

pub fn f32(value: f32) -> [u8; 4] {
    value.to_le_bytes()
}

pub fn f64(value: f64) -> [u8; 8] {
    value.to_le_bytes()
}

/// Sequential reader over a packet payload.
///
/// Unlike raw `bytes::Buf` getters, running out of bytes is an error rather
/// than a panic.
#[derive(Debug, Clone)]
pub struct FieldReader<'a> {
    buf: &'a [u8],
}

macro_rules! read_fn {
    ($name:ident, $ty:ty, $get:ident) => {
        pub fn $name(&mut self) -> Result<$ty> {
            self.need(stringify!($name), std::mem::size_of::<$ty>())?;
            Ok(self.buf.$get())
        }
    };
}

impl<'a> FieldReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn need(&self, field: &'static str, need: usize) -> Result<()> {
        if self.buf.remaining() < need {
            return Err(FrameError::PayloadTooShort {
                field,
                need,
                have: self.buf.remaining(),
            });
        }
        Ok(())
    }

    pub fn bool(&mut self) -> Result<bool> {
        Ok(self.u8()? != 0)
    }

    read_fn!(u8, u8, get_u8);
    read_fn!(i8, i8, get_i8);
    read_fn!(u16, u16, get_u16_le);
    read_fn!(i16, i16, get_i16_le);
    read_fn!(u32, u32, get_u32_le);
    read_fn!(i32, i32, get_i32_le);
    read_fn!(u64, u64, get_u64_le);
    read_fn!(i64, i64, get_i64_le);
    read_fn!(f32, f32, get_f32_le);
    read_fn!(f64, f64, get_f64_le);

    /// Bytes not yet consumed.
    pub fn rest(&self) -> &'a [u8] {
        self.buf
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writers_are_little_endian() {
        assert_eq!(bool(true), [1]);
        assert_eq!(i8(-1), [0xFF]);
        assert_eq!(u16(0x1234), [0x34, 0x12]);
        assert_eq!(i16(-2), [0xFE, 0xFF]);
        assert_eq!(u32(1), [1, 0, 0, 0]);
        assert_eq!(i64(-1), [0xFF; 8]);
        assert_eq!(f32(1.0), [0x00, 0x00, 0x80, 0x3F]);
        assert_eq!(f64(-2.0), [0, 0, 0, 0, 0, 0, 0, 0xC0]);
    }

    #[test]
    fn test_reader_sequence() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&u8(3));
        raw.extend_from_slice(&i32(-100));
        raw.extend_from_slice(&u16(1000));
        raw.extend_from_slice(&u64(u64::MAX));
        raw.extend_from_slice(&f64(0.5));

        let mut reader = FieldReader::new(&raw);
        assert_eq!(reader.u8().unwrap(), 3);
        assert_eq!(reader.i32().unwrap(), -100);
        assert_eq!(reader.u16().unwrap(), 1000);
        assert_eq!(reader.u64().unwrap(), u64::MAX);
        assert_eq!(reader.f64().unwrap(), 0.5);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_reader_reports_short_payload() {
        let raw = [0x01, 0x02];
        let mut reader = FieldReader::new(&raw);
        let err = reader.u32().unwrap_err();
        assert!(matches!(
            err,
            FrameError::PayloadTooShort {
                field: "u32",
                need: 4,
                have: 2
            }
        ));
        assert_eq!(reader.u16().unwrap(), 0x0201);
    }
}
