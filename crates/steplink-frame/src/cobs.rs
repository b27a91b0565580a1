//! Consistent overhead byte stuffing (COBS).
//!
//! A payload is encoded so that the only zero byte in the frame is the
//! trailing terminator:
//!
//! ```text
//! ┌──────────┬──────────────────────────────┬──────┐
//! │ code (1) │ payload, zeros replaced by   │ 0x00 │
//! │          │ distance to the next zero    │      │
//! └──────────┴──────────────────────────────┴──────┘
//! ```
//!
//! Frames are capped at [`MAX_FRAME_LEN`] bytes, so every distance fits into
//! one code byte and no extra overhead bytes are ever needed.

use crate::error::{FrameError, Hex, Result};

/// Total size of the largest frame, terminator included.
pub const MAX_FRAME_LEN: usize = 256;

/// Largest payload accepted by [`encode`].
pub const MAX_PAYLOAD_LEN: usize = MAX_FRAME_LEN - 3;

/// Smallest frame accepted by [`decode`].
pub const MIN_FRAME_LEN: usize = 3;

/// Frame terminator.
pub const TERMINATOR: u8 = 0x00;

/// Encode a payload into a zero-terminated frame of `payload.len() + 2` bytes.
pub fn encode(payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(FrameError::EncodeTooLong {
            size: payload.len(),
            max: MAX_PAYLOAD_LEN,
            raw: Hex::from(payload),
        });
    }

    let mut out = vec![0u8; payload.len() + 2];
    let mut marker = 0usize;
    for (index, &byte) in payload.iter().enumerate() {
        if byte == 0 {
            out[marker] = (index - marker + 1) as u8;
            marker = index + 1;
        } else {
            out[index + 1] = byte;
        }
    }
    out[marker] = (payload.len() - marker + 1) as u8;
    // Trailing byte is already the terminator.
    Ok(out)
}

/// Decode a complete zero-terminated frame back into its payload.
pub fn decode(frame: &[u8]) -> Result<Vec<u8>> {
    if frame.len() < MIN_FRAME_LEN {
        return Err(FrameError::TooShort(Hex::from(frame)));
    }
    match frame.iter().position(|&b| b == TERMINATOR) {
        Some(idx) if idx == frame.len() - 1 => {}
        _ => return Err(FrameError::BadZeroPosition(Hex::from(frame))),
    }

    let mut out = vec![0u8; frame.len() - 2];
    // Counts down to the next stuffed zero.
    let mut counter = 1usize;
    for (index, &byte) in frame.iter().enumerate() {
        counter -= 1;
        if counter == 0 {
            counter = byte as usize;
            continue;
        }
        let j = index - 1;
        if j >= out.len() {
            return Err(FrameError::EarlyTermination(Hex::from(frame)));
        }
        out[j] = byte;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_known_vectors() {
        assert_eq!(encode(&[0x00]).unwrap(), vec![0x01, 0x01, 0x00]);
        assert_eq!(encode(&[0x11, 0x22]).unwrap(), vec![0x03, 0x11, 0x22, 0x00]);
        assert_eq!(
            encode(&[0x11, 0x00, 0x22, 0x00]).unwrap(),
            vec![0x02, 0x11, 0x02, 0x22, 0x01, 0x00]
        );
    }

    #[test]
    fn test_decode_known_vectors() {
        assert_eq!(decode(&[0x01, 0x01, 0x00]).unwrap(), vec![0x00]);
        assert_eq!(decode(&[0x03, 0x11, 0x22, 0x00]).unwrap(), vec![0x11, 0x22]);
    }

    #[test]
    fn test_roundtrip_all_lengths() {
        for len in 1..=MAX_PAYLOAD_LEN {
            let payload: Vec<u8> = (0..len).map(|i| (i % 7) as u8).collect();
            let frame = encode(&payload).unwrap();
            assert_eq!(frame.len(), len + 2);
            assert_eq!(decode(&frame).unwrap(), payload, "length {len}");
        }
    }

    #[test]
    fn test_encoded_frame_has_single_trailing_zero() {
        let payload = [0u8; 200];
        let frame = encode(&payload).unwrap();
        let zeros: Vec<usize> = frame
            .iter()
            .enumerate()
            .filter(|(_, b)| **b == 0)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(zeros, vec![frame.len() - 1]);
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let err = encode(&[1u8; 254]).unwrap_err();
        assert!(matches!(err, FrameError::EncodeTooLong { size: 254, .. }));
        assert!(encode(&[1u8; 253]).is_ok());
    }

    #[test]
    fn test_decode_too_short() {
        assert!(matches!(decode(&[0x01, 0x00]), Err(FrameError::TooShort(_))));
    }

    #[test]
    fn test_decode_bad_zero_position() {
        assert!(matches!(
            decode(&[0x02, 0x00, 0x01, 0x00]),
            Err(FrameError::BadZeroPosition(_))
        ));
        assert!(matches!(
            decode(&[0x02, 0x11, 0x01]),
            Err(FrameError::BadZeroPosition(_))
        ));
    }

    #[test]
    fn test_decode_early_termination() {
        assert!(matches!(
            decode(&[0x05, 0x01, 0x00]),
            Err(FrameError::EarlyTermination(_))
        ));
    }

    #[test]
    fn test_error_message_contains_hex() {
        let msg = decode(&[0xAB, 0x00]).unwrap_err().to_string();
        assert!(msg.contains("AB 00"), "{msg}");
    }
}
