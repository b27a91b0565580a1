use std::fmt;

/// Errors that can occur during frame or packet encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The payload does not fit into a single COBS frame.
    #[error("payload too long for COBS ({size} bytes, max {max}) [{raw}]")]
    EncodeTooLong { size: usize, max: usize, raw: Hex },

    /// The raw frame is shorter than the smallest valid frame.
    #[error("raw frame too short [{0}]")]
    TooShort(Hex),

    /// A zero byte appears before the end of the frame.
    #[error("bad zero position [{0}]")]
    BadZeroPosition(Hex),

    /// A stuffing distance points past the end of the frame.
    #[error("early termination [{0}]")]
    EarlyTermination(Hex),

    /// The decoded packet does not contain the fixed header.
    #[error("packet too short ({len} bytes, need {min})")]
    PacketTooShort { len: usize, min: usize },

    /// The packet bytes do not XOR to zero.
    #[error("invalid packet checksum (residue 0x{residue:02X}) [{raw}]")]
    Checksum { residue: u8, raw: Hex },

    /// A payload field could not be read because the payload ended early.
    #[error("payload too short for {field} (need {need} bytes, have {have})")]
    PayloadTooShort {
        field: &'static str,
        need: usize,
        have: usize,
    },

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FrameError>;

/// Raw bytes rendered as space-separated upper-case hex in error messages.
#[derive(Clone, PartialEq, Eq)]
pub struct Hex(pub Vec<u8>);

impl From<&[u8]> for Hex {
    fn from(raw: &[u8]) -> Self {
        Self(raw.to_vec())
    }
}

impl fmt::Display for Hex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Hex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{self}]")
    }
}

/// Render bytes as hex (`"01 A0 FF"`).
pub fn hex_view(data: &[u8]) -> String {
    Hex::from(data).to_string()
}
