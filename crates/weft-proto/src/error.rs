//! Error types for frame encoding and decoding.

use thiserror::Error;

/// Errors that can occur while decoding a protocol frame
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Frame does not start with the protocol magic
    #[error("bad magic: expected 59 4A 53, got {0:02X?}")]
    BadMagic([u8; 3]),

    /// Frame ended before a complete field could be read
    #[error("truncated frame: needed {needed} more byte(s) at offset {offset}")]
    Truncated {
        /// Byte offset at which the read was attempted
        offset: usize,
        /// Number of bytes missing
        needed: usize,
    },

    /// Protocol version byte differs from the supported version
    #[error("version mismatch: expected {expected:#04x}, got {actual:#04x}")]
    Version {
        /// Supported version
        expected: u8,
        /// Version found on the wire
        actual: u8,
    },

    /// A discriminant byte did not match any known variant
    #[error("unknown {field} discriminant: {value:#04x}")]
    Unknown {
        /// Which discriminant field was being decoded
        field: &'static str,
        /// The unrecognized byte
        value: u8,
    },

    /// A varuint used more continuation bytes than a u64 can hold
    #[error("varuint overflow at offset {0}")]
    VarintOverflow(usize),

    /// A varstring did not contain valid UTF-8
    #[error("invalid UTF-8 in string field at offset {0}")]
    InvalidUtf8(usize),
}

/// Result alias for decode operations
pub type Result<T> = std::result::Result<T, DecodeError>;
