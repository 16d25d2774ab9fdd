//! Codec errors
//!
//! Each variant carries enough context to tell a truncated frame from a corrupt
//! payload when reading logs.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CodecError {
    /// Envelope could not be serialized
    #[error("Failed to encode {context}: {message}")]
    Encode { context: String, message: String },

    /// Envelope bytes did not decode into the expected message type
    #[error("Failed to decode {context}: {message} ({size} bytes)")]
    Decode {
        context: String,
        message: String,
        size: usize,
    },

    /// Frame exceeds protocol limits
    #[error("Frame too large: {size} bytes exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// Value type code has no registered constructor
    #[error("Unknown value type code {type_code}")]
    UnknownTypeCode { type_code: u8 },

    /// Value payload checksum validation failed - indicates data corruption
    #[error("Checksum mismatch for type {type_code}: expected {expected:#010x}, calculated {calculated:#010x}")]
    ChecksumMismatch {
        type_code: u8,
        expected: u32,
        calculated: u32,
    },

    /// Value payload is shorter than its type requires
    #[error("Truncated value payload for type {type_code}: need {need} bytes, got {got}")]
    Truncated { type_code: u8, need: usize, got: usize },

    /// Value payload is structurally invalid for its type
    #[error("Invalid value payload for type {type_code}: {reason}")]
    InvalidPayload { type_code: u8, reason: String },

    /// A constructor was registered twice for one code
    #[error("Type code {type_code} is already registered")]
    DuplicateTypeCode { type_code: u8 },
}

impl CodecError {
    pub fn decode(context: impl Into<String>, message: impl Into<String>, size: usize) -> Self {
        Self::Decode {
            context: context.into(),
            message: message.into(),
            size,
        }
    }

    pub fn encode(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Encode {
            context: context.into(),
            message: message.into(),
        }
    }

    pub fn invalid_payload(type_code: u8, reason: impl Into<String>) -> Self {
        Self::InvalidPayload {
            type_code,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CodecError>;
