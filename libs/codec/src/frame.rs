//! Message framing
//!
//! Envelopes are bincode-encoded. Transports add their own length prefix; the
//! size limit here is shared so both sides reject the same oversized frames.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{CodecError, Result};
use crate::messages::{LocatorRequest, LocatorResponse, Request, ServerMessage};

/// Largest envelope accepted by either side
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

pub fn encode_message<T: Serialize>(context: &str, message: &T) -> Result<Bytes> {
    let bytes =
        bincode::serialize(message).map_err(|e| CodecError::encode(context, e.to_string()))?;
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge {
            size: bytes.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(Bytes::from(bytes))
}

pub fn decode_message<T: DeserializeOwned>(context: &str, frame: &[u8]) -> Result<T> {
    if frame.len() > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge {
            size: frame.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    bincode::deserialize(frame).map_err(|e| CodecError::decode(context, e.to_string(), frame.len()))
}

impl Request {
    pub fn encode(&self) -> Result<Bytes> {
        encode_message("request", self)
    }

    pub fn decode(frame: &[u8]) -> Result<Self> {
        decode_message("request", frame)
    }
}

impl ServerMessage {
    pub fn encode(&self) -> Result<Bytes> {
        encode_message("server message", self)
    }

    pub fn decode(frame: &[u8]) -> Result<Self> {
        decode_message("server message", frame)
    }
}

impl LocatorRequest {
    pub fn encode(&self) -> Result<Bytes> {
        encode_message("locator request", self)
    }

    pub fn decode(frame: &[u8]) -> Result<Self> {
        decode_message("locator request", frame)
    }
}

impl LocatorResponse {
    pub fn encode(&self) -> Result<Bytes> {
        encode_message("locator response", self)
    }

    pub fn decode(frame: &[u8]) -> Result<Self> {
        decode_message("locator response", frame)
    }
}
