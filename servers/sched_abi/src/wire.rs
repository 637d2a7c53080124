//! Wire codec for protocol messages
//!
//! Messages are postcard-encoded into a fixed inline buffer; nothing on the
//! kernel side allocates to send or receive them.

use core::fmt;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::message::{Request, Response};

/// Largest encoded message
pub const MAX_MESSAGE_SIZE: usize = 112;

/// Encoding/decoding failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    /// Output buffer too small
    BufferTooSmall,
    /// Input ended before the message did
    Truncated,
    /// Input is not a valid message
    Malformed,
    /// Bytes left over after the message
    TrailingBytes { count: usize },
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BufferTooSmall => write!(f, "output buffer too small"),
            Self::Truncated => write!(f, "message truncated"),
            Self::Malformed => write!(f, "malformed message"),
            Self::TrailingBytes { count } => write!(f, "{} trailing bytes after message", count),
        }
    }
}

impl From<postcard::Error> for WireError {
    fn from(err: postcard::Error) -> Self {
        match err {
            postcard::Error::SerializeBufferFull => Self::BufferTooSmall,
            postcard::Error::DeserializeUnexpectedEnd => Self::Truncated,
            _ => Self::Malformed,
        }
    }
}

/// Encode any message into `buf`, returning the used prefix
pub fn encode<'a, T: Serialize>(message: &T, buf: &'a mut [u8]) -> Result<&'a mut [u8], WireError> {
    Ok(postcard::to_slice(message, buf)?)
}

/// Decode exactly one message from `bytes`
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, WireError> {
    let (message, rest) = postcard::take_from_bytes(bytes)?;
    if !rest.is_empty() {
        return Err(WireError::TrailingBytes { count: rest.len() });
    }
    Ok(message)
}

pub fn encode_request<'a>(request: &Request, buf: &'a mut [u8]) -> Result<&'a mut [u8], WireError> {
    encode(request, buf)
}

pub fn decode_request(bytes: &[u8]) -> Result<Request, WireError> {
    decode(bytes)
}

pub fn encode_response<'a>(response: &Response, buf: &'a mut [u8]) -> Result<&'a mut [u8], WireError> {
    encode(response, buf)
}

pub fn decode_response(bytes: &[u8]) -> Result<Response, WireError> {
    decode(bytes)
}
