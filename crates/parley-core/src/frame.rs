// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Binary framing for outgoing messages.
//!
//! Some consumers read a length-prefixed frame instead of bare JSON text:
//! - 4 bytes: payload length (big-endian)
//! - 2 bytes: frame kind
//! - N bytes: payload (UTF-8 JSON)

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde_json::Value;
use thiserror::Error;

/// Maximum payload size (16 MB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Frame header size (4 bytes length + 2 bytes kind).
pub const HEADER_SIZE: usize = 6;

/// Kind of payload carried by a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum FrameKind {
    /// Outgoing JSON envelope.
    Json = 1,
    /// Error description.
    Error = 2,
}

impl TryFrom<u16> for FrameKind {
    type Error = FrameError;

    fn try_from(value: u16) -> Result<Self, <Self as TryFrom<u16>>::Error> {
        match value {
            1 => Ok(FrameKind::Json),
            2 => Ok(FrameKind::Error),
            _ => Err(FrameError::InvalidKind(value)),
        }
    }
}

/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too large: {0} bytes (max: {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    #[error("invalid frame kind: {0}")]
    InvalidKind(u16),

    #[error("truncated frame: {0}")]
    Truncated(&'static str),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A framed payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Bytes,
}

impl Frame {
    /// Serialize `value` into a JSON frame.
    pub fn json(value: &Value) -> Result<Self, FrameError> {
        Self::new(FrameKind::Json, serde_json::to_vec(value)?)
    }

    /// Create an error frame carrying `description`.
    pub fn error(description: &str) -> Result<Self, FrameError> {
        Self::new(FrameKind::Error, description.as_bytes().to_vec())
    }

    pub fn new(kind: FrameKind, payload: Vec<u8>) -> Result<Self, FrameError> {
        if payload.len() > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(payload.len()));
        }
        Ok(Self {
            kind,
            payload: Bytes::from(payload),
        })
    }

    /// Parse the payload as JSON.
    pub fn to_json(&self) -> Result<Value, FrameError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Encode the frame to bytes for the wire.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_u32(self.payload.len() as u32);
        buf.put_u16(self.kind as u16);
        buf.put(self.payload.clone());
        buf.freeze()
    }

    /// Decode a frame from bytes.
    pub fn decode_from_bytes(mut bytes: Bytes) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FrameError::Truncated("incomplete frame header"));
        }

        let length = bytes.get_u32() as usize;
        let kind = FrameKind::try_from(bytes.get_u16())?;

        if length > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(length));
        }
        if bytes.len() < length {
            return Err(FrameError::Truncated("incomplete frame payload"));
        }

        Ok(Self {
            kind,
            payload: bytes.split_to(length),
        })
    }
}
