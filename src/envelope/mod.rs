//! Wire envelope encoding, decoding, and inbound classification.
//!
//! Both transport channels share one frame shape:
//!
//! ```text
//! byte[0]      = content-type flag (0x0 = binary, 0x1 = text)
//! byte[1..5)   = control length: u32, little-endian
//! byte[5..5+N) = control block, serialized per the flag
//! byte[5+N..)  = body (opaque, may be empty)
//! ```
//!
//! Decoding is panic-free: the parser never indexes into the buffer and
//! validates every declared length against the bytes actually present,
//! returning a structured [`EnvelopeError`] on malformed input. A decoded
//! inbound frame is then classified into either a [`Response`] or a
//! [`PushMessage`] via [`classify`]; decode success says nothing about
//! application success.

pub mod control;
pub mod error;


use bytes::{Buf, BufMut, Bytes, BytesMut};

pub use control::{CallReason, Compression, ControlBlock, MessageKind};
pub use error::{EnvelopeError, FramingError};

use crate::{push::PushMessage, request::Response};

/// Fixed header size: flag byte plus the 4-byte control length prefix.
pub const HEADER_LEN: usize = 5;

/// Upper bound on the declared control length (1 MiB).
///
/// Control blocks are small routing records; a declared length beyond this
/// indicates a corrupt or hostile frame and is rejected before allocation.
pub const MAX_CONTROL_LENGTH: usize = 1024 * 1024;

/// Serialization applied to the control block (and, by convention, the body).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ContentType {
    /// Control block is bincode-encoded.
    #[default]
    Binary,
    /// Control block is JSON-encoded.
    Text,
}

impl ContentType {
    /// The wire flag byte for this content type.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        match self {
            Self::Binary => 0x0,
            Self::Text => 0x1,
        }
    }

    /// Parse a wire flag byte.
    ///
    /// # Errors
    ///
    /// Returns [`FramingError::UnknownContentType`] for any byte other than
    /// `0x0` or `0x1`.
    pub fn from_byte(flag: u8) -> Result<Self, FramingError> {
        match flag {
            0x0 => Ok(Self::Binary),
            0x1 => Ok(Self::Text),
            other => Err(FramingError::UnknownContentType { flag: other }),
        }
    }
}

/// A decoded envelope: control block plus opaque body.
#[derive(Clone, Debug, PartialEq)]
pub struct Decoded {
    /// Content type declared by the flag byte.
    pub content_type: ContentType,
    /// Parsed control block.
    pub control: ControlBlock,
    /// Opaque body bytes (possibly empty).
    pub body: Bytes,
}

/// An inbound frame after classification.
#[derive(Debug)]
pub enum Inbound {
    /// Reply to a pending request.
    Response(Response),
    /// Unsolicited push.
    Push(PushMessage),
}

/// Encode a control block and body into a wire envelope.
///
/// # Errors
///
/// Returns [`EnvelopeError::EncodeControl`] if the control block cannot be
/// serialized, or [`FramingError::OversizedControl`] if the serialized
/// control exceeds [`MAX_CONTROL_LENGTH`].
pub fn encode(
    control: &ControlBlock,
    body: &[u8],
    content_type: ContentType,
) -> Result<Bytes, EnvelopeError> {
    let control_bytes = serialize_control(control, content_type)?;
    if control_bytes.len() > MAX_CONTROL_LENGTH {
        return Err(FramingError::OversizedControl {
            declared: control_bytes.len(),
            max: MAX_CONTROL_LENGTH,
        }
        .into());
    }
    let mut buf = BytesMut::with_capacity(HEADER_LEN + control_bytes.len() + body.len());
    buf.put_u8(content_type.as_byte());
    #[allow(clippy::cast_possible_truncation)] // bounded by MAX_CONTROL_LENGTH above
    buf.put_u32_le(control_bytes.len() as u32);
    buf.put_slice(&control_bytes);
    buf.put_slice(body);
    Ok(buf.freeze())
}

/// Decode a wire envelope into its control block and body.
///
/// # Errors
///
/// Returns a [`FramingError`] when the buffer is shorter than the header,
/// the flag byte is unknown, or the declared control length is zero,
/// oversized, or runs past the buffer; returns
/// [`EnvelopeError::DecodeControl`] when the control bytes do not parse.
pub fn decode(mut buf: Bytes) -> Result<Decoded, EnvelopeError> {
    if buf.remaining() < HEADER_LEN {
        return Err(FramingError::ShortFrame {
            len: buf.remaining(),
            min: HEADER_LEN,
        }
        .into());
    }
    let content_type = ContentType::from_byte(buf.get_u8())?;
    let declared = buf.get_u32_le() as usize;
    if declared == 0 {
        return Err(FramingError::EmptyControl.into());
    }
    if declared > MAX_CONTROL_LENGTH {
        return Err(FramingError::OversizedControl {
            declared,
            max: MAX_CONTROL_LENGTH,
        }
        .into());
    }
    if declared > buf.remaining() {
        return Err(FramingError::ControlOverrun {
            declared,
            remaining: buf.remaining(),
        }
        .into());
    }
    let control_bytes = buf.copy_to_bytes(declared);
    let control = deserialize_control(&control_bytes, content_type)?;
    let body = buf.copy_to_bytes(buf.remaining());
    Ok(Decoded {
        content_type,
        control,
        body,
    })
}

/// Classify a decoded inbound frame.
///
/// A control block whose kind is [`MessageKind::Notify`] becomes a
/// [`PushMessage`]; anything else becomes a [`Response`] with
/// `net_code = NET_OK` and the control's result code mapped into
/// `app_code` (unset becomes the `-1` sentinel).
#[must_use]
pub fn classify(decoded: Decoded) -> Inbound {
    if decoded.control.is_notify() {
        Inbound::Push(PushMessage::from_frame(decoded.control, decoded.body))
    } else {
        Inbound::Response(Response::from_frame(decoded.control, decoded.body))
    }
}

fn serialize_control(
    control: &ControlBlock,
    content_type: ContentType,
) -> Result<Vec<u8>, EnvelopeError> {
    match content_type {
        ContentType::Binary => bincode::serde::encode_to_vec(control, bincode::config::standard())
            .map_err(|e| EnvelopeError::EncodeControl(Box::new(e))),
        ContentType::Text => {
            serde_json::to_vec(control).map_err(|e| EnvelopeError::EncodeControl(Box::new(e)))
        }
    }
}

fn deserialize_control(
    bytes: &[u8],
    content_type: ContentType,
) -> Result<ControlBlock, EnvelopeError> {
    match content_type {
        ContentType::Binary => {
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map(|(control, _consumed)| control)
                .map_err(|e| EnvelopeError::DecodeControl(Box::new(e)))
        }
        ContentType::Text => {
            serde_json::from_slice(bytes).map_err(|e| EnvelopeError::DecodeControl(Box::new(e)))
        }
    }
}
