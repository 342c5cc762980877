//! Error types for the envelope codec.
//!
//! The taxonomy distinguishes wire-level framing problems (frame boundary
//! and header issues, detected before any control parsing) from control
//! block (de)serialization failures. Framing errors on the inbound path are
//! recoverable: the frame is logged and dropped without tearing down the
//! connection.

use thiserror::Error;

/// Wire-level framing errors detected before the control block is parsed.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FramingError {
    /// The buffer is shorter than the fixed envelope header.
    #[error("frame too short: {len} bytes, need at least {min}")]
    ShortFrame {
        /// Bytes available.
        len: usize,
        /// Minimum bytes required for the header.
        min: usize,
    },

    /// The content-type flag byte was not recognised.
    #[error("unknown content-type byte: {flag:#04x}")]
    UnknownContentType {
        /// The flag byte that was rejected.
        flag: u8,
    },

    /// The declared control length was zero.
    #[error("empty control block")]
    EmptyControl,

    /// The declared control length runs past the end of the buffer.
    #[error("declared control length {declared} exceeds remaining {remaining} bytes")]
    ControlOverrun {
        /// Control length declared in the header.
        declared: usize,
        /// Bytes actually remaining after the header.
        remaining: usize,
    },

    /// The declared control length exceeds the configured maximum.
    #[error("control block exceeds max length: {declared} > {max}")]
    OversizedControl {
        /// Control length declared in the header.
        declared: usize,
        /// Maximum permitted control length.
        max: usize,
    },
}

/// Top-level envelope codec error.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// Wire-level framing violation.
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    /// The control block could not be serialized.
    #[error("failed to encode control block")]
    EncodeControl(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The control block bytes could not be parsed.
    #[error("failed to decode control block")]
    DecodeControl(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl EnvelopeError {
    /// Returns the error category as a string for logging.
    #[must_use]
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Framing(_) => "framing",
            Self::EncodeControl(_) => "encode-control",
            Self::DecodeControl(_) => "decode-control",
        }
    }
}
