//! Request and response surface shared by both transport adapters.
//!
//! A [`Request`] is built per call and consumed by exactly one adapter
//! invocation; reuse requires a clone. A [`Response`] is produced exactly
//! once per request — success, transport failure, and cancellation all
//! surface as a `Response` or an explicit typed failure, never a silent
//! drop. Bodies are opaque byte sequences owned by the caller.

use std::{collections::HashMap, fmt, str::FromStr};

use bytes::Bytes;
use thiserror::Error;

use crate::{
    config::Endpoints,
    envelope::{ContentType, ControlBlock},
};

/// Transport-level success.
pub const NET_OK: i32 = 200;
/// The adapter could not reach the peer.
pub const NET_CONNECT_FAILED: i32 = -100;
/// The exchange or pending call timed out.
pub const NET_TIMEOUT: i32 = -101;
/// The caller cancelled the call.
pub const NET_ABORTED: i32 = -102;
/// The connection closed while the call was pending.
pub const NET_CLOSED: i32 = -103;
/// A frame could not be encoded or the reply could not be decoded.
pub const NET_BAD_FRAME: i32 = -104;
/// Any other transport I/O failure.
pub const NET_IO: i32 = -105;

/// Sentinel for "no application result code present".
pub const APP_CODE_UNSET: i32 = -1;

/// Which channel a request travels over.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionKind {
    /// Full-duplex multiplexed channel with push capability.
    Persistent,
    /// One-shot request/response exchange.
    Transient,
}

impl ConnectionKind {
    /// Wire/config code for this kind.
    #[must_use]
    pub const fn as_code(self) -> u8 {
        match self {
            Self::Persistent => 0,
            Self::Transient => 1,
        }
    }

    /// Parse a kind from its wire/config code.
    ///
    /// There is deliberately no silent default: an unknown code is a loud
    /// contract violation.
    ///
    /// # Errors
    ///
    /// Returns [`UnknownConnectionKind`] for any code other than `0` or `1`.
    pub fn from_code(code: u8) -> Result<Self, UnknownConnectionKind> {
        match code {
            0 => Ok(Self::Persistent),
            1 => Ok(Self::Transient),
            other => Err(UnknownConnectionKind(other.to_string())),
        }
    }
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Persistent => "persistent",
            Self::Transient => "transient",
        })
    }
}

impl FromStr for ConnectionKind {
    type Err = UnknownConnectionKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "persistent" => Ok(Self::Persistent),
            "transient" => Ok(Self::Transient),
            other => Err(UnknownConnectionKind(other.to_string())),
        }
    }
}

/// A connection-kind code that matches no known adapter.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("unknown connection kind: {0}")]
pub struct UnknownConnectionKind(pub String);

/// Terminal status of a call as seen by the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallStatus {
    /// The exchange completed and the peer replied.
    Success,
    /// The exchange failed at the transport or application boundary.
    Failed,
    /// The caller cancelled the call before completion.
    Cancelled,
}

/// One outbound call, consumed by exactly one adapter invocation.
#[derive(Clone, Debug)]
pub struct Request {
    /// Which channel this request travels over.
    pub connection_kind: ConnectionKind,
    /// Target addresses for both channel kinds.
    pub endpoints: Endpoints,
    /// Serialization applied to the control block.
    pub content_type: ContentType,
    /// Transport headers, carried in the transient exchange preamble.
    pub headers: HashMap<String, String>,
    /// Connect without sending a payload; yields a synthetic success.
    pub only_connect: bool,
    /// Opaque body bytes.
    pub body: Bytes,
    /// Routing and correlation metadata.
    pub control: ControlBlock,
}

impl Request {
    /// Build a request with an empty body, no headers, and binary content.
    #[must_use]
    pub fn new(
        connection_kind: ConnectionKind,
        endpoints: Endpoints,
        control: ControlBlock,
    ) -> Self {
        Self {
            connection_kind,
            endpoints,
            content_type: ContentType::Binary,
            headers: HashMap::new(),
            only_connect: false,
            body: Bytes::new(),
            control,
        }
    }

    /// Attach a body.
    #[must_use]
    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }

    /// Replace the transport headers.
    #[must_use]
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    /// Select the control-block serialization.
    #[must_use]
    pub fn with_content_type(mut self, content_type: ContentType) -> Self {
        self.content_type = content_type;
        self
    }

    /// Mark the request as connect-only.
    #[must_use]
    pub fn only_connect(mut self) -> Self {
        self.only_connect = true;
        self
    }
}

/// Completion of one request.
#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    /// Transport-level status (`NET_OK` on any successfully decoded reply).
    pub net_code: i32,
    /// Transport-level status message.
    pub net_message: String,
    /// Business status; [`APP_CODE_UNSET`] when the peer sent none.
    pub app_code: i32,
    /// Business status message.
    pub app_message: String,
    /// Opaque reply body, if any.
    pub body: Option<Bytes>,
    /// Server wall-clock in milliseconds since the epoch, `0` if unknown.
    pub server_time_ms: i64,
    /// Sequence id echoed from the request.
    pub sequence_id: u64,
}

impl Response {
    /// Build a response from a decoded inbound frame.
    ///
    /// Decode success is not application success: the control's result code
    /// and message map into `app_code`/`app_message`, and `net_code` is
    /// [`NET_OK`] because the frame itself arrived intact.
    #[must_use]
    pub fn from_frame(control: ControlBlock, body: Bytes) -> Self {
        Self {
            net_code: NET_OK,
            net_message: String::new(),
            app_code: control.result_code.unwrap_or(APP_CODE_UNSET),
            app_message: control.result_message.unwrap_or_default(),
            body: if body.is_empty() { None } else { Some(body) },
            server_time_ms: control.server_time_ms.unwrap_or(0),
            sequence_id: control.sequence_id,
        }
    }

    /// Synthetic success for connect-only requests; no payload was written.
    #[must_use]
    pub fn synthetic_success(sequence_id: u64) -> Self {
        Self {
            net_code: NET_OK,
            net_message: String::new(),
            app_code: APP_CODE_UNSET,
            app_message: String::new(),
            body: None,
            server_time_ms: 0,
            sequence_id,
        }
    }

    /// A transport-level failure, distinct from application failures.
    #[must_use]
    pub fn transport_failure(
        sequence_id: u64,
        net_code: i32,
        net_message: impl Into<String>,
    ) -> Self {
        Self {
            net_code,
            net_message: net_message.into(),
            app_code: APP_CODE_UNSET,
            app_message: String::new(),
            body: None,
            server_time_ms: 0,
            sequence_id,
        }
    }

    /// Whether the transport delivered a decoded reply at all.
    #[must_use]
    pub fn is_net_success(&self) -> bool { self.net_code == NET_OK }
}
