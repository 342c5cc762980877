//! Transport adapters: two interchangeable ways to exchange envelopes.
//!
//! Both adapters implement the narrow [`Transport`] contract — send one
//! request, receive one completion — so callers are transport-agnostic.
//! The persistent adapter multiplexes many in-flight calls over one
//! full-duplex connection and receives unsolicited pushes; the transient
//! adapter maps one request to one short-lived exchange with no push
//! capability.
//!
//! Transport failures never unwind past the adapter boundary: they are
//! converted into a typed [`TransportError`] (and, at the facade, into a
//! failure [`Response`]) delivered through the same completion channel as
//! success.

pub mod persistent;
pub mod transient;

#[cfg(test)]
mod tests;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use persistent::{ConnectionState, PersistentConfig, PersistentTransport};
pub use transient::{TransientConfig, TransientTransport};

use crate::{
    correlation::CorrelationError,
    request::{
        NET_ABORTED, NET_BAD_FRAME, NET_CLOSED, NET_CONNECT_FAILED, NET_IO, NET_TIMEOUT, Request,
        Response,
    },
};

/// Failures surfaced by a transport adapter.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The persistent connection is not open.
    #[error("not connected")]
    NotConnected,
    /// The connection could not be established.
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    /// The connection closed while the call was pending.
    #[error("connection closed: {reason}")]
    Closed {
        /// Why the connection went away.
        reason: String,
    },
    /// The per-call timer fired before a reply arrived.
    #[error("call timed out after {timeout_ms} ms")]
    Timeout {
        /// The timeout that elapsed.
        timeout_ms: i64,
    },
    /// The caller cancelled the call.
    #[error("call cancelled")]
    Cancelled,
    /// The caller reused a sequence id that is still pending.
    #[error("duplicate sequence id {0}")]
    DuplicateSequenceId(u64),
    /// An envelope could not be encoded or decoded.
    #[error("bad frame: {0}")]
    BadFrame(String),
    /// Any other transport I/O failure.
    #[error("i/o failure: {0}")]
    Io(String),
}

impl TransportError {
    /// The `net_code` this failure maps to in a failure [`Response`].
    #[must_use]
    pub fn net_code(&self) -> i32 {
        match self {
            Self::NotConnected | Self::ConnectFailed(_) => NET_CONNECT_FAILED,
            Self::Closed { .. } => NET_CLOSED,
            Self::Timeout { .. } => NET_TIMEOUT,
            Self::Cancelled => NET_ABORTED,
            Self::DuplicateSequenceId(_) | Self::BadFrame(_) => NET_BAD_FRAME,
            Self::Io(_) => NET_IO,
        }
    }
}

impl From<CorrelationError> for TransportError {
    fn from(err: CorrelationError) -> Self {
        match err {
            CorrelationError::DuplicateSequenceId(id) => Self::DuplicateSequenceId(id),
        }
    }
}

/// Result of one in-flight call.
pub type CallResult = Result<Response, TransportError>;

/// The narrow contract both adapters implement: send a request, get a
/// completion.
///
/// Cancelling `cancel` while the call is suspended yields
/// [`TransportError::Cancelled`]; on the persistent adapter this
/// deregisters the pending correlation entry without touching the socket,
/// and on the transient adapter it aborts the in-flight exchange.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform one request/completion exchange.
    async fn send(&self, request: Request, cancel: CancellationToken) -> CallResult;
}
