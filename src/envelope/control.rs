//! Control block schema accompanying every envelope.
//!
//! The control block carries routing and correlation metadata for a frame.
//! Outbound frames populate the request fields; inbound frames additionally
//! carry a [`MessageKind`] discriminator plus result and notify fields. All
//! fields serialize through Serde so one set of derives covers both the
//! binary (bincode) and text (JSON) content types.
//!
//! Optional fields are always serialized (as `None`/`null`) rather than
//! skipped: bincode's wire format is not self-describing, so omitting
//! absent fields would break the decode side.

use serde::{Deserialize, Serialize};

/// Discriminator classifying an inbound frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// Reply to a pending outbound request, matched by sequence id.
    Response,
    /// Unsolicited server push, dispatched by notify package.
    Notify,
}

/// Compression applied to the frame body.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Compression {
    /// Body bytes are uncompressed.
    #[default]
    None,
    /// Body bytes are gzip-compressed.
    Gzip,
}

/// Why the request was issued.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallReason {
    /// First attempt at this call.
    #[default]
    Normal,
    /// Retransmission of an earlier failed call.
    Retry,
    /// Call replayed after a reconnect.
    Reconnect,
}

/// Structured metadata accompanying a frame.
///
/// `sequence_id` must be unique among in-flight outbound requests on a
/// connection; it is caller-supplied and must not be reused while pending.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlBlock {
    /// Correlation key matching a request to its eventual response.
    pub sequence_id: u64,
    /// Target service name.
    pub service: String,
    /// Target method within the service.
    pub method: String,
    /// Optional routing key consumed by the peer.
    #[serde(default)]
    pub route_key: Option<String>,
    /// Per-call timeout in milliseconds; `0` disables the timer.
    #[serde(default)]
    pub timeout_ms: i64,
    /// Opaque credential attached by the transport manager.
    #[serde(default)]
    pub encrypt_token: Option<String>,
    /// Body compression.
    #[serde(default)]
    pub compression: Compression,
    /// Whether the call was issued by a background flow.
    #[serde(default)]
    pub background: bool,
    /// Why the call was issued.
    #[serde(default)]
    pub reason: CallReason,

    // Inbound-only fields below. Outbound requests leave them `None`.
    /// Frame classification; absent on outbound requests.
    #[serde(default)]
    pub kind: Option<MessageKind>,
    /// Business result code reported by the peer.
    #[serde(default)]
    pub result_code: Option<i32>,
    /// Human-readable result message reported by the peer.
    #[serde(default)]
    pub result_message: Option<String>,
    /// Server wall-clock in milliseconds since the epoch.
    #[serde(default)]
    pub server_time_ms: Option<i64>,
    /// Room the notify belongs to, if any.
    #[serde(default)]
    pub room_id: Option<i64>,
    /// Call the notify belongs to, if any.
    #[serde(default)]
    pub call_id: Option<i64>,
    /// Logical package name discriminating the notify payload schema.
    #[serde(default)]
    pub notify_package: Option<String>,
}

impl ControlBlock {
    /// Build an outbound request control block with default options.
    #[must_use]
    pub fn request(
        sequence_id: u64,
        service: impl Into<String>,
        method: impl Into<String>,
    ) -> Self {
        Self {
            sequence_id,
            service: service.into(),
            method: method.into(),
            ..Self::default()
        }
    }

    /// Whether this control block marks an unsolicited push.
    #[must_use]
    pub fn is_notify(&self) -> bool { self.kind == Some(MessageKind::Notify) }
}
