//! Metric helpers for `crosswire`.
//!
//! This module defines metric names and simple helper functions
//! wrapping the [`metrics`](https://docs.rs/metrics) crate.

use metrics::{counter, gauge};

/// Name of the gauge tracking open persistent connections.
pub const CONNECTIONS_ACTIVE: &str = "crosswire_connections_active";
/// Name of the counter tracking processed envelope frames.
pub const FRAMES_PROCESSED: &str = "crosswire_frames_processed_total";
/// Name of the counter tracking dropped undecodable frames.
pub const DECODE_ERRORS: &str = "crosswire_decode_errors_total";
/// Name of the counter tracking calls failed by `cancel_all`.
pub const CALLS_FAILED_ON_CLOSE: &str = "crosswire_calls_failed_on_close_total";

/// Direction of frame processing.
#[derive(Clone, Copy)]
pub enum Direction {
    /// Inbound frames received from the peer.
    Inbound,
    /// Outbound frames written to the peer.
    Outbound,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

/// Increment the open connections gauge.
pub fn inc_connections() { gauge!(CONNECTIONS_ACTIVE).increment(1.0); }

/// Decrement the open connections gauge.
pub fn dec_connections() { gauge!(CONNECTIONS_ACTIVE).decrement(1.0); }

/// Record a processed frame for the given direction.
pub fn inc_frames(direction: Direction) {
    counter!(FRAMES_PROCESSED, "direction" => direction.as_str()).increment(1);
}

/// Record a dropped undecodable frame.
pub fn inc_decode_errors() { counter!(DECODE_ERRORS).increment(1); }

/// Record calls failed because their connection went away.
pub fn inc_calls_failed_on_close(count: usize) {
    counter!(CALLS_FAILED_ON_CLOSE).increment(count as u64);
}
