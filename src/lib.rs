//! Public API for the `crosswire` library.
//!
//! `crosswire` is a dual-transport RPC client: application requests are
//! multiplexed over either a persistent full-duplex connection or a
//! one-shot request/response exchange, sharing one binary envelope format,
//! with a strict-priority concurrency-bounded task scheduler delivering
//! completions on a single execution context.
//!
//! The composition root constructs a [`TransportManager`] from a validated
//! [`ClientConfig`] and submits calls through it; unsolicited server
//! pushes reach handlers registered by connection identity. Request and
//! response bodies are opaque byte sequences owned by the caller.

pub mod config;
pub mod correlation;
pub mod envelope;
pub mod manager;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod panic;
pub mod push;
pub mod request;
pub mod scheduler;
pub mod transport;

pub use config::{ClientConfig, ConfigError, Endpoints};
pub use correlation::{CorrelationError, CorrelationTable};
pub use envelope::{
    CallReason, Compression, ContentType, ControlBlock, EnvelopeError, FramingError, MessageKind,
};
pub use manager::{ManagerError, RequestOptions, RequestTicket, TransportManager};
pub use push::{PushHandler, PushMessage, PushRegistry};
pub use request::{CallStatus, ConnectionKind, Request, Response, UnknownConnectionKind};
pub use scheduler::{Priority, Scheduler, SchedulerError, TaskSpec};
pub use transport::{
    PersistentTransport, Transport, TransportError, TransientTransport,
};
