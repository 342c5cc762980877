//! Push message dispatch: unsolicited inbound frames routed by package name.
//!
//! `PushRegistry` stores per-connection push handlers keyed by connection
//! identity plus an optional global notify hook that observes every push
//! after per-connection dispatch. Handlers are `Arc<dyn PushHandler>` so
//! registration is cheap and dispatch never blocks registration.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use log::debug;

use crate::envelope::{Compression, ControlBlock};

/// An unsolicited inbound frame, constructed on receipt and handed to a
/// registered handler, then discarded. Not persisted.
#[derive(Clone, Debug, PartialEq)]
pub struct PushMessage {
    /// Logical package name discriminating the payload schema.
    pub notify_package: String,
    /// Opaque payload bytes.
    pub body: Bytes,
    /// Compression applied to the payload.
    pub compression: Compression,
    /// Sequence id carried by the frame, usable for de-duplication.
    pub sequence_id: u64,
    /// Server wall-clock in milliseconds since the epoch, `0` if unknown.
    pub server_time_ms: i64,
    /// Room the notify belongs to, if any.
    pub room_id: Option<i64>,
    /// Call the notify belongs to, if any.
    pub call_id: Option<i64>,
}

impl PushMessage {
    /// Build a push message from a decoded notify frame.
    #[must_use]
    pub fn from_frame(control: ControlBlock, body: Bytes) -> Self {
        Self {
            notify_package: control.notify_package.unwrap_or_default(),
            body,
            compression: control.compression,
            sequence_id: control.sequence_id,
            server_time_ms: control.server_time_ms.unwrap_or(0),
            room_id: control.room_id,
            call_id: control.call_id,
        }
    }
}

/// Receives unsolicited pushes for one connection identity.
#[async_trait]
pub trait PushHandler: Send + Sync {
    /// Handle one push message.
    async fn on_push(&self, message: PushMessage);
}

/// Registry of push handlers keyed by connection identity, plus an optional
/// global notify hook.
#[derive(Default)]
pub struct PushRegistry {
    handlers: DashMap<String, Arc<dyn PushHandler>>,
    notify_hook: RwLock<Option<Arc<dyn PushHandler>>>,
}

impl PushRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Register the push handler for a connection identity, replacing any
    /// previous handler for that identity.
    pub fn register(&self, identity: impl Into<String>, handler: Arc<dyn PushHandler>) {
        self.handlers.insert(identity.into(), handler);
    }

    /// Remove the handler for a connection identity.
    pub fn unregister(&self, identity: &str) { self.handlers.remove(identity); }

    /// Install the global notify hook observing every push.
    pub fn set_notify_hook(&self, hook: Arc<dyn PushHandler>) {
        if let Ok(mut slot) = self.notify_hook.write() {
            *slot = Some(hook);
        }
    }

    /// Dispatch a push to the handler registered for `identity`, then to the
    /// global notify hook. A missing per-connection handler is logged, not an
    /// error: pushes may arrive before the application registers interest.
    pub async fn dispatch(&self, identity: &str, message: PushMessage) {
        let handler = self.handlers.get(identity).map(|entry| entry.value().clone());
        match handler {
            Some(handler) => handler.on_push(message.clone()).await,
            None => debug!(
                "push with no registered handler: identity={identity} package={}",
                message.notify_package
            ),
        }

        let hook = self
            .notify_hook
            .read()
            .ok()
            .and_then(|slot| slot.clone());
        if let Some(hook) = hook {
            hook.on_push(message).await;
        }
    }
}
