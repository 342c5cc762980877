//! Correlation table matching in-flight sequence ids to pending completions.
//!
//! Every registered entry is resolved exactly once: by a network
//! completion, by [`CorrelationTable::cancel_all`] on disconnect, or by
//! explicit caller deregistration. Exactly-once follows from the removal
//! discipline — an entry is removed from the map before its completion is
//! sent, and the underlying oneshot channel cannot deliver twice.
//!
//! Resolving an unknown id is an expected race (a reply may arrive after
//! its caller gave up) and is logged at debug level, never surfaced.

use dashmap::{DashMap, mapref::entry::Entry};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;

use crate::transport::{CallResult, TransportError};

/// Contract violations on the correlation table.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum CorrelationError {
    /// The sequence id already has a pending completion. Surfaced
    /// synchronously; this is a caller bug, not a transport condition.
    #[error("sequence id {0} already has a pending completion")]
    DuplicateSequenceId(u64),
}

/// Receiver side of one pending completion.
pub struct CallSlot {
    sequence_id: u64,
    rx: oneshot::Receiver<CallResult>,
}

impl CallSlot {
    /// The sequence id this slot is keyed by.
    #[must_use]
    pub fn sequence_id(&self) -> u64 { self.sequence_id }

    /// Await the completion.
    ///
    /// A dropped sender (the table entry was deregistered without being
    /// resolved) surfaces as a closed-connection failure so no caller ever
    /// hangs.
    pub async fn wait(self) -> CallResult {
        match self.rx.await {
            Ok(result) => result,
            Err(_recv) => Err(TransportError::Closed {
                reason: "pending completion dropped".into(),
            }),
        }
    }
}

/// Concurrent registry mapping outstanding sequence ids to their pending
/// completions.
#[derive(Default)]
pub struct CorrelationTable {
    pending: DashMap<u64, oneshot::Sender<CallResult>>,
}

impl CorrelationTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Register a pending completion for `sequence_id`.
    ///
    /// # Errors
    ///
    /// Returns [`CorrelationError::DuplicateSequenceId`] if the id already
    /// has a pending completion. At most one outstanding completion per
    /// sequence id, always.
    pub fn register(&self, sequence_id: u64) -> Result<CallSlot, CorrelationError> {
        let (tx, rx) = oneshot::channel();
        match self.pending.entry(sequence_id) {
            Entry::Occupied(_) => Err(CorrelationError::DuplicateSequenceId(sequence_id)),
            Entry::Vacant(slot) => {
                slot.insert(tx);
                Ok(CallSlot { sequence_id, rx })
            }
        }
    }

    /// Resolve and remove the entry for `sequence_id`, delivering `result`.
    ///
    /// Returns `false` when no entry is pending — expected under
    /// cancellation races and logged, not surfaced.
    pub fn resolve(&self, sequence_id: u64, result: CallResult) -> bool {
        match self.pending.remove(&sequence_id) {
            Some((_, tx)) => {
                if tx.send(result).is_err() {
                    debug!(sequence_id, "pending caller went away before resolution");
                }
                true
            }
            None => {
                debug!(sequence_id, "resolution for unknown sequence id ignored");
                false
            }
        }
    }

    /// Remove the entry for `sequence_id` without resolving it.
    ///
    /// Used by caller cancellation: the network layer's view of the call is
    /// untouched, and a late reply will hit the unknown-id no-op path.
    pub fn deregister(&self, sequence_id: u64) -> bool {
        self.pending.remove(&sequence_id).is_some()
    }

    /// Fail every outstanding entry with a closed-connection result carrying
    /// `reason`. Used on disconnect and socket error so no caller hangs.
    ///
    /// Returns the number of entries resolved.
    pub fn cancel_all(&self, reason: &str) -> usize {
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        let mut resolved = 0;
        for sequence_id in ids {
            if self.resolve(
                sequence_id,
                Err(TransportError::Closed {
                    reason: reason.to_owned(),
                }),
            ) {
                resolved += 1;
            }
        }
        resolved
    }

    /// Number of outstanding entries.
    #[must_use]
    pub fn len(&self) -> usize { self.pending.len() }

    /// Whether no entries are outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.pending.is_empty() }
}
