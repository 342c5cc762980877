//! Transport manager: the facade callers go through.
//!
//! Explicitly constructed and injectable — there is no process-wide
//! instance. The manager owns adapter selection per request, the one
//! persistent connection's lifecycle, push-handler registration keyed by
//! connection identity, and credential updates. `send_request` assembles a
//! [`Request`]/[`ControlBlock`] pair with a freshly allocated sequence id
//! and submits the exchange to the scheduler; the completion callback is
//! delivered on the scheduler's single completion context.

use std::sync::{
    Arc, Mutex as StdMutex, RwLock as StdRwLock,
    atomic::{AtomicU64, Ordering},
};

use bytes::Bytes;
use futures::FutureExt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{
    config::{ClientConfig, ConfigError},
    envelope::{ContentType, ControlBlock},
    push::{PushHandler, PushRegistry},
    request::{
        CallStatus, ConnectionKind, NET_ABORTED, NET_IO, Request, Response, UnknownConnectionKind,
    },
    scheduler::{Priority, Scheduler, SchedulerError, TaskSpec, TaskWork},
    transport::{
        CallResult, PersistentConfig, PersistentTransport, Transport, TransportError,
        TransientConfig, TransientTransport, persistent::ClosedHook,
    },
};

/// Errors surfaced by the manager facade.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// The configuration failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// A connection-kind code matched no adapter.
    #[error(transparent)]
    UnknownConnectionKind(#[from] UnknownConnectionKind),
    /// The identity does not name the configured persistent connection.
    #[error("unknown connection identity: {0}")]
    IdentityMismatch(String),
    /// The persistent adapter reported a failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The scheduler refused the work.
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

/// Per-call options accepted by [`TransportManager::send_request_with`].
#[derive(Clone, Debug)]
pub struct RequestOptions {
    /// Scheduler priority class.
    pub priority: Priority,
    /// Control-block serialization.
    pub content_type: ContentType,
    /// Transport headers for the transient exchange preamble.
    pub headers: std::collections::HashMap<String, String>,
    /// Optional routing key for the peer.
    pub route_key: Option<String>,
    /// Per-call timeout in milliseconds; `0` disables the timer.
    pub timeout_ms: i64,
    /// Whether the call was issued by a background flow.
    pub background: bool,
    /// Connect without sending a payload.
    pub only_connect: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            priority: Priority::Normal,
            content_type: ContentType::Binary,
            headers: std::collections::HashMap::new(),
            route_key: None,
            timeout_ms: 0,
            background: false,
            only_connect: false,
        }
    }
}

/// Handle to one submitted call.
pub struct RequestTicket {
    sequence_id: u64,
    cancel: CancellationToken,
}

impl RequestTicket {
    /// The sequence id allocated for this call.
    #[must_use]
    pub fn sequence_id(&self) -> u64 { self.sequence_id }

    /// Cooperatively cancel the call. Safe to call at any time; at most one
    /// completion callback ever fires.
    pub fn cancel(&self) { self.cancel.cancel(); }
}

/// Completion callback invoked with the terminal status and response.
pub type CompletionFn = Box<dyn FnOnce(CallStatus, Response) + Send>;

/// The facade owning adapters, scheduler, and the persistent connection.
pub struct TransportManager {
    cfg: ClientConfig,
    scheduler: Scheduler<(CallStatus, Response)>,
    persistent: Arc<PersistentTransport>,
    transient: Arc<TransientTransport>,
    pushes: Arc<PushRegistry>,
    token: StdRwLock<Option<String>>,
    next_sequence: AtomicU64,
}

impl TransportManager {
    /// Build a manager from a validated configuration.
    ///
    /// Must be called within a Tokio runtime; the scheduler's pump and
    /// completion loops are spawned here.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::Config`] when the configuration fails
    /// validation.
    pub fn new(cfg: ClientConfig) -> Result<Self, ManagerError> {
        cfg.validate()?;

        let pushes = Arc::new(PushRegistry::new());
        let persistent = Arc::new(PersistentTransport::new(
            PersistentConfig {
                addr: cfg.endpoints.persistent.clone(),
                keepalive_interval: cfg.keepalive_interval,
                idle_timeout: cfg.idle_timeout,
            },
            cfg.connection_identity.clone(),
            Arc::clone(&pushes),
        ));
        let transient = Arc::new(TransientTransport::new(TransientConfig {
            send_timeout: cfg.transient_timeout,
        }));
        let scheduler = Scheduler::new(cfg.concurrency);

        Ok(Self {
            cfg,
            scheduler,
            persistent,
            transient,
            pushes,
            token: StdRwLock::new(None),
            next_sequence: AtomicU64::new(1),
        })
    }

    /// Select the adapter for a connection kind.
    #[must_use]
    pub fn select_adapter(&self, kind: ConnectionKind) -> Arc<dyn Transport> {
        match kind {
            ConnectionKind::Persistent => Arc::clone(&self.persistent) as Arc<dyn Transport>,
            ConnectionKind::Transient => Arc::clone(&self.transient) as Arc<dyn Transport>,
        }
    }

    /// Select the adapter for a raw connection-kind code.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::UnknownConnectionKind`] for an unknown code —
    /// there is no silent default adapter.
    pub fn select_adapter_by_code(&self, code: u8) -> Result<Arc<dyn Transport>, ManagerError> {
        Ok(self.select_adapter(ConnectionKind::from_code(code)?))
    }

    /// Update the credential attached to subsequent requests.
    ///
    /// Takes effect immediately, without reconnecting.
    pub fn update_token(&self, token: impl Into<String>) {
        if let Ok(mut slot) = self.token.write() {
            *slot = Some(token.into());
        }
    }

    /// Register the push handler for a connection identity.
    pub fn register_push_handler(
        &self,
        identity: impl Into<String>,
        handler: Arc<dyn PushHandler>,
    ) {
        self.pushes.register(identity, handler);
    }

    /// Install the global notify hook observing every push.
    pub fn set_notify_hook(&self, hook: Arc<dyn PushHandler>) { self.pushes.set_notify_hook(hook); }

    /// Install the closed/error hook for the persistent connection.
    pub fn set_closed_hook(&self, hook: ClosedHook) { self.persistent.set_closed_hook(hook); }

    /// Open the persistent connection named by `identity`.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::IdentityMismatch`] for an unknown identity
    /// and [`ManagerError::Transport`] when the dial fails.
    pub async fn connect(&self, identity: &str) -> Result<(), ManagerError> {
        self.check_identity(identity)?;
        self.persistent.connect().await?;
        Ok(())
    }

    /// Close the persistent connection named by `identity`. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::IdentityMismatch`] for an unknown identity.
    pub async fn disconnect(&self, identity: &str) -> Result<(), ManagerError> {
        self.check_identity(identity)?;
        self.persistent.disconnect().await;
        Ok(())
    }

    /// The persistent adapter instance owned by this manager.
    #[must_use]
    pub fn persistent(&self) -> Arc<PersistentTransport> { Arc::clone(&self.persistent) }

    /// Allocate a fresh sequence id, unique for the life of this manager.
    pub fn next_sequence_id(&self) -> u64 { self.next_sequence.fetch_add(1, Ordering::Relaxed) }

    /// Submit a call with default options.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::Scheduler`] when the scheduler is shut down.
    pub fn send_request(
        &self,
        service: impl Into<String>,
        method: impl Into<String>,
        body: Bytes,
        kind: ConnectionKind,
        on_completion: impl FnOnce(CallStatus, Response) + Send + 'static,
    ) -> Result<RequestTicket, ManagerError> {
        self.send_request_with(
            service,
            method,
            body,
            kind,
            RequestOptions::default(),
            on_completion,
        )
    }

    /// Assemble and submit one call.
    ///
    /// The control block gets a freshly allocated sequence id and the
    /// current credential; the exchange runs as a scheduler task of the
    /// requested priority, and `on_completion` fires exactly once on the
    /// completion context.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::Scheduler`] when the scheduler is shut down.
    pub fn send_request_with(
        &self,
        service: impl Into<String>,
        method: impl Into<String>,
        body: Bytes,
        kind: ConnectionKind,
        options: RequestOptions,
        on_completion: impl FnOnce(CallStatus, Response) + Send + 'static,
    ) -> Result<RequestTicket, ManagerError> {
        let sequence_id = self.next_sequence_id();
        let service = service.into();
        let method = method.into();

        let mut control = ControlBlock::request(sequence_id, service.clone(), method.clone());
        control.route_key = options.route_key;
        control.timeout_ms = options.timeout_ms;
        control.background = options.background;
        control.encrypt_token = self.token.read().ok().and_then(|slot| slot.clone());

        let mut request = Request::new(kind, self.cfg.endpoints.clone(), control)
            .with_body(body)
            .with_content_type(options.content_type)
            .with_headers(options.headers);
        if options.only_connect {
            request = request.only_connect();
        }

        let adapter = self.select_adapter(kind);
        let cancel = CancellationToken::new();
        let work: TaskWork<(CallStatus, Response)> = Box::new(move |cancel| {
            async move {
                let outcome = adapter.send(request, cancel).await;
                Ok(settle(sequence_id, outcome))
            }
            .boxed()
        });

        let slot: Arc<StdMutex<Option<CompletionFn>>> =
            Arc::new(StdMutex::new(Some(Box::new(on_completion))));
        let success_slot = Arc::clone(&slot);
        let error_slot = Arc::clone(&slot);
        let cancel_slot = Arc::clone(&slot);

        let task = TaskSpec::new(format!("{service}.{method}#{sequence_id}"), options.priority, work)
            .with_cancel(cancel.clone())
            .on_success(move |(status, response)| deliver(&success_slot, status, response))
            .on_error(move |error| {
                deliver(
                    &error_slot,
                    CallStatus::Failed,
                    Response::transport_failure(sequence_id, NET_IO, error.to_string()),
                );
            })
            .on_cancel(move || {
                deliver(
                    &cancel_slot,
                    CallStatus::Cancelled,
                    Response::transport_failure(sequence_id, NET_ABORTED, "cancelled"),
                );
            });

        self.scheduler.enqueue(task)?;
        Ok(RequestTicket { sequence_id, cancel })
    }

    /// Cancel every queued and in-flight call and halt the scheduler.
    /// The emergency-shutdown path; idempotent.
    pub fn stop_all(&self) { self.scheduler.stop_all(); }

    fn check_identity(&self, identity: &str) -> Result<(), ManagerError> {
        if identity == self.cfg.connection_identity {
            Ok(())
        } else {
            Err(ManagerError::IdentityMismatch(identity.to_owned()))
        }
    }
}

/// Map an adapter outcome to the caller-facing status/response pair.
fn settle(sequence_id: u64, outcome: CallResult) -> (CallStatus, Response) {
    match outcome {
        Ok(response) => {
            let status = if response.is_net_success() {
                CallStatus::Success
            } else {
                CallStatus::Failed
            };
            (status, response)
        }
        Err(TransportError::Cancelled) => (
            CallStatus::Cancelled,
            Response::transport_failure(sequence_id, NET_ABORTED, "cancelled"),
        ),
        Err(error) => {
            let net_code = error.net_code();
            (
                CallStatus::Failed,
                Response::transport_failure(sequence_id, net_code, error.to_string()),
            )
        }
    }
}

/// Invoke the completion exactly once; later deliveries find the slot empty.
fn deliver(slot: &Arc<StdMutex<Option<CompletionFn>>>, status: CallStatus, response: Response) {
    if let Ok(mut guard) = slot.lock() {
        if let Some(callback) = guard.take() {
            callback(status, response);
        }
    }
}
