//! Persistent full-duplex adapter: one framed connection, many in-flight
//! calls, unsolicited pushes.
//!
//! Lifecycle: `Disconnected → Connecting → Open → Closing → Disconnected`,
//! with `Open → Disconnected` reachable directly on socket error. While
//! Open, a single connection task owns the socket exclusively and drives a
//! `tokio::select!` loop over four sources: the shutdown token, the
//! outbound write queue, inbound frames, and the keep-alive/idle timers.
//! Inbound frames are decoded and dispatched one at a time in arrival
//! order; a malformed frame is logged and dropped, never fatal.
//!
//! On any exit — explicit disconnect, socket error, peer close, idle
//! timeout — every pending correlation entry is failed with the close
//! reason, so no caller hangs forever.

use std::sync::{Arc, RwLock as StdRwLock};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    sync::{Mutex, mpsc},
    task::JoinHandle,
    time::{self, Duration, Instant, MissedTickBehavior},
};
use tokio_util::{
    codec::{Framed, LengthDelimitedCodec},
    sync::CancellationToken,
};
use tracing::{debug, warn};

use super::{CallResult, Transport, TransportError};
use crate::{
    correlation::CorrelationTable,
    envelope::{self, ContentType, ControlBlock, Inbound},
    push::PushRegistry,
    request::{Request, Response},
};

/// Reserved service name for transport diagnostics; inbound frames tagged
/// with it are logged and otherwise ignored.
pub(crate) const SYS_SERVICE: &str = "sys";
/// Method name carried by keep-alive frames.
pub(crate) const PING_METHOD: &str = "ping";

/// Outbound queue depth between callers and the connection task.
const WRITE_QUEUE_DEPTH: usize = 64;

/// Connection lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection; `connect` may be called.
    Disconnected,
    /// Dial in progress.
    Connecting,
    /// Connection task running; calls may be sent.
    Open,
    /// Voluntary teardown in progress.
    Closing,
}

/// Tunables for one persistent connection.
#[derive(Clone, Debug)]
pub struct PersistentConfig {
    /// Address dialled by [`PersistentTransport::connect`].
    pub addr: String,
    /// Interval between keep-alive frames.
    pub keepalive_interval: Duration,
    /// Close the connection after this long with no traffic in either
    /// direction.
    pub idle_timeout: Duration,
}

/// Callback invoked with the close reason when the connection errors out
/// or is closed by the peer. Detached by a voluntary `disconnect`.
pub type ClosedHook = Arc<dyn Fn(&str) + Send + Sync>;

struct ConnState {
    phase: ConnectionState,
    writer: Option<mpsc::Sender<Bytes>>,
    shutdown: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

/// The persistent full-duplex transport adapter.
pub struct PersistentTransport {
    cfg: PersistentConfig,
    identity: String,
    state: Arc<Mutex<ConnState>>,
    correlation: Arc<CorrelationTable>,
    pushes: Arc<PushRegistry>,
    closed_hook: Arc<StdRwLock<Option<ClosedHook>>>,
}

impl PersistentTransport {
    /// Build an adapter for the connection identified by `identity`.
    #[must_use]
    pub fn new(cfg: PersistentConfig, identity: impl Into<String>, pushes: Arc<PushRegistry>) -> Self {
        Self {
            cfg,
            identity: identity.into(),
            state: Arc::new(Mutex::new(ConnState {
                phase: ConnectionState::Disconnected,
                writer: None,
                shutdown: None,
                task: None,
            })),
            correlation: Arc::new(CorrelationTable::new()),
            pushes,
            closed_hook: Arc::new(StdRwLock::new(None)),
        }
    }

    /// Install the closed/error hook. A voluntary `disconnect` detaches it
    /// before teardown, so it only observes involuntary closes.
    pub fn set_closed_hook(&self, hook: ClosedHook) {
        if let Ok(mut slot) = self.closed_hook.write() {
            *slot = Some(hook);
        }
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> ConnectionState { self.state.lock().await.phase }

    /// Number of calls currently awaiting a reply on this connection.
    #[must_use]
    pub fn pending_calls(&self) -> usize { self.correlation.len() }

    /// Open the connection. A no-op when already Open.
    ///
    /// Resolves once the socket is established and the connection task is
    /// running, or fails with a connection error.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectFailed`] if the dial fails or a
    /// connect/teardown is already in progress.
    pub async fn connect(&self) -> Result<(), TransportError> {
        {
            let mut st = self.state.lock().await;
            match st.phase {
                ConnectionState::Open => return Ok(()),
                ConnectionState::Connecting | ConnectionState::Closing => {
                    return Err(TransportError::ConnectFailed(format!(
                        "connection busy ({:?})",
                        st.phase
                    )));
                }
                ConnectionState::Disconnected => st.phase = ConnectionState::Connecting,
            }
        }

        match TcpStream::connect(&self.cfg.addr).await {
            Ok(stream) => {
                self.install(stream).await;
                Ok(())
            }
            Err(e) => {
                self.state.lock().await.phase = ConnectionState::Disconnected;
                Err(TransportError::ConnectFailed(e.to_string()))
            }
        }
    }

    /// Attach an already-established stream and start the connection task.
    ///
    /// This is the generic entry point behind [`connect`](Self::connect);
    /// tests drive the adapter over in-memory duplex streams with it.
    pub async fn attach<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        {
            let mut st = self.state.lock().await;
            st.phase = ConnectionState::Connecting;
        }
        self.install(stream).await;
    }

    async fn install<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let framed = Framed::new(stream, LengthDelimitedCodec::new());
        let (out_tx, out_rx) = mpsc::channel::<Bytes>(WRITE_QUEUE_DEPTH);
        let shutdown = CancellationToken::new();

        let driver = ConnectionDriver {
            correlation: Arc::clone(&self.correlation),
            pushes: Arc::clone(&self.pushes),
            identity: self.identity.clone(),
            keepalive: self.cfg.keepalive_interval,
            idle_timeout: self.cfg.idle_timeout,
        };
        let state = Arc::clone(&self.state);
        let closed_hook = Arc::clone(&self.closed_hook);
        let task_shutdown = shutdown.clone();

        // The connection counts as Open before the task starts; the task
        // resets the state on exit, so ordering the other way round could
        // leave a dead connection marked Open.
        {
            let mut st = self.state.lock().await;
            st.phase = ConnectionState::Open;
            st.writer = Some(out_tx);
            st.shutdown = Some(shutdown);
            st.task = None;
        }
        #[cfg(feature = "metrics")]
        crate::metrics::inc_connections();

        let task = tokio::spawn(async move {
            let reason = driver.run(framed, out_rx, task_shutdown.clone()).await;
            let voluntary = task_shutdown.is_cancelled();

            let failed = driver.correlation.cancel_all(&reason);
            if failed > 0 {
                warn!(pending = failed, reason = %reason, "failed outstanding calls on close");
            }
            #[cfg(feature = "metrics")]
            crate::metrics::inc_calls_failed_on_close(failed);

            {
                let mut st = state.lock().await;
                st.phase = ConnectionState::Disconnected;
                st.writer = None;
                st.shutdown = None;
            }

            if !voluntary {
                let hook = closed_hook.read().ok().and_then(|slot| slot.clone());
                if let Some(hook) = hook {
                    hook(&reason);
                }
            }
            #[cfg(feature = "metrics")]
            crate::metrics::dec_connections();
        });

        // Harmless if the task already tore down: only the handle is stored.
        self.state.lock().await.task = Some(task);
    }

    /// Close the connection. Idempotent.
    ///
    /// Detaches the closed/error hook, stops the connection task, and fails
    /// every pending call with a `"disconnected"` reason.
    pub async fn disconnect(&self) {
        {
            let st = self.state.lock().await;
            if st.phase == ConnectionState::Disconnected {
                return;
            }
        }

        // Detach hooks before teardown: a voluntary close is not an error
        // event.
        if let Ok(mut slot) = self.closed_hook.write() {
            *slot = None;
        }

        let (shutdown, task) = {
            let mut st = self.state.lock().await;
            st.phase = ConnectionState::Closing;
            st.writer = None;
            (st.shutdown.take(), st.task.take())
        };

        if let Some(token) = shutdown {
            token.cancel();
        }
        if let Some(task) = task {
            if let Err(e) = task.await {
                debug!(error = %e, "connection task join failed");
            }
        }

        self.state.lock().await.phase = ConnectionState::Disconnected;
    }
}

#[async_trait]
impl Transport for PersistentTransport {
    async fn send(&self, request: Request, cancel: CancellationToken) -> CallResult {
        let writer = {
            let st = self.state.lock().await;
            if st.phase != ConnectionState::Open {
                return Err(TransportError::NotConnected);
            }
            st.writer.clone().ok_or(TransportError::NotConnected)?
        };

        let sequence_id = request.control.sequence_id;
        if request.only_connect {
            return Ok(Response::synthetic_success(sequence_id));
        }

        let slot = self.correlation.register(sequence_id)?;

        let frame = match envelope::encode(&request.control, &request.body, request.content_type) {
            Ok(frame) => frame,
            Err(e) => {
                self.correlation.deregister(sequence_id);
                return Err(TransportError::BadFrame(e.to_string()));
            }
        };
        if writer.send(frame).await.is_err() {
            self.correlation.deregister(sequence_id);
            return Err(TransportError::Closed {
                reason: "connection task gone".into(),
            });
        }
        #[cfg(feature = "metrics")]
        crate::metrics::inc_frames(crate::metrics::Direction::Outbound);

        let timeout_ms = request.control.timeout_ms;
        tokio::select! {
            result = slot.wait() => result,
            () = cancel.cancelled() => {
                self.correlation.deregister(sequence_id);
                Err(TransportError::Cancelled)
            }
            () = call_timer(timeout_ms) => {
                self.correlation.deregister(sequence_id);
                Err(TransportError::Timeout { timeout_ms })
            }
        }
    }
}

/// Sleeps for the call timeout, or forever when the timeout is disabled.
async fn call_timer(timeout_ms: i64) {
    match u64::try_from(timeout_ms) {
        Ok(ms) if ms > 0 => time::sleep(Duration::from_millis(ms)).await,
        _ => std::future::pending::<()>().await,
    }
}

/// State shared by the connection task; owns inbound dispatch.
struct ConnectionDriver {
    correlation: Arc<CorrelationTable>,
    pushes: Arc<PushRegistry>,
    identity: String,
    keepalive: Duration,
    idle_timeout: Duration,
}

impl ConnectionDriver {
    /// Drive the connection until shutdown, error, or idle timeout.
    /// Returns the close reason.
    async fn run<S>(
        &self,
        framed: Framed<S, LengthDelimitedCodec>,
        mut out_rx: mpsc::Receiver<Bytes>,
        shutdown: CancellationToken,
    ) -> String
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let (mut sink, mut stream) = framed.split();
        let mut ping_tick = time::interval_at(Instant::now() + self.keepalive, self.keepalive);
        ping_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_activity = Instant::now();

        loop {
            tokio::select! {
                biased;

                () = shutdown.cancelled() => {
                    let _ = sink.close().await;
                    break "disconnected".to_string();
                }

                maybe_out = out_rx.recv() => match maybe_out {
                    Some(bytes) => {
                        last_activity = Instant::now();
                        if let Err(e) = sink.send(bytes).await {
                            break format!("write failed: {e}");
                        }
                    }
                    None => {
                        let _ = sink.close().await;
                        break "disconnected".to_string();
                    }
                },

                inbound = stream.next() => match inbound {
                    Some(Ok(frame)) => {
                        last_activity = Instant::now();
                        self.handle_inbound(frame.freeze()).await;
                    }
                    Some(Err(e)) => break format!("read failed: {e}"),
                    None => break "closed by peer".to_string(),
                },

                _ = ping_tick.tick() => {
                    match keepalive_frame() {
                        Ok(ping) => {
                            if let Err(e) = sink.send(ping).await {
                                break format!("keepalive write failed: {e}");
                            }
                        }
                        Err(e) => warn!(error = %e, "failed to encode keepalive frame"),
                    }
                }

                () = time::sleep_until(last_activity + self.idle_timeout) => {
                    let _ = sink.close().await;
                    break "idle timeout".to_string();
                }
            }
        }
    }

    /// Decode and dispatch one inbound frame. Never fails the connection:
    /// malformed frames are logged and dropped.
    async fn handle_inbound(&self, frame: Bytes) {
        let decoded = match envelope::decode(frame) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(error = %e, kind = e.error_type(), "dropping undecodable frame");
                #[cfg(feature = "metrics")]
                crate::metrics::inc_decode_errors();
                return;
            }
        };
        #[cfg(feature = "metrics")]
        crate::metrics::inc_frames(crate::metrics::Direction::Inbound);

        if decoded.control.service == SYS_SERVICE && decoded.control.kind.is_none() {
            debug!(method = %decoded.control.method, "diagnostic frame");
            return;
        }

        match envelope::classify(decoded) {
            Inbound::Response(response) => {
                let sequence_id = response.sequence_id;
                self.correlation.resolve(sequence_id, Ok(response));
            }
            Inbound::Push(message) => {
                self.pushes.dispatch(&self.identity, message).await;
            }
        }
    }
}

/// Build a keep-alive frame: a Text envelope on the diagnostic service.
fn keepalive_frame() -> Result<Bytes, envelope::EnvelopeError> {
    let control = ControlBlock::request(0, SYS_SERVICE, PING_METHOD);
    envelope::encode(&control, &[], ContentType::Text)
}
