//! One-shot adapter: each call is its own framed exchange.
//!
//! Stateless per call — no correlation table, no push capability. An
//! exchange dials the transient endpoint, writes a header preamble and the
//! request envelope, reads exactly one reply envelope, and closes. The
//! whole exchange runs under a fixed deadline and races the caller's
//! cancellation token; cancellation aborts the in-flight exchange by
//! dropping the connection.
//!
//! The adapter never fails past its boundary: transport-level failures map
//! to failure [`Response`]s whose `net_code` values are distinct from
//! application failures, with the request's sequence id echoed back for
//! caller bookkeeping.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    time::{self, Duration},
};
use tokio_util::{
    codec::{Framed, LengthDelimitedCodec},
    sync::CancellationToken,
};
use tracing::debug;

use super::{CallResult, Transport, TransportError};
use crate::{
    envelope::{self, Inbound},
    request::{
        NET_BAD_FRAME, NET_CLOSED, NET_CONNECT_FAILED, NET_IO, NET_TIMEOUT, Request, Response,
    },
};

/// Tunables for the transient adapter.
#[derive(Clone, Debug)]
pub struct TransientConfig {
    /// Fixed deadline covering one whole exchange, dial included.
    pub send_timeout: Duration,
}

impl Default for TransientConfig {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(30),
        }
    }
}

/// The one-shot transport adapter.
#[derive(Debug, Default)]
pub struct TransientTransport {
    cfg: TransientConfig,
}

impl TransientTransport {
    /// Build an adapter with the given tunables.
    #[must_use]
    pub fn new(cfg: TransientConfig) -> Self { Self { cfg } }

    async fn exchange(&self, request: &Request) -> Response {
        let sequence_id = request.control.sequence_id;
        match TcpStream::connect(&request.endpoints.transient).await {
            Ok(stream) => self.exchange_on(stream, request).await,
            Err(e) => Response::transport_failure(
                sequence_id,
                NET_CONNECT_FAILED,
                format!("connect failed: {e}"),
            ),
        }
    }

    /// Run one exchange over an already-established stream.
    ///
    /// Split out from [`exchange`](Self::exchange) so tests can drive the
    /// adapter over in-memory duplex streams.
    pub(crate) async fn exchange_on<S>(&self, stream: S, request: &Request) -> Response
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let sequence_id = request.control.sequence_id;
        let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

        let preamble = match encode_header_preamble(request) {
            Ok(preamble) => preamble,
            Err(e) => {
                return Response::transport_failure(
                    sequence_id,
                    NET_BAD_FRAME,
                    format!("preamble encode failed: {e}"),
                );
            }
        };
        if let Err(e) = framed.send(preamble).await {
            return Response::transport_failure(
                sequence_id,
                NET_IO,
                format!("preamble write failed: {e}"),
            );
        }

        let frame = match envelope::encode(&request.control, &request.body, request.content_type) {
            Ok(frame) => frame,
            Err(e) => {
                return Response::transport_failure(
                    sequence_id,
                    NET_BAD_FRAME,
                    format!("envelope encode failed: {e}"),
                );
            }
        };
        if let Err(e) = framed.send(frame).await {
            return Response::transport_failure(sequence_id, NET_IO, format!("write failed: {e}"));
        }

        match framed.next().await {
            Some(Ok(reply)) => match envelope::decode(reply.freeze()) {
                Ok(decoded) => match envelope::classify(decoded) {
                    Inbound::Response(mut response) => {
                        // Echo the request's sequence id for caller
                        // bookkeeping; there is no multiplexing to protect.
                        response.sequence_id = sequence_id;
                        response
                    }
                    Inbound::Push(message) => {
                        debug!(package = %message.notify_package, "notify on transient exchange");
                        Response::transport_failure(
                            sequence_id,
                            NET_BAD_FRAME,
                            "unexpected notify on transient exchange",
                        )
                    }
                },
                Err(e) => Response::transport_failure(
                    sequence_id,
                    NET_BAD_FRAME,
                    format!("undecodable reply: {e}"),
                ),
            },
            Some(Err(e)) => {
                Response::transport_failure(sequence_id, NET_IO, format!("read failed: {e}"))
            }
            None => Response::transport_failure(sequence_id, NET_CLOSED, "closed before reply"),
        }
    }
}

#[async_trait]
impl Transport for TransientTransport {
    async fn send(&self, request: Request, cancel: CancellationToken) -> CallResult {
        let sequence_id = request.control.sequence_id;
        if request.only_connect {
            return Ok(Response::synthetic_success(sequence_id));
        }
        tokio::select! {
            response = self.exchange(&request) => Ok(response),
            () = cancel.cancelled() => Err(TransportError::Cancelled),
            () = time::sleep(self.cfg.send_timeout) => Ok(Response::transport_failure(
                sequence_id,
                NET_TIMEOUT,
                "send timeout",
            )),
        }
    }
}

/// Encode the request headers as the exchange preamble: a bincode-encoded
/// list of key/value pairs in sorted key order.
fn encode_header_preamble(request: &Request) -> Result<Bytes, bincode::error::EncodeError> {
    let mut pairs: Vec<(&str, &str)> = request
        .headers
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    pairs.sort_unstable();
    bincode::serde::encode_to_vec(&pairs, bincode::config::standard()).map(Bytes::from)
}
