//! Unit tests for both transport adapters, driven over in-memory duplex
//! streams and loopback TCP.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::{
    io::{DuplexStream, duplex},
    sync::mpsc,
    time::{Duration, sleep, timeout},
};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use super::*;
use crate::{
    config::Endpoints,
    envelope::{self, ContentType, ControlBlock, MessageKind},
    push::{PushHandler, PushMessage, PushRegistry},
    request::{ConnectionKind, NET_CONNECT_FAILED, NET_OK, NET_TIMEOUT, Request},
};

fn peer(stream: DuplexStream) -> Framed<DuplexStream, LengthDelimitedCodec> {
    Framed::new(stream, LengthDelimitedCodec::new())
}

fn request(sequence_id: u64) -> Request {
    Request::new(
        ConnectionKind::Persistent,
        Endpoints::new("unused", "unused"),
        ControlBlock::request(sequence_id, "s", "m"),
    )
}

fn response_frame(sequence_id: u64, result_code: i32) -> Bytes {
    let mut control = ControlBlock::request(sequence_id, "s", "m");
    control.kind = Some(MessageKind::Response);
    control.result_code = Some(result_code);
    envelope::encode(&control, b"reply", ContentType::Binary).expect("encode response frame")
}

fn notify_frame(package: &str) -> Bytes {
    let mut control = ControlBlock::request(900, "chat", "deliver");
    control.kind = Some(MessageKind::Notify);
    control.notify_package = Some(package.into());
    envelope::encode(&control, b"push body", ContentType::Binary).expect("encode notify frame")
}

fn transport() -> (Arc<PersistentTransport>, Arc<PushRegistry>) {
    let pushes = Arc::new(PushRegistry::new());
    let cfg = PersistentConfig {
        addr: "127.0.0.1:0".into(),
        keepalive_interval: Duration::from_secs(15),
        idle_timeout: Duration::from_secs(30),
    };
    let transport = Arc::new(PersistentTransport::new(cfg, "main", Arc::clone(&pushes)));
    (transport, pushes)
}

struct RecordingHandler {
    tx: mpsc::UnboundedSender<PushMessage>,
}

#[async_trait]
impl PushHandler for RecordingHandler {
    async fn on_push(&self, message: PushMessage) {
        let _ = self.tx.send(message);
    }
}

async fn wait_for_pending(transport: &PersistentTransport, expected: usize) {
    timeout(Duration::from_secs(5), async {
        while transport.pending_calls() != expected {
            sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("pending calls did not settle");
}

#[tokio::test]
async fn persistent_send_resolves_on_matching_response() {
    let (transport, _pushes) = transport();
    let (client, server) = duplex(4096);
    transport.attach(client).await;
    assert_eq!(transport.state().await, ConnectionState::Open);

    let mut server = peer(server);
    let responder = tokio::spawn(async move {
        let frame = server.next().await.expect("request frame").expect("read");
        let decoded = envelope::decode(frame.freeze()).expect("decode request");
        assert_eq!(decoded.control.sequence_id, 42);
        assert_eq!(decoded.control.service, "s");
        assert_eq!(decoded.control.method, "m");
        assert!(decoded.body.is_empty());
        server.send(response_frame(42, 0)).await.expect("respond");
        server
    });

    let response = transport
        .send(request(42), CancellationToken::new())
        .await
        .expect("call resolves");
    assert_eq!(response.net_code, NET_OK);
    assert_eq!(response.app_code, 0);
    assert_eq!(response.sequence_id, 42);
    assert!(transport.pending_calls() == 0);

    drop(responder.await.expect("responder"));
    transport.disconnect().await;
}

#[tokio::test]
async fn push_frames_dispatch_without_touching_pending_calls() {
    let (transport, pushes) = transport();
    let (push_tx, mut push_rx) = mpsc::unbounded_channel();
    pushes.register("main", Arc::new(RecordingHandler { tx: push_tx }));

    let (client, server) = duplex(4096);
    transport.attach(client).await;
    let mut server = peer(server);

    // Leave one call pending so we can observe that pushes do not touch it.
    let pending_transport = Arc::clone(&transport);
    let pending = tokio::spawn(async move {
        pending_transport
            .send(request(7), CancellationToken::new())
            .await
    });
    wait_for_pending(&transport, 1).await;
    let _request_frame = server.next().await.expect("request frame").expect("read");

    server.send(notify_frame("pkg.X")).await.expect("send push");

    let message = timeout(Duration::from_secs(5), push_rx.recv())
        .await
        .expect("push delivered")
        .expect("handler alive");
    assert_eq!(message.notify_package, "pkg.X");
    assert_eq!(message.body.as_ref(), b"push body");
    assert_eq!(transport.pending_calls(), 1, "push must not resolve pending calls");

    server.send(response_frame(7, 0)).await.expect("respond");
    let response = pending.await.expect("join").expect("call resolves");
    assert_eq!(response.sequence_id, 7);
    transport.disconnect().await;
}

#[tokio::test]
async fn disconnect_fails_pending_calls_with_reason() {
    let (transport, _pushes) = transport();
    let (client, _server) = duplex(4096);
    transport.attach(client).await;

    let pending_transport = Arc::clone(&transport);
    let pending = tokio::spawn(async move {
        pending_transport
            .send(request(7), CancellationToken::new())
            .await
    });
    wait_for_pending(&transport, 1).await;

    transport.disconnect().await;

    let result = pending.await.expect("join");
    match result {
        Err(TransportError::Closed { reason }) => assert_eq!(reason, "disconnected"),
        other => panic!("expected closed failure, got {other:?}"),
    }
    assert_eq!(transport.state().await, ConnectionState::Disconnected);
    assert_eq!(transport.pending_calls(), 0);

    // Idempotent.
    transport.disconnect().await;
}

#[tokio::test]
async fn malformed_inbound_frames_are_dropped_not_fatal() {
    let (transport, _pushes) = transport();
    let (client, server) = duplex(4096);
    transport.attach(client).await;
    let mut server = peer(server);

    let pending_transport = Arc::clone(&transport);
    let pending = tokio::spawn(async move {
        pending_transport
            .send(request(5), CancellationToken::new())
            .await
    });
    wait_for_pending(&transport, 1).await;
    let _request_frame = server.next().await.expect("request frame").expect("read");

    // Too short for the envelope header; dropped with a log line.
    server
        .send(Bytes::from_static(b"xx"))
        .await
        .expect("send garbage");
    // A valid reply afterwards proves the connection survived.
    server.send(response_frame(5, 0)).await.expect("respond");

    let response = pending.await.expect("join").expect("call resolves");
    assert_eq!(response.sequence_id, 5);
    assert_eq!(transport.state().await, ConnectionState::Open);
    transport.disconnect().await;
}

#[tokio::test]
async fn only_connect_requests_yield_synthetic_success() {
    let (transport, _pushes) = transport();
    let (client, server) = duplex(4096);
    transport.attach(client).await;
    let mut server = peer(server);

    let response = transport
        .send(request(11).only_connect(), CancellationToken::new())
        .await
        .expect("synthetic success");
    assert_eq!(response.net_code, NET_OK);
    assert_eq!(response.sequence_id, 11);
    assert_eq!(transport.pending_calls(), 0);

    // Nothing was written for the connect-only request.
    transport.disconnect().await;
    assert!(
        server.next().await.is_none(),
        "connect-only request must not write a payload"
    );
}

#[tokio::test]
async fn duplicate_sequence_ids_fail_fast() {
    let (transport, _pushes) = transport();
    let (client, server) = duplex(4096);
    transport.attach(client).await;
    let mut server = peer(server);

    let pending_transport = Arc::clone(&transport);
    let pending = tokio::spawn(async move {
        pending_transport
            .send(request(42), CancellationToken::new())
            .await
    });
    wait_for_pending(&transport, 1).await;

    let duplicate = transport.send(request(42), CancellationToken::new()).await;
    assert_eq!(duplicate, Err(TransportError::DuplicateSequenceId(42)));

    // The original call is unaffected.
    let _request_frame = server.next().await.expect("request frame").expect("read");
    server.send(response_frame(42, 0)).await.expect("respond");
    let response = pending.await.expect("join").expect("call resolves");
    assert_eq!(response.sequence_id, 42);
    transport.disconnect().await;
}

#[tokio::test]
async fn cancellation_deregisters_without_touching_the_socket() {
    let (transport, _pushes) = transport();
    let (client, server) = duplex(4096);
    transport.attach(client).await;
    let mut server = peer(server);

    let cancel = CancellationToken::new();
    let pending_transport = Arc::clone(&transport);
    let send_cancel = cancel.clone();
    let pending = tokio::spawn(async move {
        pending_transport.send(request(3), send_cancel).await
    });
    wait_for_pending(&transport, 1).await;

    cancel.cancel();
    let result = pending.await.expect("join");
    assert_eq!(result, Err(TransportError::Cancelled));
    assert_eq!(transport.pending_calls(), 0);
    assert_eq!(transport.state().await, ConnectionState::Open);

    // A late reply for the cancelled id is a logged no-op.
    let _request_frame = server.next().await.expect("request frame").expect("read");
    server.send(response_frame(3, 0)).await.expect("late reply");
    sleep(Duration::from_millis(10)).await;
    assert_eq!(transport.state().await, ConnectionState::Open);
    transport.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn per_call_timeout_races_the_reply() {
    let (transport, _pushes) = transport();
    let (client, _server) = duplex(4096);
    transport.attach(client).await;

    let mut timed = request(9);
    timed.control.timeout_ms = 50;
    let result = transport.send(timed, CancellationToken::new()).await;
    assert_eq!(result, Err(TransportError::Timeout { timeout_ms: 50 }));
    assert_eq!(transport.pending_calls(), 0);
    transport.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn keepalive_frames_flow_on_the_diagnostic_service() {
    let (transport, _pushes) = transport();
    let (client, server) = duplex(4096);
    transport.attach(client).await;
    let mut server = peer(server);

    let frame = timeout(Duration::from_secs(20), server.next())
        .await
        .expect("keepalive due")
        .expect("frame")
        .expect("read");
    let decoded = envelope::decode(frame.freeze()).expect("decode keepalive");
    assert_eq!(decoded.content_type, ContentType::Text);
    assert_eq!(decoded.control.service, "sys");
    assert_eq!(decoded.control.method, "ping");
    transport.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn idle_timeout_closes_the_connection_and_fails_pending_calls() {
    let (transport, _pushes) = transport();
    let (client, _server) = duplex(4096);
    transport.attach(client).await;

    let pending_transport = Arc::clone(&transport);
    let pending = tokio::spawn(async move {
        pending_transport
            .send(request(13), CancellationToken::new())
            .await
    });
    wait_for_pending(&transport, 1).await;

    // No inbound traffic: the watchdog fires at the idle timeout even
    // though keep-alive pings keep being written.
    let result = timeout(Duration::from_secs(120), pending)
        .await
        .expect("watchdog fired")
        .expect("join");
    match result {
        Err(TransportError::Closed { reason }) => assert_eq!(reason, "idle timeout"),
        other => panic!("expected idle-timeout close, got {other:?}"),
    }
    assert_eq!(transport.state().await, ConnectionState::Disconnected);
}

#[tokio::test]
async fn peer_close_invokes_the_closed_hook_with_pending_calls_failed() {
    let (transport, _pushes) = transport();
    let (reason_tx, mut reason_rx) = mpsc::unbounded_channel::<String>();
    transport.set_closed_hook(Arc::new(move |reason: &str| {
        let _ = reason_tx.send(reason.to_owned());
    }));

    let (client, server) = duplex(4096);
    transport.attach(client).await;

    let pending_transport = Arc::clone(&transport);
    let pending = tokio::spawn(async move {
        pending_transport
            .send(request(21), CancellationToken::new())
            .await
    });
    wait_for_pending(&transport, 1).await;

    drop(server);

    let result = pending.await.expect("join");
    assert!(matches!(result, Err(TransportError::Closed { .. })));
    let reason = timeout(Duration::from_secs(5), reason_rx.recv())
        .await
        .expect("hook fired")
        .expect("hook alive");
    assert_eq!(reason, "closed by peer");
}

#[tokio::test]
async fn voluntary_disconnect_does_not_invoke_the_closed_hook() {
    let (transport, _pushes) = transport();
    let (reason_tx, mut reason_rx) = mpsc::unbounded_channel::<String>();
    transport.set_closed_hook(Arc::new(move |reason: &str| {
        let _ = reason_tx.send(reason.to_owned());
    }));

    let (client, _server) = duplex(4096);
    transport.attach(client).await;
    transport.disconnect().await;

    sleep(Duration::from_millis(10)).await;
    assert!(
        reason_rx.try_recv().is_err(),
        "voluntary disconnect must not fire the closed hook"
    );
}

#[tokio::test]
async fn send_without_connection_is_refused() {
    let (transport, _pushes) = transport();
    let result = transport.send(request(1), CancellationToken::new()).await;
    assert_eq!(result, Err(TransportError::NotConnected));
}

// ---- transient adapter ----

fn transient_request(sequence_id: u64, transient_addr: &str) -> Request {
    let mut headers = HashMap::new();
    headers.insert("x-app".to_owned(), "demo".to_owned());
    Request::new(
        ConnectionKind::Transient,
        Endpoints::new("unused", transient_addr),
        ControlBlock::request(sequence_id, "s", "m"),
    )
    .with_headers(headers)
    .with_body(Bytes::from_static(b"ask"))
}

#[tokio::test]
async fn transient_exchange_round_trips_over_a_duplex_stream() {
    let adapter = TransientTransport::new(TransientConfig::default());
    let (client, server) = duplex(4096);
    let mut server = peer(server);

    let responder = tokio::spawn(async move {
        let preamble = server.next().await.expect("preamble frame").expect("read");
        let (headers, _consumed): (Vec<(String, String)>, usize) =
            bincode::serde::decode_from_slice(&preamble, bincode::config::standard())
                .expect("decode preamble");
        assert_eq!(headers, vec![("x-app".to_owned(), "demo".to_owned())]);

        let frame = server.next().await.expect("request frame").expect("read");
        let decoded = envelope::decode(frame.freeze()).expect("decode request");
        assert_eq!(decoded.body.as_ref(), b"ask");
        // Reply under a different sequence id; the adapter echoes the
        // request's id regardless.
        server.send(response_frame(777, 0)).await.expect("respond");
    });

    let response = adapter
        .exchange_on(client, &transient_request(15, "unused"))
        .await;
    assert_eq!(response.net_code, NET_OK);
    assert_eq!(response.app_code, 0);
    assert_eq!(response.sequence_id, 15);
    responder.await.expect("responder");
}

#[tokio::test]
async fn transient_connect_failure_maps_to_a_net_code() {
    let adapter = TransientTransport::new(TransientConfig::default());
    // Bind then drop a listener so the port is closed.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr").to_string();
    drop(listener);

    let response = adapter
        .send(transient_request(8, &addr), CancellationToken::new())
        .await
        .expect("always a response");
    assert_eq!(response.net_code, NET_CONNECT_FAILED);
    assert_eq!(response.sequence_id, 8);
}

#[tokio::test]
async fn transient_send_timeout_yields_a_timeout_response() {
    let adapter = TransientTransport::new(TransientConfig {
        send_timeout: Duration::from_millis(50),
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr").to_string();
    // Accept, then hold the socket open without ever replying.
    let silent = tokio::spawn(async move {
        let _sock = listener.accept().await;
        std::future::pending::<()>().await
    });

    let response = adapter
        .send(transient_request(4, &addr), CancellationToken::new())
        .await
        .expect("always a response");
    assert_eq!(response.net_code, NET_TIMEOUT);
    assert_eq!(response.sequence_id, 4);
    silent.abort();
}

#[tokio::test]
async fn transient_cancellation_aborts_the_exchange() {
    let adapter = TransientTransport::new(TransientConfig::default());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr").to_string();
    let silent = tokio::spawn(async move {
        let _sock = listener.accept().await;
        std::future::pending::<()>().await
    });

    let cancel = CancellationToken::new();
    let aborter = cancel.clone();
    tokio::spawn(async move {
        sleep(Duration::from_millis(20)).await;
        aborter.cancel();
    });

    let result = adapter
        .send(transient_request(6, &addr), cancel)
        .await;
    assert_eq!(result, Err(TransportError::Cancelled));
    silent.abort();
}
