//! `WsTransport` against a real in-process WebSocket server.

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

use voxa_core::transport::ws::WsTransport;
use voxa_core::transport::{EventSink, Transport, TransportEvent};

/// Echo server on an ephemeral port. Returns the port and a channel
/// yielding the client's `Device-Id` header.
fn spawn_echo_server() -> (u16, mpsc::Receiver<Option<String>>, tokio::runtime::Runtime) {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .expect("server runtime");

    let listener = runtime
        .block_on(tokio::net::TcpListener::bind("127.0.0.1:0"))
        .expect("bind");
    let port = listener.local_addr().expect("local addr").port();

    let (header_tx, header_rx) = mpsc::channel();
    runtime.spawn(async move {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };

        let header_cb = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            let device_id = req
                .headers()
                .get("Device-Id")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let _ = header_tx.send(device_id);
            Ok(resp)
        };

        let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(stream, header_cb).await else {
            return;
        };

        while let Some(Ok(message)) = ws.next().await {
            match message {
                Message::Text(_) | Message::Binary(_) => {
                    if ws.send(message).await.is_err() {
                        break;
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    (port, header_rx, runtime)
}

fn channel_sink() -> (EventSink, mpsc::Receiver<TransportEvent>) {
    let (tx, rx) = mpsc::channel();
    let sink: EventSink = Arc::new(move |event| {
        let _ = tx.send(event);
    });
    (sink, rx)
}

fn expect_event(rx: &mpsc::Receiver<TransportEvent>) -> TransportEvent {
    rx.recv_timeout(Duration::from_secs(5)).expect("a transport event")
}

#[test]
fn frames_round_trip_and_headers_are_sent() {
    let (port, header_rx, _runtime) = spawn_echo_server();
    let (sink, events) = channel_sink();

    let transport = WsTransport::new(
        format!("ws://127.0.0.1:{port}/v1/"),
        vec![
            ("Protocol-Version".into(), "1".into()),
            ("Device-Id".into(), "aa:bb:cc:dd:ee:ff".into()),
            ("Client-Id".into(), "test-client".into()),
        ],
        sink,
    )
    .expect("transport");

    transport.connect().expect("connect spawn");
    assert_eq!(expect_event(&events), TransportEvent::Opened);
    assert!(transport.is_connected());

    let device_id = header_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("handshake headers");
    assert_eq!(device_id.as_deref(), Some("aa:bb:cc:dd:ee:ff"));

    transport
        .send_text(r#"{"type":"listen","state":"start"}"#)
        .expect("text send");
    match expect_event(&events) {
        TransportEvent::Text(text) => {
            assert_eq!(text, r#"{"type":"listen","state":"start"}"#);
        }
        other => panic!("expected echoed text, got {other:?}"),
    }

    transport.send_binary(&[0x01, 0x02, 0x03]).expect("binary send");
    match expect_event(&events) {
        TransportEvent::Binary(data) => assert_eq!(data, vec![0x01, 0x02, 0x03]),
        other => panic!("expected echoed binary, got {other:?}"),
    }

    transport.disconnect();
    assert!(!transport.is_connected());
    // The reader notices the closed stream and reports it exactly once.
    assert_eq!(expect_event(&events), TransportEvent::Closed);
}

#[test]
fn sends_after_disconnect_fail_cleanly() {
    let (port, _header_rx, _runtime) = spawn_echo_server();
    let (sink, events) = channel_sink();

    let transport = WsTransport::new(
        format!("ws://127.0.0.1:{port}/v1/"),
        Vec::new(),
        sink,
    )
    .expect("transport");

    transport.connect().expect("connect spawn");
    assert_eq!(expect_event(&events), TransportEvent::Opened);

    transport.disconnect();
    assert!(transport.send_text("{}").is_err());
    assert!(transport.send_binary(&[0u8; 2]).is_err());
}
