//! WebSocket transport over TLS.
//!
//! Runs a private single-worker tokio runtime: `connect` spawns the
//! handshake and reader onto it, sends are `block_on` calls with a 5 s
//! deadline. TLS trust comes from the webpki root bundle compiled into
//! rustls, so no system store is consulted.
//!
//! Binary sends are timed; anything over 100 ms is logged as network
//! distress (the capture clock is upstream of these sends).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::{SplitSink, StreamExt};
use futures_util::SinkExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{info, warn};

use super::{EventSink, Transport, TransportEvent};
use crate::error::{Result, VoxaError};

/// Deadline for the TCP+TLS+WebSocket handshake.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for one outbound send.
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Binary sends slower than this indicate a struggling network.
const SLOW_SEND: Duration = Duration::from_millis(100);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Production transport: one TLS WebSocket, text + binary opcodes.
pub struct WsTransport {
    url: String,
    headers: Vec<(String, String)>,
    sink: EventSink,
    runtime: tokio::runtime::Runtime,
    writer: Arc<tokio::sync::Mutex<Option<WsSink>>>,
    connected: Arc<AtomicBool>,
}

impl WsTransport {
    /// `headers` is the complete, already-merged header set (engine-managed
    /// identity headers included).
    pub fn new(url: String, headers: Vec<(String, String)>, sink: EventSink) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .thread_name("ws-io")
            .build()
            .map_err(|e| VoxaError::Transport(format!("runtime: {e}")))?;

        Ok(Self {
            url,
            headers,
            sink,
            runtime,
            writer: Arc::new(tokio::sync::Mutex::new(None)),
            connected: Arc::new(AtomicBool::new(false)),
        })
    }

    fn build_request(&self) -> Result<http::Request<()>> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| VoxaError::Transport(format!("bad url: {e}")))?;

        let headers = request.headers_mut();
        for (name, value) in &self.headers {
            let name = http::header::HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| VoxaError::Transport(format!("bad header name '{name}': {e}")))?;
            let value = http::header::HeaderValue::from_str(value)
                .map_err(|e| VoxaError::Transport(format!("bad header value: {e}")))?;
            headers.insert(name, value);
        }
        Ok(request)
    }
}

impl Transport for WsTransport {
    fn connect(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }

        let request = self.build_request()?;
        let url = self.url.clone();
        let sink = Arc::clone(&self.sink);
        let writer = Arc::clone(&self.writer);
        let connected = Arc::clone(&self.connected);

        self.runtime.spawn(async move {
            let attempt = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(request)).await;
            let stream = match attempt {
                Ok(Ok((stream, _response))) => stream,
                Ok(Err(e)) => {
                    warn!(%url, "websocket connect failed: {e}");
                    (sink)(TransportEvent::Closed);
                    return;
                }
                Err(_) => {
                    warn!(%url, "websocket connect timed out");
                    (sink)(TransportEvent::Closed);
                    return;
                }
            };

            info!(%url, "websocket connected");
            let (write_half, mut read_half) = stream.split();
            *writer.lock().await = Some(write_half);
            connected.store(true, Ordering::SeqCst);
            (sink)(TransportEvent::Opened);

            while let Some(frame) = read_half.next().await {
                match frame {
                    Ok(Message::Text(text)) => (sink)(TransportEvent::Text(text.into())),
                    Ok(Message::Binary(data)) => {
                        (sink)(TransportEvent::Binary(data.into()));
                    }
                    Ok(Message::Close(_)) => break,
                    // Pings are answered by the protocol layer on flush.
                    Ok(_) => {}
                    Err(e) => {
                        warn!("websocket read error: {e}");
                        break;
                    }
                }
            }

            connected.store(false, Ordering::SeqCst);
            writer.lock().await.take();
            (sink)(TransportEvent::Closed);
        });

        Ok(())
    }

    fn disconnect(&self) {
        let writer = Arc::clone(&self.writer);
        self.connected.store(false, Ordering::SeqCst);
        self.runtime.block_on(async move {
            if let Some(mut write_half) = writer.lock().await.take() {
                tokio::time::timeout(SEND_TIMEOUT, write_half.close()).await.ok();
            }
        });
        info!("websocket disconnected");
    }

    fn send_text(&self, text: &str) -> Result<()> {
        let message = Message::Text(text.to_string().into());
        self.blocking_send(message)
    }

    fn send_binary(&self, data: &[u8]) -> Result<()> {
        let started = Instant::now();
        let message = Message::Binary(data.to_vec().into());
        let result = self.blocking_send(message);

        let elapsed = started.elapsed();
        if elapsed > SLOW_SEND {
            warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                bytes = data.len(),
                "slow binary send, poor network condition"
            );
        }
        result
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl WsTransport {
    fn blocking_send(&self, message: Message) -> Result<()> {
        let writer = Arc::clone(&self.writer);
        self.runtime.block_on(async move {
            let send = async {
                let mut guard = writer.lock().await;
                let write_half = guard
                    .as_mut()
                    .ok_or(VoxaError::Transport("not connected".into()))?;
                write_half
                    .send(message)
                    .await
                    .map_err(|e| VoxaError::Transport(format!("send: {e}")))
            };
            match tokio::time::timeout(SEND_TIMEOUT, send).await {
                Ok(result) => result,
                Err(_) => Err(VoxaError::SendTimeout(SEND_TIMEOUT.as_millis() as u64)),
            }
        })
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        if self.connected.load(Ordering::SeqCst) {
            self.disconnect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink() -> EventSink {
        Arc::new(|_event| {})
    }

    #[test]
    fn rejects_malformed_urls() {
        let transport =
            WsTransport::new("not a url".into(), Vec::new(), sink()).expect("construction");
        assert!(transport.connect().is_err());
    }

    #[test]
    fn sends_fail_when_not_connected() {
        let transport =
            WsTransport::new("wss://example.invalid/v1/".into(), Vec::new(), sink()).unwrap();
        assert!(!transport.is_connected());
        assert!(transport.send_text("{}").is_err());
        assert!(transport.send_binary(&[0u8; 4]).is_err());
    }

    #[test]
    fn rejects_invalid_header_names() {
        let transport = WsTransport::new(
            "wss://example.invalid/v1/".into(),
            vec![("bad header\n".into(), "x".into())],
            sink(),
        )
        .unwrap();
        assert!(transport.connect().is_err());
    }

    #[test]
    fn connect_failure_reports_closed() {
        let (tx, rx) = std::sync::mpsc::channel();
        let sink: EventSink = Arc::new(move |event| {
            let _ = tx.send(event);
        });
        // Unresolvable host: the async connect attempt must end in Closed.
        let transport =
            WsTransport::new("ws://127.0.0.1:1/".into(), Vec::new(), sink).unwrap();
        transport.connect().unwrap();

        let event = rx
            .recv_timeout(Duration::from_secs(15))
            .expect("a transport event");
        assert_eq!(event, TransportEvent::Closed);
    }
}
