//! Wire client: the WebSocket connection to the core.
//!
//! One background task owns the socket. It demultiplexes inbound frames
//! to per-request completion channels (correlated by id), routes
//! unsolicited frames to a broadcast channel, and sweeps per-request
//! deadlines. A frame timeout fails only that request; a socket close
//! fails everything outstanding. The task never reconnects on its own;
//! that is the supervisor's job.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};

use crate::config::ConnectionConfig;
use crate::core::error::{QsysError, Result};
use crate::qrwc::frame::{FrameError, InboundFrame, RawFrame, RequestFrame};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Lifecycle and push events emitted by the wire client.
#[derive(Debug, Clone)]
pub enum WireEvent {
    /// Socket established (and logon accepted, when configured).
    Connected,

    /// Socket closed.
    Disconnected {
        /// Close code when the peer sent a close frame.
        code: Option<u16>,
        /// Close reason or error description.
        reason: String,
    },

    /// Transport-level error that did not close the socket.
    Error(String),

    /// Unsolicited server push.
    Unsolicited {
        /// Push method name.
        method: String,
        /// Push payload.
        params: serde_json::Value,
    },
}

/// Capacity of the wire event channel.
const WIRE_EVENT_CAPACITY: usize = 256;

/// Tracks one in-flight request.
struct PendingRequest {
    response_tx: oneshot::Sender<Result<serde_json::Value>>,
    method: String,
    deadline: Instant,
}

enum WireCommand {
    SendFrame {
        frame: RequestFrame,
        deadline: Instant,
        response_tx: oneshot::Sender<Result<serde_json::Value>>,
    },
    Close,
}

/// Handle to a live wire connection.
///
/// Cheap to clone. Dropping all handles closes the command channel,
/// which shuts the socket task down.
#[derive(Clone)]
pub struct WireClient {
    command_tx: mpsc::Sender<WireCommand>,
    events: broadcast::Sender<WireEvent>,
    connected: Arc<AtomicBool>,
    next_id: Arc<AtomicU64>,
    frame_timeout: Duration,
}

impl WireClient {
    /// Open a socket to the core and spawn the frame-demultiplexing
    /// task. When credentials are configured, a `Logon` frame is sent
    /// and awaited before the client is handed back.
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let url = config.endpoint()?;
        let ws_stream = open_socket(&url, config).await?;

        let connected = Arc::new(AtomicBool::new(true));
        let (events, _) = broadcast::channel(WIRE_EVENT_CAPACITY);
        let (command_tx, command_rx) = mpsc::channel(64);

        let task = WireTask {
            ws_stream,
            command_rx,
            pending: HashMap::new(),
            events: events.clone(),
            connected: Arc::clone(&connected),
        };
        tokio::spawn(task.run());

        let client = Self {
            command_tx,
            events,
            connected,
            next_id: Arc::new(AtomicU64::new(1)),
            frame_timeout: config.frame_timeout(),
        };

        if let (Some(user), Some(password)) = (&config.username, &config.password) {
            client
                .send_frame(
                    "Logon",
                    serde_json::json!({ "User": user, "Password": password }),
                )
                .await
                .map_err(|e| {
                    QsysError::connection(format!("Logon rejected: {}", e.message))
                })?;
        }

        let _ = client.events.send(WireEvent::Connected);
        Ok(client)
    }

    /// Send one request frame and await its response.
    ///
    /// Resolves with the `result` payload, or fails with
    /// `QSYS_COMMAND_FAILED` when the core answers with an error
    /// envelope, `NETWORK_TIMEOUT` when the per-frame deadline elapses,
    /// or `NETWORK_DROPPED` when the socket closes underneath it.
    pub async fn send_frame(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value> {
        self.send_frame_with_timeout(method, params, self.frame_timeout)
            .await
    }

    /// [`send_frame`](Self::send_frame) with an explicit deadline.
    pub async fn send_frame_with_timeout(
        &self,
        method: &str,
        params: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value> {
        if !self.is_connected() {
            return Err(QsysError::connection("Not connected to Q-SYS core"));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = RequestFrame::new(id, method, params);
        let (response_tx, response_rx) = oneshot::channel();

        self.command_tx
            .send(WireCommand::SendFrame {
                frame,
                deadline: Instant::now() + timeout,
                response_tx,
            })
            .await
            .map_err(|_| QsysError::dropped("Wire task is not running"))?;

        response_rx
            .await
            .map_err(|_| QsysError::dropped("Wire task dropped the request"))?
    }

    /// Subscribe to wire events (lifecycle + unsolicited pushes).
    pub fn subscribe(&self) -> broadcast::Receiver<WireEvent> {
        self.events.subscribe()
    }

    /// Whether the socket is currently open.
    #[inline]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Close the socket gracefully. Outstanding requests fail with
    /// `NETWORK_DROPPED`.
    pub async fn close(&self) {
        let _ = self.command_tx.send(WireCommand::Close).await;
    }
}

impl std::fmt::Debug for WireClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireClient")
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Establish the socket, honoring the TLS settings.
async fn open_socket(url: &url::Url, config: &ConnectionConfig) -> Result<WsStream> {
    let connector = if config.secure && !config.reject_unauthorized {
        // Cores commonly ship self-signed certificates.
        Some(Connector::Rustls(Arc::new(insecure_tls_config())))
    } else {
        None
    };

    let connect = tokio_tungstenite::connect_async_tls_with_config(
        url.as_str(),
        None,
        false,
        connector,
    );

    match tokio::time::timeout(Duration::from_millis(config.connection_timeout_ms), connect).await
    {
        Ok(Ok((stream, _response))) => Ok(stream),
        Ok(Err(e)) => Err(QsysError::connection(format!(
            "WebSocket connect to {url} failed: {e}"
        ))),
        Err(_) => Err(QsysError::timeout(format!(
            "WebSocket connect to {url} timed out after {}ms",
            config.connection_timeout_ms
        ))),
    }
}

/// TLS config that skips certificate verification.
fn insecure_tls_config() -> rustls::ClientConfig {
    #[derive(Debug)]
    struct NoVerification(Arc<rustls::crypto::CryptoProvider>);

    impl rustls::client::danger::ServerCertVerifier for NoVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &rustls::pki_types::CertificateDer<'_>,
            _intermediates: &[rustls::pki_types::CertificateDer<'_>],
            _server_name: &rustls::pki_types::ServerName<'_>,
            _ocsp_response: &[u8],
            _now: rustls::pki_types::UnixTime,
        ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error>
        {
            Ok(rustls::client::danger::ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &rustls::pki_types::CertificateDer<'_>,
            _dss: &rustls::DigitallySignedStruct,
        ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error>
        {
            Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &rustls::pki_types::CertificateDer<'_>,
            _dss: &rustls::DigitallySignedStruct,
        ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error>
        {
            Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .expect("default protocol versions")
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerification(provider)))
        .with_no_client_auth()
}

/// The background task that owns the socket.
struct WireTask {
    ws_stream: WsStream,
    command_rx: mpsc::Receiver<WireCommand>,
    pending: HashMap<u64, PendingRequest>,
    events: broadcast::Sender<WireEvent>,
    connected: Arc<AtomicBool>,
}

impl WireTask {
    async fn run(mut self) {
        loop {
            let next_deadline = self.pending.values().map(|p| p.deadline).min();
            let deadline_sleep = async {
                match next_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                ws_msg = self.ws_stream.next() => {
                    match ws_msg {
                        Some(Ok(Message::Text(text))) => self.handle_text(&text),
                        Some(Ok(Message::Close(frame))) => {
                            let (code, reason) = match frame {
                                Some(cf) => (Some(u16::from(cf.code)), cf.reason.to_string()),
                                None => (None, String::from("closed")),
                            };
                            self.shutdown(code, reason).await;
                            return;
                        }
                        Some(Err(e)) => {
                            self.shutdown(None, format!("socket error: {e}")).await;
                            return;
                        }
                        None => {
                            self.shutdown(None, String::from("stream ended")).await;
                            return;
                        }
                        Some(Ok(_)) => {
                            // Binary, Ping, Pong, Frame: nothing to do,
                            // tungstenite answers pings itself.
                        }
                    }
                }

                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(WireCommand::SendFrame { frame, deadline, response_tx }) => {
                            self.handle_send(frame, deadline, response_tx).await;
                        }
                        Some(WireCommand::Close) | None => {
                            let _ = self.ws_stream.close(None).await;
                            self.shutdown(None, String::from("closed by client")).await;
                            return;
                        }
                    }
                }

                () = deadline_sleep => {
                    self.sweep_deadlines();
                }
            }
        }
    }

    fn handle_text(&mut self, text: &str) {
        tracing::trace!(frame = text, "frame in");
        let raw: RawFrame = match serde_json::from_str(text) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::debug!(error = %e, "Unparseable frame from core");
                let _ = self
                    .events
                    .send(WireEvent::Error(format!("parse failure: {e}")));
                return;
            }
        };

        match raw.classify() {
            Some(InboundFrame::Response { id, result }) => {
                if let Some(pending) = self.pending.remove(&id) {
                    let outcome = result.map_err(|FrameError { code, message }| {
                        QsysError::command(message).with_context(serde_json::json!({
                            "method": pending.method,
                            "qrwcCode": code,
                        }))
                    });
                    let _ = pending.response_tx.send(outcome);
                } else {
                    tracing::debug!(id, "Response with no pending request");
                }
            }
            Some(InboundFrame::Unsolicited { method, params }) => {
                let _ = self.events.send(WireEvent::Unsolicited { method, params });
            }
            None => {
                tracing::debug!("Unclassifiable frame from core");
            }
        }
    }

    async fn handle_send(
        &mut self,
        frame: RequestFrame,
        deadline: Instant,
        response_tx: oneshot::Sender<Result<serde_json::Value>>,
    ) {
        let id = frame.id;
        let method = frame.method.clone();

        let json = match serde_json::to_string(&frame) {
            Ok(json) => json,
            Err(e) => {
                let _ = response_tx.send(Err(QsysError::internal(format!(
                    "frame serialization failed: {e}"
                ))));
                return;
            }
        };

        tracing::trace!(frame = %json, "frame out");
        if let Err(e) = self.ws_stream.send(Message::Text(json.into())).await {
            let _ = response_tx.send(Err(QsysError::dropped(format!(
                "WebSocket write failed: {e}"
            ))));
            return;
        }

        self.pending.insert(
            id,
            PendingRequest {
                response_tx,
                method,
                deadline,
            },
        );
    }

    /// Fail requests whose deadline has passed. The socket stays open.
    fn sweep_deadlines(&mut self) {
        let now = Instant::now();
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(&id, _)| id)
            .collect();

        for id in expired {
            if let Some(pending) = self.pending.remove(&id) {
                let _ = pending.response_tx.send(Err(QsysError::timeout(format!(
                    "No response to {} within deadline",
                    pending.method
                ))));
            }
        }
    }

    async fn shutdown(&mut self, code: Option<u16>, reason: String) {
        self.connected.store(false, Ordering::Relaxed);
        for (_, pending) in std::mem::take(&mut self.pending) {
            let _ = pending.response_tx.send(Err(QsysError::dropped(format!(
                "Connection lost while awaiting {}",
                pending.method
            ))));
        }
        let _ = self.events.send(WireEvent::Disconnected { code, reason });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ErrorCode;
    use futures_util::StreamExt;
    use tokio::net::TcpListener;

    /// Minimal in-process QRWC peer for wire tests.
    async fn spawn_stub_core<F>(handler: F) -> ConnectionConfig
    where
        F: Fn(RawFrame) -> Option<String> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Text(text) = msg {
                    let raw: RawFrame = serde_json::from_str(&text).unwrap();
                    if let Some(reply) = handler(raw) {
                        ws.send(Message::Text(reply.into())).await.unwrap();
                    }
                }
            }
        });

        ConnectionConfig {
            secure: false,
            port,
            connection_timeout_ms: 2000,
            ..ConnectionConfig::for_host("127.0.0.1")
        }
    }

    #[tokio::test]
    async fn test_request_response_round_trip() {
        let config = spawn_stub_core(|raw| {
            raw.id.map(|id| {
                format!(r#"{{"jsonrpc":"2.0","id":{id},"result":{{"Platform":"Core 110f"}}}}"#)
            })
        })
        .await;

        let client = WireClient::connect(&config).await.unwrap();
        let result = client
            .send_frame("Status.Get", serde_json::Value::Null)
            .await
            .unwrap();
        assert_eq!(result["Platform"], "Core 110f");
    }

    #[tokio::test]
    async fn test_error_envelope_surfaces_as_command_failed() {
        let config = spawn_stub_core(|raw| {
            raw.id.map(|id| {
                format!(
                    r#"{{"jsonrpc":"2.0","id":{id},"error":{{"code":2,"message":"Invalid Page Request ID"}}}}"#
                )
            })
        })
        .await;

        let client = WireClient::connect(&config).await.unwrap();
        let err = client
            .send_frame("Status.Get", serde_json::Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::QsysCommandFailed);
        assert!(err.message.contains("Invalid Page Request ID"));
    }

    #[tokio::test]
    async fn test_frame_timeout_does_not_close_socket() {
        let config = spawn_stub_core(|raw| {
            // Answer only the second request; the first starves.
            raw.id.filter(|&id| id > 1).map(|id| {
                format!(r#"{{"jsonrpc":"2.0","id":{id},"result":true}}"#)
            })
        })
        .await;

        let client = WireClient::connect(&config).await.unwrap();

        let err = client
            .send_frame_with_timeout(
                "Status.Get",
                serde_json::Value::Null,
                Duration::from_millis(100),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::NetworkTimeout);

        // The socket must still be usable.
        assert!(client.is_connected());
        let result = client
            .send_frame("Status.Get", serde_json::Value::Null)
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!(true));
    }

    #[tokio::test]
    async fn test_unsolicited_frames_reach_subscribers() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::Text(
                r#"{"jsonrpc":"2.0","method":"EngineStatus","params":{"State":"Active"}}"#.into(),
            ))
            .await
            .unwrap();
            // Hold the socket open.
            while ws.next().await.is_some() {}
        });
        let config = ConnectionConfig {
            secure: false,
            port,
            ..ConnectionConfig::for_host("127.0.0.1")
        };

        let client = WireClient::connect(&config).await.unwrap();
        let mut events = client.subscribe();

        loop {
            match events.recv().await.unwrap() {
                WireEvent::Unsolicited { method, params } => {
                    assert_eq!(method, "EngineStatus");
                    assert_eq!(params["State"], "Active");
                    break;
                }
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_disconnect_fails_outstanding_requests() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            // Read one frame, then slam the connection shut.
            let _ = ws.next().await;
        });

        let config = ConnectionConfig {
            secure: false,
            port,
            connection_timeout_ms: 5000,
            ..ConnectionConfig::for_host("127.0.0.1")
        };
        let client = WireClient::connect(&config).await.unwrap();
        let err = client
            .send_frame("Status.Get", serde_json::Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::NetworkDropped);
        assert!(!client.is_connected());
    }
}
