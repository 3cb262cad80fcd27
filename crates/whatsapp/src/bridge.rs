//! WebSocket transport to an external protocol bridge.
//!
//! The bridge owns the wire protocol and the socket to the service. We talk
//! to it with JSON text frames:
//!
//! ```text
//! → {"id": 1, "method": "open", "params": {...}}
//! ← {"id": 1, "result": ...}            or {"id": 1, "error": "..."}
//! ← {"event": "connection.update", "data": {"connection": "close", "statusCode": 401}}
//! ← {"event": "creds.update", "data": {...}}
//! ← {"event": "messages.upsert", "data": {"messages": [...]}}
//! ```
//!
//! Each session gets its own socket; events arrive on it in service order.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    anyhow::{Context, Result, anyhow, bail},
    async_trait::async_trait,
    futures::{SinkExt, StreamExt},
    serde::{Deserialize, Serialize},
    serde_json::{Value, json},
    tokio::{
        sync::{Mutex, mpsc, oneshot},
        task::JoinHandle,
    },
    tokio_tungstenite::{connect_async, tungstenite::Message},
    tracing::{debug, trace, warn},
};

use crate::{
    transport::{OpenRequest, SessionLink, Transport},
    types::{
        ConnectionState, CredentialUpdate, DisconnectReason, InboundEvent, MessageKey,
        ProtocolVersion, TransportEvent,
    },
};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, String>>>>>;

// ── Frames ───────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct RequestFrame<'a> {
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum IncomingFrame {
    Response {
        id: u64,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<String>,
    },
    Event {
        event: String,
        #[serde(default)]
        data: Value,
    },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectionUpdate {
    #[serde(default)]
    connection: Option<String>,
    #[serde(default)]
    status_code: Option<u16>,
}

#[derive(Deserialize)]
struct MessagesUpsert {
    #[serde(default)]
    messages: Vec<InboundEvent>,
}

/// Translate a bridge event into a [`TransportEvent`]. Unknown events and
/// updates without a connection phase yield `None`.
fn parse_event(name: &str, data: Value) -> Option<TransportEvent> {
    match name {
        "connection.update" => {
            let update: ConnectionUpdate = serde_json::from_value(data)
                .map_err(|e| warn!(error = %e, "malformed connection.update"))
                .ok()?;
            let state = match update.connection.as_deref()? {
                "connecting" => ConnectionState::Connecting,
                "open" => ConnectionState::Open,
                "close" => ConnectionState::Closed(
                    update
                        .status_code
                        .map_or(DisconnectReason::ConnectionLost, DisconnectReason::from_status_code),
                ),
                other => {
                    debug!(connection = other, "unknown connection phase");
                    return None;
                },
            };
            Some(TransportEvent::Connection(state))
        },
        "creds.update" => serde_json::from_value::<CredentialUpdate>(data)
            .map(TransportEvent::Credentials)
            .map_err(|e| warn!(error = %e, "malformed creds.update"))
            .ok(),
        "messages.upsert" => serde_json::from_value::<MessagesUpsert>(data)
            .map(|upsert| TransportEvent::Messages(upsert.messages))
            .map_err(|e| warn!(error = %e, "malformed messages.upsert"))
            .ok(),
        other => {
            trace!(event = other, "ignoring bridge event");
            None
        },
    }
}

// ── Connection ───────────────────────────────────────────────────────────────

/// One socket to the bridge with request/response correlation.
///
/// Events are queued by the reader and handed to the session channel by a
/// separate forwarder, so a full session channel never stalls responses.
struct BridgeConnection {
    outbound: mpsc::UnboundedSender<Message>,
    pending: Pending,
    next_id: AtomicU64,
    closing: Arc<AtomicBool>,
    request_timeout: Duration,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    forwarder: Option<JoinHandle<()>>,
}

impl BridgeConnection {
    async fn connect(
        url: &str,
        events: Option<mpsc::Sender<TransportEvent>>,
        request_timeout: Duration,
    ) -> Result<Self> {
        let (socket, _) = connect_async(url)
            .await
            .with_context(|| format!("failed to connect to bridge at {url}"))?;
        let (mut sink, mut stream) = socket.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let close = matches!(message, Message::Close(_));
                if let Err(e) = sink.send(message).await {
                    debug!(error = %e, "bridge write failed");
                    break;
                }
                if close {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let (queue, forwarder) = match events {
            Some(events) => {
                let (queue, mut queue_rx) = mpsc::unbounded_channel::<TransportEvent>();
                let forwarder = tokio::spawn(async move {
                    while let Some(event) = queue_rx.recv().await {
                        if events.send(event).await.is_err() {
                            debug!("session event receiver dropped");
                            break;
                        }
                    }
                });
                (Some(queue), Some(forwarder))
            },
            None => (None, None),
        };

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let closing = Arc::new(AtomicBool::new(false));

        let reader_pending = Arc::clone(&pending);
        let reader_closing = Arc::clone(&closing);
        let reader = tokio::spawn(async move {
            let mut close_reported = false;
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        close_reported |=
                            route_frame(text.as_str(), &reader_pending, queue.as_ref()).await;
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {},
                    Err(e) => {
                        debug!(error = %e, "bridge read failed");
                        break;
                    },
                }
            }

            // Outstanding requests see their sender dropped.
            reader_pending.lock().await.clear();
            if let Some(queue) = queue
                && !close_reported
                && !reader_closing.load(Ordering::SeqCst)
            {
                let lost = ConnectionState::Closed(DisconnectReason::ConnectionLost);
                let _ = queue.send(TransportEvent::Connection(lost));
            }
        });

        Ok(Self {
            outbound,
            pending,
            next_id: AtomicU64::new(1),
            closing,
            request_timeout,
            reader,
            writer,
            forwarder,
        })
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let frame = serde_json::to_string(&RequestFrame { id, method, params })?;
        trace!(id, method, "bridge request");
        if self.outbound.send(Message::Text(frame.into())).is_err() {
            self.pending.lock().await.remove(&id);
            bail!("bridge connection closed");
        }

        let reply = match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => bail!("bridge connection closed during {method}"),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                bail!("bridge request {method} timed out");
            },
        };
        reply.map_err(|e| anyhow!("bridge {method} failed: {e}"))
    }

    fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        let _ = self.outbound.send(Message::Close(None));
    }
}

impl Drop for BridgeConnection {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
        if let Some(forwarder) = &self.forwarder {
            forwarder.abort();
        }
    }
}

/// Handle one text frame. Returns true if it queued a close event.
async fn route_frame(
    text: &str,
    pending: &Pending,
    events: Option<&mpsc::UnboundedSender<TransportEvent>>,
) -> bool {
    let frame: IncomingFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, "unparseable bridge frame");
            return false;
        },
    };

    match frame {
        IncomingFrame::Response { id, result, error } => {
            let Some(tx) = pending.lock().await.remove(&id) else {
                debug!(id, "response for unknown request");
                return false;
            };
            let reply = match error {
                Some(error) => Err(error),
                None => Ok(result.unwrap_or(Value::Null)),
            };
            let _ = tx.send(reply);
            false
        },
        IncomingFrame::Event { event, data } => {
            let (Some(events), Some(parsed)) = (events, parse_event(&event, data)) else {
                return false;
            };
            let closes = matches!(
                parsed,
                TransportEvent::Connection(ConnectionState::Closed(_))
            );
            events.send(parsed).is_ok() && closes
        },
    }
}

// ── Transport ────────────────────────────────────────────────────────────────

/// [`Transport`] backed by a protocol bridge reachable over WebSocket.
pub struct BridgeTransport {
    url: String,
    request_timeout: Duration,
}

impl BridgeTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Transport for BridgeTransport {
    async fn negotiate_version(&self) -> Result<ProtocolVersion> {
        let conn = BridgeConnection::connect(&self.url, None, self.request_timeout).await?;
        let value = conn.request("fetchLatestVersion", json!({})).await;
        conn.close();
        let version = serde_json::from_value(value?).context("invalid version from bridge")?;
        Ok(version)
    }

    async fn open_session(
        &self,
        request: OpenRequest,
    ) -> Result<(Arc<dyn SessionLink>, mpsc::Receiver<TransportEvent>)> {
        let (events_tx, events_rx) = mpsc::channel(request.event_buffer.max(1));
        let conn =
            BridgeConnection::connect(&self.url, Some(events_tx), self.request_timeout).await?;
        conn.request(
            "open",
            json!({
                "phoneNumber": request.identity.as_str(),
                "credentials": request.credentials,
                "version": request.version,
                "browser": request.browser,
            }),
        )
        .await?;
        debug!(identity = %request.identity, "bridge session opened");
        Ok((Arc::new(BridgeLink { conn }), events_rx))
    }
}

struct BridgeLink {
    conn: BridgeConnection,
}

#[async_trait]
impl SessionLink for BridgeLink {
    async fn request_pairing_code(&self, phone_number: &str) -> Result<String> {
        let value = self
            .conn
            .request("requestPairingCode", json!({ "phoneNumber": phone_number }))
            .await?;
        value
            .as_str()
            .map(str::to_owned)
            .context("bridge returned a non-string pairing code")
    }

    async fn send_reaction(&self, to: &str, symbol: &str, key: &MessageKey) -> Result<()> {
        self.conn
            .request(
                "sendMessage",
                json!({ "jid": to, "content": { "react": { "text": symbol, "key": key } } }),
            )
            .await?;
        Ok(())
    }

    async fn send_message(&self, to: &str, text: &str) -> Result<()> {
        self.conn
            .request(
                "sendMessage",
                json!({ "jid": to, "content": { "text": text } }),
            )
            .await?;
        Ok(())
    }

    async fn close(&self) {
        self.conn.close();
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, crate::identity::Identity, tokio::net::TcpListener};

    #[test]
    fn parses_close_with_status_code() {
        let event = parse_event(
            "connection.update",
            json!({ "connection": "close", "statusCode": 401 }),
        );
        assert!(matches!(
            event,
            Some(TransportEvent::Connection(ConnectionState::Closed(
                DisconnectReason::LoggedOut
            )))
        ));
    }

    #[test]
    fn close_without_code_is_connection_lost() {
        let event = parse_event("connection.update", json!({ "connection": "close" }));
        assert!(matches!(
            event,
            Some(TransportEvent::Connection(ConnectionState::Closed(
                DisconnectReason::ConnectionLost
            )))
        ));
    }

    #[test]
    fn updates_without_phase_are_skipped() {
        assert!(parse_event("connection.update", json!({ "isNewLogin": true })).is_none());
        assert!(parse_event("presence.update", json!({})).is_none());
    }

    #[test]
    fn parses_upsert() {
        let event = parse_event(
            "messages.upsert",
            json!({
                "type": "notify",
                "messages": [{
                    "key": { "remoteJid": "status@broadcast", "id": "ABC", "fromMe": false },
                    "message": { "type": "text", "text": "hi" }
                }]
            }),
        );
        let Some(TransportEvent::Messages(messages)) = event else {
            panic!("expected messages, got {event:?}");
        };
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].key.remote_jid, "status@broadcast");
    }

    #[test]
    fn frames_distinguish_responses_from_events() {
        let response: IncomingFrame =
            serde_json::from_str(r#"{"id": 3, "result": "ABCD1234"}"#).unwrap();
        assert!(matches!(response, IncomingFrame::Response { id: 3, .. }));
        let event: IncomingFrame =
            serde_json::from_str(r#"{"event": "creds.update", "data": {}}"#).unwrap();
        assert!(matches!(event, IncomingFrame::Event { .. }));
    }

    /// Minimal bridge: answers `open` and `requestPairingCode`, then emits an
    /// open event and closes with `401`.
    async fn spawn_bridge() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(Message::Text(text))) = ws.next().await {
                let request: Value = serde_json::from_str(text.as_str()).unwrap();
                let id = request["id"].clone();
                match request["method"].as_str().unwrap() {
                    "open" => {
                        assert_eq!(request["params"]["phoneNumber"], "254712345678");
                        let reply = json!({ "id": id, "result": null }).to_string();
                        ws.send(Message::Text(reply.into())).await.unwrap();
                    },
                    "requestPairingCode" => {
                        let reply = json!({ "id": id, "result": "ABCD1234" }).to_string();
                        ws.send(Message::Text(reply.into())).await.unwrap();
                        let open = json!({ "event": "connection.update", "data": { "connection": "open" } });
                        ws.send(Message::Text(open.to_string().into())).await.unwrap();
                        let close = json!({
                            "event": "connection.update",
                            "data": { "connection": "close", "statusCode": 401 }
                        });
                        ws.send(Message::Text(close.to_string().into())).await.unwrap();
                    },
                    other => {
                        let reply = json!({ "id": id, "error": format!("unknown method {other}") });
                        ws.send(Message::Text(reply.to_string().into())).await.unwrap();
                    },
                }
            }
        });
        format!("ws://{addr}")
    }

    #[tokio::test]
    async fn session_round_trip_over_websocket() {
        let url = spawn_bridge().await;
        let transport = BridgeTransport::new(url).with_request_timeout(Duration::from_secs(5));
        let (link, mut events) = transport
            .open_session(OpenRequest {
                identity: Identity::parse("254712345678").unwrap(),
                credentials: Default::default(),
                version: ProtocolVersion([2, 3000, 1]),
                browser: ["Status-Bot".into(), "Chrome".into(), "1.0".into()],
                event_buffer: 8,
            })
            .await
            .unwrap();

        let code = link.request_pairing_code("254712345678").await.unwrap();
        assert_eq!(code, "ABCD1234");

        assert!(matches!(
            events.recv().await,
            Some(TransportEvent::Connection(ConnectionState::Open))
        ));
        assert!(matches!(
            events.recv().await,
            Some(TransportEvent::Connection(ConnectionState::Closed(
                DisconnectReason::LoggedOut
            )))
        ));

        let err = link.send_message("x@s.whatsapp.net", "hi").await.unwrap_err();
        assert!(err.to_string().contains("unknown method sendMessage"));
        link.close().await;
    }

    /// Bridge that pushes `updates` credential events ahead of the pairing
    /// code reply.
    async fn spawn_busy_bridge(updates: usize) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(Message::Text(text))) = ws.next().await {
                let request: Value = serde_json::from_str(text.as_str()).unwrap();
                let id = request["id"].clone();
                if request["method"] == "requestPairingCode" {
                    for n in 1..=updates {
                        let update = json!({ "event": "creds.update", "data": { "me": format!("n-{n}") } });
                        ws.send(Message::Text(update.to_string().into())).await.unwrap();
                    }
                    let reply = json!({ "id": id, "result": "WXYZ0001" });
                    ws.send(Message::Text(reply.to_string().into())).await.unwrap();
                } else {
                    let reply = json!({ "id": id, "result": null });
                    ws.send(Message::Text(reply.to_string().into())).await.unwrap();
                }
            }
        });
        format!("ws://{addr}")
    }

    #[tokio::test]
    async fn full_event_buffer_does_not_stall_replies() {
        let url = spawn_busy_bridge(3).await;
        let transport = BridgeTransport::new(url).with_request_timeout(Duration::from_secs(2));
        let (link, mut events) = transport
            .open_session(OpenRequest {
                identity: Identity::parse("254712345678").unwrap(),
                credentials: Default::default(),
                version: ProtocolVersion([2, 3000, 1]),
                browser: ["Status-Bot".into(), "Chrome".into(), "1.0".into()],
                event_buffer: 1,
            })
            .await
            .unwrap();

        // Nobody drains `events` until the reply is in.
        let code = link.request_pairing_code("254712345678").await.unwrap();
        assert_eq!(code, "WXYZ0001");

        for n in 1..=3 {
            match events.recv().await {
                Some(TransportEvent::Credentials(update)) => {
                    assert_eq!(update.me.as_deref(), Some(format!("n-{n}").as_str()));
                },
                other => panic!("expected credentials, got {other:?}"),
            }
        }
        link.close().await;
    }

    #[tokio::test]
    async fn unreachable_bridge_fails_to_open() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let transport = BridgeTransport::new(format!("ws://{addr}"));
        assert!(transport.negotiate_version().await.is_err());
    }
}
