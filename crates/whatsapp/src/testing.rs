//! Scripted in-memory transport for tests.
//!
//! Every `open_session` call produces a [`MockSession`] that tests pick up
//! with [`MockTransport::next_session`] and drive by emitting events. Outbound
//! calls are recorded on the session's [`MockLink`].

use std::{
    sync::{
        Arc, Mutex as StdMutex,
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
    },
    time::Duration,
};

use {
    anyhow::{Result, bail},
    async_trait::async_trait,
    tokio::sync::{Mutex, mpsc},
};

use crate::{
    identity::Identity,
    registry::{SessionRegistry, SessionSnapshot},
    transport::{OpenRequest, SessionLink, Transport},
    types::{
        ConnectionState, CredentialUpdate, DisconnectReason, InboundEvent, MessageContent,
        MessageKey, ProtocolVersion, STATUS_BROADCAST_JID, TransportEvent,
    },
};

const WAIT: Duration = Duration::from_secs(5);

/// A reaction recorded by [`MockLink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentReaction {
    pub to: String,
    pub symbol: String,
    pub key: MessageKey,
}

/// Outbound side of a mock session.
#[derive(Default)]
pub struct MockLink {
    code: String,
    fail_pairing: bool,
    fail_next_reaction: AtomicBool,
    reaction_delay: Duration,
    reactions_started: AtomicUsize,
    closed: AtomicBool,
    pairing_requests: StdMutex<Vec<String>>,
    reactions: StdMutex<Vec<SentReaction>>,
    texts: StdMutex<Vec<(String, String)>>,
}

impl MockLink {
    pub fn reactions(&self) -> Vec<SentReaction> {
        self.reactions.lock().unwrap().clone()
    }

    pub fn texts(&self) -> Vec<(String, String)> {
        self.texts.lock().unwrap().clone()
    }

    /// `send_reaction` calls entered, including ones still in flight.
    pub fn reactions_started(&self) -> usize {
        self.reactions_started.load(Ordering::SeqCst)
    }

    pub fn pairing_requests(&self) -> Vec<String> {
        self.pairing_requests.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Make the next `send_reaction` call fail.
    pub fn fail_next_reaction(&self) {
        self.fail_next_reaction.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl SessionLink for MockLink {
    async fn request_pairing_code(&self, phone_number: &str) -> Result<String> {
        self.pairing_requests
            .lock()
            .unwrap()
            .push(phone_number.to_string());
        if self.fail_pairing {
            bail!("rate-overlimit");
        }
        Ok(self.code.clone())
    }

    async fn send_reaction(&self, to: &str, symbol: &str, key: &MessageKey) -> Result<()> {
        self.reactions_started.fetch_add(1, Ordering::SeqCst);
        if !self.reaction_delay.is_zero() {
            tokio::time::sleep(self.reaction_delay).await;
        }
        if self.fail_next_reaction.swap(false, Ordering::SeqCst) {
            bail!("socket write failed");
        }
        self.reactions.lock().unwrap().push(SentReaction {
            to: to.to_string(),
            symbol: symbol.to_string(),
            key: key.clone(),
        });
        Ok(())
    }

    async fn send_message(&self, to: &str, text: &str) -> Result<()> {
        self.texts
            .lock()
            .unwrap()
            .push((to.to_string(), text.to_string()));
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// One opened mock session.
#[derive(Clone)]
pub struct MockSession {
    pub identity: Identity,
    pub registered: bool,
    pub version: ProtocolVersion,
    pub link: Arc<MockLink>,
    events: mpsc::Sender<TransportEvent>,
}

impl MockSession {
    /// Deliver an event. Returns false once the session's consumer is gone.
    pub async fn emit(&self, event: TransportEvent) -> bool {
        self.events.send(event).await.is_ok()
    }

    pub async fn open(&self) -> bool {
        self.emit(TransportEvent::Connection(ConnectionState::Open))
            .await
    }

    pub async fn close(&self, reason: DisconnectReason) -> bool {
        self.emit(TransportEvent::Connection(ConnectionState::Closed(reason)))
            .await
    }

    pub async fn credentials(&self, update: CredentialUpdate) -> bool {
        self.emit(TransportEvent::Credentials(update)).await
    }

    pub async fn messages(&self, events: Vec<InboundEvent>) -> bool {
        self.emit(TransportEvent::Messages(events)).await
    }

    /// Drop the event channel without a close notification.
    pub fn hang_up(self) {
        drop(self.events);
    }
}

/// Build an inbound event posted to `chat` with message id `id`.
pub fn inbound(chat: &str, id: &str, message: MessageContent) -> InboundEvent {
    InboundEvent {
        key: MessageKey {
            remote_jid: chat.to_string(),
            id: id.to_string(),
            from_me: false,
            participant: (chat == STATUS_BROADCAST_JID)
                .then(|| "254700000009@s.whatsapp.net".to_string()),
        },
        message: Some(message),
        push_name: None,
    }
}

/// Scripted [`Transport`].
pub struct MockTransport {
    opened_tx: mpsc::UnboundedSender<MockSession>,
    opened_rx: Mutex<mpsc::UnboundedReceiver<MockSession>>,
    opens: AtomicUsize,
    open_calls: AtomicUsize,
    codes: AtomicU32,
    reaction_delay: StdMutex<Duration>,
    fail_version: AtomicBool,
    fail_open: AtomicBool,
    fail_pairing: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        let (opened_tx, opened_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            opened_tx,
            opened_rx: Mutex::new(opened_rx),
            opens: AtomicUsize::new(0),
            open_calls: AtomicUsize::new(0),
            codes: AtomicU32::new(0),
            reaction_delay: StdMutex::new(Duration::ZERO),
            fail_version: AtomicBool::new(false),
            fail_open: AtomicBool::new(false),
            fail_pairing: AtomicBool::new(false),
        })
    }

    pub fn set_fail_version(&self, fail: bool) {
        self.fail_version.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_pairing(&self, fail: bool) {
        self.fail_pairing.store(fail, Ordering::SeqCst);
    }

    /// Make every `send_reaction` on sessions opened from now on take `delay`.
    pub fn set_reaction_delay(&self, delay: Duration) {
        *self.reaction_delay.lock().unwrap() = delay;
    }

    /// Number of `open_session` calls so far, failed ones included.
    pub fn open_calls(&self) -> usize {
        self.open_calls.load(Ordering::SeqCst)
    }

    /// Number of successful `open_session` calls so far.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Wait for the next opened session. Panics after five seconds.
    pub async fn next_session(&self) -> MockSession {
        let mut rx = self.opened_rx.lock().await;
        tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for a session to open")
            .expect("mock transport dropped")
    }

    /// The next opened session if one is already queued.
    pub async fn try_next_session(&self) -> Option<MockSession> {
        self.opened_rx.lock().await.try_recv().ok()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn negotiate_version(&self) -> Result<ProtocolVersion> {
        if self.fail_version.load(Ordering::SeqCst) {
            bail!("version endpoint unreachable");
        }
        Ok(ProtocolVersion([2, 3000, 1]))
    }

    async fn open_session(
        &self,
        request: OpenRequest,
    ) -> Result<(Arc<dyn SessionLink>, mpsc::Receiver<TransportEvent>)> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_open.load(Ordering::SeqCst) {
            bail!("connection refused");
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        let n = self.codes.fetch_add(1, Ordering::SeqCst) + 1;

        let (tx, rx) = mpsc::channel(request.event_buffer);
        let link = Arc::new(MockLink {
            code: format!("PAIR{n:04}"),
            fail_pairing: self.fail_pairing.load(Ordering::SeqCst),
            reaction_delay: *self.reaction_delay.lock().unwrap(),
            ..Default::default()
        });
        let session = MockSession {
            identity: request.identity,
            registered: request.credentials.registered,
            version: request.version,
            link: Arc::clone(&link),
            events: tx,
        };
        let _ = self.opened_tx.send(session);
        Ok((link, rx))
    }
}

/// Wait until `identity`'s snapshot satisfies `pred`. Panics after five
/// seconds.
pub async fn wait_for_snapshot(
    registry: &SessionRegistry,
    identity: &Identity,
    pred: impl Fn(&SessionSnapshot) -> bool,
) -> SessionSnapshot {
    let mut rx = registry.entry(identity).subscribe();
    let snapshot = tokio::time::timeout(WAIT, rx.wait_for(|s| pred(s)))
        .await
        .expect("timed out waiting for session state")
        .expect("registry entry dropped");
    snapshot.clone()
}

/// Poll `cond` until it holds. Panics after five seconds.
pub async fn eventually(what: &str, cond: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
