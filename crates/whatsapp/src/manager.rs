//! Owns every supervisor and the state they share.

use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};

use {
    statusbot_config::WhatsAppConfig,
    tokio::sync::Mutex,
    tokio_util::sync::CancellationToken,
    tracing::{info, warn},
};

use crate::{
    backoff::ReconnectPolicy,
    connector::{Connector, ConnectorOptions},
    error::{Error, Result},
    identity::Identity,
    react::ReactionPolicy,
    registry::{
        PairingView, SessionEntry, SessionRegistry, SessionSnapshot, SessionState, TerminalReason,
    },
    store::CredentialStore,
    supervisor::{self, SupervisorContext, SupervisorHandle},
    transport::Transport,
    types::ProtocolVersion,
};

/// Runtime settings for a [`SessionManager`].
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub data_dir: PathBuf,
    pub connector: ConnectorOptions,
    pub reconnect: ReconnectPolicy,
    pub reactions: Vec<String>,
    pub dedupe_ttl: Duration,
    /// Sent to the account's own chat on its first connect.
    pub greeting: Option<String>,
    pub pair_timeout: Duration,
}

impl SessionOptions {
    pub fn from_config(config: &WhatsAppConfig) -> Self {
        Self {
            data_dir: config
                .data_dir
                .clone()
                .unwrap_or_else(|| statusbot_config::data_dir().join("whatsapp")),
            connector: ConnectorOptions {
                pairing_grace: Duration::from_millis(config.pairing_grace_ms),
                browser: config.browser.clone(),
                fallback_version: ProtocolVersion(config.fallback_version),
                event_buffer: config.event_buffer.max(1),
            },
            reconnect: ReconnectPolicy::from_config(&config.reconnect),
            reactions: config.reactions.clone(),
            dedupe_ttl: Duration::from_secs(config.dedupe_ttl_secs),
            greeting: config
                .notify_on_connect
                .then(|| config.connect_message.clone()),
            pair_timeout: Duration::from_secs(config.pair_timeout_secs),
        }
    }
}

/// Starts, stops and pairs per-number sessions. At most one supervisor runs
/// per number.
pub struct SessionManager {
    ctx: Arc<SupervisorContext>,
    registry: Arc<SessionRegistry>,
    store: Arc<CredentialStore>,
    supervisors: Mutex<HashMap<Identity, SupervisorHandle>>,
    shutdown: CancellationToken,
    pair_timeout: Duration,
}

impl SessionManager {
    pub fn new(options: SessionOptions, transport: Arc<dyn Transport>) -> Result<Self> {
        let store = Arc::new(CredentialStore::open(&options.data_dir)?);
        let policy = Arc::new(ReactionPolicy::new(options.reactions)?);
        let ctx = Arc::new(SupervisorContext {
            connector: Connector::new(transport, options.connector),
            store: Arc::clone(&store),
            policy,
            reconnect: options.reconnect,
            dedupe_ttl: options.dedupe_ttl,
            greeting: options.greeting,
        });
        Ok(Self {
            ctx,
            registry: Arc::new(SessionRegistry::new()),
            store,
            supervisors: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            pair_timeout: options.pair_timeout,
        })
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    pub fn pairing_view(&self, identity: &Identity) -> PairingView {
        self.registry.pairing_view(identity)
    }

    pub fn sessions(&self) -> Vec<(Identity, SessionSnapshot)> {
        self.registry.list()
    }

    /// Whether a supervisor is currently running for `identity`.
    pub async fn is_running(&self, identity: &Identity) -> bool {
        self.supervisors
            .lock()
            .await
            .get(identity)
            .is_some_and(|s| !s.is_finished())
    }

    /// Start supervising `identity` with its stored credentials.
    ///
    /// Returns the supervisor epoch. Fails with [`Error::AlreadyRunning`] if
    /// one is active already.
    pub async fn start(&self, identity: Identity) -> Result<u64> {
        let mut supervisors = self.supervisors.lock().await;
        if supervisors.get(&identity).is_some_and(|s| !s.is_finished()) {
            return Err(Error::AlreadyRunning(identity));
        }
        let entry = self.registry.entry(&identity);
        let epoch = entry.begin_epoch();
        self.spawn_locked(&mut supervisors, entry, epoch);
        Ok(epoch)
    }

    fn spawn_locked(
        &self,
        supervisors: &mut HashMap<Identity, SupervisorHandle>,
        entry: Arc<SessionEntry>,
        epoch: u64,
    ) {
        let identity = entry.identity().clone();
        let handle = supervisor::spawn(Arc::clone(&self.ctx), entry, epoch, &self.shutdown);
        supervisors.insert(identity, handle);
    }

    /// Stop the supervisor for `identity`, if any.
    pub async fn stop(&self, identity: &Identity) -> Option<TerminalReason> {
        let handle = self.supervisors.lock().await.remove(identity)?;
        Some(handle.stop().await)
    }

    /// Stop `identity`'s session and delete its credentials.
    pub async fn reset(&self, identity: &Identity) -> Result<()> {
        let previous = self.supervisors.lock().await.remove(identity);
        if let Some(handle) = previous {
            handle.stop().await;
        }
        self.store.reset(identity).await
    }

    /// Start a fresh pairing for `number` and wait for its code.
    ///
    /// Any running supervisor for the number is stopped first, which
    /// invalidates a code it may have issued. Registered credentials that are
    /// not currently connected are discarded.
    pub async fn pair(&self, number: &str) -> Result<String> {
        let identity = Identity::parse(number)?;
        let entry = self.registry.entry(&identity);

        // The new epoch is taken before the previous supervisor is stopped,
        // so its final writes are stale and earlier waiters see `Superseded`.
        let (epoch, previous, mut updates) = {
            let mut supervisors = self.supervisors.lock().await;
            let running = supervisors.get(&identity).is_some_and(|s| !s.is_finished());
            if running && entry.snapshot().state == SessionState::Open {
                return Err(Error::AlreadyConnected(identity));
            }
            let previous = supervisors.remove(&identity);
            let epoch = entry.begin_epoch();
            (epoch, previous, entry.subscribe())
        };

        if let Some(previous) = previous {
            previous.stop().await;
        }
        if let Err(e) = self.discard_registration(&identity).await {
            entry.mark_terminal(epoch, TerminalReason::Stopped, Some(e.to_string()));
            return Err(e);
        }

        {
            let mut supervisors = self.supervisors.lock().await;
            if entry.snapshot().epoch != epoch {
                return Err(Error::Superseded);
            }
            self.spawn_locked(&mut supervisors, Arc::clone(&entry), epoch);
        }
        info!(identity = %identity, epoch, "pairing requested");

        let waited = tokio::time::timeout(
            self.pair_timeout,
            updates.wait_for(|s| {
                s.epoch != epoch
                    || s.pairing_code.is_some()
                    || s.state == SessionState::Open
                    || s.state.is_terminal()
            }),
        )
        .await;
        let snapshot = match waited {
            Err(_) => return Err(Error::PairingTimeout),
            Ok(Err(_)) => return Err(Error::Stopped),
            Ok(Ok(snapshot)) => snapshot.clone(),
        };

        if snapshot.epoch != epoch {
            return Err(Error::Superseded);
        }
        if let Some(code) = snapshot.pairing_code {
            return Ok(code);
        }
        match snapshot.state {
            SessionState::Open => Err(Error::AlreadyConnected(identity)),
            SessionState::Terminal(TerminalReason::PairingFailed) => Err(Error::Pairing(
                snapshot
                    .last_error
                    .unwrap_or_else(|| "unknown error".to_string()),
            )),
            _ => Err(Error::Stopped),
        }
    }

    /// Delete stored credentials if they claim a registration.
    async fn discard_registration(&self, identity: &Identity) -> Result<()> {
        if self.store.load(identity).await?.registered {
            self.store.reset(identity).await?;
        }
        Ok(())
    }

    /// Start a supervisor for every number with registered credentials on
    /// disk. Returns the numbers started.
    pub async fn resume_registered(&self) -> Result<Vec<Identity>> {
        let mut started = Vec::new();
        for identity in self.store.identities()? {
            match self.store.load(&identity).await {
                Ok(bundle) if bundle.registered => match self.start(identity.clone()).await {
                    Ok(_) => started.push(identity),
                    Err(Error::AlreadyRunning(_)) => {},
                    Err(e) => warn!(identity = %identity, error = %e, "failed to resume session"),
                },
                Ok(_) => {},
                Err(e) => {
                    warn!(identity = %identity, error = %e, "failed to read stored credentials");
                },
            }
        }
        if !started.is_empty() {
            info!(count = started.len(), "resumed stored sessions");
        }
        Ok(started)
    }

    /// Stop every supervisor and wait for their sessions to close.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<_> = self.supervisors.lock().await.drain().map(|(_, h)| h).collect();
        for handle in handles {
            handle.join().await;
        }
        info!("all sessions stopped");
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, path::Path};

    use super::*;
    use crate::{
        testing::{MockTransport, eventually, inbound, wait_for_snapshot},
        types::{
            CredentialUpdate, DisconnectReason, KeyMaterial, MessageContent, STATUS_BROADCAST_JID,
        },
    };

    const NUMBER: &str = "254712345678";

    fn options(dir: &Path) -> SessionOptions {
        SessionOptions {
            data_dir: dir.to_path_buf(),
            connector: ConnectorOptions {
                pairing_grace: Duration::from_millis(5),
                browser: ["Status-Bot".into(), "Chrome".into(), "1.0".into()],
                fallback_version: ProtocolVersion([2, 3000, 1015901307]),
                event_buffer: 16,
            },
            reconnect: ReconnectPolicy::immediate(),
            reactions: vec!["🔥".into(), "💯".into(), "😎".into()],
            dedupe_ttl: Duration::from_secs(600),
            greeting: None,
            pair_timeout: Duration::from_secs(5),
        }
    }

    fn id() -> Identity {
        Identity::parse(NUMBER).unwrap()
    }

    fn registered_update() -> CredentialUpdate {
        CredentialUpdate {
            registered: Some(true),
            me: Some(format!("{NUMBER}:3@s.whatsapp.net")),
            keys: BTreeMap::from([("noise".to_string(), Some(KeyMaterial(vec![7; 32])))]),
        }
    }

    fn text(body: &str) -> MessageContent {
        MessageContent::Text { text: body.into() }
    }

    async fn registered_manager(
        dir: &Path,
        tweak: impl FnOnce(&mut SessionOptions),
    ) -> (SessionManager, Arc<MockTransport>) {
        let mut opts = options(dir);
        tweak(&mut opts);
        let transport = MockTransport::new();
        let manager = SessionManager::new(opts, transport.clone()).unwrap();
        manager.store().on_update(&id(), &registered_update()).await.unwrap();
        (manager, transport)
    }

    #[tokio::test]
    async fn pair_returns_code_for_sanitized_number() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MockTransport::new();
        let manager = SessionManager::new(options(dir.path()), transport.clone()).unwrap();

        let code = manager.pair("+254 712-345-678").await.unwrap();
        assert_eq!(code, "PAIR0001");

        let session = transport.next_session().await;
        assert_eq!(session.identity, id());
        assert!(!session.registered);
        assert_eq!(session.link.pairing_requests(), vec![NUMBER.to_string()]);
        assert_eq!(manager.pairing_view(&id()), PairingView::Pending(code));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_number_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MockTransport::new();
        let manager = SessionManager::new(options(dir.path()), transport.clone()).unwrap();

        assert!(matches!(
            manager.pair("12ab").await,
            Err(Error::InvalidIdentity(_))
        ));
        assert_eq!(transport.open_count(), 0);
    }

    #[tokio::test]
    async fn second_pair_replaces_first() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MockTransport::new();
        let manager = SessionManager::new(options(dir.path()), transport.clone()).unwrap();

        assert_eq!(manager.pair(NUMBER).await.unwrap(), "PAIR0001");
        let first = transport.next_session().await;

        assert_eq!(manager.pair(NUMBER).await.unwrap(), "PAIR0002");
        let second = transport.next_session().await;

        assert!(first.link.is_closed());
        assert!(!second.link.is_closed());
        assert_eq!(
            manager.registry().current_code(&id()).as_deref(),
            Some("PAIR0002")
        );
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn concurrent_pair_supersedes_the_waiting_request() {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = options(dir.path());
        opts.connector.pairing_grace = Duration::from_millis(200);
        let manager = Arc::new(SessionManager::new(opts, MockTransport::new()).unwrap());

        for round in 0..5 {
            let first = tokio::spawn({
                let manager = Arc::clone(&manager);
                async move { manager.pair(NUMBER).await }
            });
            // The first request is inside its pairing grace by now.
            tokio::time::sleep(Duration::from_millis(50)).await;
            let code = manager.pair(NUMBER).await.unwrap();

            let first = first.await.unwrap();
            assert!(
                matches!(first, Err(Error::Superseded)),
                "round {round}: {first:?}"
            );
            assert_eq!(manager.registry().current_code(&id()), Some(code));
        }
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn open_clears_code_after_persisting_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MockTransport::new();
        let manager = SessionManager::new(options(dir.path()), transport.clone()).unwrap();

        manager.pair(NUMBER).await.unwrap();
        let session = transport.next_session().await;
        assert!(session.credentials(registered_update()).await);
        assert!(session.open().await);

        wait_for_snapshot(manager.registry(), &id(), |s| s.state == SessionState::Open).await;
        assert_eq!(manager.pairing_view(&id()), PairingView::Connected);

        let stored = manager.store().load(&id()).await.unwrap();
        assert!(stored.registered);
        assert_eq!(stored.keys["noise"], KeyMaterial(vec![7; 32]));

        assert!(matches!(
            manager.pair(NUMBER).await,
            Err(Error::AlreadyConnected(_))
        ));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn transient_close_reconnects_once_with_stored_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MockTransport::new();
        let manager = SessionManager::new(options(dir.path()), transport.clone()).unwrap();

        manager.pair(NUMBER).await.unwrap();
        let first = transport.next_session().await;
        first.credentials(registered_update()).await;
        first.open().await;
        let opened =
            wait_for_snapshot(manager.registry(), &id(), |s| s.state == SessionState::Open).await;

        first.close(DisconnectReason::RestartRequired).await;
        let second = transport.next_session().await;
        assert_eq!(second.identity, id());
        assert!(second.registered);
        assert!(second.link.pairing_requests().is_empty());

        second.open().await;
        wait_for_snapshot(manager.registry(), &id(), |s| {
            s.state == SessionState::Open && s.generation == opened.generation + 1
        })
        .await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(transport.try_next_session().await.is_none());
        assert_eq!(transport.open_count(), 2);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn dropped_event_channel_counts_as_connection_lost() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, transport) = registered_manager(dir.path(), |_| {}).await;
        manager.start(id()).await.unwrap();

        let first = transport.next_session().await;
        first.open().await;
        wait_for_snapshot(manager.registry(), &id(), |s| s.state == SessionState::Open).await;
        first.hang_up();

        let second = transport.next_session().await;
        assert!(second.registered);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn logout_is_terminal_and_deletes_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, transport) = registered_manager(dir.path(), |_| {}).await;
        manager.start(id()).await.unwrap();

        let session = transport.next_session().await;
        session.open().await;
        session.close(DisconnectReason::LoggedOut).await;

        wait_for_snapshot(manager.registry(), &id(), |s| {
            s.state == SessionState::Terminal(TerminalReason::LoggedOut)
        })
        .await;
        assert!(manager.stop(&id()).await.is_some());
        assert_eq!(transport.open_count(), 1);
        assert!(manager.store().identities().unwrap().is_empty());
        assert!(!manager.store().load(&id()).await.unwrap().registered);
    }

    #[tokio::test]
    async fn status_updates_get_one_reaction_each() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, transport) = registered_manager(dir.path(), |_| {}).await;
        manager.start(id()).await.unwrap();

        let session = transport.next_session().await;
        session.open().await;
        let status = inbound(STATUS_BROADCAST_JID, "m1", text("story"));
        session
            .messages(vec![
                status.clone(),
                inbound("254700000001@s.whatsapp.net", "m2", text("hello")),
                status.clone(),
            ])
            .await;
        session
            .messages(vec![inbound(STATUS_BROADCAST_JID, "m3", text("again"))])
            .await;

        let link = Arc::clone(&session.link);
        eventually("two reactions", || link.reactions().len() >= 2).await;
        let reactions = link.reactions();
        assert_eq!(reactions.len(), 2);
        assert_eq!(reactions[0].key, status.key);
        assert_eq!(reactions[1].key.id, "m3");
        for reaction in &reactions {
            assert_eq!(reaction.to, STATUS_BROADCAST_JID);
            assert!(["🔥", "💯", "😎"].contains(&reaction.symbol.as_str()));
        }
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn failed_reaction_does_not_stop_the_session() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, transport) = registered_manager(dir.path(), |_| {}).await;
        manager.start(id()).await.unwrap();

        let session = transport.next_session().await;
        session.open().await;
        session.link.fail_next_reaction();
        session
            .messages(vec![
                inbound(STATUS_BROADCAST_JID, "m1", text("one")),
                inbound(STATUS_BROADCAST_JID, "m2", text("two")),
            ])
            .await;

        let link = Arc::clone(&session.link);
        eventually("a reaction", || !link.reactions().is_empty()).await;
        assert_eq!(link.reactions()[0].key.id, "m2");
        assert_eq!(manager.registry().snapshot(&id()).unwrap().state, SessionState::Open);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn greeting_is_sent_once_per_supervisor() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, transport) =
            registered_manager(dir.path(), |o| o.greeting = Some("bot online".into())).await;
        manager.start(id()).await.unwrap();

        let first = transport.next_session().await;
        first.open().await;
        let opened =
            wait_for_snapshot(manager.registry(), &id(), |s| s.state == SessionState::Open).await;
        let link = Arc::clone(&first.link);
        eventually("greeting", || !link.texts().is_empty()).await;
        assert_eq!(
            link.texts(),
            vec![(format!("{NUMBER}@s.whatsapp.net"), "bot online".to_string())]
        );

        first.close(DisconnectReason::ConnectionLost).await;
        let second = transport.next_session().await;
        second.open().await;
        wait_for_snapshot(manager.registry(), &id(), |s| {
            s.state == SessionState::Open && s.generation == opened.generation + 1
        })
        .await;
        assert!(second.link.texts().is_empty());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn retries_stop_after_max_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, transport) = registered_manager(dir.path(), |o| {
            o.reconnect = ReconnectPolicy::immediate().with_max_attempts(Some(2));
        })
        .await;
        transport.set_fail_open(true);
        manager.start(id()).await.unwrap();

        let snapshot = wait_for_snapshot(manager.registry(), &id(), |s| s.state.is_terminal()).await;
        assert_eq!(
            snapshot.state,
            SessionState::Terminal(TerminalReason::RetriesExhausted)
        );
        assert_eq!(snapshot.attempts, 3);
        assert_eq!(transport.open_calls(), 3);
        assert!(snapshot.last_error.unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn failed_connects_wait_for_the_floor() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, transport) = registered_manager(dir.path(), |o| {
            o.reconnect = ReconnectPolicy::immediate().with_failure_floor(Duration::from_millis(300));
        })
        .await;
        transport.set_fail_open(true);
        manager.start(id()).await.unwrap();

        eventually("first attempt", || transport.open_calls() >= 1).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(transport.open_calls(), 1);
        eventually("second attempt", || transport.open_calls() >= 2).await;
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn pairing_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MockTransport::new();
        transport.set_fail_pairing(true);
        let manager = SessionManager::new(options(dir.path()), transport.clone()).unwrap();

        match manager.pair(NUMBER).await {
            Err(Error::Pairing(message)) => assert!(message.contains("rate-overlimit")),
            other => panic!("expected pairing error, got {other:?}"),
        }
        let session = transport.next_session().await;
        assert!(session.link.is_closed());
        assert_eq!(
            manager.registry().snapshot(&id()).unwrap().state,
            SessionState::Terminal(TerminalReason::PairingFailed)
        );
        // Nothing was ever persisted, so no store is left behind.
        assert!(manager.store().identities().unwrap().is_empty());
    }

    #[tokio::test]
    async fn pair_times_out_without_code() {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = options(dir.path());
        opts.connector.pairing_grace = Duration::from_secs(2);
        opts.pair_timeout = Duration::from_millis(30);
        let manager = SessionManager::new(opts, MockTransport::new()).unwrap();

        assert!(matches!(
            manager.pair(NUMBER).await,
            Err(Error::PairingTimeout)
        ));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn pair_discards_stale_registration() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, transport) = registered_manager(dir.path(), |_| {}).await;

        manager.pair(NUMBER).await.unwrap();
        let session = transport.next_session().await;
        assert!(!session.registered);
        assert_eq!(session.link.pairing_requests().len(), 1);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _transport) = registered_manager(dir.path(), |_| {}).await;

        manager.start(id()).await.unwrap();
        assert!(manager.is_running(&id()).await);
        assert!(matches!(
            manager.start(id()).await,
            Err(Error::AlreadyRunning(_))
        ));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_closes_every_session() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, transport) = registered_manager(dir.path(), |_| {}).await;
        manager.start(id()).await.unwrap();
        let session = transport.next_session().await;
        session.open().await;
        wait_for_snapshot(manager.registry(), &id(), |s| s.state == SessionState::Open).await;

        manager.shutdown().await;
        assert!(session.link.is_closed());
        assert_eq!(
            manager.registry().snapshot(&id()).unwrap().state,
            SessionState::Terminal(TerminalReason::Stopped)
        );
        assert!(!manager.is_running(&id()).await);
    }

    #[tokio::test]
    async fn reset_stops_and_forgets() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, transport) = registered_manager(dir.path(), |_| {}).await;
        manager.start(id()).await.unwrap();
        let session = transport.next_session().await;

        manager.reset(&id()).await.unwrap();
        assert!(session.link.is_closed());
        assert!(!manager.store().load(&id()).await.unwrap().registered);
    }

    #[tokio::test]
    async fn reset_does_not_hold_up_other_numbers() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, transport) = registered_manager(dir.path(), |_| {}).await;
        let manager = Arc::new(manager);
        transport.set_reaction_delay(Duration::from_secs(3));
        manager.start(id()).await.unwrap();

        let session = transport.next_session().await;
        session.open().await;
        session
            .messages(vec![inbound(STATUS_BROADCAST_JID, "m1", text("slow"))])
            .await;
        let link = Arc::clone(&session.link);
        eventually("reaction in flight", || link.reactions_started() == 1).await;

        let started = tokio::time::Instant::now();
        let reset = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.reset(&id()).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(manager.pair("254700000002").await.unwrap(), "PAIR0002");
        reset.await.unwrap().unwrap();

        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(session.link.is_closed());
        assert!(session.link.reactions().is_empty());
        assert!(!manager.store().load(&id()).await.unwrap().registered);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn resume_starts_only_registered_numbers() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, transport) = registered_manager(dir.path(), |_| {}).await;
        let unregistered = Identity::parse("254700000002").unwrap();
        manager
            .store()
            .on_update(&unregistered, &CredentialUpdate::default())
            .await
            .unwrap();

        let started = manager.resume_registered().await.unwrap();
        assert_eq!(started, vec![id()]);
        let session = transport.next_session().await;
        assert_eq!(session.identity, id());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn version_negotiation_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, transport) = registered_manager(dir.path(), |_| {}).await;
        transport.set_fail_version(true);
        manager.start(id()).await.unwrap();

        let session = transport.next_session().await;
        assert_eq!(session.version, ProtocolVersion([2, 3000, 1015901307]));
        manager.shutdown().await;
    }
}
