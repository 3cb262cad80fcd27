//! Per-number session state shared between supervisors and readers.
//!
//! Every number has one [`SessionEntry`] holding a [`SessionSnapshot`] behind
//! a `watch` channel. Writers tag their updates with the supervisor `epoch`
//! or connection `generation` they belong to; updates from a superseded
//! supervisor or connection are dropped.

use std::{fmt, sync::Arc};

use {dashmap::DashMap, tokio::sync::watch};

use crate::{identity::Identity, types::DisconnectReason};

/// Supervisor lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Connecting,
    Open,
    Closed(DisconnectReason),
    Terminal(TerminalReason),
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminal(_))
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Connecting => f.write_str("connecting"),
            Self::Open => f.write_str("open"),
            Self::Closed(reason) => write!(f, "closed ({reason})"),
            Self::Terminal(reason) => write!(f, "terminal ({reason})"),
        }
    }
}

/// Why a supervisor stopped for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalReason {
    /// The account was unlinked; pairing again is required.
    LoggedOut,
    /// The pairing code request failed before the number was registered.
    PairingFailed,
    /// The reconnect policy ran out of attempts.
    RetriesExhausted,
    /// Stopped by the owner (shutdown, reset or a new pairing request).
    Stopped,
}

impl fmt::Display for TerminalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::LoggedOut => "logged out",
            Self::PairingFailed => "pairing failed",
            Self::RetriesExhausted => "retries exhausted",
            Self::Stopped => "stopped",
        })
    }
}

/// Point-in-time view of one number's session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    /// Pending pairing code. Only set while connecting unregistered.
    pub pairing_code: Option<String>,
    /// Incremented on every supervisor start.
    pub epoch: u64,
    /// Incremented on every connection attempt and every supervisor start.
    pub generation: u64,
    /// Consecutive failed attempts since the last open connection.
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// What the pairing page should show for a number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingView {
    Pending(String),
    Connected,
    NotRequested,
}

/// Shared state of one number.
pub struct SessionEntry {
    identity: Identity,
    tx: watch::Sender<SessionSnapshot>,
}

impl SessionEntry {
    fn new(identity: Identity) -> Self {
        let (tx, _) = watch::channel(SessionSnapshot::default());
        Self { identity, tx }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.tx.subscribe()
    }

    /// True while `generation` is the live connection of a running supervisor.
    pub fn is_current(&self, generation: u64) -> bool {
        let s = self.tx.borrow();
        s.generation == generation && !s.state.is_terminal()
    }

    /// Start a new supervisor epoch. Clears any pending code and retires the
    /// live connection, so a supervisor that is still winding down can no
    /// longer write.
    pub(crate) fn begin_epoch(&self) -> u64 {
        let mut epoch = 0;
        self.tx.send_modify(|s| {
            s.epoch += 1;
            s.generation += 1;
            s.state = SessionState::Idle;
            s.pairing_code = None;
            s.attempts = 0;
            s.last_error = None;
            epoch = s.epoch;
        });
        epoch
    }

    /// Start a new connection attempt. Returns its generation, or `None` if
    /// `epoch` has been superseded.
    pub(crate) fn begin_attempt(&self, epoch: u64) -> Option<u64> {
        let mut generation = None;
        self.tx.send_if_modified(|s| {
            if s.epoch != epoch || s.state.is_terminal() {
                return false;
            }
            s.generation += 1;
            s.state = SessionState::Connecting;
            s.pairing_code = None;
            generation = Some(s.generation);
            true
        });
        generation
    }

    pub(crate) fn publish_code(&self, generation: u64, code: &str) -> bool {
        self.tx.send_if_modified(|s| {
            if s.generation != generation || s.state != SessionState::Connecting {
                return false;
            }
            s.pairing_code = Some(code.to_string());
            true
        })
    }

    pub(crate) fn mark_open(&self, generation: u64) -> bool {
        self.tx.send_if_modified(|s| {
            if s.generation != generation || s.state.is_terminal() {
                return false;
            }
            s.state = SessionState::Open;
            s.pairing_code = None;
            s.attempts = 0;
            s.last_error = None;
            true
        })
    }

    pub(crate) fn mark_closed(&self, generation: u64, reason: DisconnectReason) -> bool {
        self.tx.send_if_modified(|s| {
            if s.generation != generation || s.state.is_terminal() {
                return false;
            }
            s.state = SessionState::Closed(reason);
            s.pairing_code = None;
            true
        })
    }

    pub(crate) fn record_failure(&self, epoch: u64, attempts: u32, error: Option<String>) {
        self.tx.send_if_modified(|s| {
            if s.epoch != epoch {
                return false;
            }
            s.attempts = attempts;
            if error.is_some() {
                s.last_error = error;
            }
            true
        });
    }

    pub(crate) fn mark_terminal(
        &self,
        epoch: u64,
        reason: TerminalReason,
        error: Option<String>,
    ) -> bool {
        self.tx.send_if_modified(|s| {
            if s.epoch != epoch || s.state.is_terminal() {
                return false;
            }
            s.state = SessionState::Terminal(reason);
            s.pairing_code = None;
            if error.is_some() {
                s.last_error = error;
            }
            true
        })
    }
}

/// Map of number to session state.
#[derive(Default)]
pub struct SessionRegistry {
    entries: DashMap<Identity, Arc<SessionEntry>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the entry for `identity`, creating an idle one if needed.
    pub fn entry(&self, identity: &Identity) -> Arc<SessionEntry> {
        self.entries
            .entry(identity.clone())
            .or_insert_with(|| Arc::new(SessionEntry::new(identity.clone())))
            .clone()
    }

    pub fn get(&self, identity: &Identity) -> Option<Arc<SessionEntry>> {
        self.entries.get(identity).map(|e| Arc::clone(e.value()))
    }

    pub fn snapshot(&self, identity: &Identity) -> Option<SessionSnapshot> {
        self.get(identity).map(|e| e.snapshot())
    }

    /// The live pairing code for `identity`, if one is pending.
    pub fn current_code(&self, identity: &Identity) -> Option<String> {
        self.snapshot(identity).and_then(|s| s.pairing_code)
    }

    pub fn pairing_view(&self, identity: &Identity) -> PairingView {
        match self.snapshot(identity) {
            Some(SessionSnapshot {
                state: SessionState::Open,
                ..
            }) => PairingView::Connected,
            Some(SessionSnapshot {
                pairing_code: Some(code),
                ..
            }) => PairingView::Pending(code),
            _ => PairingView::NotRequested,
        }
    }

    /// All known numbers with their snapshots, sorted by number.
    pub fn list(&self) -> Vec<(Identity, SessionSnapshot)> {
        let mut all: Vec<_> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().snapshot()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> Arc<SessionEntry> {
        SessionRegistry::new().entry(&Identity::parse("254712345678").unwrap())
    }

    #[test]
    fn open_clears_pairing_code() {
        let e = entry();
        let epoch = e.begin_epoch();
        let generation = e.begin_attempt(epoch).unwrap();
        assert!(e.publish_code(generation, "ABCD1234"));
        assert_eq!(e.snapshot().pairing_code.as_deref(), Some("ABCD1234"));

        assert!(e.mark_open(generation));
        let s = e.snapshot();
        assert_eq!(s.state, SessionState::Open);
        assert!(s.pairing_code.is_none());
    }

    #[test]
    fn new_attempt_invalidates_previous_code() {
        let e = entry();
        let epoch = e.begin_epoch();
        let first = e.begin_attempt(epoch).unwrap();
        e.publish_code(first, "FIRST111");

        let second = e.begin_attempt(epoch).unwrap();
        assert!(e.snapshot().pairing_code.is_none());
        assert!(!e.publish_code(first, "STALE000"));
        assert!(e.publish_code(second, "SECOND22"));
        assert_eq!(e.snapshot().pairing_code.as_deref(), Some("SECOND22"));
    }

    #[test]
    fn stale_epoch_cannot_write() {
        let e = entry();
        let old = e.begin_epoch();
        let new = e.begin_epoch();
        assert!(e.begin_attempt(old).is_none());
        assert!(!e.mark_terminal(old, TerminalReason::Stopped, None));
        assert!(e.begin_attempt(new).is_some());
    }

    #[test]
    fn new_epoch_retires_live_connection() {
        let e = entry();
        let old = e.begin_epoch();
        let generation = e.begin_attempt(old).unwrap();

        let new = e.begin_epoch();
        assert!(!e.is_current(generation));
        assert!(!e.mark_open(generation));
        assert!(!e.mark_closed(generation, DisconnectReason::ConnectionLost));
        assert!(!e.mark_terminal(old, TerminalReason::Stopped, None));

        let s = e.snapshot();
        assert_eq!(s.epoch, new);
        assert_eq!(s.state, SessionState::Idle);
    }

    #[test]
    fn terminal_handle_is_not_current() {
        let e = entry();
        let epoch = e.begin_epoch();
        let generation = e.begin_attempt(epoch).unwrap();
        assert!(e.is_current(generation));
        assert!(e.mark_terminal(epoch, TerminalReason::LoggedOut, None));
        assert!(!e.is_current(generation));
        assert!(e.begin_attempt(epoch).is_none());
    }

    #[test]
    fn pairing_view_distinguishes_states() {
        let registry = SessionRegistry::new();
        let id = Identity::parse("254712345678").unwrap();
        assert_eq!(registry.pairing_view(&id), PairingView::NotRequested);

        let e = registry.entry(&id);
        let epoch = e.begin_epoch();
        let generation = e.begin_attempt(epoch).unwrap();
        e.publish_code(generation, "ABCD1234");
        assert_eq!(
            registry.pairing_view(&id),
            PairingView::Pending("ABCD1234".into())
        );

        e.mark_open(generation);
        assert_eq!(registry.pairing_view(&id), PairingView::Connected);
        assert_eq!(registry.current_code(&id), None);
    }
}
