//! Reconnection supervisor: one task per number that keeps a session alive.
//!
//! ```text
//! Idle ─▶ Connecting ─▶ Open ─▶ Closed ─┬─▶ Connecting   (any other reason)
//!              │                        └─▶ Terminal     (logged out)
//!              └──────────▶ Closed / failed attempt
//! ```
//!
//! Attempts are strictly sequential: the next one only starts after the
//! previous handle has been closed.

use std::{sync::Arc, time::Duration};

use {
    tokio::task::JoinHandle,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{
    backoff::ReconnectPolicy,
    connector::Connector,
    dispatch::{Dispatcher, EndCause, SessionEnd},
    error::Error,
    identity::Identity,
    react::ReactionPolicy,
    registry::{SessionEntry, TerminalReason},
    store::CredentialStore,
    types::DisconnectReason,
};

/// Everything a supervisor needs, shared by all supervisors of a manager.
pub(crate) struct SupervisorContext {
    pub connector: Connector,
    pub store: Arc<CredentialStore>,
    pub policy: Arc<ReactionPolicy>,
    pub reconnect: ReconnectPolicy,
    pub dedupe_ttl: Duration,
    pub greeting: Option<String>,
}

/// Owner's handle on a running supervisor task.
pub struct SupervisorHandle {
    identity: Identity,
    epoch: u64,
    cancel: CancellationToken,
    task: JoinHandle<TerminalReason>,
}

impl SupervisorHandle {
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel the supervisor and wait for it to close its session.
    pub async fn stop(self) -> TerminalReason {
        self.cancel.cancel();
        self.join().await
    }

    /// Wait for the supervisor to end on its own.
    pub async fn join(self) -> TerminalReason {
        match self.task.await {
            Ok(reason) => reason,
            Err(e) => {
                warn!(identity = %self.identity, error = %e, "supervisor task failed");
                TerminalReason::Stopped
            },
        }
    }
}

/// Start a supervisor for `entry`'s number under `epoch`, which the caller
/// obtained from [`SessionEntry::begin_epoch`]. Cancelling `parent` stops it.
pub(crate) fn spawn(
    ctx: Arc<SupervisorContext>,
    entry: Arc<SessionEntry>,
    epoch: u64,
    parent: &CancellationToken,
) -> SupervisorHandle {
    let cancel = parent.child_token();
    let identity = entry.identity().clone();
    let supervisor = Supervisor {
        ctx,
        entry,
        epoch,
        cancel: cancel.clone(),
    };
    SupervisorHandle {
        identity,
        epoch,
        cancel,
        task: tokio::spawn(supervisor.run()),
    }
}

struct Supervisor {
    ctx: Arc<SupervisorContext>,
    entry: Arc<SessionEntry>,
    epoch: u64,
    cancel: CancellationToken,
}

impl Supervisor {
    fn identity(&self) -> &Identity {
        self.entry.identity()
    }

    async fn run(self) -> TerminalReason {
        info!(identity = %self.identity(), epoch = self.epoch, "session supervisor started");

        let mut dispatcher = Dispatcher::new(
            Arc::clone(&self.ctx.store),
            Arc::clone(&self.ctx.policy),
            self.ctx.dedupe_ttl,
            self.ctx.greeting.clone(),
        );
        // Consecutive attempts that did not reach `Open`.
        let mut failures: u32 = 0;

        loop {
            let Some(generation) = self.entry.begin_attempt(self.epoch) else {
                return TerminalReason::Stopped;
            };
            debug!(identity = %self.identity(), generation, "connecting");

            let end = self.attempt(generation, &mut dispatcher).await;
            if end.opened {
                failures = 0;
            }
            let connect_failed = matches!(end.cause, EndCause::Failed(_));

            match end.cause {
                EndCause::Cancelled => return self.finish(TerminalReason::Stopped, None),
                EndCause::Closed(reason) if reason.is_logged_out() => {
                    warn!(identity = %self.identity(), "logged out, pair again to reconnect");
                    if let Err(e) = self.ctx.store.reset(self.identity()).await {
                        warn!(identity = %self.identity(), error = %e, "failed to clear credentials");
                    }
                    return self.finish(TerminalReason::LoggedOut, None);
                },
                EndCause::Closed(reason) => {
                    failures += 1;
                    info!(
                        identity = %self.identity(),
                        reason = %reason,
                        code = reason.status_code(),
                        attempt = failures,
                        "connection closed, reconnecting"
                    );
                    self.entry
                        .record_failure(self.epoch, failures, Some(reason.to_string()));
                },
                EndCause::Failed(Error::Pairing(message)) => {
                    warn!(identity = %self.identity(), error = %message, "pairing failed");
                    return self.finish(TerminalReason::PairingFailed, Some(message));
                },
                EndCause::Failed(error) => {
                    failures += 1;
                    warn!(
                        identity = %self.identity(),
                        error = %error,
                        attempt = failures,
                        "connect attempt failed"
                    );
                    self.entry
                        .mark_closed(generation, DisconnectReason::ConnectionClosed);
                    self.entry
                        .record_failure(self.epoch, failures, Some(error.to_string()));
                },
            }

            if !self.ctx.reconnect.allows(failures) {
                warn!(identity = %self.identity(), attempts = failures, "giving up reconnecting");
                return self.finish(TerminalReason::RetriesExhausted, None);
            }

            let delay = if connect_failed {
                self.ctx.reconnect.failure_delay_for(failures)
            } else {
                self.ctx.reconnect.delay_for(failures)
            };
            if !delay.is_zero() {
                debug!(identity = %self.identity(), delay_ms = delay.as_millis() as u64, "backing off");
                tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => return self.finish(TerminalReason::Stopped, None),
                    () = tokio::time::sleep(delay) => {},
                }
            }
        }
    }

    /// One connect-and-dispatch cycle. The handle is always closed before
    /// this returns.
    async fn attempt(&self, generation: u64, dispatcher: &mut Dispatcher) -> SessionEnd {
        let credentials = match self.ctx.store.load(self.identity()).await {
            Ok(credentials) => credentials,
            Err(e) => return SessionEnd::failed(e),
        };

        let mut handle = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return SessionEnd::cancelled(),
            connected = self.ctx.connector.connect(&self.entry, generation, credentials) => {
                match connected {
                    Ok(handle) => handle,
                    Err(e) => return SessionEnd::failed(e),
                }
            },
        };

        let end = dispatcher.run(&mut handle, &self.cancel).await;
        handle.close().await;
        end
    }

    fn finish(&self, reason: TerminalReason, error: Option<String>) -> TerminalReason {
        self.entry.mark_terminal(self.epoch, reason, error);
        info!(identity = %self.identity(), reason = %reason, "session supervisor stopped");
        reason
    }
}
