//! Per-session event loop.
//!
//! Consumes a [`SessionHandle`]'s events strictly in order: connection
//! changes update the registry, credential changes are persisted before the
//! next event is looked at, and status broadcasts go to the reaction policy.

use std::{sync::Arc, time::Duration};

use {
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, trace, warn},
};

use crate::{
    connector::SessionHandle,
    dedupe::DedupeCache,
    error::Error,
    react::ReactionPolicy,
    store::CredentialStore,
    types::{
        ConnectionState, ContentType, DisconnectReason, InboundEvent, STATUS_BROADCAST_JID,
        TransportEvent,
    },
};

/// What to do with an inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// A status update, with its content type after unwrapping one
    /// ephemeral envelope.
    StatusBroadcast(ContentType),
    Ignore,
}

/// Route on the chat the event was posted to. Only the status broadcast
/// chat qualifies; the content type is informational.
pub fn route(event: &InboundEvent) -> Route {
    if event.key.remote_jid != STATUS_BROADCAST_JID {
        return Route::Ignore;
    }
    let content_type = event
        .message
        .as_ref()
        .map_or(ContentType::Unsupported, |m| {
            m.unwrap_ephemeral().content_type()
        });
    Route::StatusBroadcast(content_type)
}

/// How one session ended.
#[derive(Debug)]
pub(crate) enum EndCause {
    Closed(DisconnectReason),
    Cancelled,
    Failed(Error),
}

#[derive(Debug)]
pub(crate) struct SessionEnd {
    /// The connection reached `Open` before it ended.
    pub opened: bool,
    pub cause: EndCause,
}

impl SessionEnd {
    pub(crate) fn failed(error: Error) -> Self {
        Self {
            opened: false,
            cause: EndCause::Failed(error),
        }
    }

    pub(crate) fn cancelled() -> Self {
        Self {
            opened: false,
            cause: EndCause::Cancelled,
        }
    }
}

/// Event loop state that outlives individual connections of one supervisor.
pub(crate) struct Dispatcher {
    store: Arc<CredentialStore>,
    policy: Arc<ReactionPolicy>,
    dedupe: DedupeCache,
    /// Sent to the account's own chat on the first open, then cleared.
    greeting: Option<String>,
}

impl Dispatcher {
    pub(crate) fn new(
        store: Arc<CredentialStore>,
        policy: Arc<ReactionPolicy>,
        dedupe_ttl: Duration,
        greeting: Option<String>,
    ) -> Self {
        Self {
            store,
            policy,
            dedupe: DedupeCache::new(dedupe_ttl),
            greeting,
        }
    }

    /// Drive `handle` until it closes, fails to persist credentials, or
    /// `cancel` fires. Cancellation also interrupts the work for the current
    /// event.
    pub(crate) async fn run(
        &mut self,
        handle: &mut SessionHandle,
        cancel: &CancellationToken,
    ) -> SessionEnd {
        let mut opened = false;
        loop {
            let event = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    return SessionEnd { opened, cause: EndCause::Cancelled };
                },
                event = handle.next_event() => event,
            };
            let Some(event) = event else {
                // Transport dropped the channel without a close notification.
                let reason = DisconnectReason::ConnectionLost;
                handle.mark_closed(reason);
                return SessionEnd {
                    opened,
                    cause: EndCause::Closed(reason),
                };
            };

            if matches!(event, TransportEvent::Connection(ConnectionState::Open)) {
                opened = true;
            }
            let ended = tokio::select! {
                biased;
                () = cancel.cancelled() => Some(EndCause::Cancelled),
                ended = self.handle_event(handle, event) => ended,
            };
            if let Some(cause) = ended {
                return SessionEnd { opened, cause };
            }
        }
    }

    /// Apply one event. Returns the cause if it ends the session.
    async fn handle_event(
        &mut self,
        handle: &SessionHandle,
        event: TransportEvent,
    ) -> Option<EndCause> {
        match event {
            TransportEvent::Connection(ConnectionState::Connecting) => {
                debug!(identity = %handle.identity(), "transport connecting");
            },
            TransportEvent::Connection(ConnectionState::Open) => {
                if handle.mark_open() {
                    info!(identity = %handle.identity(), generation = handle.generation(), "connected");
                }
                self.greet(handle).await;
            },
            TransportEvent::Connection(ConnectionState::Closed(reason)) => {
                handle.mark_closed(reason);
                return Some(EndCause::Closed(reason));
            },
            TransportEvent::Credentials(update) => {
                if let Err(e) = self.store.on_update(handle.identity(), &update).await {
                    warn!(identity = %handle.identity(), error = %e, "failed to persist credentials");
                    return Some(EndCause::Failed(e));
                }
            },
            TransportEvent::Messages(events) => {
                for event in &events {
                    self.dispatch(handle, event).await;
                }
            },
        }
        None
    }

    async fn greet(&mut self, handle: &SessionHandle) {
        let Some(text) = self.greeting.take() else {
            return;
        };
        let own_chat = handle.identity().jid();
        if let Err(e) = handle.send_message(&own_chat, &text).await {
            warn!(identity = %handle.identity(), error = %e, "failed to send connect notification");
        }
    }

    async fn dispatch(&mut self, handle: &SessionHandle, event: &InboundEvent) {
        let content_type = match route(event) {
            Route::Ignore => {
                trace!(chat = %event.key.remote_jid, "ignoring message");
                return;
            },
            Route::StatusBroadcast(content_type) => content_type,
        };

        let key = format!(
            "{}/{}/{}",
            event.key.remote_jid,
            event.key.participant.as_deref().unwrap_or_default(),
            event.key.id
        );
        if self.dedupe.check_and_insert(&key) {
            debug!(message_id = %event.key.id, "status already handled");
            return;
        }

        debug!(
            identity = %handle.identity(),
            message_id = %event.key.id,
            content_type = %content_type,
            "status update"
        );
        self.policy.react(handle, event).await;
    }
}
