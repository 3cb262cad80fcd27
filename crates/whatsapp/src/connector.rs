//! Opens one transport session and runs the pairing sub-protocol.

use std::{sync::Arc, time::Duration};

use {
    tokio::sync::mpsc,
    tracing::{debug, info, warn},
};

use crate::{
    error::{Error, Result},
    identity::Identity,
    registry::SessionEntry,
    transport::{OpenRequest, SessionLink, Transport},
    types::{CredentialBundle, DisconnectReason, MessageKey, ProtocolVersion, TransportEvent},
};

/// Connector settings.
#[derive(Debug, Clone)]
pub struct ConnectorOptions {
    /// Socket stabilisation wait before a pairing code may be requested.
    pub pairing_grace: Duration,
    pub browser: [String; 3],
    pub fallback_version: ProtocolVersion,
    pub event_buffer: usize,
}

/// One live connection. Superseded handles refuse to send.
pub struct SessionHandle {
    identity: Identity,
    generation: u64,
    registered: bool,
    link: Arc<dyn SessionLink>,
    events: mpsc::Receiver<TransportEvent>,
    entry: Arc<SessionEntry>,
}

impl SessionHandle {
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether the session was opened with registered credentials.
    pub fn registered(&self) -> bool {
        self.registered
    }

    pub fn is_current(&self) -> bool {
        self.entry.is_current(self.generation)
    }

    fn ensure_current(&self) -> Result<()> {
        if self.is_current() {
            Ok(())
        } else {
            Err(Error::StaleHandle)
        }
    }

    pub async fn send_reaction(&self, to: &str, symbol: &str, key: &MessageKey) -> Result<()> {
        self.ensure_current()?;
        self.link.send_reaction(to, symbol, key).await?;
        Ok(())
    }

    pub async fn send_message(&self, to: &str, text: &str) -> Result<()> {
        self.ensure_current()?;
        self.link.send_message(to, text).await?;
        Ok(())
    }

    pub(crate) fn mark_open(&self) -> bool {
        self.entry.mark_open(self.generation)
    }

    pub(crate) fn mark_closed(&self, reason: DisconnectReason) -> bool {
        self.entry.mark_closed(self.generation, reason)
    }

    /// Next transport event, or `None` once the transport dropped the channel.
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }

    pub async fn close(self) {
        self.link.close().await;
    }
}

/// Builds [`SessionHandle`]s from stored credentials.
pub struct Connector {
    transport: Arc<dyn Transport>,
    options: ConnectorOptions,
}

impl Connector {
    pub fn new(transport: Arc<dyn Transport>, options: ConnectorOptions) -> Self {
        Self { transport, options }
    }

    /// Open a session for `entry`'s number as connection `generation`.
    ///
    /// Unregistered credentials go through pairing: after the grace wait a
    /// code is requested and published on the entry.
    pub async fn connect(
        &self,
        entry: &Arc<SessionEntry>,
        generation: u64,
        credentials: CredentialBundle,
    ) -> Result<SessionHandle> {
        let identity = entry.identity().clone();

        let version = match self.transport.negotiate_version().await {
            Ok(version) => version,
            Err(e) => {
                warn!(
                    identity = %identity,
                    error = %e,
                    fallback = %self.options.fallback_version,
                    "version negotiation failed, using fallback"
                );
                self.options.fallback_version
            },
        };
        debug!(identity = %identity, generation, version = %version, "opening session");

        let registered = credentials.registered;
        let (link, events) = self
            .transport
            .open_session(OpenRequest {
                identity: identity.clone(),
                credentials,
                version,
                browser: self.options.browser.clone(),
                event_buffer: self.options.event_buffer,
            })
            .await?;

        let handle = SessionHandle {
            identity,
            generation,
            registered,
            link,
            events,
            entry: Arc::clone(entry),
        };

        if !registered && let Err(e) = self.request_pairing_code(&handle).await {
            handle.close().await;
            return Err(e);
        }
        Ok(handle)
    }

    async fn request_pairing_code(&self, handle: &SessionHandle) -> Result<()> {
        // Asking before the handshake settles gets the request rejected.
        tokio::time::sleep(self.options.pairing_grace).await;

        let code = handle
            .link
            .request_pairing_code(handle.identity.as_str())
            .await
            .map_err(|e| Error::Pairing(format!("{e:#}")))?;

        if handle.entry.publish_code(handle.generation, &code) {
            info!(identity = %handle.identity, code = %code, "pairing code issued");
        } else {
            debug!(identity = %handle.identity, "pairing code arrived for a superseded attempt");
        }
        Ok(())
    }
}
