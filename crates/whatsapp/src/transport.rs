//! Boundary to the protocol implementation.
//!
//! The core never speaks the wire protocol itself. A [`Transport`] opens
//! sessions and hands back a [`SessionLink`] for outbound calls plus a bounded
//! channel of [`TransportEvent`]s in the order the service produced them.

use std::sync::Arc;

use {anyhow::Result, async_trait::async_trait, tokio::sync::mpsc};

use crate::{
    identity::Identity,
    types::{CredentialBundle, MessageKey, ProtocolVersion, TransportEvent},
};

/// Parameters for opening one session.
#[derive(Debug, Clone)]
pub struct OpenRequest {
    pub identity: Identity,
    pub credentials: CredentialBundle,
    pub version: ProtocolVersion,
    /// Client identification: `[name, browser, version]`.
    pub browser: [String; 3],
    /// Capacity of the returned event channel.
    pub event_buffer: usize,
}

/// Opens sessions against the messaging service.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Ask the service for the latest client protocol version.
    async fn negotiate_version(&self) -> Result<ProtocolVersion>;

    /// Open a socket with the given credentials.
    async fn open_session(
        &self,
        request: OpenRequest,
    ) -> Result<(Arc<dyn SessionLink>, mpsc::Receiver<TransportEvent>)>;
}

/// Outbound half of one live session.
#[async_trait]
pub trait SessionLink: Send + Sync {
    /// Request a pairing code for an unregistered session.
    async fn request_pairing_code(&self, phone_number: &str) -> Result<String>;

    /// React to the message identified by `key` in chat `to`.
    async fn send_reaction(&self, to: &str, symbol: &str, key: &MessageKey) -> Result<()>;

    /// Send a plain text message to `to`.
    async fn send_message(&self, to: &str, text: &str) -> Result<()>;

    /// Close the socket. No further events are delivered afterwards.
    async fn close(&self);
}
