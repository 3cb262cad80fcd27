//! WhatsApp session lifecycle: pairing, credential persistence, automatic
//! reconnection and status auto-reactions.
//!
//! Flow for one phone number:
//! 1. [`SessionManager::pair`] or [`SessionManager::start`] spawns a supervisor.
//! 2. The supervisor loads credentials from the [`CredentialStore`] and asks
//!    the [`Connector`] for a [`SessionHandle`] (requesting a pairing code if
//!    the number is not registered yet).
//! 3. The dispatcher consumes the handle's events in order: credential
//!    updates are persisted, status broadcasts get a random reaction.
//! 4. When the connection closes the supervisor reconnects, unless the
//!    account was logged out.
//!
//! The wire protocol itself lives behind the [`Transport`] trait;
//! [`BridgeTransport`] talks to an external protocol bridge over WebSocket.

pub mod backoff;
pub mod bridge;
pub mod connector;
pub mod dedupe;
pub mod dispatch;
pub mod error;
pub mod identity;
pub mod manager;
pub mod react;
pub mod registry;
pub mod store;
pub mod supervisor;
#[cfg(any(test, feature = "test-support"))]
#[allow(clippy::expect_used, clippy::unwrap_used)]
pub mod testing;
pub mod transport;
pub mod types;

pub use {
    backoff::ReconnectPolicy,
    bridge::BridgeTransport,
    connector::{Connector, ConnectorOptions, SessionHandle},
    error::{Error, Result},
    identity::Identity,
    manager::{SessionManager, SessionOptions},
    react::ReactionPolicy,
    registry::{PairingView, SessionRegistry, SessionSnapshot, SessionState, TerminalReason},
    store::CredentialStore,
    transport::{OpenRequest, SessionLink, Transport},
    types::{
        ConnectionState, CredentialBundle, CredentialUpdate, DisconnectReason, InboundEvent,
        MessageContent, MessageKey, ProtocolVersion, STATUS_BROADCAST_JID, TransportEvent,
    },
};
