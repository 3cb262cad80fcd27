//! Wire-level types exchanged with the transport.

use std::{collections::BTreeMap, fmt};

use {
    base64::{Engine, engine::general_purpose::STANDARD as BASE64},
    serde::{Deserialize, Deserializer, Serialize, Serializer},
};

/// Routing key of the status broadcast channel.
pub const STATUS_BROADCAST_JID: &str = "status@broadcast";

// ── Protocol version ─────────────────────────────────────────────────────────

/// Web client protocol version, e.g. `2.3000.1015901307`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolVersion(pub [u32; 3]);

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c] = self.0;
        write!(f, "{a}.{b}.{c}")
    }
}

// ── Connection state ─────────────────────────────────────────────────────────

/// Why the service closed a connection.
///
/// Only [`DisconnectReason::LoggedOut`] is permanent; every other reason is
/// worth reconnecting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    LoggedOut,
    Forbidden,
    ConnectionLost,
    MultideviceMismatch,
    ConnectionClosed,
    ConnectionReplaced,
    BadSession,
    Unavailable,
    RestartRequired,
    Other(u16),
}

impl DisconnectReason {
    pub fn from_status_code(code: u16) -> Self {
        match code {
            401 => Self::LoggedOut,
            403 => Self::Forbidden,
            408 => Self::ConnectionLost,
            411 => Self::MultideviceMismatch,
            428 => Self::ConnectionClosed,
            440 => Self::ConnectionReplaced,
            500 => Self::BadSession,
            503 => Self::Unavailable,
            515 => Self::RestartRequired,
            other => Self::Other(other),
        }
    }

    pub fn status_code(self) -> u16 {
        match self {
            Self::LoggedOut => 401,
            Self::Forbidden => 403,
            Self::ConnectionLost => 408,
            Self::MultideviceMismatch => 411,
            Self::ConnectionClosed => 428,
            Self::ConnectionReplaced => 440,
            Self::BadSession => 500,
            Self::Unavailable => 503,
            Self::RestartRequired => 515,
            Self::Other(code) => code,
        }
    }

    pub fn is_logged_out(self) -> bool {
        self == Self::LoggedOut
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::LoggedOut => "logged out",
            Self::Forbidden => "forbidden",
            Self::ConnectionLost => "connection lost",
            Self::MultideviceMismatch => "multi-device mismatch",
            Self::ConnectionClosed => "connection closed",
            Self::ConnectionReplaced => "connection replaced",
            Self::BadSession => "bad session",
            Self::Unavailable => "service unavailable",
            Self::RestartRequired => "restart required",
            Self::Other(code) => return write!(f, "status {code}"),
        };
        f.write_str(text)
    }
}

/// Connection state transitions emitted by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed(DisconnectReason),
}

// ── Credentials ──────────────────────────────────────────────────────────────

/// Opaque key material. Base64 in human-readable formats, raw bytes otherwise.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct KeyMaterial(pub Vec<u8>);

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyMaterial({} bytes)", self.0.len())
    }
}

impl Serialize for KeyMaterial {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&BASE64.encode(&self.0))
        } else {
            serializer.serialize_bytes(&self.0)
        }
    }
}

impl<'de> Deserialize<'de> for KeyMaterial {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let encoded = String::deserialize(deserializer)?;
            BASE64
                .decode(encoded.as_bytes())
                .map(Self)
                .map_err(serde::de::Error::custom)
        } else {
            Vec::<u8>::deserialize(deserializer).map(Self)
        }
    }
}

/// Everything needed to resume a session without pairing again.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialBundle {
    /// Set once a device has accepted the pairing code.
    #[serde(default)]
    pub registered: bool,
    /// Own address assigned by the service after pairing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub me: Option<String>,
    /// Signing, identity and session keys by name.
    #[serde(default)]
    pub keys: BTreeMap<String, KeyMaterial>,
}

/// Partial credential change. Absent fields are left untouched; a key mapped
/// to `None` is deleted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registered: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub me: Option<String>,
    #[serde(default)]
    pub keys: BTreeMap<String, Option<KeyMaterial>>,
}

impl CredentialBundle {
    /// Overwrite semantics: applying the same update twice is a no-op the
    /// second time.
    pub fn apply(&mut self, update: &CredentialUpdate) {
        if let Some(registered) = update.registered {
            self.registered = registered;
        }
        if let Some(me) = &update.me {
            self.me = Some(me.clone());
        }
        for (name, value) in &update.keys {
            match value {
                Some(material) => {
                    self.keys.insert(name.clone(), material.clone());
                },
                None => {
                    self.keys.remove(name);
                },
            }
        }
    }
}

// ── Inbound messages ─────────────────────────────────────────────────────────

/// Addressing key of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageKey {
    pub remote_jid: String,
    pub id: String,
    #[serde(default)]
    pub from_me: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant: Option<String>,
}

/// Message payload, reduced to what the bot needs to tell types apart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    Text {
        text: String,
    },
    Image {
        #[serde(default)]
        caption: Option<String>,
    },
    Video {
        #[serde(default)]
        caption: Option<String>,
    },
    Audio,
    Ephemeral {
        message: Box<MessageContent>,
    },
    #[serde(other)]
    Unsupported,
}

/// Content type tag of a [`MessageContent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Text,
    Image,
    Video,
    Audio,
    Ephemeral,
    Unsupported,
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Ephemeral => "ephemeral",
            Self::Unsupported => "unsupported",
        })
    }
}

impl MessageContent {
    pub fn content_type(&self) -> ContentType {
        match self {
            Self::Text { .. } => ContentType::Text,
            Self::Image { .. } => ContentType::Image,
            Self::Video { .. } => ContentType::Video,
            Self::Audio => ContentType::Audio,
            Self::Ephemeral { .. } => ContentType::Ephemeral,
            Self::Unsupported => ContentType::Unsupported,
        }
    }

    /// Strip one level of ephemeral envelope.
    pub fn unwrap_ephemeral(&self) -> &MessageContent {
        match self {
            Self::Ephemeral { message } => message,
            other => other,
        }
    }
}

/// A message-like notification delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundEvent {
    pub key: MessageKey,
    #[serde(default)]
    pub message: Option<MessageContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_name: Option<String>,
}

// ── Transport events ─────────────────────────────────────────────────────────

/// Notifications a live session delivers, in transport order.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connection(ConnectionState),
    Credentials(CredentialUpdate),
    Messages(Vec<InboundEvent>),
}
