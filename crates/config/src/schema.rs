//! Config schema types (HTTP server, WhatsApp sessions, reconnect policy).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusbotConfig {
    pub server: ServerConfig,
    pub whatsapp: WhatsAppConfig,
}

impl StatusbotConfig {
    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> anyhow::Result<()> {
        let wa = &self.whatsapp;
        if wa.reactions.iter().all(|r| r.trim().is_empty()) {
            anyhow::bail!("whatsapp.reactions must contain at least one symbol");
        }
        if wa.event_buffer == 0 {
            anyhow::bail!("whatsapp.event_buffer must be greater than zero");
        }
        if wa.reconnect.multiplier < 1.0 {
            anyhow::bail!(
                "whatsapp.reconnect.multiplier must be >= 1.0 (got {})",
                wa.reconnect.multiplier
            );
        }
        if wa.reconnect.max_delay_ms < wa.reconnect.initial_delay_ms {
            anyhow::bail!("whatsapp.reconnect.max_delay_ms must be >= initial_delay_ms");
        }
        Ok(())
    }
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 3000,
        }
    }
}

/// WhatsApp session settings shared by every managed phone number.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WhatsAppConfig {
    /// WebSocket endpoint of the protocol bridge.
    pub bridge_url: String,

    /// Root directory for per-number credential stores.
    /// Defaults to `~/.statusbot/whatsapp`.
    pub data_dir: Option<PathBuf>,

    /// Wait after the socket opens before requesting a pairing code.
    /// Requests sent earlier race the handshake and get rejected.
    pub pairing_grace_ms: u64,

    /// How long `/pair` waits for the code to arrive.
    pub pair_timeout_secs: u64,

    /// Reaction symbols picked at random for each status update.
    pub reactions: Vec<String>,

    /// Send `connect_message` to the account's own chat on first connect.
    pub notify_on_connect: bool,
    pub connect_message: String,

    /// Client identification: `[name, browser, version]`.
    pub browser: [String; 3],

    /// Protocol version used when the bridge cannot report the latest one.
    pub fallback_version: [u32; 3],

    /// Capacity of each session's event channel.
    pub event_buffer: usize,

    /// Redelivered status updates inside this window are not reacted to again.
    pub dedupe_ttl_secs: u64,

    /// Start sessions for every paired number found on disk at startup.
    pub resume_on_start: bool,

    pub reconnect: ReconnectConfig,
}

impl Default for WhatsAppConfig {
    fn default() -> Self {
        Self {
            bridge_url: "ws://127.0.0.1:8787".into(),
            data_dir: None,
            pairing_grace_ms: 1500,
            pair_timeout_secs: 30,
            reactions: ["🔥", "💯", "💥", "😎", "❤️"]
                .into_iter()
                .map(String::from)
                .collect(),
            notify_on_connect: false,
            connect_message: "✅ Status bot connected. Auto-react is enabled.".into(),
            browser: ["Status-Bot".into(), "Chrome".into(), "1.0".into()],
            fallback_version: [2, 3000, 1015901307],
            event_buffer: 64,
            dedupe_ttl_secs: 600,
            resume_on_start: true,
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Reconnect backoff. The defaults retry a closed connection immediately
/// and forever.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Minimum wait after an attempt that never connected (bridge down,
    /// refused open).
    pub failure_delay_ms: u64,
    /// Give up after this many consecutive failed attempts. `None` never gives up.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 0,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            failure_delay_ms: 1_000,
            max_attempts: None,
        }
    }
}
