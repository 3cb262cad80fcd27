use std::{sync::Arc, time::Instant};

use statusbot_whatsapp::SessionManager;

/// Shared state behind every handler.
pub struct GatewayState {
    pub manager: Arc<SessionManager>,
    pub version: String,
    pub started_at: Instant,
}

impl GatewayState {
    pub fn new(manager: Arc<SessionManager>) -> Arc<Self> {
        Arc::new(Self {
            manager,
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: Instant::now(),
        })
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
