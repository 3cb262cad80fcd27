//! Gateway: HTTP surface for pairing and inspecting WhatsApp sessions.
//!
//! Lifecycle:
//! 1. Build the bridge transport and session manager from config
//! 2. Resume every number with registered credentials
//! 3. Serve the pairing page, `/pair` and the JSON API
//! 4. On Ctrl-C drain HTTP connections, then stop every supervisor
//!
//! All session logic lives in `statusbot-whatsapp`; handlers here only
//! translate between HTTP and [`statusbot_whatsapp::SessionManager`].

pub mod error;
pub mod pages;
pub mod server;
pub mod state;
