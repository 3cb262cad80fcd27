//! Configuration loading and schema.
//!
//! Config files are looked up as `statusbot.{toml,yaml,yml,json}` in the
//! working directory, then in `~/.config/statusbot/`. String values may use
//! `${ENV_VAR}` placeholders.

pub mod env_subst;
pub mod loader;
pub mod schema;

pub use {
    loader::{
        clear_config_dir, config_dir, data_dir, discover_and_load, load_config, set_config_dir,
    },
    schema::{ReconnectConfig, ServerConfig, StatusbotConfig, WhatsAppConfig},
};
