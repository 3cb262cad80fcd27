use {
    rand::Rng,
    tracing::{info, warn},
};

use crate::{
    connector::SessionHandle,
    error::{Error, Result},
    types::InboundEvent,
};

/// Picks a reaction symbol uniformly from a fixed, non-empty set and sends it.
#[derive(Debug, Clone)]
pub struct ReactionPolicy {
    symbols: Vec<String>,
}

impl ReactionPolicy {
    pub fn new<I, S>(symbols: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let symbols: Vec<String> = symbols
            .into_iter()
            .map(Into::into)
            .filter(|s: &String| !s.trim().is_empty())
            .collect();
        if symbols.is_empty() {
            return Err(Error::EmptyReactionSet);
        }
        Ok(Self { symbols })
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    pub fn pick(&self) -> &str {
        self.pick_with(&mut rand::rng())
    }

    pub fn pick_with<R: Rng>(&self, rng: &mut R) -> &str {
        &self.symbols[rng.random_range(0..self.symbols.len())]
    }

    /// Send one reaction to `event`, addressed to its own chat. Failures are
    /// logged and swallowed. Returns whether the reaction went out.
    pub async fn react(&self, handle: &SessionHandle, event: &InboundEvent) -> bool {
        let symbol = self.pick().to_string();
        match handle
            .send_reaction(&event.key.remote_jid, &symbol, &event.key)
            .await
        {
            Ok(()) => {
                info!(
                    identity = %handle.identity(),
                    message_id = %event.key.id,
                    reaction = %symbol,
                    "reacted to status"
                );
                true
            },
            Err(e) => {
                warn!(
                    identity = %handle.identity(),
                    message_id = %event.key.id,
                    error = %e,
                    "failed to react"
                );
                false
            },
        }
    }
}
