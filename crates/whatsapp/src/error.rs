use crate::identity::Identity;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid phone number {0:?}: expected 7 to 15 digits")]
    InvalidIdentity(String),

    #[error("credential store error: {0}")]
    Store(#[from] sled::Error),

    #[error("credential encoding error: {0}")]
    Codec(#[from] postcard::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Transport(#[from] anyhow::Error),

    #[error("pairing code request failed: {0}")]
    Pairing(String),

    #[error("timed out waiting for a pairing code")]
    PairingTimeout,

    #[error("pairing attempt was superseded by a newer request")]
    Superseded,

    #[error("session for {0} is already connected")]
    AlreadyConnected(Identity),

    #[error("a session for {0} is already running")]
    AlreadyRunning(Identity),

    #[error("session handle was replaced by a newer connection")]
    StaleHandle,

    #[error("reaction set must contain at least one symbol")]
    EmptyReactionSet,

    #[error("session stopped")]
    Stopped,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
