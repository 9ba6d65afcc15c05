//! Error taxonomy of the room runtime
//!
//! - [`ConfigError`]: the game definition or configuration is unusable;
//!   surfaced once, at room construction.
//! - [`RuntimeError`]: everything that can go wrong afterwards. Usage errors
//!   (unknown action, host-only call from a client, rejected lobby request,
//!   malformed patch from the wire) are only returned in strict mode and
//!   logged otherwise. Invariant violations such as an empty patch path are
//!   always returned.

use crate::transport::TransportError;
use shared::{PatchError, ValueKind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("game definition has no setup function")]
    MissingSetup,
    #[error("action names must not be empty")]
    EmptyActionName,
    #[error("action `{0}` uses the reserved lobby namespace")]
    ReservedActionName(String),
    #[error("action `{0}` is registered twice")]
    DuplicateAction(String),
    #[error("lobby min_players must be at least 1")]
    ZeroMinPlayers,
    #[error("lobby min_players ({min}) exceeds max_players ({max})")]
    PlayerBounds { min: usize, max: usize },
    #[error("{0} must be non-zero")]
    ZeroInterval(&'static str),
    #[error("initial state must be a map when the lobby is enabled, setup returned {0}")]
    NonMapState(ValueKind),
    #[error("setup produced an unserializable state: {0}")]
    Setup(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(
        "unknown action `{name}`{}; valid actions: [{}]",
        .suggestion.as_ref().map(|s| format!(" (did you mean `{}`?)", s)).unwrap_or_default(),
        .known.join(", ")
    )]
    UnknownAction {
        name: String,
        suggestion: Option<String>,
        known: Vec<String>,
    },
    #[error("`{operation}` may only be called on the host")]
    NotHost { operation: &'static str },
    #[error("lobby rejected `{action}`: {reason}")]
    LobbyRejected { action: String, reason: String },
    #[error("action `{0}` panicked while applying")]
    ActionPanicked(String),
    #[error(transparent)]
    Patch(#[from] PatchError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("state conversion failed: {0}")]
    State(#[from] serde_json::Error),
    #[error("room has been destroyed")]
    Destroyed,
    #[error("timed out waiting for {wanted} players ({present} present)")]
    Timeout { wanted: usize, present: usize },
}

impl RuntimeError {
    /// Whether this error signals a programming error rather than a
    /// recoverable runtime condition
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, RuntimeError::Patch(PatchError::EmptyPath))
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
