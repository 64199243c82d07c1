use std::fmt;

use thiserror::Error;

/// Unrecoverable presence-layer failures. These always end the session and
/// are never retried by the engine itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalKind {
    /// The same account logged in from another device.
    RemoteLogin,
    /// The presence session was lost and could not be re-established in time.
    SessionLost,
}

impl fmt::Display for FatalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RemoteLogin => write!(f, "account logged in elsewhere"),
            Self::SessionLost => write!(f, "presence session lost"),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RoomError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("mutation rejected: {0}")]
    ConsistencyViolation(String),
    #[error("engine is not ready")]
    NotReady,
    #[error("fatal session failure: {0}")]
    Fatal(FatalKind),
}

impl From<serde_json::Error> for RoomError {
    fn from(e: serde_json::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

pub type RoomResult<T = ()> = Result<T, RoomError>;
