use std::io;

use thiserror::Error;

/// Coarse classification of [`Error`] values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Opening, writing to or closing the link failed.
    Transport,
    /// No acknowledgement arrived within the retry budget.
    ProtocolTimeout,
    /// Rejected before any I/O was attempted.
    InvalidArgument,
    /// The link is not in the right lifecycle state for the operation.
    InvalidState,
    /// The manager was closed while the operation was pending.
    Closed,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("no acknowledgement from {address:#04x} for id {id} after {attempts} attempts")]
    Timeout { address: u8, id: u8, attempts: u32 },

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("transport is not open")]
    NotOpen,

    #[error("transport is already open")]
    AlreadyOpen,

    #[error("manager closed while waiting for an acknowledgement")]
    Closed,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Transport(_) => ErrorKind::Transport,
            Error::Timeout { .. } => ErrorKind::ProtocolTimeout,
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::NotOpen | Error::AlreadyOpen => ErrorKind::InvalidState,
            Error::Closed => ErrorKind::Closed,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
