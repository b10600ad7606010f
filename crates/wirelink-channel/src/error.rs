use thiserror::Error;

use wirelink_core::State;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Core(#[from] wirelink_core::Error),

    #[error(transparent)]
    Config(#[from] wirelink_config::Error),

    #[error("unknown protocol: {0}")]
    UnknownProtocol(String),

    #[error("channel '{0}' is already a child")]
    DuplicateChild(String),

    #[error("invalid state for {op}: {state}")]
    InvalidState { op: &'static str, state: State },

    #[error("operation not supported by this channel")]
    NotSupported,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("corrupt data: {0}")]
    Corrupt(String),

    #[error("{0}")]
    Failed(String),
}

impl Error {
    pub fn failed(msg: impl Into<String>) -> Self {
        Error::Failed(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        Error::Corrupt(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
