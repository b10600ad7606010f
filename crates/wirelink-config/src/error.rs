use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("link cycle at '{0}': resolution exceeded depth limit")]
    LinkCycle(String),

    #[error("invalid link target '{0}': {1}")]
    InvalidLink(String, &'static str),

    #[error("key already exists: '{0}'")]
    KeyExists(String),

    #[error("invalid browse mask '{0}': at most one '**' is allowed")]
    InvalidMask(String),

    #[error("invalid url '{0}': {1}")]
    InvalidUrl(String, &'static str),

    #[error("invalid props '{0}': {1}")]
    InvalidProps(String, &'static str),

    #[error(transparent)]
    Value(#[from] wirelink_core::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
