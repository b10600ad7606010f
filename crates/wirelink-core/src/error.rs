use thiserror::Error;

use crate::state::State;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: State, to: State },

    #[error("invalid {what}: '{value}'")]
    InvalidValue { what: &'static str, value: String },
}

impl Error {
    pub fn invalid_value(what: &'static str, value: impl Into<String>) -> Self {
        Error::InvalidValue {
            what,
            value: value.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
