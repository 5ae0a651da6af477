use thiserror::Error;

use crate::parser::ParseError;

/// Central error type for the mazurka HTTP engine.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0:?}")]
    Parse(ParseError),

    #[error("route already registered with a different action: {0}")]
    RouteConflict(String),

    #[error("rewrite destination references unknown capture <{0}>")]
    UnknownCapture(String),

    #[error("invalid route pattern: {0}")]
    InvalidPattern(String),

    #[error("worker pool queue is full")]
    PoolFull,

    #[error("authentication error: {0}")]
    Auth(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl From<ParseError> for CoreError {
    fn from(e: ParseError) -> Self {
        CoreError::Parse(e)
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
