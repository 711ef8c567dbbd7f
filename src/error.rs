use std::result::Result as StdResult;

use crate::protocol::DecodeError;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// A write to the structured event log failed. Fatal: the whole point of
    /// the honeypot is the log, so workers that hit this trigger shutdown.
    #[error("event log write failed: {0}")]
    LogWrite(std::io::Error),

    #[error("sandbox error: {0}")]
    Sandbox(String),

    #[error("{0}")]
    Msg(String),
}

pub type Result<T> = StdResult<T, Error>;
