use std::io;

use thiserror::Error;

/// Central error type for server construction and startup.
///
/// Per-connection failures never surface here: worker tasks handle them by
/// closing or re-arming the connection.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("database error: {0}")]
    Sql(#[from] mysql::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ServerError>;
