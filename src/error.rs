//! Error types for the structured writer.
//!
//! Two kinds of failures flow through the crate: static configuration errors
//! raised by the validator before any data moves, and dynamic errors raised
//! while dispatching to the column-writer sink. Sink errors are surfaced to
//! the caller unchanged; the writer never retries or rewrites them.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, WriterError>;

#[derive(Debug, Error)]
pub enum WriterError {
    /// A configuration failed validation. The message is stable and callers
    /// may match on its content.
    #[error("{0}")]
    InvalidArgument(String),

    /// A cell reference selected for an item had already been reclaimed by
    /// the sink. The buffer-length gate makes this unreachable for correctly
    /// configured writers.
    #[error("cell reference for column {column} is no longer alive")]
    StaleReference { column: usize },

    /// An error returned by the column-writer sink, passed through verbatim.
    #[error(transparent)]
    Sink(#[from] anyhow::Error),
}
