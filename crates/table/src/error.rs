use std::io;

use thiserror::Error;

/// Errors raised while building, opening or reading a table file.
#[derive(Debug, Error)]
pub enum TableError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Header magic/codec mismatch, bad checksum, index out of bounds.
    #[error("corrupt table {file}: {reason}")]
    Corrupt { file: String, reason: String },

    /// A record ran past the end of the data segment.
    #[error("incomplete table file {0}: record truncated")]
    IncompleteFile(String),

    #[error("invalid table file name: {0:?}")]
    InvalidFileName(String),

    /// More than 255 records landed in one hash bucket even after resizing.
    #[error("hash bucket overflow: {0} records in one bucket")]
    BucketOverflow(usize),

    /// The table exceeds one of the format's fixed-width fields.
    #[error("table too large: {0}")]
    TooLarge(String),

    /// The minimal perfect hash could not be built for this key set.
    #[error("could not build a perfect hash over {0} keys")]
    PerfectHash(usize),

    #[error("b-tree error: {0}")]
    BTree(#[from] redb::Error),

    /// The table was used after [`close`](crate::TableReader::close).
    #[error("table {0} is closed")]
    Closed(String),
}

impl TableError {
    pub(crate) fn corrupt(file: &str, reason: impl Into<String>) -> Self {
        TableError::Corrupt {
            file: file.to_string(),
            reason: reason.into(),
        }
    }
}

/// Converts any of redb's per-operation error types.
pub(crate) fn redb_err<E: Into<redb::Error>>(e: E) -> TableError {
    TableError::BTree(e.into())
}

pub type Result<T> = std::result::Result<T, TableError>;
