use std::io;

use config::ConfigError;
use table::TableError;
use thiserror::Error;

/// Errors returned by the engine.
#[derive(Debug, Error)]
pub enum GravelError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A table could not be built, opened or read.
    #[error(transparent)]
    Table(#[from] TableError),

    /// The manifest is malformed or an update to it was refused.
    #[error("manifest: {0}")]
    Manifest(String),

    /// The batch was already committed or discarded.
    #[error("batch is sealed")]
    SealedBatch,

    /// A single batch must fit in one memtable generation.
    #[error("batch of {size} bytes exceeds max table size {limit}")]
    BatchTooLarge { size: u64, limit: u64 },

    #[error("invalid shard count {0}")]
    InvalidShards(u64),

    #[error("engine is closed")]
    Closed,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl GravelError {
    pub(crate) fn manifest(msg: impl Into<String>) -> Self {
        GravelError::Manifest(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, GravelError>;
