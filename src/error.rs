use std::path::PathBuf;

use thiserror::Error;

use crate::storage::index::{BlockRange, ChunkId};

#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Index at {path:?} is corrupt, manual repair required: {reason}")]
    CorruptIndex { path: PathBuf, reason: String },

    #[error("Chunk '{id}' already recorded as {recorded}, refusing to overwrite with {attempted}")]
    InconsistentChunk {
        id: ChunkId,
        recorded: BlockRange,
        attempted: BlockRange,
    },

    #[error("Chunk '{0}' is not in the index")]
    UnknownChunk(ChunkId),

    #[error("Failed to write chunk '{id}': {source}")]
    ChunkWrite {
        id: ChunkId,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read chunk '{id}': {reason}")]
    ChunkRead { id: ChunkId, reason: String },

    #[error(
        "Fetch aborted at blocks {floor}..={end_block} after {attempts} attempt(s): {reason}"
    )]
    FetchAborted {
        end_block: u64,
        floor: u64,
        attempts: u32,
        reason: String,
    },

    #[error("Source error: {0}")]
    Source(String),

    #[error("Consolidated output error: {0}")]
    Output(String),
}

pub type Result<T> = std::result::Result<T, HarvestError>;
