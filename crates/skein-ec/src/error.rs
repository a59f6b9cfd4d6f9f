//! Error types for skein-ec

use thiserror::Error;

/// Result type for erasure coding operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while encoding or reconstructing shards
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// Configuration parameters are inconsistent
    #[error("invalid erasure config: {0}")]
    InvalidConfig(String),

    /// Input data has an unusable size
    #[error("invalid data size: {0}")]
    InvalidDataSize(String),

    /// Fewer distinct valid shards than data shards were supplied
    #[error("insufficient shards: have {available} but need {required}")]
    InsufficientShards {
        /// Distinct valid shards supplied
        available: usize,
        /// Data shards required
        required: usize,
    },

    /// A shard index is outside `0..total`
    #[error("shard index {index} out of range for {total} shards")]
    InvalidShardIndex {
        /// Offending index
        index: usize,
        /// Total shard count
        total: usize,
    },

    /// The same shard index was requested or supplied twice
    #[error("duplicate shard index {0}")]
    DuplicateShard(usize),

    /// Shards in one call have different lengths
    #[error("shard size mismatch: expected {expected} bytes, got {actual}")]
    ShardSizeMismatch {
        /// Expected size
        expected: usize,
        /// Actual size
        actual: usize,
    },

    /// Failure inside the encoder
    #[error("encoding error: {0}")]
    EncodingError(String),

    /// Failure inside the decoder
    #[error("decoding error: {0}")]
    DecodingError(String),
}
