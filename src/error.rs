//! Crate-wide error types.
//!
//! [`FwError`] covers the control plane and the frame path; [`StoreError`]
//! covers the chunked container and is carried inside [`FwError::Storage`].
//! Per-frame failures (`UnknownDataset`, `OutOfOrder`, `WrongRank`,
//! `Storage`) terminate processing of the offending frame only; the writer
//! logs them and keeps running.

use thiserror::Error;

/// Result alias used throughout the library.
pub type FwResult<T> = Result<T, FwError>;

/// Errors raised by the writer, the plugin graph, and the control plane.
#[derive(Debug, Error)]
pub enum FwError {
    /// A setting cannot be applied in the current state (e.g. while writing).
    #[error("configuration rejected: {0}")]
    ConfigRejected(String),

    /// A required sub-message field is absent or undecodable.
    #[error("missing field `{0}`")]
    MissingField(String),

    /// A frame references a dataset that was never created.
    #[error("unknown dataset `{0}`")]
    UnknownDataset(String),

    /// A dimension or parameter label is not present on the frame.
    #[error("unknown label `{0}`")]
    UnknownLabel(String),

    /// Frame number below the latched start offset (or zero, which the
    /// 1-based hardware numbering never produces).
    #[error("frame {frame} out of order: below start offset {start}")]
    OutOfOrder { frame: u64, start: u64 },

    /// Frame does not belong to this writer's stripe.
    #[error("frame {frame} does not belong to rank {rank} of {processes}")]
    WrongRank {
        frame: u64,
        rank: usize,
        processes: usize,
    },

    /// The underlying chunked-store operation failed.
    #[error("storage: {0}")]
    Storage(#[from] StoreError),

    /// A plugin index is already occupied.
    #[error("plugin index `{0}` already loaded")]
    AlreadyLoaded(String),

    /// A plugin index (or factory name) is not known.
    #[error("plugin `{0}` is not loaded")]
    NotLoaded(String),

    /// Control or shared-memory channel failure.
    #[error("transport: {0}")]
    Transport(String),
}

/// Errors raised by the chunked array container.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("dataset `{0}` already exists")]
    DatasetExists(String),

    #[error("dataset `{0}` does not exist")]
    NoSuchDataset(String),

    #[error("chunk coordinate {coord:?} does not lie on the chunk grid {chunk:?}")]
    UnalignedChunk { coord: Vec<u64>, chunk: Vec<u64> },

    #[error("chunk coordinate rank {got} does not match dataset rank {want}")]
    BadRank { got: usize, want: usize },

    #[error("extent may only grow: {from} -> {to}")]
    ShrinkingExtent { from: u64, to: u64 },

    #[error("chunk payload of {got} bytes does not fit an existing {want}-byte chunk")]
    ChunkSizeMismatch { got: usize, want: usize },

    #[error("corrupt container: {0}")]
    Corrupt(String),
}
