//! Chunked array container.
//!
//! A single-file store holding named N-dimensional datasets with an
//! unbounded leading axis, written exclusively through direct chunk writes:
//! the caller supplies the pre-encoded chunk image and the chunk-grid
//! coordinate, and the container records where the bytes landed.  Nothing is
//! re-encoded on the way in, and the write path never reads back.
//!
//! On-disk layout:
//!
//! ```text
//! [superblock 16 B][chunk data ...][footer JSON][trailer 24 B]
//! ```
//!
//! The footer (dataset table plus chunk index) is serialized as JSON when the
//! file closes and protected by an XXH32 checksum in the fixed-size trailer,
//! so a torn close is detectable.  Chunk payloads of 64 KiB or more are
//! placed at 4 MiB-aligned offsets; smaller payloads pack contiguously.
//! Unwritten regions read back as zero, which doubles as the fill value.

pub mod file;
pub mod read;

use serde::{Deserialize, Serialize};

pub use file::{ChunkFile, DatasetSpec};
pub use read::ChunkFileReader;

/// File magic, also the last four bytes of a well-formed container.
pub const MAGIC: u32 = 0x4657_4631; // "FWF1"
/// Format version recorded in superblock and footer.
pub const VERSION: u32 = 1;
/// Superblock size in bytes: magic, version, eight reserved bytes.
pub const SUPERBLOCK_SIZE: u64 = 16;
/// Trailer size in bytes: footer offset, footer length, XXH32, magic.
pub const TRAILER_SIZE: u64 = 24;
/// Payloads at or above this size are placed on an alignment boundary.
pub const ALIGN_THRESHOLD: usize = 64 * 1024;
/// Chunk-boundary alignment for large payloads.
pub const CHUNK_ALIGN: u64 = 4 * 1024 * 1024;

/// Element type of a dataset.
///
/// `U32` also carries pixel streams declared as "float32" upstream: the
/// wire payload is stored bit-for-bit under a 32-bit unsigned element type,
/// matching the established on-disk behaviour of this format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dtype {
    U8,
    U16,
    U32,
}

impl Dtype {
    /// Element size in bytes.
    pub fn size(self) -> usize {
        match self {
            Dtype::U8 => 1,
            Dtype::U16 => 2,
            Dtype::U32 => 4,
        }
    }
}

// Footer wire structures, shared by writer and reader.

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Footer {
    pub version: u32,
    pub datasets: Vec<FooterDataset>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct FooterDataset {
    pub name: String,
    pub dtype: Dtype,
    pub dims: Vec<u64>,
    pub chunk: Vec<u64>,
    pub chunks: Vec<FooterChunk>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct FooterChunk {
    pub coord: Vec<u64>,
    pub offset: u64,
    pub len: u64,
    pub filter_mask: u32,
}
