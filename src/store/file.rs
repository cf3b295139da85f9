//! Write side of the chunked container.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, trace};
use xxhash_rust::xxh32::xxh32;

use super::{
    Dtype, Footer, FooterChunk, FooterDataset, ALIGN_THRESHOLD, CHUNK_ALIGN, MAGIC,
    SUPERBLOCK_SIZE, TRAILER_SIZE, VERSION,
};
use crate::error::StoreError;

/// Parameters for one dataset: full on-disk dimensions (leading axis
/// included) and the chunk shape, same rank.
#[derive(Debug, Clone)]
pub struct DatasetSpec {
    pub name: String,
    pub dtype: Dtype,
    pub dims: Vec<u64>,
    pub chunk: Vec<u64>,
}

struct Dataset {
    dtype: Dtype,
    dims: Vec<u64>,
    chunk: Vec<u64>,
    records: Vec<FooterChunk>,
    by_coord: HashMap<Vec<u64>, usize>,
}

/// An open container accepting dataset definitions and direct chunk writes.
///
/// Dropping without [`close`](Self::close) leaves the file without footer or
/// trailer; the reader refuses such a file, which is the crash-consistency
/// contract: a container is valid iff it was closed.
pub struct ChunkFile {
    file: File,
    path: PathBuf,
    end: u64,
    datasets: BTreeMap<String, Dataset>,
}

impl ChunkFile {
    /// Create (truncating) a container at `path` and write the superblock.
    pub fn create(path: impl AsRef<Path>) -> Result<ChunkFile, StoreError> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::create(&path)?;
        let mut superblock = [0u8; SUPERBLOCK_SIZE as usize];
        superblock[..4].copy_from_slice(&MAGIC.to_le_bytes());
        superblock[4..8].copy_from_slice(&VERSION.to_le_bytes());
        file.write_all(&superblock)?;
        debug!(path = %path.display(), "container created");
        Ok(ChunkFile {
            file,
            path,
            end: SUPERBLOCK_SIZE,
            datasets: BTreeMap::new(),
        })
    }

    /// Path the container was created at.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Register a dataset.  The leading axis is unbounded; `spec.dims`
    /// gives the initial extent.
    pub fn create_dataset(&mut self, spec: &DatasetSpec) -> Result<(), StoreError> {
        if self.datasets.contains_key(&spec.name) {
            return Err(StoreError::DatasetExists(spec.name.clone()));
        }
        if spec.chunk.len() != spec.dims.len() {
            return Err(StoreError::BadRank {
                got: spec.chunk.len(),
                want: spec.dims.len(),
            });
        }
        debug!(
            name = %spec.name,
            dims = ?spec.dims,
            chunk = ?spec.chunk,
            "dataset created"
        );
        self.datasets.insert(
            spec.name.clone(),
            Dataset {
                dtype: spec.dtype,
                dims: spec.dims.clone(),
                chunk: spec.chunk.clone(),
                records: Vec::new(),
                by_coord: HashMap::new(),
            },
        );
        Ok(())
    }

    /// Current dimensions of a dataset.
    pub fn dims(&self, name: &str) -> Result<&[u64], StoreError> {
        self.datasets
            .get(name)
            .map(|d| d.dims.as_slice())
            .ok_or_else(|| StoreError::NoSuchDataset(name.to_owned()))
    }

    /// Grow a dataset.  Only the leading dimension may change, and only
    /// upward.
    pub fn set_extent(&mut self, name: &str, new_dims: &[u64]) -> Result<(), StoreError> {
        let dataset = self
            .datasets
            .get_mut(name)
            .ok_or_else(|| StoreError::NoSuchDataset(name.to_owned()))?;
        if new_dims.len() != dataset.dims.len() {
            return Err(StoreError::BadRank {
                got: new_dims.len(),
                want: dataset.dims.len(),
            });
        }
        if new_dims[0] < dataset.dims[0] {
            return Err(StoreError::ShrinkingExtent {
                from: dataset.dims[0],
                to: new_dims[0],
            });
        }
        trace!(name, extent = new_dims[0], "extent set");
        dataset.dims = new_dims.to_vec();
        Ok(())
    }

    /// Write a pre-encoded chunk image at `coord`.
    ///
    /// `coord` must lie on the dataset's chunk grid and inside its current
    /// extent.  Rewriting a coordinate overwrites in place when the payload
    /// length is unchanged.
    pub fn write_chunk(
        &mut self,
        name: &str,
        coord: &[u64],
        payload: &[u8],
        filter_mask: u32,
    ) -> Result<(), StoreError> {
        let dataset = self
            .datasets
            .get_mut(name)
            .ok_or_else(|| StoreError::NoSuchDataset(name.to_owned()))?;
        if coord.len() != dataset.dims.len() {
            return Err(StoreError::BadRank {
                got: coord.len(),
                want: dataset.dims.len(),
            });
        }
        for (axis, (&c, &k)) in coord.iter().zip(&dataset.chunk).enumerate() {
            if k == 0 || c % k != 0 || c >= dataset.dims[axis] {
                return Err(StoreError::UnalignedChunk {
                    coord: coord.to_vec(),
                    chunk: dataset.chunk.clone(),
                });
            }
        }

        let offset = match dataset.by_coord.get(coord) {
            Some(&index) => {
                let record = &dataset.records[index];
                if record.len != payload.len() as u64 {
                    return Err(StoreError::ChunkSizeMismatch {
                        got: payload.len(),
                        want: record.len as usize,
                    });
                }
                record.offset
            }
            None => {
                let mut at = self.end;
                if payload.len() >= ALIGN_THRESHOLD {
                    at = at.div_ceil(CHUNK_ALIGN) * CHUNK_ALIGN;
                }
                self.end = at + payload.len() as u64;
                dataset.by_coord.insert(coord.to_vec(), dataset.records.len());
                dataset.records.push(FooterChunk {
                    coord: coord.to_vec(),
                    offset: at,
                    len: payload.len() as u64,
                    filter_mask,
                });
                at
            }
        };

        trace!(name, ?coord, offset, len = payload.len(), "chunk write");
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(payload)?;
        Ok(())
    }

    /// Write footer and trailer, flush everything, and consume the handle.
    pub fn close(mut self) -> Result<(), StoreError> {
        let datasets = std::mem::take(&mut self.datasets);
        let footer = Footer {
            version: VERSION,
            datasets: datasets
                .into_iter()
                .map(|(name, d)| FooterDataset {
                    name,
                    dtype: d.dtype,
                    dims: d.dims,
                    chunk: d.chunk,
                    chunks: d.records,
                })
                .collect(),
        };

        let bytes = serde_json::to_vec(&footer)
            .map_err(|e| StoreError::Corrupt(format!("footer encode: {e}")))?;
        let footer_offset = self.end;
        self.file.seek(SeekFrom::Start(footer_offset))?;
        self.file.write_all(&bytes)?;

        let mut trailer = [0u8; TRAILER_SIZE as usize];
        trailer[..8].copy_from_slice(&footer_offset.to_le_bytes());
        trailer[8..16].copy_from_slice(&(bytes.len() as u64).to_le_bytes());
        trailer[16..20].copy_from_slice(&xxh32(&bytes, 0).to_le_bytes());
        trailer[20..24].copy_from_slice(&MAGIC.to_le_bytes());
        self.file.write_all(&trailer)?;
        self.file.sync_all()?;
        debug!(path = %self.path.display(), "container closed");
        Ok(())
    }
}
