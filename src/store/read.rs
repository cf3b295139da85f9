//! Verification reader for the chunked container.
//!
//! The writing engine never reads back; this reader exists for tests and
//! offline inspection of closed containers.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use xxhash_rust::xxh32::xxh32;

use super::{Dtype, Footer, FooterDataset, MAGIC, SUPERBLOCK_SIZE, TRAILER_SIZE};
use crate::error::StoreError;

/// A closed container opened for inspection.
pub struct ChunkFileReader {
    file: File,
    datasets: HashMap<String, FooterDataset>,
    names: Vec<String>,
}

impl ChunkFileReader {
    /// Open `path`, validating superblock, trailer, and footer checksum.
    pub fn open(path: impl AsRef<Path>) -> Result<ChunkFileReader, StoreError> {
        let mut file = File::open(path)?;
        let total = file.metadata()?.len();
        if total < SUPERBLOCK_SIZE + TRAILER_SIZE {
            return Err(StoreError::Corrupt("file too short".into()));
        }

        let mut superblock = [0u8; SUPERBLOCK_SIZE as usize];
        file.read_exact(&mut superblock)?;
        if u32::from_le_bytes(superblock[..4].try_into().unwrap()) != MAGIC {
            return Err(StoreError::Corrupt("bad superblock magic".into()));
        }

        let mut trailer = [0u8; TRAILER_SIZE as usize];
        file.seek(SeekFrom::End(-(TRAILER_SIZE as i64)))?;
        file.read_exact(&mut trailer)?;
        if u32::from_le_bytes(trailer[20..24].try_into().unwrap()) != MAGIC {
            return Err(StoreError::Corrupt("bad trailer magic (unclosed file?)".into()));
        }
        let footer_offset = u64::from_le_bytes(trailer[..8].try_into().unwrap());
        let footer_len = u64::from_le_bytes(trailer[8..16].try_into().unwrap());
        let checksum = u32::from_le_bytes(trailer[16..20].try_into().unwrap());
        if footer_offset + footer_len + TRAILER_SIZE > total {
            return Err(StoreError::Corrupt("footer exceeds file".into()));
        }

        let mut bytes = vec![0u8; footer_len as usize];
        file.seek(SeekFrom::Start(footer_offset))?;
        file.read_exact(&mut bytes)?;
        if xxh32(&bytes, 0) != checksum {
            return Err(StoreError::Corrupt("footer checksum mismatch".into()));
        }
        let footer: Footer = serde_json::from_slice(&bytes)
            .map_err(|e| StoreError::Corrupt(format!("footer decode: {e}")))?;

        let names = footer.datasets.iter().map(|d| d.name.clone()).collect();
        let datasets = footer
            .datasets
            .into_iter()
            .map(|d| (d.name.clone(), d))
            .collect();
        Ok(ChunkFileReader {
            file,
            datasets,
            names,
        })
    }

    /// Dataset names in footer order.
    pub fn dataset_names(&self) -> &[String] {
        &self.names
    }

    pub fn dims(&self, name: &str) -> Result<&[u64], StoreError> {
        self.dataset(name).map(|d| d.dims.as_slice())
    }

    pub fn chunk_shape(&self, name: &str) -> Result<&[u64], StoreError> {
        self.dataset(name).map(|d| d.chunk.as_slice())
    }

    pub fn dtype(&self, name: &str) -> Result<Dtype, StoreError> {
        self.dataset(name).map(|d| d.dtype)
    }

    /// Number of chunks recorded for a dataset.
    pub fn chunk_count(&self, name: &str) -> Result<usize, StoreError> {
        self.dataset(name).map(|d| d.chunks.len())
    }

    /// Fetch the chunk payload at `coord`; `Ok(None)` when the coordinate
    /// was never written.
    pub fn read_chunk(&mut self, name: &str, coord: &[u64]) -> Result<Option<Vec<u8>>, StoreError> {
        let record = match self
            .dataset(name)?
            .chunks
            .iter()
            .find(|c| c.coord == coord)
        {
            Some(record) => (record.offset, record.len),
            None => return Ok(None),
        };
        let mut payload = vec![0u8; record.1 as usize];
        self.file.seek(SeekFrom::Start(record.0))?;
        self.file.read_exact(&mut payload)?;
        Ok(Some(payload))
    }

    /// File offset of the chunk at `coord`, for alignment checks.
    pub fn chunk_offset(&self, name: &str, coord: &[u64]) -> Result<Option<u64>, StoreError> {
        Ok(self
            .dataset(name)?
            .chunks
            .iter()
            .find(|c| c.coord == coord)
            .map(|c| c.offset))
    }

    fn dataset(&self, name: &str) -> Result<&FooterDataset, StoreError> {
        self.datasets
            .get(name)
            .ok_or_else(|| StoreError::NoSuchDataset(name.to_owned()))
    }
}
