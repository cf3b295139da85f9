//! One raw image frame: payload bytes plus routing metadata.
//!
//! A [`Frame`] is built by the shared-memory ingest path, populated through
//! its setters, then handed to the plugin graph as `Arc<Frame>`.  From that
//! point on it is read-only; the pooled payload block flows back to the
//! [`DataBlockPool`] when the last holder drops its handle.
//!
//! Dimensions and parameters are labelled rather than positional: a frame
//! carries the per-frame shape under the `"frame"` label and, for detectors
//! that pack several readout stripes into one payload, a `"subframe"` shape
//! together with `subframe_count` / `subframe_size` parameters.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{FwError, FwResult};
use crate::pool::{DataBlock, DataBlockPool};

/// Immutable handle to one raw image.
pub struct Frame {
    dataset_name: String,
    frame_number: u64,
    block: Option<DataBlock>,
    pool: Arc<DataBlockPool>,
    tag: String,
    dimensions: HashMap<String, Vec<u64>>,
    parameters: HashMap<String, u64>,
}

impl Frame {
    /// Create an empty frame whose payload blocks are drawn from `pool`
    /// under `tag`.
    pub fn new(pool: &Arc<DataBlockPool>, tag: &str) -> Self {
        Frame {
            dataset_name: String::new(),
            frame_number: 0,
            block: None,
            pool: Arc::clone(pool),
            tag: tag.to_owned(),
            dimensions: HashMap::new(),
            parameters: HashMap::new(),
        }
    }

    /// Copy `src` into a pooled block of at least `src.len()` bytes.
    pub fn copy_data(&mut self, src: &[u8]) {
        let block = self
            .block
            .get_or_insert_with(|| self.pool.take(&self.tag, src.len()));
        block.copy_from(src);
    }

    /// The payload bytes.  Empty until [`copy_data`](Self::copy_data) runs.
    pub fn data(&self) -> &[u8] {
        self.block.as_ref().map_or(&[], DataBlock::data)
    }

    /// Payload size in bytes.
    pub fn data_size(&self) -> usize {
        self.block.as_ref().map_or(0, DataBlock::len)
    }

    pub fn dataset_name(&self) -> &str {
        &self.dataset_name
    }

    pub fn set_dataset_name(&mut self, name: &str) {
        self.dataset_name = name.to_owned();
    }

    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    pub fn set_frame_number(&mut self, n: u64) {
        self.frame_number = n;
    }

    /// Record an ordered dimension sequence under `label`.
    pub fn set_dimensions(&mut self, label: &str, dims: Vec<u64>) {
        self.dimensions.insert(label.to_owned(), dims);
    }

    /// Fetch the dimension sequence stored under `label`.
    pub fn get_dimensions(&self, label: &str) -> FwResult<&[u64]> {
        self.dimensions
            .get(label)
            .map(Vec::as_slice)
            .ok_or_else(|| FwError::UnknownLabel(label.to_owned()))
    }

    /// Record a scalar parameter under `label`.
    pub fn set_parameter(&mut self, label: &str, value: u64) {
        self.parameters.insert(label.to_owned(), value);
    }

    /// Fetch the scalar parameter stored under `label`.
    pub fn get_parameter(&self, label: &str) -> FwResult<u64> {
        self.parameters
            .get(label)
            .copied()
            .ok_or_else(|| FwError::UnknownLabel(label.to_owned()))
    }

    pub fn has_parameter(&self, label: &str) -> bool {
        self.parameters.contains_key(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> Frame {
        Frame::new(&DataBlockPool::new(), "img")
    }

    #[test]
    fn payload_copies_into_pooled_block() {
        let pool = DataBlockPool::new();
        let mut f = Frame::new(&pool, "img");
        f.copy_data(&[0xAA; 16]);
        assert_eq!(f.data_size(), 16);
        assert_eq!(f.data(), &[0xAA; 16]);
        drop(f);
        assert_eq!(pool.free_blocks("img"), 1);
    }

    #[test]
    fn unknown_labels_fail() {
        let f = frame();
        assert!(matches!(
            f.get_dimensions("subframe"),
            Err(FwError::UnknownLabel(_))
        ));
        assert!(matches!(
            f.get_parameter("subframe_count"),
            Err(FwError::UnknownLabel(_))
        ));
        assert!(!f.has_parameter("subframe_count"));
    }

    #[test]
    fn dimensions_and_parameters_round_trip() {
        let mut f = frame();
        f.set_dimensions("frame", vec![4, 4]);
        f.set_parameter("subframe_count", 2);
        assert_eq!(f.get_dimensions("frame").unwrap(), &[4, 4]);
        assert_eq!(f.get_parameter("subframe_count").unwrap(), 2);
        assert!(f.has_parameter("subframe_count"));
    }
}
