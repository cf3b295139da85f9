//! Reusable byte-block pool backing [`Frame`](crate::frame::Frame) payloads.
//!
//! Copying a payload out of shared memory must not allocate per frame at
//! detector rates, so payload buffers are recycled.  Blocks are keyed by a
//! caller-supplied tag (by convention the destination dataset name) and
//! returned to the pool automatically when the last frame holder drops.
//!
//! Allocation policy: `take` hands out the largest free block under the tag,
//! growing it in place when it is smaller than requested.  The pool is shared
//! process-wide behind an `Arc` and internally synchronised.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

/// Pool of reusable payload buffers, keyed by tag.
pub struct DataBlockPool {
    // Free lists per tag, each kept sorted by capacity (largest last).
    free: Mutex<std::collections::HashMap<String, Vec<Vec<u8>>>>,
    // Handle blocks use to find their way home.
    me: Weak<DataBlockPool>,
}

impl DataBlockPool {
    /// Create an empty pool.
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|me| DataBlockPool {
            free: Mutex::new(std::collections::HashMap::new()),
            me: me.clone(),
        })
    }

    /// Take a block of at least `nbytes` capacity under `tag`.
    ///
    /// The largest free block for the tag is reused when one exists; a block
    /// that is too small is grown in place.  The returned block holds no
    /// valid data until [`DataBlock::copy_from`] is called.
    pub fn take(&self, tag: &str, nbytes: usize) -> DataBlock {
        let mut buf = {
            let mut free = self.free.lock();
            free.get_mut(tag).and_then(Vec::pop).unwrap_or_default()
        };
        if buf.capacity() < nbytes {
            buf.reserve(nbytes - buf.len());
        }
        buf.clear();
        DataBlock {
            buf,
            tag: tag.to_owned(),
            pool: self.me.clone(),
        }
    }

    /// Number of free blocks currently held under `tag`.
    pub fn free_blocks(&self, tag: &str) -> usize {
        self.free.lock().get(tag).map_or(0, Vec::len)
    }

    fn give_back(&self, tag: String, buf: Vec<u8>) {
        let mut free = self.free.lock();
        let list = free.entry(tag).or_default();
        // Keep the list sorted by capacity so `take` pops the largest.
        let at = list.partition_point(|b| b.capacity() <= buf.capacity());
        list.insert(at, buf);
    }
}

/// One pooled buffer.  Returns to its pool on drop.
pub struct DataBlock {
    buf: Vec<u8>,
    tag: String,
    pool: Weak<DataBlockPool>,
}

impl DataBlock {
    /// Replace the block contents with a copy of `src`.
    pub fn copy_from(&mut self, src: &[u8]) {
        self.buf.clear();
        self.buf.extend_from_slice(src);
    }

    /// The valid payload bytes.
    pub fn data(&self) -> &[u8] {
        &self.buf
    }

    /// Number of valid payload bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True when no payload has been copied in.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Tag the block was taken under.
    pub fn tag(&self) -> &str {
        &self.tag
    }
}

impl Drop for DataBlock {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.give_back(std::mem::take(&mut self.tag), std::mem::take(&mut self.buf));
        }
    }
}
