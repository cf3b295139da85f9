//! Read-only view of the upstream frame receiver's shared-memory segment.
//!
//! The segment starts with a fixed header naming the buffer manager and the
//! buffer geometry; the buffers follow contiguously.  Each buffer carries a
//! small per-buffer header ahead of the raw payload.  The parser performs no
//! locking: the upstream owner guarantees a buffer is not reclaimed until
//! the release notification for it has been published.

use std::fs::File;
use std::num::NonZeroUsize;
use std::os::fd::AsFd;
use std::ptr::NonNull;

use nix::fcntl::OFlag;
use nix::sys::mman::{self, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use tracing::debug;

use crate::error::{FwError, FwResult};

/// Fixed header at the start of the mapped region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct SharedHeader {
    pub manager_id: u64,
    pub num_buffers: u64,
    pub buffer_size: u64,
}

/// Size of [`SharedHeader`] on the wire.
pub const SHARED_HEADER_SIZE: usize = std::mem::size_of::<SharedHeader>();

/// Per-buffer metadata ahead of each payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct BufferHeader {
    pub frame_number: u64,
    pub frame_state: u64,
}

/// Size of [`BufferHeader`] on the wire.
pub const BUFFER_HEADER_SIZE: usize = std::mem::size_of::<BufferHeader>();

/// Memory-mapped, read-only shared segment.
pub struct SharedMemoryParser {
    name: String,
    base: NonNull<core::ffi::c_void>,
    size: usize,
    header: SharedHeader,
}

// The mapping is read-only and the pointer arithmetic is bounds-checked
// against the header geometry.
unsafe impl Send for SharedMemoryParser {}
unsafe impl Sync for SharedMemoryParser {}

impl SharedMemoryParser {
    /// Open and map the named segment read-only.
    pub fn open(name: &str) -> FwResult<SharedMemoryParser> {
        // POSIX shared-memory names carry a leading slash.
        let shm_name = if name.starts_with('/') {
            name.to_owned()
        } else {
            format!("/{name}")
        };
        let fd = mman::shm_open(shm_name.as_str(), OFlag::O_RDONLY, Mode::empty())
            .map_err(|e| FwError::Transport(format!("shm_open {shm_name}: {e}")))?;
        let file = File::from(fd);
        let size = file
            .metadata()
            .map_err(|e| FwError::Transport(format!("shm stat {shm_name}: {e}")))?
            .len() as usize;
        if size < SHARED_HEADER_SIZE {
            return Err(FwError::Transport(format!(
                "shared segment {shm_name} too small: {size} bytes"
            )));
        }
        let length = NonZeroUsize::new(size)
            .ok_or_else(|| FwError::Transport(format!("shared segment {shm_name} is empty")))?;
        let base = unsafe {
            mman::mmap(
                None,
                length,
                ProtFlags::PROT_READ,
                MapFlags::MAP_SHARED,
                file.as_fd(),
                0,
            )
        }
        .map_err(|e| FwError::Transport(format!("mmap {shm_name}: {e}")))?;

        let header =
            unsafe { std::ptr::read_unaligned(base.as_ptr() as *const SharedHeader) };
        let span = header
            .num_buffers
            .checked_mul(header.buffer_size)
            .and_then(|b| b.checked_add(SHARED_HEADER_SIZE as u64));
        if header.buffer_size < BUFFER_HEADER_SIZE as u64
            || span.map_or(true, |s| s > size as u64)
        {
            unsafe {
                let _ = mman::munmap(base, size);
            }
            return Err(FwError::Transport(format!(
                "shared segment {shm_name} geometry invalid: {header:?} in {size} bytes"
            )));
        }
        debug!(
            name = %shm_name,
            manager_id = header.manager_id,
            num_buffers = header.num_buffers,
            buffer_size = header.buffer_size,
            "shared segment mapped"
        );
        Ok(SharedMemoryParser {
            name: shm_name,
            base,
            size,
            header,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn manager_id(&self) -> u64 {
        self.header.manager_id
    }

    pub fn num_buffers(&self) -> u64 {
        self.header.num_buffers
    }

    pub fn buffer_size(&self) -> u64 {
        self.header.buffer_size
    }

    /// Payload capacity of one buffer.
    pub fn payload_size(&self) -> usize {
        self.header.buffer_size as usize - BUFFER_HEADER_SIZE
    }

    /// Resolve buffer `idx` to its metadata header and payload bytes.
    pub fn buffer(&self, idx: u64) -> FwResult<(BufferHeader, &[u8])> {
        if idx >= self.header.num_buffers {
            return Err(FwError::Transport(format!(
                "buffer index {idx} out of range ({} buffers)",
                self.header.num_buffers
            )));
        }
        let start = SHARED_HEADER_SIZE + (idx * self.header.buffer_size) as usize;
        unsafe {
            let buffer = (self.base.as_ptr() as *const u8).add(start);
            let meta = std::ptr::read_unaligned(buffer as *const BufferHeader);
            let payload =
                std::slice::from_raw_parts(buffer.add(BUFFER_HEADER_SIZE), self.payload_size());
            Ok((meta, payload))
        }
    }
}

impl Drop for SharedMemoryParser {
    fn drop(&mut self) {
        unsafe {
            let _ = mman::munmap(self.base, self.size);
        }
    }
}
