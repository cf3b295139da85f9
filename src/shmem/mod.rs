//! Shared-memory ingest: segment parsing and the notification bridge.

pub mod controller;
pub mod parser;

pub use controller::SharedMemoryController;
pub use parser::{BufferHeader, SharedHeader, SharedMemoryParser, BUFFER_HEADER_SIZE, SHARED_HEADER_SIZE};
