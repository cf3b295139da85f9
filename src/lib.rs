//! framewriter — detector frame file writer.
//!
//! An online service that receives raw image frames from an upstream
//! detector readout over shared memory, routes them through a configurable
//! graph of processing stages, and appends them to a multi-dataset chunked
//! container file.  Several writer processes can share one logical output by
//! striping frame numbers across ranks.
//!
//! Module map:
//! - [`frame`] / [`pool`] — the unit of flow and its recycled payload blocks
//! - [`shmem`] — shared-segment parsing and the ready/release bridge
//! - [`plugin`] — the stage abstraction and factory registry
//! - [`writer`] — the writing engine
//! - [`store`] — the chunked array container it writes
//! - [`controller`] — the control-plane dispatcher
//! - [`ipc`] — message trees, paired channels, reactor

pub mod controller;
pub mod error;
pub mod frame;
pub mod ipc;
pub mod plugin;
pub mod pool;
pub mod shmem;
pub mod store;
pub mod writer;

// ─────────────────────────────────────────────────────────────────────────────
// Top-level re-exports for the common entry points.
// ─────────────────────────────────────────────────────────────────────────────

/// The application controller: owns the reactor, the control channel, and
/// the plugin graph.
pub use controller::Controller;
/// Crate error type and result alias.
pub use error::{FwError, FwResult, StoreError};
/// The unit of flow.
pub use frame::Frame;
/// Payload block pool shared by the ingest path.
pub use pool::DataBlockPool;
/// The writing engine stage.
pub use writer::FileWriterPlugin;

pub const VERSION_STRING: &str = env!("CARGO_PKG_VERSION");
