//! Bridge from the frame receiver's notification channels to the plugin
//! graph.
//!
//! One channel delivers frame-ready notifications, the other publishes
//! frame-release notifications.  On each ready message the controller
//! resolves the named buffer through the [`SharedMemoryParser`], copies the
//! payload into a pooled [`Frame`] (so the shared buffer can be handed back
//! promptly), fans the frame out to every registered sink, and then
//! publishes the release.
//!
//! Fan-out policy: delivery blocks on a full sink queue, bounded by an
//! optional grace period after which the frame is dropped for that sink
//! with a warning.  The release notification goes out either way — the
//! copy out of shared memory has already happened.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::error::FwResult;
use crate::frame::Frame;
use crate::ipc::{IpcChannel, IpcMessage, IpcReactor, MsgType, MsgVal};
use crate::plugin::PluginStage;
use crate::pool::DataBlockPool;
use crate::shmem::parser::SharedMemoryParser;

/// Subscribes to frame-ready, publishes frame-release, feeds the graph.
pub struct SharedMemoryController {
    inner: Arc<Inner>,
}

struct Inner {
    parser: Mutex<Option<Arc<SharedMemoryParser>>>,
    callbacks: Mutex<BTreeMap<String, Arc<PluginStage>>>,
    rx: IpcChannel,
    tx: IpcChannel,
    pool: Arc<DataBlockPool>,
    grace: Option<Duration>,
    active: AtomicBool,
}

impl SharedMemoryController {
    /// Connect both notification channels and register the ready channel
    /// with `reactor`.
    pub fn new(
        reactor: &IpcReactor,
        ready_endpoint: &str,
        release_endpoint: &str,
        pool: &Arc<DataBlockPool>,
        grace: Option<Duration>,
    ) -> FwResult<SharedMemoryController> {
        let rx = IpcChannel::connect(ready_endpoint)?;
        let tx = IpcChannel::connect(release_endpoint)?;
        let inner = Arc::new(Inner {
            parser: Mutex::new(None),
            callbacks: Mutex::new(BTreeMap::new()),
            rx,
            tx,
            pool: Arc::clone(pool),
            grace,
            active: AtomicBool::new(true),
        });
        let handler_inner = Arc::clone(&inner);
        reactor.register_channel(
            inner.rx.receiver(),
            Box::new(move || handler_inner.handle_ready()),
        );
        debug!(ready = ready_endpoint, release = release_endpoint, "shm ingest wired");
        Ok(SharedMemoryController { inner })
    }

    /// Attach the parser for the currently configured segment.
    pub fn set_parser(&self, parser: Arc<SharedMemoryParser>) {
        *self.inner.parser.lock() = Some(parser);
    }

    /// Register a sink to receive every ingested frame.
    pub fn register_callback(&self, name: &str, stage: Arc<PluginStage>) {
        self.inner.callbacks.lock().insert(name.to_owned(), stage);
    }

    /// Remove a previously registered sink.
    pub fn remove_callback(&self, name: &str) {
        self.inner.callbacks.lock().remove(name);
    }

    pub fn callback_names(&self) -> Vec<String> {
        self.inner.callbacks.lock().keys().cloned().collect()
    }

    /// Detach from the reactor at the next wakeup.
    pub fn shutdown(&self) {
        self.inner.active.store(false, Ordering::SeqCst);
    }
}

impl Inner {
    // Reactor handler: drain pending notifications. Returns false to
    // deregister (shut down or channel gone).
    fn handle_ready(&self) -> bool {
        if !self.active.load(Ordering::SeqCst) {
            return false;
        }
        loop {
            match self.rx.try_recv() {
                Ok(Some(msg)) => self.ingest(&msg),
                Ok(None) => return true,
                Err(_) => return false,
            }
        }
    }

    fn ingest(&self, msg: &IpcMessage) {
        let (frame_number, buffer_id) = match (
            msg.get_param::<u64>("frame_number"),
            msg.get_param::<u64>("buffer_id"),
        ) {
            (Ok(n), Ok(b)) => (n, b),
            _ => {
                warn!("frame-ready notification missing frame_number/buffer_id");
                return;
            }
        };
        let dataset: String = msg.get_param("dataset").unwrap_or_default();

        let parser = self.parser.lock().clone();
        let parser = match parser {
            Some(parser) => parser,
            None => {
                warn!(buffer_id, "frame ready but no shared segment is mapped");
                return;
            }
        };

        let frame = match self.build_frame(&parser, msg, &dataset, frame_number, buffer_id) {
            Ok(frame) => Arc::new(frame),
            Err(e) => {
                warn!(frame_number, buffer_id, "frame construction failed: {e}");
                self.release(frame_number, buffer_id);
                return;
            }
        };

        // The payload is copied out; downstream pressure may no longer
        // delay the buffer hand-back beyond the fan-out grace period.
        let sinks: Vec<(String, Arc<PluginStage>)> = self
            .callbacks
            .lock()
            .iter()
            .map(|(n, s)| (n.clone(), Arc::clone(s)))
            .collect();
        for (name, sink) in sinks {
            if !sink.offer(Arc::clone(&frame), self.grace) {
                warn!(frame_number, sink = %name, "frame dropped for sink");
            }
        }

        self.release(frame_number, buffer_id);
    }

    fn build_frame(
        &self,
        parser: &SharedMemoryParser,
        msg: &IpcMessage,
        dataset: &str,
        frame_number: u64,
        buffer_id: u64,
    ) -> FwResult<Frame> {
        let (_meta, payload) = parser.buffer(buffer_id)?;
        let nbytes = msg
            .get_param::<usize>("frame_size")
            .unwrap_or(payload.len())
            .min(payload.len());

        let mut frame = Frame::new(&self.pool, dataset);
        frame.set_dataset_name(dataset);
        frame.set_frame_number(frame_number);
        frame.copy_data(&payload[..nbytes]);

        if let Ok(dims) = msg.get_param::<HashMap<String, Vec<u64>>>("dimensions") {
            for (label, seq) in dims {
                frame.set_dimensions(&label, seq);
            }
        }
        if let Ok(params) = msg.get_param::<HashMap<String, u64>>("parameters") {
            for (label, value) in params {
                frame.set_parameter(&label, value);
            }
        }
        trace!(frame_number, buffer_id, dataset, nbytes, "frame ingested");
        Ok(frame)
    }

    fn release(&self, frame_number: u64, buffer_id: u64) {
        let mut note = IpcMessage::new(MsgType::Notify, MsgVal::FrameRelease);
        note.set_param("frame_number", frame_number);
        note.set_param("buffer_id", buffer_id);
        if let Err(e) = self.tx.send(&note) {
            warn!(buffer_id, "release notification failed: {e}");
        }
    }
}
