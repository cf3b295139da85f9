//! Processing stages and the factory registry that instantiates them.
//!
//! A stage is one node of the frame fan-out graph: a plugin implementation
//! behind a bounded input queue and a single worker thread.  After the
//! plugin's handler returns, the frame is offered to every registered
//! downstream stage; each sink has its own queue, so a slow sink does not
//! stall its siblings (it stalls only the producer that feeds it, which is
//! the backpressure contract).
//!
//! Stage construction goes through [`PluginRegistry`], a name → constructor
//! table populated at process startup.  Dynamic library loading can hide
//! behind the same factory signature; nothing else in the graph cares.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{FwError, FwResult};
use crate::frame::Frame;
use crate::ipc::IpcMessage;

/// Default bound of a stage's input queue.
pub const DEFAULT_QUEUE_DEPTH: usize = 128;

/// The capability set every processing stage implements.
pub trait FramePlugin: Send + Sync {
    /// Record the index name the stage was loaded under (used as the
    /// status-reply prefix).
    fn set_name(&self, name: &str);

    /// The index name the stage was loaded under.
    fn name(&self) -> String;

    /// Apply a configuration sub-message; `reply` collects results.
    fn configure(&self, config: &IpcMessage, reply: &mut IpcMessage) -> FwResult<()>;

    /// Contribute status items to `reply`.
    fn status(&self, reply: &mut IpcMessage);

    /// Handle one frame.  Per-frame failures are logged by the
    /// implementation; they never unwind into the worker.
    fn process_frame(&self, frame: &Arc<Frame>);
}

enum Job {
    Frame(Arc<Frame>),
    Stop,
}

/// One node of the fan-out graph: queue, worker, downstream registry.
pub struct PluginStage {
    name: String,
    plugin: Arc<dyn FramePlugin>,
    tx: Sender<Job>,
    pending_rx: Mutex<Option<Receiver<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    sinks: Arc<Mutex<BTreeMap<String, Arc<PluginStage>>>>,
}

impl PluginStage {
    /// Wrap `plugin` as a stage named `name` with the default queue depth.
    pub fn new(name: &str, plugin: Arc<dyn FramePlugin>) -> Arc<PluginStage> {
        Self::with_queue_depth(name, plugin, DEFAULT_QUEUE_DEPTH)
    }

    pub fn with_queue_depth(
        name: &str,
        plugin: Arc<dyn FramePlugin>,
        depth: usize,
    ) -> Arc<PluginStage> {
        let (tx, rx) = bounded(depth);
        plugin.set_name(name);
        Arc::new(PluginStage {
            name: name.to_owned(),
            plugin,
            tx,
            pending_rx: Mutex::new(Some(rx)),
            worker: Mutex::new(None),
            sinks: Arc::new(Mutex::new(BTreeMap::new())),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn plugin(&self) -> &Arc<dyn FramePlugin> {
        &self.plugin
    }

    /// Start the worker thread.  Idempotent.
    pub fn start(&self) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }
        let rx = match self.pending_rx.lock().take() {
            Some(rx) => rx,
            None => return,
        };
        let plugin = Arc::clone(&self.plugin);
        let sinks = Arc::clone(&self.sinks);
        let name = self.name.clone();
        let handle = std::thread::Builder::new()
            .name(format!("stage-{name}"))
            .spawn(move || worker_loop(rx, plugin, sinks))
            .expect("spawn stage worker");
        debug!(stage = %self.name, "worker started");
        *worker = Some(handle);
    }

    /// Drain the queue and stop the worker.  Idempotent.
    pub fn stop(&self) {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let _ = self.tx.send(Job::Stop);
            let _ = handle.join();
            debug!(stage = %self.name, "worker stopped");
        }
    }

    /// Enqueue a frame, blocking while the queue is full.
    pub fn push(&self, frame: Arc<Frame>) {
        let _ = self.tx.send(Job::Frame(frame));
    }

    /// Enqueue a frame with an optional grace period.  Returns `false`
    /// when the queue stayed full past the grace period and the frame was
    /// dropped for this stage.
    pub fn offer(&self, frame: Arc<Frame>, grace: Option<Duration>) -> bool {
        match grace {
            None => {
                let _ = self.tx.send(Job::Frame(frame));
                true
            }
            Some(grace) => match self.tx.send_timeout(Job::Frame(frame), grace) {
                Ok(()) => true,
                Err(_) => {
                    warn!(stage = %self.name, "queue full past grace period, frame dropped");
                    false
                }
            },
        }
    }

    /// Register `stage` as a downstream sink under `name`.
    pub fn register_sink(&self, name: &str, stage: Arc<PluginStage>) {
        self.sinks.lock().insert(name.to_owned(), stage);
    }

    /// Remove the downstream sink registered under `name`.
    pub fn remove_sink(&self, name: &str) {
        self.sinks.lock().remove(name);
    }

    /// Names of the registered downstream sinks.
    pub fn sink_names(&self) -> Vec<String> {
        self.sinks.lock().keys().cloned().collect()
    }
}

impl Drop for PluginStage {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(
    rx: Receiver<Job>,
    plugin: Arc<dyn FramePlugin>,
    sinks: Arc<Mutex<BTreeMap<String, Arc<PluginStage>>>>,
) {
    while let Ok(job) = rx.recv() {
        match job {
            Job::Frame(frame) => {
                plugin.process_frame(&frame);
                // Snapshot the registry; delivery must not hold the lock
                // across a potentially blocking enqueue.
                let downstream: Vec<Arc<PluginStage>> = sinks.lock().values().cloned().collect();
                for sink in downstream {
                    sink.push(Arc::clone(&frame));
                }
            }
            Job::Stop => break,
        }
    }
}

/// Constructor signature for stage plugins.
pub type PluginFactory = fn() -> Arc<dyn FramePlugin>;

/// Name → constructor table for `plugin.load`.
#[derive(Default)]
pub struct PluginRegistry {
    factories: Mutex<HashMap<String, PluginFactory>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the built-in stage classes.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register("FileWriter", file_writer_factory);
        registry
    }

    pub fn register(&self, class: &str, factory: PluginFactory) {
        self.factories.lock().insert(class.to_owned(), factory);
    }

    /// Instantiate the class registered under `class`.
    pub fn create(&self, class: &str) -> FwResult<Arc<dyn FramePlugin>> {
        let factories = self.factories.lock();
        let factory = factories
            .get(class)
            .ok_or_else(|| FwError::NotLoaded(class.to_owned()))?;
        Ok(factory())
    }

    pub fn known_classes(&self) -> Vec<String> {
        self.factories.lock().keys().cloned().collect()
    }
}

fn file_writer_factory() -> Arc<dyn FramePlugin> {
    Arc::new(crate::writer::FileWriterPlugin::new())
}
