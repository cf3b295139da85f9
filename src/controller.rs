//! Control-plane dispatcher: owns the reactor task, the control channel,
//! the shared-memory ingest, and the plugin graph.
//!
//! One inbound configure message can carry any mix of the recognised
//! top-level keys; they are dispatched in a fixed order (shutdown, status,
//! ctrl_endpoint, plugin, fr_setup, then per-plugin sub-trees) and each step
//! fails independently — the first failure is recorded in the reply's
//! `error` field, later steps still run, and the reply is always sent.
//!
//! Construction is complete only once the reactor thread is confirmed
//! running; a spawn failure surfaces from `new` so the process can exit
//! non-zero instead of running headless.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde_json::Value;
use tracing::{debug, info, trace, warn};

use crate::error::{FwError, FwResult};
use crate::ipc::{IpcChannel, IpcMessage, IpcReactor, MsgType, MsgVal};
use crate::plugin::{PluginRegistry, PluginStage};
use crate::pool::DataBlockPool;
use crate::shmem::{SharedMemoryController, SharedMemoryParser};

// Top-level configuration keys.
const CONFIG_SHUTDOWN: &str = "shutdown";
const CONFIG_STATUS: &str = "status";
const CONFIG_CTRL_ENDPOINT: &str = "ctrl_endpoint";
const CONFIG_PLUGIN: &str = "plugin";
const CONFIG_PLUGIN_LIST: &str = "list";
const CONFIG_PLUGIN_LOAD: &str = "load";
const CONFIG_PLUGIN_CONNECT: &str = "connect";
const CONFIG_PLUGIN_DISCONNECT: &str = "disconnect";
const CONFIG_PLUGIN_NAME: &str = "name";
const CONFIG_PLUGIN_INDEX: &str = "index";
const CONFIG_PLUGIN_LIBRARY: &str = "library";
const CONFIG_PLUGIN_CONNECTION: &str = "connection";
const CONFIG_FR_SETUP: &str = "fr_setup";
const CONFIG_FR_SHARED_MEMORY: &str = "fr_shared_mem";
const CONFIG_FR_RELEASE: &str = "fr_release_cnxn";
const CONFIG_FR_READY: &str = "fr_ready_cnxn";
const CONFIG_FR_TIMEOUT_MS: &str = "fr_timeout_ms";

// Upstream name of the shared-memory ingest in the connection graph.
const FRAME_RECEIVER: &str = "frame_receiver";

/// The application controller.
pub struct Controller {
    inner: Arc<Inner>,
    reactor_thread: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    reactor: Arc<IpcReactor>,
    registry: PluginRegistry,
    pool: Arc<DataBlockPool>,
    plugins: Mutex<BTreeMap<String, Arc<PluginStage>>>,
    // upstream name -> downstream indices, for cycle detection.
    edges: Mutex<HashMap<String, HashSet<String>>>,
    smc: Mutex<Option<Arc<SharedMemoryController>>>,
    ctrl: Mutex<Option<IpcChannel>>,
    exit_flag: Mutex<bool>,
    exit_cond: Condvar,
    stopped: AtomicBool,
}

impl Controller {
    /// Start the reactor thread and return once it is running.
    pub fn new() -> FwResult<Controller> {
        let inner = Arc::new(Inner {
            reactor: Arc::new(IpcReactor::new()),
            registry: PluginRegistry::with_builtins(),
            pool: DataBlockPool::new(),
            plugins: Mutex::new(BTreeMap::new()),
            edges: Mutex::new(HashMap::new()),
            smc: Mutex::new(None),
            ctrl: Mutex::new(None),
            exit_flag: Mutex::new(false),
            exit_cond: Condvar::new(),
            stopped: AtomicBool::new(false),
        });

        let reactor = Arc::clone(&inner.reactor);
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let thread = std::thread::Builder::new()
            .name("ctrl-reactor".into())
            .spawn(move || {
                let _ = ready_tx.send(());
                reactor.run();
            })
            .map_err(|e| FwError::Transport(format!("reactor thread: {e}")))?;
        ready_rx
            .recv_timeout(Duration::from_secs(5))
            .map_err(|_| FwError::Transport("reactor thread failed to start".into()))?;

        inner
            .reactor
            .register_timer(Duration::from_secs(1), Box::new(|| trace!("reactor tick")));

        info!("controller running");
        Ok(Controller {
            inner,
            reactor_thread: Mutex::new(Some(thread)),
        })
    }

    /// Apply one configuration message; `reply` collects results and the
    /// first error.  Also reachable through a bound control channel.
    pub fn configure(&self, config: &IpcMessage, reply: &mut IpcMessage) {
        Inner::configure(&self.inner, config, reply);
    }

    /// Block until a shutdown request arrives.
    pub fn wait_for_shutdown(&self) {
        let mut flag = self.inner.exit_flag.lock();
        while !*flag {
            self.inner.exit_cond.wait(&mut flag);
        }
    }

    /// Tear everything down: ingest, plugin workers, reactor.  Idempotent.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("controller stopping");
        if let Some(smc) = self.inner.smc.lock().take() {
            smc.shutdown();
        }
        let stages: Vec<Arc<PluginStage>> =
            self.inner.plugins.lock().values().cloned().collect();
        for stage in stages {
            stage.stop();
        }
        self.inner.reactor.stop();
        if let Some(thread) = self.reactor_thread.lock().take() {
            let _ = thread.join();
        }
    }

    /// The stage loaded under `index`, if any.
    pub fn plugin(&self, index: &str) -> Option<Arc<PluginStage>> {
        self.inner.plugins.lock().get(index).cloned()
    }

    pub fn plugin_names(&self) -> Vec<String> {
        self.inner.plugins.lock().keys().cloned().collect()
    }

    /// Factory registry, for registering additional stage classes.
    pub fn registry(&self) -> &PluginRegistry {
        &self.inner.registry
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Inner {
    fn configure(this: &Arc<Inner>, config: &IpcMessage, reply: &mut IpcMessage) {
        debug!(config = %config.encode(), "configuration submitted");

        if config.has_param(CONFIG_SHUTDOWN) {
            info!("shutdown requested");
            let mut flag = this.exit_flag.lock();
            *flag = true;
            this.exit_cond.notify_all();
        }

        if config.has_param(CONFIG_STATUS) {
            let stages: Vec<Arc<PluginStage>> = this.plugins.lock().values().cloned().collect();
            for stage in stages {
                stage.plugin().status(reply);
            }
        }

        if config.has_param(CONFIG_CTRL_ENDPOINT) {
            match config.get_param::<String>(CONFIG_CTRL_ENDPOINT) {
                Ok(endpoint) => {
                    if let Err(e) = Inner::setup_control_interface(this, &endpoint) {
                        set_error(reply, &e);
                    }
                }
                Err(e) => set_error(reply, &e),
            }
        }

        if let Some(sub) = config.get_subtree(CONFIG_PLUGIN) {
            this.configure_plugin(sub, reply);
        }

        if let Some(sub) = config.get_subtree(CONFIG_FR_SETUP) {
            if let Err(e) = this.setup_frame_receiver(sub) {
                set_error(reply, &e);
            }
        }

        // Forward sub-trees addressed to loaded plugins.
        let stages: Vec<(String, Arc<PluginStage>)> = this
            .plugins
            .lock()
            .iter()
            .map(|(n, s)| (n.clone(), Arc::clone(s)))
            .collect();
        for (index, stage) in stages {
            if let Some(sub) = config.get_subtree(&index) {
                let msg = IpcMessage::from_subtree(MsgVal::Configure, sub);
                if let Err(e) = stage.plugin().configure(&msg, reply) {
                    set_error(reply, &e);
                }
            }
        }
    }

    fn configure_plugin(&self, sub: &Value, reply: &mut IpcMessage) {
        let sub = IpcMessage::from_subtree(MsgVal::Configure, sub);

        if sub.has_param(CONFIG_PLUGIN_LIST) {
            for name in self.plugins.lock().keys() {
                reply.set_param("plugins/names[]", name.clone());
            }
        }

        if let Some(load) = sub.get_subtree(CONFIG_PLUGIN_LOAD) {
            let load = IpcMessage::from_subtree(MsgVal::Configure, load);
            if let Err(e) = self.load_plugin(&load) {
                set_error(reply, &e);
            }
        }

        if let Some(connect) = sub.get_subtree(CONFIG_PLUGIN_CONNECT) {
            let connect = IpcMessage::from_subtree(MsgVal::Configure, connect);
            if let Err(e) = self.connect_plugin(&connect) {
                set_error(reply, &e);
            }
        }

        if let Some(disconnect) = sub.get_subtree(CONFIG_PLUGIN_DISCONNECT) {
            let disconnect = IpcMessage::from_subtree(MsgVal::Configure, disconnect);
            if let Err(e) = self.disconnect_plugin(&disconnect) {
                set_error(reply, &e);
            }
        }
    }

    fn load_plugin(&self, msg: &IpcMessage) -> FwResult<()> {
        let index: String = msg.get_param(CONFIG_PLUGIN_INDEX)?;
        let class: String = msg.get_param(CONFIG_PLUGIN_NAME)?;
        let library: String = msg.get_param(CONFIG_PLUGIN_LIBRARY)?;

        let mut plugins = self.plugins.lock();
        if plugins.contains_key(&index) {
            return Err(FwError::AlreadyLoaded(index));
        }
        let plugin = self.registry.create(&class)?;
        let stage = PluginStage::new(&index, plugin);
        stage.start();
        info!(%index, %class, %library, "plugin loaded");
        plugins.insert(index, stage);
        Ok(())
    }

    fn connect_plugin(&self, msg: &IpcMessage) -> FwResult<()> {
        let index: String = msg.get_param(CONFIG_PLUGIN_INDEX)?;
        let connection: String = msg.get_param(CONFIG_PLUGIN_CONNECTION)?;

        let stage = self
            .plugins
            .lock()
            .get(&index)
            .cloned()
            .ok_or_else(|| FwError::NotLoaded(index.clone()))?;

        // Frames flow connection -> index; if index already reaches
        // connection, this edge would close a loop.
        {
            let edges = self.edges.lock();
            if reaches(&edges, &index, &connection) {
                return Err(FwError::ConfigRejected(format!(
                    "connecting `{index}` to `{connection}` would create a cycle"
                )));
            }
        }

        if connection == FRAME_RECEIVER {
            let smc = self
                .smc
                .lock()
                .clone()
                .ok_or_else(|| FwError::NotLoaded(FRAME_RECEIVER.into()))?;
            smc.register_callback(&index, stage);
        } else {
            let upstream = self
                .plugins
                .lock()
                .get(&connection)
                .cloned()
                .ok_or_else(|| FwError::NotLoaded(connection.clone()))?;
            upstream.register_sink(&index, stage);
        }
        debug!(%index, %connection, "plugin connected");
        self.edges
            .lock()
            .entry(connection)
            .or_default()
            .insert(index);
        Ok(())
    }

    fn disconnect_plugin(&self, msg: &IpcMessage) -> FwResult<()> {
        let index: String = msg.get_param(CONFIG_PLUGIN_INDEX)?;
        let connection: String = msg.get_param(CONFIG_PLUGIN_CONNECTION)?;

        if !self.plugins.lock().contains_key(&index) {
            return Err(FwError::NotLoaded(index));
        }
        if connection == FRAME_RECEIVER {
            if let Some(smc) = self.smc.lock().clone() {
                smc.remove_callback(&index);
            }
        } else if let Some(upstream) = self.plugins.lock().get(&connection).cloned() {
            upstream.remove_sink(&index);
        }
        if let Some(sinks) = self.edges.lock().get_mut(&connection) {
            sinks.remove(&index);
        }
        debug!(%index, %connection, "plugin disconnected");
        Ok(())
    }

    fn setup_control_interface(this: &Arc<Inner>, endpoint: &str) -> FwResult<()> {
        info!(endpoint, "binding control channel");
        let chan = IpcChannel::bind(endpoint)?;
        let handler_chan = chan.clone();
        let handler_inner = Arc::clone(this);
        this.reactor.register_channel(
            chan.receiver(),
            Box::new(move || Inner::handle_ctrl(&handler_inner, &handler_chan)),
        );
        *this.ctrl.lock() = Some(chan);
        Ok(())
    }

    fn setup_frame_receiver(&self, sub: &Value) -> FwResult<()> {
        let sub = IpcMessage::from_subtree(MsgVal::Configure, sub);
        let shm_name: String = sub.get_param(CONFIG_FR_SHARED_MEMORY)?;
        let release: String = sub.get_param(CONFIG_FR_RELEASE)?;
        let ready: String = sub.get_param(CONFIG_FR_READY)?;
        let grace = sub
            .get_param::<u64>(CONFIG_FR_TIMEOUT_MS)
            .ok()
            .map(Duration::from_millis);

        info!(shm = %shm_name, ready = %ready, release = %release, "frame receiver setup");
        let parser = Arc::new(SharedMemoryParser::open(&shm_name)?);

        if let Some(old) = self.smc.lock().take() {
            old.shutdown();
        }
        let smc = SharedMemoryController::new(&self.reactor, &ready, &release, &self.pool, grace)?;
        smc.set_parser(parser);
        *self.smc.lock() = Some(Arc::new(smc));
        Ok(())
    }

    // Control-channel reactor handler.  Returns false once the channel
    // is gone, removing the registration.
    fn handle_ctrl(this: &Arc<Inner>, chan: &IpcChannel) -> bool {
        loop {
            let encoded = match chan.try_recv_raw() {
                Ok(Some(encoded)) => encoded,
                Ok(None) => return true,
                Err(_) => return false,
            };
            let mut reply = IpcMessage::new(MsgType::Ack, MsgVal::Configure);
            match IpcMessage::parse(&encoded) {
                Ok(msg)
                    if msg.msg_type() == MsgType::Cmd && msg.msg_val() == MsgVal::Configure =>
                {
                    Inner::configure(this, &msg, &mut reply);
                }
                Ok(msg) => {
                    warn!(?msg, "unexpected control message");
                    set_error(&mut reply, &FwError::Transport("expected cmd/configure".into()));
                }
                Err(e) => {
                    warn!("undecodable control message: {e}");
                    set_error(&mut reply, &e);
                }
            }
            if let Err(e) = chan.send(&reply) {
                warn!("control reply failed: {e}");
            }
        }
    }
}

// Record the first error in the reply; later failures keep the first text.
fn set_error(reply: &mut IpcMessage, error: &FwError) {
    if !reply.has_param("error") {
        reply.set_param("error", error.to_string());
    }
    reply.set_nack();
}

// Is `to` reachable from `from` along the frame-flow edges?
fn reaches(edges: &HashMap<String, HashSet<String>>, from: &str, to: &str) -> bool {
    if from == to {
        return true;
    }
    let mut visited: HashSet<&str> = HashSet::new();
    let mut stack = vec![from];
    while let Some(node) = stack.pop() {
        if let Some(sinks) = edges.get(node) {
            for sink in sinks {
                if sink.as_str() == to {
                    return true;
                }
                if visited.insert(sink.as_str()) {
                    stack.push(sink.as_str());
                }
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge_map(pairs: &[(&str, &str)]) -> HashMap<String, HashSet<String>> {
        let mut edges: HashMap<String, HashSet<String>> = HashMap::new();
        for (from, to) in pairs {
            edges.entry((*from).into()).or_default().insert((*to).into());
        }
        edges
    }

    #[test]
    fn reachability_follows_edges() {
        let edges = edge_map(&[("a", "b"), ("b", "c")]);
        assert!(reaches(&edges, "a", "c"));
        assert!(!reaches(&edges, "c", "a"));
        assert!(reaches(&edges, "x", "x"), "self is always reachable");
    }
}
