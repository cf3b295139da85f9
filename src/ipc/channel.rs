//! Paired two-way message channels.
//!
//! Two transports share one surface:
//!
//! - `inproc://<name>` — a process-wide registry of crossbeam channel pairs.
//!   Whichever side arrives first (bind or connect) creates the pair and
//!   parks the peer half under the name; the second side claims it.  This is
//!   the default transport and the one the tests use.
//! - `tcp://host:port` — newline-delimited JSON over a TCP socket.  A bound
//!   channel accepts one client at a time (a newer client replaces the
//!   previous one); a connected channel is a single client.
//!
//! Inbound traffic of both transports drains into a crossbeam receiver so a
//! reactor can poll many channels uniformly.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, OnceLock};
use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{FwError, FwResult};
use crate::ipc::message::IpcMessage;

/// One endpoint of a paired message channel.
#[derive(Clone)]
pub struct IpcChannel {
    rx: Receiver<String>,
    out: Outbound,
    endpoint: Option<String>,
}

#[derive(Clone)]
enum Outbound {
    Pair(Sender<String>),
    Tcp(Arc<Mutex<Option<TcpStream>>>),
}

// Parked peer halves of inproc pairs, keyed by endpoint name.
fn inproc_registry() -> &'static Mutex<HashMap<String, IpcChannel>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, IpcChannel>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

impl IpcChannel {
    /// Create a connected in-process pair directly, without naming it.
    pub fn pair() -> (IpcChannel, IpcChannel) {
        let (a_tx, a_rx) = unbounded();
        let (b_tx, b_rx) = unbounded();
        (
            IpcChannel {
                rx: a_rx,
                out: Outbound::Pair(b_tx),
                endpoint: None,
            },
            IpcChannel {
                rx: b_rx,
                out: Outbound::Pair(a_tx),
                endpoint: None,
            },
        )
    }

    /// Bind the server side of `endpoint`.
    pub fn bind(endpoint: &str) -> FwResult<IpcChannel> {
        if let Some(name) = endpoint.strip_prefix("inproc://") {
            Ok(Self::inproc(name, endpoint))
        } else if let Some(addr) = endpoint.strip_prefix("tcp://") {
            Self::tcp_bind(addr, endpoint)
        } else {
            Err(FwError::Transport(format!("unknown endpoint `{endpoint}`")))
        }
    }

    /// Connect the client side of `endpoint`.
    pub fn connect(endpoint: &str) -> FwResult<IpcChannel> {
        if let Some(name) = endpoint.strip_prefix("inproc://") {
            Ok(Self::inproc(name, endpoint))
        } else if let Some(addr) = endpoint.strip_prefix("tcp://") {
            Self::tcp_connect(addr, endpoint)
        } else {
            Err(FwError::Transport(format!("unknown endpoint `{endpoint}`")))
        }
    }

    fn inproc(name: &str, endpoint: &str) -> IpcChannel {
        let mut registry = inproc_registry().lock();
        if let Some(mut chan) = registry.remove(name) {
            chan.endpoint = Some(endpoint.to_owned());
            return chan;
        }
        let (mut ours, peer) = Self::pair();
        ours.endpoint = Some(endpoint.to_owned());
        registry.insert(name.to_owned(), peer);
        ours
    }

    fn tcp_bind(addr: &str, endpoint: &str) -> FwResult<IpcChannel> {
        let listener = TcpListener::bind(addr)
            .map_err(|e| FwError::Transport(format!("bind {endpoint}: {e}")))?;
        let (in_tx, in_rx) = unbounded();
        let slot: Arc<Mutex<Option<TcpStream>>> = Arc::new(Mutex::new(None));
        let accept_slot = Arc::clone(&slot);
        thread::Builder::new()
            .name("ipc-accept".into())
            .spawn(move || {
                for stream in listener.incoming() {
                    match stream {
                        Ok(stream) => {
                            debug!(peer = ?stream.peer_addr().ok(), "control client connected");
                            if let Ok(write_half) = stream.try_clone() {
                                *accept_slot.lock() = Some(write_half);
                            }
                            spawn_line_reader(stream, in_tx.clone());
                        }
                        Err(e) => {
                            warn!("control accept failed: {e}");
                            break;
                        }
                    }
                }
            })
            .map_err(|e| FwError::Transport(format!("accept thread: {e}")))?;
        Ok(IpcChannel {
            rx: in_rx,
            out: Outbound::Tcp(slot),
            endpoint: Some(endpoint.to_owned()),
        })
    }

    fn tcp_connect(addr: &str, endpoint: &str) -> FwResult<IpcChannel> {
        let stream = TcpStream::connect(addr)
            .map_err(|e| FwError::Transport(format!("connect {endpoint}: {e}")))?;
        let (in_tx, in_rx) = unbounded();
        let write_half = stream
            .try_clone()
            .map_err(|e| FwError::Transport(format!("clone {endpoint}: {e}")))?;
        spawn_line_reader(stream, in_tx);
        Ok(IpcChannel {
            rx: in_rx,
            out: Outbound::Tcp(Arc::new(Mutex::new(Some(write_half)))),
            endpoint: Some(endpoint.to_owned()),
        })
    }

    /// Send one message to the peer.
    pub fn send(&self, msg: &IpcMessage) -> FwResult<()> {
        let encoded = msg.encode();
        match &self.out {
            Outbound::Pair(tx) => tx
                .send(encoded)
                .map_err(|_| FwError::Transport("peer closed".into())),
            Outbound::Tcp(slot) => {
                let mut guard = slot.lock();
                let stream = guard
                    .as_mut()
                    .ok_or_else(|| FwError::Transport("no client connected".into()))?;
                writeln!(stream, "{encoded}")
                    .and_then(|_| stream.flush())
                    .map_err(|e| FwError::Transport(format!("send: {e}")))
            }
        }
    }

    /// Block until a message arrives.
    pub fn recv(&self) -> FwResult<IpcMessage> {
        let encoded = self
            .rx
            .recv()
            .map_err(|_| FwError::Transport("channel closed".into()))?;
        IpcMessage::parse(&encoded)
    }

    /// Fetch a pending message without blocking.  `Ok(None)` when idle,
    /// an error once the peer is gone.
    pub fn try_recv(&self) -> FwResult<Option<IpcMessage>> {
        match self.try_recv_raw()? {
            Some(encoded) => IpcMessage::parse(&encoded).map(Some),
            None => Ok(None),
        }
    }

    /// Fetch pending wire text without decoding it, so the caller can turn
    /// a malformed message into an error reply instead of losing the
    /// channel.
    pub fn try_recv_raw(&self) -> FwResult<Option<String>> {
        match self.rx.try_recv() {
            Ok(encoded) => Ok(Some(encoded)),
            Err(crossbeam_channel::TryRecvError::Empty) => Ok(None),
            Err(crossbeam_channel::TryRecvError::Disconnected) => {
                Err(FwError::Transport("channel closed".into()))
            }
        }
    }

    /// Block up to `timeout` for a message.
    pub fn recv_timeout(&self, timeout: std::time::Duration) -> FwResult<Option<IpcMessage>> {
        match self.rx.recv_timeout(timeout) {
            Ok(encoded) => IpcMessage::parse(&encoded).map(Some),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => Ok(None),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                Err(FwError::Transport("channel closed".into()))
            }
        }
    }

    /// The raw inbound receiver, for reactor polling.
    pub fn receiver(&self) -> Receiver<String> {
        self.rx.clone()
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }
}

fn spawn_line_reader(stream: TcpStream, in_tx: Sender<String>) {
    let _ = thread::Builder::new().name("ipc-read".into()).spawn(move || {
        let reader = BufReader::new(stream);
        for line in reader.lines() {
            match line {
                Ok(line) if line.is_empty() => continue,
                Ok(line) => {
                    if in_tx.send(line).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });
}
