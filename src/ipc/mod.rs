//! Control-plane plumbing: message trees, paired channels, and the reactor.

pub mod channel;
pub mod message;
pub mod reactor;

pub use channel::IpcChannel;
pub use message::{IpcMessage, MsgType, MsgVal};
pub use reactor::IpcReactor;
