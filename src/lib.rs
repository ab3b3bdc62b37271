//! Client side request engine for memcached binary protocol clusters.
//!
//! Requests are routed to a shard through the current [`ShardMap`], queued on
//! the pipeline of the server owning it and written in batches when the host
//! calls [`Engine::flush`]. Replies are matched back by opaque; a
//! NOT_MY_VBUCKET reply sends the request on to another server or into the
//! retry queue.
//!
//! [`ShardMap`]: mcpipe_vbucket::ShardMap

#[macro_use]
extern crate quick_error;

mod dispatch;
mod engine;
mod error;
mod queue;
mod retry;
mod server;
mod settings;

pub use dispatch::{Dispatch, Dispatcher, TopologyListener};
pub use engine::Engine;
pub use error::{Error, Result, TransportError};
pub use queue::{
    CommandQueue, DynRouter, EnqueueError, Handle, Installed, Outcome, Packet, PacketFlags, Pipeline, Rejected,
    Release, Request, Response, Route, Token, ValueBuf,
};
pub use retry::RetryQueue;
pub use server::{Server, ServerState};
pub use settings::{Settings, SettingsBuilder};
