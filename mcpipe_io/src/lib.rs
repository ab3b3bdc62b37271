//! Socket IO abstract layer.
//!
//! The engine never runs its own loop. It talks to an [`IoProvider`], which
//! offers exactly one of two socket flavors:
//!
//! * [`ReadinessIo`]: the host tells the engine a socket is readable or
//!   writable and the engine does the non-blocking call (`poll`, `epoll`).
//! * [`CompletionIo`]: the engine submits buffers and the host tells it when
//!   the operation finished (IOCP, io_uring).
//!
//! Both flavors share [`Timers`]. Whatever happens is returned from
//! [`IoProvider::wait`] as [`IoEvent`]s for the host to feed to the engine.
//!
//! [`PollLoop`] and [`ThreadedLoop`] are small reference hosts for each flavor.

#[macro_use]
extern crate quick_error;

pub mod error;

mod poll;
mod provider;
mod threaded;
mod timer;
mod types;

pub use error::{IoError, Result};
pub use poll::PollLoop;
pub use provider::{CompletionIo, IoOps, IoProvider, ReadinessIo, Timers};
pub use threaded::ThreadedLoop;
pub use types::{ConnectStatus, Interest, IoEvent, IoModel, SocketId, SocketState, TimerId};
