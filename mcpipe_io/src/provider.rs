use super::{ConnectStatus, IoEvent, IoModel, Result, SocketId, SocketState, TimerId};
use bytes::{Bytes, BytesMut};
use std::io::{IoSlice, IoSliceMut};
use std::net::SocketAddr;
use std::time::Duration;

pub trait Timers {
    fn create_timer(&mut self) -> TimerId;
    /// Arms the timer to fire once after `after`, replacing any earlier schedule.
    fn schedule_timer(&mut self, timer: TimerId, after: Duration) -> Result<()>;
    fn cancel_timer(&mut self, timer: TimerId) -> Result<()>;
    fn destroy_timer(&mut self, timer: TimerId) -> Result<()>;
}

/// Poll style sockets. All calls are non-blocking; a call that cannot make
/// progress fails with `WouldBlock` and the caller waits for a `Ready` event
/// on the interest it registered with `watch`.
pub trait ReadinessIo {
    fn create_socket(&mut self, addr: SocketAddr) -> Result<SocketId>;
    /// Starts connecting. Call again once the socket reports writable to learn
    /// whether the connection was established.
    fn connect(&mut self, socket: SocketId) -> Result<ConnectStatus>;
    fn send(&mut self, socket: SocketId, buf: &[u8]) -> Result<usize>;
    fn sendv(&mut self, socket: SocketId, bufs: &[IoSlice]) -> Result<usize>;
    fn recv(&mut self, socket: SocketId, buf: &mut [u8]) -> Result<usize>;
    fn recvv(&mut self, socket: SocketId, bufs: &mut [IoSliceMut]) -> Result<usize>;
    /// Replaces the interest set; `Interest::NONE` stops watching.
    fn watch(&mut self, socket: SocketId, interest: super::Interest) -> Result<()>;
    fn close(&mut self, socket: SocketId) -> Result<()>;
    fn state(&self, socket: SocketId) -> Option<SocketState>;
}

/// IOCP style sockets. Operations are submitted with their buffers and finish
/// later as `Connected`, `WriteDone` and `ReadDone` events that hand the
/// buffers back.
pub trait CompletionIo {
    fn create_socket(&mut self, addr: SocketAddr) -> Result<SocketId>;
    fn start_connect(&mut self, socket: SocketId) -> Result<()>;
    /// Writes every buffer in order. Completes once all bytes are written or
    /// the socket fails.
    fn submit_write(&mut self, socket: SocketId, bufs: Vec<Bytes>) -> Result<()>;
    /// Reads at most the spare capacity of `buf` (at least one byte) and
    /// appends it.
    fn submit_read(&mut self, socket: SocketId, buf: BytesMut) -> Result<()>;
    /// Asynchronous: operations already submitted still complete (most likely
    /// with an error), followed by a `Closed` event.
    fn close(&mut self, socket: SocketId) -> Result<()>;
    fn state(&self, socket: SocketId) -> Option<SocketState>;
}

/// The one flavor of socket operations a provider offers.
pub enum IoOps<'a> {
    Readiness(&'a mut dyn ReadinessIo),
    Completion(&'a mut dyn CompletionIo),
}

/// A host event loop. The engine calls into `ops()` and the timers; the host
/// collects what happened with `wait` and feeds it back to the engine.
pub trait IoProvider: Timers {
    fn model(&self) -> IoModel;

    fn ops(&mut self) -> IoOps<'_>;

    /// Blocks for at most `timeout` (forever when `None`, as long as anything
    /// could still happen) and returns the events observed.
    fn wait(&mut self, timeout: Option<Duration>) -> Result<Vec<IoEvent>>;
}
