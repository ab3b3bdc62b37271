use crate::error::TransportError;
use crate::queue::Pipeline;
use crate::settings::Settings;
use crate::{Error, Result};
use bytes::{Bytes, BytesMut};
use log::{debug, trace, warn};
use mcpipe_io::{CompletionIo, ConnectStatus, Interest, IoError, ReadinessIo, SocketId, TimerId};
use mcpipe_protocol::{Frame, FrameReader};
use std::io::{ErrorKind, IoSlice};
use std::net::SocketAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Clean,
    /// Failed; waiting for submitted operations to come back before the
    /// socket is let go.
    ErrDrain,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
    Idle,
    Connecting,
    Ready,
}

/// The connection to one cluster node, feeding bytes from its pipeline to
/// the socket and frames from the socket back to the engine.
pub struct Server {
    index: usize,
    addr: SocketAddr,
    socket: Option<SocketId>,
    link: Link,
    state: ServerState,
    reader: FrameReader,
    interest: Interest,
    writes: usize,
    reading: bool,
    protocol_errors: usize,
    max_protocol_errors: usize,
    max_iovecs: usize,
    pub(crate) connect_timer: Option<TimerId>,
}

fn closed_by_peer() -> Error {
    Error::Transport(TransportError::new(
        ErrorKind::ConnectionReset,
        "connection closed by peer",
    ))
}

impl Server {
    pub fn new(index: usize, addr: SocketAddr, settings: &Settings) -> Server {
        Server {
            index,
            addr,
            socket: None,
            link: Link::Idle,
            state: ServerState::Clean,
            reader: FrameReader::with_chunk(settings.read_chunk).max_frame(settings.max_frame_size),
            interest: Interest::NONE,
            writes: 0,
            reading: false,
            protocol_errors: 0,
            max_protocol_errors: settings.max_protocol_errors,
            max_iovecs: settings.max_iovecs,
            connect_timer: None,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn set_index(&mut self, index: usize) {
        self.index = index;
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn socket(&self) -> Option<SocketId> {
        self.socket
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.link == Link::Ready
    }

    pub fn is_connecting(&self) -> bool {
        self.link == Link::Connecting
    }

    pub fn is_idle(&self) -> bool {
        self.link == Link::Idle
    }

    /// Completion operations handed to the provider and not reported back.
    pub fn operations_pending(&self) -> usize {
        self.writes + self.reading as usize
    }

    fn live_socket(&self) -> Result<SocketId> {
        match self.socket {
            Some(socket) if self.state == ServerState::Clean => Ok(socket),
            _ => Err(Error::Transport(TransportError::new(
                ErrorKind::NotConnected,
                format!("{} has no usable socket", self.addr),
            ))),
        }
    }

    fn collect_frames(&mut self, frames: &mut Vec<Frame>) -> Result<()> {
        loop {
            match self.reader.next_frame() {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => return Ok(()),
                Err(err) => {
                    self.protocol_errors += 1;
                    warn!(
                        "<{}> (IX={}) Malformed frame ({} of {} tolerated): {}",
                        self.addr, self.index, self.protocol_errors, self.max_protocol_errors, err
                    );
                    if self.protocol_errors >= self.max_protocol_errors {
                        return Err(Error::Transport(TransportError::new(
                            ErrorKind::InvalidData,
                            err.to_string(),
                        )));
                    }
                }
            }
        }
    }

    // readiness model

    pub fn connect_readiness(&mut self, io: &mut dyn ReadinessIo) -> Result<()> {
        let socket = io.create_socket(self.addr)?;
        self.socket = Some(socket);
        debug!("<{}> (IX={}) Connecting on {}", self.addr, self.index, socket);
        match io.connect(socket)? {
            ConnectStatus::Connected => {
                self.link = Link::Ready;
                self.watch(io, Interest::READ | Interest::WRITE)
            }
            ConnectStatus::InProgress => {
                self.link = Link::Connecting;
                self.watch(io, Interest::WRITE)
            }
        }
    }

    fn watch(&mut self, io: &mut dyn ReadinessIo, interest: Interest) -> Result<()> {
        if interest != self.interest {
            io.watch(self.live_socket()?, interest)?;
            self.interest = interest;
        }
        Ok(())
    }

    /// Acts on a readiness notification: finishes a pending connect, reads
    /// whatever arrived into `frames` and writes what the pipeline holds.
    pub fn on_ready(
        &mut self,
        io: &mut dyn ReadinessIo,
        pipeline: &mut Pipeline,
        ready: Interest,
        frames: &mut Vec<Frame>,
    ) -> Result<()> {
        let socket = self.live_socket()?;

        if self.link == Link::Connecting {
            match io.connect(socket)? {
                ConnectStatus::Connected => {
                    debug!("<{}> (IX={}) Connected", self.addr, self.index);
                    self.link = Link::Ready;
                }
                ConnectStatus::InProgress => return Ok(()),
            }
        }

        if ready.contains(Interest::READ) {
            self.read_available(io, socket, frames)?;
        } else if ready.contains(Interest::ERROR) {
            return Err(closed_by_peer());
        }
        self.flush_readiness(io, pipeline)
    }

    fn read_available(&mut self, io: &mut dyn ReadinessIo, socket: SocketId, frames: &mut Vec<Frame>) -> Result<()> {
        let mut buf = vec![0u8; self.reader.bytes_wanted()];
        loop {
            match io.recv(socket, &mut buf) {
                Ok(0) => {
                    self.collect_frames(frames)?;
                    return Err(closed_by_peer());
                }
                Ok(n) => {
                    trace!("<{}> (IX={}) Read {} bytes", self.addr, self.index, n);
                    self.reader.feed(&buf[..n]);
                }
                Err(ref err) if err.is_would_block() => break,
                Err(err) => return Err(err.into()),
            }
        }
        self.collect_frames(frames)
    }

    /// Writes as much of the backlog as the socket takes, then waits for the
    /// socket to drain if anything is left.
    pub fn flush_readiness(&mut self, io: &mut dyn ReadinessIo, pipeline: &mut Pipeline) -> Result<()> {
        if self.link != Link::Ready {
            return Ok(());
        }
        let socket = self.live_socket()?;
        loop {
            let (bufs, total) = pipeline.fill_iovecs(self.max_iovecs);
            if total == 0 {
                break;
            }
            let slices: Vec<IoSlice> = bufs.iter().map(|buf| IoSlice::new(buf)).collect();
            match io.sendv(socket, &slices) {
                Ok(0) => break,
                Ok(n) => {
                    trace!("<{}> (IX={}) Wrote {} of {} bytes", self.addr, self.index, n, total);
                    pipeline.mark_flushed(n, total);
                }
                Err(ref err) if err.is_would_block() => break,
                Err(err) => return Err(err.into()),
            }
        }

        let mut interest = Interest::READ;
        if pipeline.has_unflushed() {
            interest |= Interest::WRITE;
        }
        self.watch(io, interest)
    }

    // completion model

    pub fn connect_completion(&mut self, io: &mut dyn CompletionIo) -> Result<()> {
        let socket = io.create_socket(self.addr)?;
        self.socket = Some(socket);
        debug!("<{}> (IX={}) Connecting on {}", self.addr, self.index, socket);
        io.start_connect(socket)?;
        self.link = Link::Connecting;
        Ok(())
    }

    pub fn on_connected(
        &mut self,
        io: &mut dyn CompletionIo,
        pipeline: &mut Pipeline,
        result: std::io::Result<()>,
    ) -> Result<()> {
        result.map_err(TransportError::from)?;
        debug!("<{}> (IX={}) Connected", self.addr, self.index);
        self.link = Link::Ready;
        self.post_read(io)?;
        self.flush_completion(io, pipeline)
    }

    fn post_read(&mut self, io: &mut dyn CompletionIo) -> Result<()> {
        if self.reading || self.link != Link::Ready {
            return Ok(());
        }
        let socket = self.live_socket()?;
        io.submit_read(socket, BytesMut::with_capacity(self.reader.bytes_wanted()))?;
        self.reading = true;
        Ok(())
    }

    /// Submits the unclaimed part of the backlog as writes.
    pub fn flush_completion(&mut self, io: &mut dyn CompletionIo, pipeline: &mut Pipeline) -> Result<()> {
        if self.link != Link::Ready {
            return Ok(());
        }
        let socket = self.live_socket()?;
        while pipeline.has_unflushed() {
            let (bufs, total) = pipeline.claim_iovecs(self.max_iovecs);
            if total == 0 {
                break;
            }
            trace!("<{}> (IX={}) Submitting {} bytes", self.addr, self.index, total);
            io.submit_write(socket, bufs)?;
            self.writes += 1;
        }
        Ok(())
    }

    pub fn on_write_done(
        &mut self,
        pipeline: &mut Pipeline,
        result: std::io::Result<usize>,
        bufs: &[Bytes],
    ) -> Result<()> {
        self.writes = self.writes.saturating_sub(1);
        let attempted: usize = bufs.iter().map(|buf| buf.len()).sum();
        let written = match result {
            Ok(written) => written,
            Err(err) => {
                pipeline.complete_write(0, attempted);
                return Err(TransportError::from(err).into());
            }
        };
        pipeline.complete_write(written, attempted);
        if written < attempted {
            return Err(Error::Transport(TransportError::new(
                ErrorKind::WriteZero,
                format!("wrote {} of {} bytes", written, attempted),
            )));
        }
        Ok(())
    }

    pub fn on_read_done(
        &mut self,
        io: &mut dyn CompletionIo,
        result: std::io::Result<usize>,
        buf: BytesMut,
        frames: &mut Vec<Frame>,
    ) -> Result<()> {
        self.reading = false;
        match result.map_err(TransportError::from)? {
            0 => {
                self.collect_frames(frames)?;
                Err(closed_by_peer())
            }
            n => {
                trace!("<{}> (IX={}) Read {} bytes", self.addr, self.index, n);
                self.reader.feed(&buf);
                self.collect_frames(frames)?;
                self.post_read(io)
            }
        }
    }

    // teardown

    /// Closes the socket after a failure or removal. Returns true when the
    /// server is closed for good; false means completions are still due and
    /// a `Closed` event will follow.
    pub fn close_readiness(&mut self, io: &mut dyn ReadinessIo) -> bool {
        if let Some(socket) = self.socket {
            if let Err(err) = io.close(socket) {
                debug!("<{}> (IX={}) Closing {}: {}", self.addr, self.index, socket, err);
            }
        }
        self.link = Link::Idle;
        self.state = ServerState::Closed;
        true
    }

    pub fn close_completion(&mut self, io: &mut dyn CompletionIo) -> bool {
        self.link = Link::Idle;
        let socket = match self.socket {
            Some(socket) => socket,
            None => {
                self.state = ServerState::Closed;
                return true;
            }
        };
        match io.close(socket) {
            Ok(()) => {
                self.state = ServerState::ErrDrain;
                false
            }
            Err(IoError::UnknownSocket(_)) => {
                self.state = ServerState::Closed;
                true
            }
            Err(err) => {
                warn!("<{}> (IX={}) Closing {}: {}", self.addr, self.index, socket, err);
                self.state = ServerState::ErrDrain;
                false
            }
        }
    }

    pub fn on_closed(&mut self) {
        debug!("<{}> (IX={}) Socket closed", self.addr, self.index);
        self.state = ServerState::Closed;
        self.writes = 0;
        self.reading = false;
    }
}
