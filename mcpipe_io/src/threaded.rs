use super::timer::TimerTable;
use super::{
    CompletionIo, IoError, IoEvent, IoModel, IoOps, IoProvider, Result, SocketId, SocketState,
    TimerId, Timers,
};
use bytes::{Bytes, BytesMut};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use std::collections::{BTreeMap, VecDeque};
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::{Duration, Instant};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

enum Completion {
    Connected {
        socket: SocketId,
        result: std::io::Result<TcpStream>,
    },
    WriteDone {
        socket: SocketId,
        result: std::io::Result<usize>,
        bufs: Vec<Bytes>,
    },
    ReadDone {
        socket: SocketId,
        result: std::io::Result<usize>,
        buf: BytesMut,
    },
}

impl Completion {
    fn socket(&self) -> SocketId {
        match self {
            Completion::Connected { socket, .. }
            | Completion::WriteDone { socket, .. }
            | Completion::ReadDone { socket, .. } => *socket,
        }
    }
}

struct Workers {
    stream: TcpStream,
    writes: Sender<Vec<Bytes>>,
    reads: Sender<BytesMut>,
}

struct ThreadedSocket {
    addr: SocketAddr,
    state: SocketState,
    workers: Option<Workers>,
    // operations submitted and not yet reported back
    pending: usize,
}

/// Completion provider emulated with blocking sockets: every connected socket
/// gets a writer and a reader thread, and finished operations are posted to a
/// single completion channel drained by `wait`.
pub struct ThreadedLoop {
    sockets: BTreeMap<SocketId, ThreadedSocket>,
    next_socket: u64,
    timers: TimerTable,
    completions: (Sender<Completion>, Receiver<Completion>),
    ready: VecDeque<IoEvent>,
    connect_timeout: Duration,
}

impl Default for ThreadedLoop {
    fn default() -> ThreadedLoop {
        ThreadedLoop {
            sockets: BTreeMap::new(),
            next_socket: 0,
            timers: TimerTable::default(),
            completions: channel::unbounded(),
            ready: VecDeque::new(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl ThreadedLoop {
    pub fn new() -> ThreadedLoop {
        ThreadedLoop::default()
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn socket_mut(&mut self, socket: SocketId) -> Result<&mut ThreadedSocket> {
        self.sockets
            .get_mut(&socket)
            .ok_or(IoError::UnknownSocket(socket))
    }

    fn connected_workers(&mut self, socket: SocketId) -> Result<&mut ThreadedSocket> {
        let entry = self.socket_mut(socket)?;
        match (entry.state, entry.workers.is_some()) {
            (SocketState::Connected, true) => Ok(entry),
            (state, _) => Err(IoError::WrongState(socket, state)),
        }
    }

    fn pending_total(&self) -> usize {
        self.sockets.values().map(|entry| entry.pending).sum()
    }

    fn spawn_workers(&self, socket: SocketId, stream: &TcpStream) -> std::io::Result<Workers> {
        let (writes, write_jobs) = channel::unbounded::<Vec<Bytes>>();
        let (reads, read_jobs) = channel::unbounded::<BytesMut>();

        let mut writer = stream.try_clone()?;
        let done = self.completions.0.clone();
        std::thread::Builder::new()
            .name(format!("mcpipe-writer-{}", socket.0))
            .spawn(move || {
                for bufs in write_jobs.iter() {
                    let result = write_all(&mut writer, &bufs);
                    if done.send(Completion::WriteDone { socket, result, bufs }).is_err() {
                        break;
                    }
                }
            })?;

        let mut reader = stream.try_clone()?;
        let done = self.completions.0.clone();
        std::thread::Builder::new()
            .name(format!("mcpipe-reader-{}", socket.0))
            .spawn(move || {
                for mut buf in read_jobs.iter() {
                    let result = read_into(&mut reader, &mut buf);
                    if done.send(Completion::ReadDone { socket, result, buf }).is_err() {
                        break;
                    }
                }
            })?;

        Ok(Workers {
            stream: stream.try_clone()?,
            writes,
            reads,
        })
    }

    /// Turns a worker completion into an event, updating the socket's books.
    fn complete(&mut self, completion: Completion) -> Option<IoEvent> {
        let socket = completion.socket();
        let (state, drained) = {
            let entry = self.sockets.get_mut(&socket)?;
            entry.pending = entry.pending.saturating_sub(1);
            (entry.state, entry.pending == 0)
        };

        let event = match completion {
            Completion::Connected { socket, result } => {
                let result = match (result, state) {
                    (Ok(stream), SocketState::Connecting) => self.attach(socket, stream),
                    (Ok(_), _) => Err(std::io::Error::new(
                        std::io::ErrorKind::ConnectionAborted,
                        "socket closed while connecting",
                    )),
                    (Err(err), _) => Err(err),
                };
                if result.is_err() && state == SocketState::Connecting {
                    if let Some(entry) = self.sockets.get_mut(&socket) {
                        entry.state = SocketState::Closing;
                    }
                }
                IoEvent::Connected { socket, result }
            }
            Completion::WriteDone { socket, result, bufs } => IoEvent::WriteDone { socket, result, bufs },
            Completion::ReadDone { socket, result, buf } => IoEvent::ReadDone { socket, result, buf },
        };

        if drained && state == SocketState::Closing {
            self.finish_close(socket);
        }
        Some(event)
    }

    fn attach(&mut self, socket: SocketId, stream: TcpStream) -> std::io::Result<()> {
        stream.set_nodelay(true)?;
        let workers = self.spawn_workers(socket, &stream)?;
        if let Some(entry) = self.sockets.get_mut(&socket) {
            entry.workers = Some(workers);
            entry.state = SocketState::Connected;
        }
        Ok(())
    }

    fn finish_close(&mut self, socket: SocketId) {
        if let Some(entry) = self.sockets.remove(&socket) {
            log::trace!("Socket {} to {} is closed", socket, entry.addr);
        }
        self.ready.push_back(IoEvent::Closed { socket });
    }
}

fn write_all(writer: &mut TcpStream, bufs: &[Bytes]) -> std::io::Result<usize> {
    let mut written = 0;
    for buf in bufs {
        writer.write_all(buf)?;
        written += buf.len();
    }
    Ok(written)
}

fn read_into(reader: &mut TcpStream, buf: &mut BytesMut) -> std::io::Result<usize> {
    let start = buf.len();
    let spare = std::cmp::max(buf.capacity() - start, 1);
    buf.resize(start + spare, 0);
    let result = reader.read(&mut buf[start..]);
    buf.truncate(start + *result.as_ref().unwrap_or(&0));
    result
}

impl CompletionIo for ThreadedLoop {
    fn create_socket(&mut self, addr: SocketAddr) -> Result<SocketId> {
        self.next_socket += 1;
        let id = SocketId(self.next_socket);
        self.sockets.insert(
            id,
            ThreadedSocket {
                addr,
                state: SocketState::Unconnected,
                workers: None,
                pending: 0,
            },
        );
        Ok(id)
    }

    fn start_connect(&mut self, socket: SocketId) -> Result<()> {
        let timeout = self.connect_timeout;
        let done = self.completions.0.clone();
        let entry = self.socket_mut(socket)?;
        entry.state = entry
            .state
            .transition(SocketState::Connecting)
            .ok_or(IoError::WrongState(socket, entry.state))?;
        entry.pending += 1;

        let addr = entry.addr;
        let spawned = std::thread::Builder::new()
            .name(format!("mcpipe-connect-{}", socket.0))
            .spawn(move || {
                let result = TcpStream::connect_timeout(&addr, timeout);
                let _ = done.send(Completion::Connected { socket, result });
            });
        if let Err(err) = spawned {
            let entry = self.socket_mut(socket)?;
            entry.pending -= 1;
            entry.state = SocketState::Closing;
            return Err(err.into());
        }
        Ok(())
    }

    fn submit_write(&mut self, socket: SocketId, bufs: Vec<Bytes>) -> Result<()> {
        let entry = self.connected_workers(socket)?;
        if let Some(workers) = entry.workers.as_ref() {
            if workers.writes.send(bufs).is_err() {
                return Err(IoError::WrongState(socket, entry.state));
            }
        }
        entry.pending += 1;
        Ok(())
    }

    fn submit_read(&mut self, socket: SocketId, buf: BytesMut) -> Result<()> {
        let entry = self.connected_workers(socket)?;
        if let Some(workers) = entry.workers.as_ref() {
            if workers.reads.send(buf).is_err() {
                return Err(IoError::WrongState(socket, entry.state));
            }
        }
        entry.pending += 1;
        Ok(())
    }

    fn close(&mut self, socket: SocketId) -> Result<()> {
        let (drained, already) = {
            let entry = self.socket_mut(socket)?;
            let already = entry.state == SocketState::Closing;
            entry.state = SocketState::Closing;
            // dropping the senders ends the workers once their queues are empty;
            // the shutdown makes queued operations fail instead of blocking
            if let Some(workers) = entry.workers.take() {
                let _ = workers.stream.shutdown(Shutdown::Both);
            }
            (entry.pending == 0, already)
        };
        log::trace!("Closing socket {}, already closing: {}", socket, already);
        if drained {
            self.finish_close(socket);
        }
        Ok(())
    }

    fn state(&self, socket: SocketId) -> Option<SocketState> {
        self.sockets.get(&socket).map(|entry| entry.state)
    }
}

impl Timers for ThreadedLoop {
    fn create_timer(&mut self) -> TimerId {
        self.timers.create()
    }

    fn schedule_timer(&mut self, timer: TimerId, after: Duration) -> Result<()> {
        self.timers.schedule(timer, after)
    }

    fn cancel_timer(&mut self, timer: TimerId) -> Result<()> {
        self.timers.cancel(timer)
    }

    fn destroy_timer(&mut self, timer: TimerId) -> Result<()> {
        self.timers.destroy(timer)
    }
}

impl IoProvider for ThreadedLoop {
    fn model(&self) -> IoModel {
        IoModel::Completion
    }

    fn ops(&mut self) -> IoOps<'_> {
        IoOps::Completion(self)
    }

    fn wait(&mut self, timeout: Option<Duration>) -> Result<Vec<IoEvent>> {
        let mut events: Vec<IoEvent> = self.ready.drain(..).collect();

        let budget = if events.is_empty() {
            self.timers.wait_budget(timeout)
        } else {
            Some(Duration::from_millis(0))
        };

        let first = match budget {
            Some(budget) => match self.completions.1.recv_timeout(budget) {
                Ok(completion) => Some(completion),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => None,
            },
            None if self.pending_total() > 0 => self.completions.1.recv().ok(),
            None => None,
        };

        if let Some(completion) = first {
            events.extend(self.complete(completion));
            while let Ok(completion) = self.completions.1.try_recv() {
                events.extend(self.complete(completion));
            }
        }
        events.extend(self.ready.drain(..));

        for timer in self.timers.expire(Instant::now()) {
            events.push(IoEvent::Timer { timer });
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn next_event(io: &mut ThreadedLoop) -> IoEvent {
        loop {
            let mut events = io.wait(Some(Duration::from_secs(5))).unwrap();
            if !events.is_empty() {
                assert_eq!(events.len(), 1, "{:?}", events);
                return events.remove(0);
            }
        }
    }

    fn connect(io: &mut ThreadedLoop, addr: SocketAddr) -> SocketId {
        let socket = io.create_socket(addr).unwrap();
        io.start_connect(socket).unwrap();
        match next_event(io) {
            IoEvent::Connected { socket: connected, result } => {
                assert_eq!(connected, socket);
                result.unwrap();
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(io.state(socket), Some(SocketState::Connected));
        socket
    }

    #[test]
    fn write_then_read_back() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 10];
            stream.read_exact(&mut buf).unwrap();
            stream.write_all(&buf).unwrap();
        });

        let mut io = ThreadedLoop::new();
        let socket = connect(&mut io, addr);

        let bufs = vec![Bytes::from_static(b"01234"), Bytes::from_static(b"56789")];
        io.submit_write(socket, bufs.clone()).unwrap();
        match next_event(&mut io) {
            IoEvent::WriteDone { result, bufs: returned, .. } => {
                assert_eq!(result.unwrap(), 10);
                assert_eq!(returned, bufs);
            }
            other => panic!("unexpected {:?}", other),
        }

        let mut received = BytesMut::new();
        while received.len() < 10 {
            received.reserve(64);
            io.submit_read(socket, received).unwrap();
            received = match next_event(&mut io) {
                IoEvent::ReadDone { result, buf, .. } => {
                    assert!(result.unwrap() > 0);
                    buf
                }
                other => panic!("unexpected {:?}", other),
            };
        }
        assert_eq!(&received[..], b"0123456789");
        server.join().unwrap();
    }

    #[test]
    fn close_completes_pending_reads() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (release, hold) = channel::bounded::<()>(1);
        let server = std::thread::spawn(move || {
            let (_stream, _) = listener.accept().unwrap();
            let _ = hold.recv();
        });

        let mut io = ThreadedLoop::new();
        let socket = connect(&mut io, addr);
        io.submit_read(socket, BytesMut::with_capacity(16)).unwrap();
        io.close(socket).unwrap();
        assert_eq!(io.state(socket), Some(SocketState::Closing));
        assert!(io.submit_read(socket, BytesMut::with_capacity(16)).is_err());

        let mut events = Vec::new();
        while events.len() < 2 {
            events.extend(io.wait(Some(Duration::from_secs(5))).unwrap());
        }
        match &events[0] {
            IoEvent::ReadDone { result, .. } => {
                assert!(result.as_ref().map(|n| *n == 0).unwrap_or(true));
            }
            other => panic!("unexpected {:?}", other),
        }
        match &events[1] {
            IoEvent::Closed { socket: closed } => assert_eq!(*closed, socket),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(io.state(socket), None);

        release.send(()).unwrap();
        server.join().unwrap();
    }

    #[test]
    fn refused_connection() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let mut io = ThreadedLoop::new();
        let socket = io.create_socket(addr).unwrap();
        io.start_connect(socket).unwrap();
        match next_event(&mut io) {
            IoEvent::Connected { result, .. } => assert!(result.is_err()),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(io.state(socket), Some(SocketState::Closing));
        io.close(socket).unwrap();
        match next_event(&mut io) {
            IoEvent::Closed { socket: closed } => assert_eq!(closed, socket),
            other => panic!("unexpected {:?}", other),
        }
    }
}
