use super::timer::TimerTable;
use super::{
    ConnectStatus, Interest, IoError, IoEvent, IoModel, IoOps, IoProvider, ReadinessIo, Result,
    SocketId, SocketState, TimerId, Timers,
};
use std::collections::BTreeMap;
use std::io::{IoSlice, IoSliceMut, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::time::{Duration, Instant};

struct PollSocket {
    addr: SocketAddr,
    stream: TcpStream,
    state: SocketState,
    interest: Interest,
}

/// Readiness provider on top of `poll(2)`.
#[derive(Default)]
pub struct PollLoop {
    sockets: BTreeMap<SocketId, PollSocket>,
    next_socket: u64,
    timers: TimerTable,
}

impl PollLoop {
    pub fn new() -> PollLoop {
        PollLoop::default()
    }

    fn socket_mut(&mut self, socket: SocketId) -> Result<&mut PollSocket> {
        self.sockets
            .get_mut(&socket)
            .ok_or(IoError::UnknownSocket(socket))
    }

    fn connected(&mut self, socket: SocketId) -> Result<&mut PollSocket> {
        let entry = self.socket_mut(socket)?;
        if entry.state != SocketState::Connected {
            return Err(IoError::WrongState(socket, entry.state));
        }
        Ok(entry)
    }
}

fn nonblocking_socket(addr: &SocketAddr) -> Result<TcpStream> {
    let domain = if addr.is_ipv4() {
        libc::AF_INET
    } else {
        libc::AF_INET6
    };
    let fd = unsafe {
        libc::socket(
            domain,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    // the stream owns the descriptor from here on and closes it on drop
    let stream = unsafe { TcpStream::from_raw_fd(fd) };
    stream.set_nodelay(true)?;
    Ok(stream)
}

fn fill_sockaddr_storage(storage: &mut libc::sockaddr_storage, addr: &SocketAddr) -> libc::socklen_t {
    match addr {
        SocketAddr::V4(v4) => {
            let sa = storage as *mut _ as *mut libc::sockaddr_in;
            unsafe {
                (*sa).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sa).sin_port = v4.port().to_be();
                (*sa).sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
            }
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t
        }
        SocketAddr::V6(v6) => {
            let sa = storage as *mut _ as *mut libc::sockaddr_in6;
            unsafe {
                (*sa).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sa).sin6_port = v6.port().to_be();
                (*sa).sin6_flowinfo = v6.flowinfo();
                (*sa).sin6_addr.s6_addr = v6.ip().octets();
                (*sa).sin6_scope_id = v6.scope_id();
            }
            std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t
        }
    }
}

fn to_poll_events(interest: Interest) -> libc::c_short {
    let mut events = 0;
    if interest.contains(Interest::READ) {
        events |= libc::POLLIN;
    }
    if interest.contains(Interest::WRITE) {
        events |= libc::POLLOUT;
    }
    events
}

fn from_poll_events(revents: libc::c_short) -> Interest {
    let mut ready = Interest::NONE;
    if revents & libc::POLLIN != 0 {
        ready |= Interest::READ;
    }
    if revents & libc::POLLOUT != 0 {
        ready |= Interest::WRITE;
    }
    if revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
        ready |= Interest::ERROR;
    }
    ready
}

impl ReadinessIo for PollLoop {
    fn create_socket(&mut self, addr: SocketAddr) -> Result<SocketId> {
        let stream = nonblocking_socket(&addr)?;
        self.next_socket += 1;
        let id = SocketId(self.next_socket);
        self.sockets.insert(
            id,
            PollSocket {
                addr,
                stream,
                state: SocketState::Unconnected,
                interest: Interest::NONE,
            },
        );
        log::trace!("Created socket {} for {}", id, addr);
        Ok(id)
    }

    fn connect(&mut self, socket: SocketId) -> Result<ConnectStatus> {
        let entry = self.socket_mut(socket)?;
        match entry.state {
            SocketState::Connected => Ok(ConnectStatus::Connected),
            SocketState::Connecting => {
                if let Some(err) = entry.stream.take_error()? {
                    entry.state = SocketState::Closing;
                    return Err(err.into());
                }
                match entry.stream.peer_addr() {
                    Ok(_) => {
                        entry.state = SocketState::Connected;
                        Ok(ConnectStatus::Connected)
                    }
                    Err(ref err) if err.kind() == std::io::ErrorKind::NotConnected => {
                        Ok(ConnectStatus::InProgress)
                    }
                    Err(err) => {
                        entry.state = SocketState::Closing;
                        Err(err.into())
                    }
                }
            }
            SocketState::Unconnected => {
                let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
                let len = fill_sockaddr_storage(&mut storage, &entry.addr);
                let rv = unsafe {
                    libc::connect(
                        entry.stream.as_raw_fd(),
                        &storage as *const _ as *const libc::sockaddr,
                        len,
                    )
                };
                if rv == 0 {
                    entry.state = SocketState::Connected;
                    return Ok(ConnectStatus::Connected);
                }
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINPROGRESS) {
                    entry.state = SocketState::Connecting;
                    Ok(ConnectStatus::InProgress)
                } else {
                    entry.state = SocketState::Closing;
                    Err(err.into())
                }
            }
            state => Err(IoError::WrongState(socket, state)),
        }
    }

    fn send(&mut self, socket: SocketId, buf: &[u8]) -> Result<usize> {
        Ok(self.connected(socket)?.stream.write(buf)?)
    }

    fn sendv(&mut self, socket: SocketId, bufs: &[IoSlice]) -> Result<usize> {
        Ok(self.connected(socket)?.stream.write_vectored(bufs)?)
    }

    fn recv(&mut self, socket: SocketId, buf: &mut [u8]) -> Result<usize> {
        Ok(self.connected(socket)?.stream.read(buf)?)
    }

    fn recvv(&mut self, socket: SocketId, bufs: &mut [IoSliceMut]) -> Result<usize> {
        Ok(self.connected(socket)?.stream.read_vectored(bufs)?)
    }

    fn watch(&mut self, socket: SocketId, interest: Interest) -> Result<()> {
        self.socket_mut(socket)?.interest = interest;
        Ok(())
    }

    fn close(&mut self, socket: SocketId) -> Result<()> {
        let entry = self
            .sockets
            .remove(&socket)
            .ok_or(IoError::UnknownSocket(socket))?;
        log::trace!("Closing socket {} to {}", socket, entry.addr);
        Ok(())
    }

    fn state(&self, socket: SocketId) -> Option<SocketState> {
        self.sockets.get(&socket).map(|entry| entry.state)
    }
}

impl Timers for PollLoop {
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

impl IoProvider for PollLoop {
    fn model(&self) -> IoModel {
        IoModel::Readiness
    }

    fn ops(&mut self) -> IoOps<'_> {
        IoOps::Readiness(self)
    }

    fn wait(&mut self, timeout: Option<Duration>) -> Result<Vec<IoEvent>> {
        let watched: Vec<SocketId> = self
            .sockets
            .iter()
            .filter(|(_, entry)| !entry.interest.is_empty())
            .map(|(id, _)| *id)
            .collect();
        let mut fds: Vec<libc::pollfd> = watched
            .iter()
            .filter_map(|id| self.sockets.get(id))
            .map(|entry| libc::pollfd {
                fd: entry.stream.as_raw_fd(),
                events: to_poll_events(entry.interest),
                revents: 0,
            })
            .collect();

        let budget = self.timers.wait_budget(timeout);
        if fds.is_empty() && budget.is_none() {
            return Ok(Vec::new());
        }
        let millis = match budget {
            // round up, a sub-millisecond remainder must not spin with a zero timeout
            Some(budget) => {
                let millis = budget.as_millis() + if budget.subsec_nanos() % 1_000_000 > 0 { 1 } else { 0 };
                std::cmp::min(millis, libc::c_int::max_value() as u128) as libc::c_int
            }
            None => -1,
        };

        let rv = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, millis) };
        if rv < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                return Err(err.into());
            }
        }

        let mut events = Vec::new();
        if rv > 0 {
            for (id, fd) in watched.iter().zip(fds.iter()) {
                let ready = from_poll_events(fd.revents);
                if !ready.is_empty() {
                    events.push(IoEvent::Ready {
                        socket: *id,
                        ready,
                    });
                }
            }
        }
        for timer in self.timers.expire(Instant::now()) {
            events.push(IoEvent::Timer { timer });
        }
        Ok(events)
    }
}
