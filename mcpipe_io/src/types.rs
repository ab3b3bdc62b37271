use bytes::{Bytes, BytesMut};
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoModel {
    /// The host reports when a socket can be read or written, the engine
    /// performs the non-blocking call itself.
    Readiness,
    /// The engine hands buffers to the host and is told when the operation
    /// has finished.
    Completion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u64);

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest(u8);

impl Interest {
    pub const NONE: Interest = Interest(0);
    pub const READ: Interest = Interest(0x02);
    pub const WRITE: Interest = Interest(0x04);
    pub const ERROR: Interest = Interest(0x08);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: Interest) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn remove(self, other: Interest) -> Interest {
        Interest(self.0 & !other.0)
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, other: Interest) -> Interest {
        Interest(self.0 | other.0)
    }
}

impl BitOrAssign for Interest {
    fn bitor_assign(&mut self, other: Interest) {
        self.0 |= other.0
    }
}

impl BitAnd for Interest {
    type Output = Interest;

    fn bitand(self, other: Interest) -> Interest {
        Interest(self.0 & other.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Unconnected,
    Connecting,
    Connected,
    /// Closed by the owner or failed; operations submitted earlier still complete.
    Closing,
    Closed,
}

impl SocketState {
    /// The state after moving to `next`, or `None` if the move is not allowed.
    pub fn transition(self, next: SocketState) -> Option<SocketState> {
        use SocketState::*;
        let allowed = match (self, next) {
            (Unconnected, Connecting) => true,
            (Connecting, Connected) => true,
            (Unconnected, Closing) | (Connecting, Closing) | (Connected, Closing) => true,
            (Unconnected, Closed) | (Closing, Closed) => true,
            _ => false,
        };
        if allowed {
            Some(next)
        } else {
            None
        }
    }

    pub fn is_open(self) -> bool {
        match self {
            SocketState::Closing | SocketState::Closed => false,
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStatus {
    Connected,
    InProgress,
}

/// Something the host loop observed, handed to the engine to act upon.
#[derive(Debug)]
pub enum IoEvent {
    /// Readiness model: the socket can make progress in the given directions.
    Ready { socket: SocketId, ready: Interest },
    /// Completion model: a connect started with `start_connect` finished.
    Connected {
        socket: SocketId,
        result: std::io::Result<()>,
    },
    /// Completion model: a submitted write finished; the buffers come back.
    WriteDone {
        socket: SocketId,
        result: std::io::Result<usize>,
        bufs: Vec<Bytes>,
    },
    /// Completion model: a submitted read finished; received bytes were
    /// appended to `buf`. `Ok(0)` means the peer closed the connection.
    ReadDone {
        socket: SocketId,
        result: std::io::Result<usize>,
        buf: BytesMut,
    },
    /// Completion model: the socket finished closing and nothing is pending on it.
    Closed { socket: SocketId },
    Timer { timer: TimerId },
}

impl IoEvent {
    pub fn socket(&self) -> Option<SocketId> {
        match self {
            IoEvent::Ready { socket, .. }
            | IoEvent::Connected { socket, .. }
            | IoEvent::WriteDone { socket, .. }
            | IoEvent::ReadDone { socket, .. }
            | IoEvent::Closed { socket } => Some(*socket),
            IoEvent::Timer { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interest_bits() {
        let both = Interest::READ | Interest::WRITE;
        assert_eq!(both.bits(), 0x06);
        assert!(both.contains(Interest::READ));
        assert!(!both.contains(Interest::ERROR));
        assert!(!both.contains(Interest::NONE));
        assert_eq!(both.remove(Interest::WRITE), Interest::READ);
        assert!(Interest::default().is_empty());
    }

    #[test]
    fn socket_transitions() {
        use SocketState::*;
        assert_eq!(Unconnected.transition(Connecting), Some(Connecting));
        assert_eq!(Connecting.transition(Connected), Some(Connected));
        assert_eq!(Connected.transition(Closing), Some(Closing));
        assert_eq!(Closing.transition(Closed), Some(Closed));

        assert_eq!(Connected.transition(Connecting), None);
        assert_eq!(Closed.transition(Connected), None);
        assert_eq!(Closing.transition(Connected), None);
        assert!(!Closing.is_open());
    }
}
