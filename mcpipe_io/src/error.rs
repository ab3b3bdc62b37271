use super::{SocketId, SocketState, TimerId};

quick_error! {
    #[derive(Debug)]
    pub enum IoError {
        Io(err: std::io::Error) {
            from()
            display("{}", err)
        }
        UnknownSocket(socket: SocketId) {
            display("Socket {} does not exist", socket)
        }
        UnknownTimer(timer: TimerId) {
            display("Timer {} does not exist", timer)
        }
        WrongState(socket: SocketId, state: SocketState) {
            display("Socket {} cannot do that while {:?}", socket, state)
        }
    }
}

impl IoError {
    pub fn is_would_block(&self) -> bool {
        match self {
            IoError::Io(err) => err.kind() == std::io::ErrorKind::WouldBlock,
            _ => false,
        }
    }

    pub fn kind(&self) -> std::io::ErrorKind {
        match self {
            IoError::Io(err) => err.kind(),
            IoError::WrongState(..) => std::io::ErrorKind::NotConnected,
            _ => std::io::ErrorKind::Other,
        }
    }
}

pub type Result<T> = std::result::Result<T, IoError>;
