use mcpipe_protocol::{ProtocolError, Status};

quick_error! {
    #[derive(Debug)]
    pub enum ClientError {
        Engine(err: mcpipe::Error) {
            from()
            display("Engine error: {}", err)
        }
        Io(err: mcpipe_io::IoError) {
            from()
            display("Io error: {}", err)
        }
        Protocol(err: ProtocolError) {
            from()
            display("Malformed reply: {}", err)
        }
        Server(status: Status) {
            display("Server answered {:?}", status)
        }
        Canceled {
            display("Request dropped before it completed")
        }
    }
}

impl ClientError {
    /// The status the server answered with, if it answered at all.
    pub fn status(&self) -> Option<Status> {
        match self {
            ClientError::Server(status) => Some(*status),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
