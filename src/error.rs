use mcpipe_io::IoError;
use mcpipe_protocol::ProtocolError;
use mcpipe_vbucket::RoutingError;
use std::fmt;
use std::io::ErrorKind;

/// A transport failure, kept cloneable so one broken connection can fail
/// every packet it carried with the same error.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportError {
    pub kind: ErrorKind,
    pub detail: String,
}

impl TransportError {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> TransportError {
        TransportError {
            kind,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.detail)
    }
}

impl From<&std::io::Error> for TransportError {
    fn from(err: &std::io::Error) -> TransportError {
        TransportError::new(err.kind(), err.to_string())
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> TransportError {
        TransportError::from(&err)
    }
}

impl From<IoError> for TransportError {
    fn from(err: IoError) -> TransportError {
        TransportError::new(err.kind(), err.to_string())
    }
}

quick_error! {
    #[derive(Debug, Clone, PartialEq)]
    pub enum Error {
        Routing(err: RoutingError) {
            from()
            display("Routing failed: {}", err)
        }
        Transport(err: TransportError) {
            from()
            display("Transport failed: {}", err)
        }
        Protocol(err: ProtocolError) {
            from()
            display("Protocol violation: {}", err)
        }
        TopologyExhausted(redirects: u8) {
            display("Gave up after {} NOT_MY_VBUCKET redirects", redirects)
        }
        Timeout {
            display("Operation timed out")
        }
        Cancelled {
            display("Operation was cancelled")
        }
        Shutdown {
            display("Engine is shutting down")
        }
    }
}

impl From<IoError> for Error {
    fn from(err: IoError) -> Error {
        Error::Transport(err.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
