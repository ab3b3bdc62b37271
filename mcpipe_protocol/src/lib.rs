#[macro_use]
extern crate quick_error;

pub mod error;
pub mod extras;

mod frame;
mod header;
mod opcode;

pub use error::protocol_error::{ProtocolError, Result};
pub use extras::{ArithmeticExtras, StoreExtras, TouchExtras};
pub use frame::{Frame, FrameReader, DEFAULT_BUF_SIZE, DEFAULT_MAX_FRAME};
pub use header::{Header, Magic, HEADER_SIZE};
pub use opcode::{datatype, Opcode, ServerOpcode, Status};
