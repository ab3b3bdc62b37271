//! The fixed 24 byte header shared by requests and responses.
//!
//! ```text
//! Byte/     0       |       1       |       2       |       3       |
//!   +---------------+---------------+---------------+---------------+
//!  0| Magic         | Opcode        | Key length                    |
//!   +---------------+---------------+---------------+---------------+
//!  4| Extras length | Data type     | vbucket id / Status           |
//!   +---------------+---------------+---------------+---------------+
//!  8| Total body length                                             |
//!   +---------------+---------------+---------------+---------------+
//! 12| Opaque                                                        |
//!   +---------------+---------------+---------------+---------------+
//! 16| CAS                                                           |
//!   |                                                               |
//!   +---------------+---------------+---------------+---------------+
//! ```
//!
//! All multi-byte fields are big endian.

use super::{Opcode, ProtocolError, Result, Status};
use bytes::{Buf, BufMut};

pub const HEADER_SIZE: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Magic {
    Request,
    Response,
    ServerRequest,
}

impl Magic {
    pub fn from_byte(byte: u8) -> Result<Magic> {
        match byte {
            0x80 => Ok(Magic::Request),
            0x81 => Ok(Magic::Response),
            0x82 => Ok(Magic::ServerRequest),
            other => Err(ProtocolError::BadMagic(other)),
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            Magic::Request => 0x80,
            Magic::Response => 0x81,
            Magic::ServerRequest => 0x82,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub magic: Magic,
    pub opcode: u8,
    pub key_len: u16,
    pub extras_len: u8,
    pub datatype: u8,
    /// vbucket id in requests, status in responses.
    pub vbucket: u16,
    pub body_len: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl Header {
    /// Builds a request header for the given body layout. Fails when the key,
    /// the extras or the whole body do not fit their length fields.
    pub fn request(opcode: Opcode, extras_len: usize, key_len: usize, value_len: usize) -> Result<Header> {
        Header::with_magic(Magic::Request, opcode.into(), extras_len, key_len, value_len)
    }

    pub fn response(opcode: u8, status: Status, extras_len: usize, key_len: usize, value_len: usize) -> Result<Header> {
        let mut header = Header::with_magic(Magic::Response, opcode, extras_len, key_len, value_len)?;
        header.vbucket = status.into();
        Ok(header)
    }

    fn with_magic(magic: Magic, opcode: u8, extras_len: usize, key_len: usize, value_len: usize) -> Result<Header> {
        if key_len > u16::max_value() as usize {
            return Err(ProtocolError::KeyTooLong(key_len));
        }
        if extras_len > u8::max_value() as usize {
            return Err(ProtocolError::ExtrasTooLong(extras_len));
        }
        let body_len = extras_len + key_len + value_len;
        if body_len > u32::max_value() as usize {
            return Err(ProtocolError::BodyTooLong(body_len));
        }
        Ok(Header {
            magic,
            opcode,
            key_len: key_len as u16,
            extras_len: extras_len as u8,
            datatype: 0,
            vbucket: 0,
            body_len: body_len as u32,
            opaque: 0,
            cas: 0,
        })
    }

    pub fn parse(mut buf: &[u8]) -> Result<Header> {
        if buf.len() < HEADER_SIZE {
            return Err(ProtocolError::ShortHeader(buf.len()));
        }
        let magic = Magic::from_byte(buf.get_u8())?;
        let header = Header {
            magic,
            opcode: buf.get_u8(),
            key_len: buf.get_u16(),
            extras_len: buf.get_u8(),
            datatype: buf.get_u8(),
            vbucket: buf.get_u16(),
            body_len: buf.get_u32(),
            opaque: buf.get_u32(),
            cas: buf.get_u64(),
        };
        if (header.extras_len as u32 + header.key_len as u32) > header.body_len {
            return Err(ProtocolError::BodyLength(
                header.body_len,
                header.extras_len,
                header.key_len,
            ));
        }
        Ok(header)
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.magic.to_byte());
        buf.put_u8(self.opcode);
        buf.put_u16(self.key_len);
        buf.put_u8(self.extras_len);
        buf.put_u8(self.datatype);
        buf.put_u16(self.vbucket);
        buf.put_u32(self.body_len);
        buf.put_u32(self.opaque);
        buf.put_u64(self.cas);
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut raw = [0u8; HEADER_SIZE];
        let mut cursor = &mut raw[..];
        self.encode(&mut cursor);
        raw
    }

    pub fn command(&self) -> Opcode {
        Opcode::from(self.opcode)
    }

    pub fn status(&self) -> Status {
        Status::from(self.vbucket)
    }

    pub fn value_len(&self) -> usize {
        self.body_len as usize - self.extras_len as usize - self.key_len as usize
    }

    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.body_len as usize
    }
}
