use super::{ProtocolError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Extras of set/add/replace requests and of get responses (flags only).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoreExtras {
    pub flags: u32,
    pub expiry: u32,
}

impl StoreExtras {
    pub const SIZE: usize = 8;

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u32(self.flags);
        buf.put_u32(self.expiry);
        buf.freeze()
    }
}

/// Extras of touch and get-and-touch requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TouchExtras {
    pub expiry: u32,
}

impl TouchExtras {
    pub const SIZE: usize = 4;

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u32(self.expiry);
        buf.freeze()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArithmeticExtras {
    pub delta: u64,
    pub initial: u64,
    /// `0xffff_ffff` asks the server not to create a missing counter.
    pub expiry: u32,
}

impl ArithmeticExtras {
    pub const SIZE: usize = 20;
    pub const NO_CREATE: u32 = 0xffff_ffff;

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u64(self.delta);
        buf.put_u64(self.initial);
        buf.put_u32(self.expiry);
        buf.freeze()
    }

    pub fn parse(mut extras: &[u8]) -> Result<ArithmeticExtras> {
        if extras.len() < Self::SIZE {
            return Err(ProtocolError::ShortExtras(Self::SIZE, extras.len()));
        }
        Ok(ArithmeticExtras {
            delta: extras.get_u64(),
            initial: extras.get_u64(),
            expiry: extras.get_u32(),
        })
    }
}

pub fn parse_u32(mut extras: &[u8]) -> Result<u32> {
    if extras.len() < 4 {
        return Err(ProtocolError::ShortExtras(4, extras.len()));
    }
    Ok(extras.get_u32())
}

/// Item flags carried by a get response.
pub fn parse_flags(extras: &[u8]) -> Result<u32> {
    parse_u32(extras)
}

/// Counter value carried in the body of an increment/decrement response.
pub fn parse_counter(mut value: &[u8]) -> Result<u64> {
    if value.len() < 8 {
        return Err(ProtocolError::ShortExtras(8, value.len()));
    }
    Ok(value.get_u64())
}

pub fn parse_store(mut extras: &[u8]) -> Result<StoreExtras> {
    if extras.len() < StoreExtras::SIZE {
        return Err(ProtocolError::ShortExtras(StoreExtras::SIZE, extras.len()));
    }
    Ok(StoreExtras {
        flags: extras.get_u32(),
        expiry: extras.get_u32(),
    })
}
