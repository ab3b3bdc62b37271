use super::{Header, Magic, ProtocolError, Result, HEADER_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const DEFAULT_BUF_SIZE: usize = 8 * 1024;

/// Largest frame accepted from a peer unless configured otherwise.
pub const DEFAULT_MAX_FRAME: usize = 20 * 1024 * 1024 + HEADER_SIZE;

// a single read never asks for more than this many chunks
const MAX_READ_CHUNKS: usize = 16;

/// One complete packet: header plus body (extras, key, value).
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub header: Header,
    pub body: Bytes,
}

impl Frame {
    /// Assembles a frame, fixing up the header's length fields to match the parts.
    pub fn new(mut header: Header, extras: &[u8], key: &[u8], value: &[u8]) -> Frame {
        header.extras_len = extras.len() as u8;
        header.key_len = key.len() as u16;
        header.body_len = (extras.len() + key.len() + value.len()) as u32;

        let mut body = BytesMut::with_capacity(header.body_len as usize);
        body.put_slice(extras);
        body.put_slice(key);
        body.put_slice(value);
        Frame {
            header,
            body: body.freeze(),
        }
    }

    pub fn extras(&self) -> Bytes {
        self.body.slice(..self.header.extras_len as usize)
    }

    pub fn key(&self) -> Bytes {
        let start = self.header.extras_len as usize;
        self.body.slice(start..start + self.header.key_len as usize)
    }

    pub fn value(&self) -> Bytes {
        let start = self.header.extras_len as usize + self.header.key_len as usize;
        self.body.slice(start..)
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.header.frame_len());
        self.header.encode(&mut buf);
        buf.put_slice(&self.body);
        buf.freeze()
    }
}

/// Accumulates bytes from the transport and cuts them into frames.
///
/// Bytes may arrive in any chunking; a frame is only produced once it is
/// complete. A bad magic byte means the stream is out of sync, so everything
/// buffered is discarded. A frame whose lengths do not add up is consumed
/// whole and reported, leaving the stream usable. So is a frame longer than
/// `max_frame`: its bytes are dropped as they arrive instead of buffered.
pub struct FrameReader {
    buffer: BytesMut,
    chunk: usize,
    max_frame: usize,
    skip: usize,
}

impl Default for FrameReader {
    fn default() -> FrameReader {
        FrameReader::with_chunk(DEFAULT_BUF_SIZE)
    }
}

impl FrameReader {
    pub fn with_chunk(chunk: usize) -> FrameReader {
        FrameReader {
            buffer: BytesMut::with_capacity(chunk),
            chunk,
            max_frame: DEFAULT_MAX_FRAME,
            skip: 0,
        }
    }

    pub fn max_frame(mut self, max_frame: usize) -> FrameReader {
        self.max_frame = std::cmp::max(max_frame, HEADER_SIZE);
        self
    }

    pub fn feed(&mut self, mut data: &[u8]) {
        if self.skip > 0 {
            let dropped = std::cmp::min(self.skip, data.len());
            self.skip -= dropped;
            data = &data[dropped..];
        }
        self.buffer.extend_from_slice(data);
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.skip = 0;
    }

    /// How many bytes the next read should ask for: at least one chunk, or
    /// whatever is still missing from the frame being assembled, bounded by
    /// `MAX_READ_CHUNKS` chunks. Larger frames accumulate over several reads.
    pub fn bytes_wanted(&self) -> usize {
        let missing = if self.skip > 0 {
            self.skip
        } else if self.buffer.len() < HEADER_SIZE {
            HEADER_SIZE - self.buffer.len()
        } else {
            self.pending_frame_len().saturating_sub(self.buffer.len())
        };
        std::cmp::min(std::cmp::max(self.chunk, missing), self.chunk * MAX_READ_CHUNKS)
    }

    fn pending_frame_len(&self) -> usize {
        let mut raw_len = &self.buffer[8..12];
        HEADER_SIZE + raw_len.get_u32() as usize
    }

    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.buffer.len() < HEADER_SIZE {
            return Ok(None);
        }
        if let Err(err) = Magic::from_byte(self.buffer[0]) {
            self.buffer.clear();
            return Err(err);
        }

        let frame_len = self.pending_frame_len();
        if frame_len > self.max_frame {
            let dropped = std::cmp::min(self.buffer.len(), frame_len);
            self.buffer.advance(dropped);
            self.skip = frame_len - dropped;
            return Err(ProtocolError::FrameTooLong(frame_len, self.max_frame));
        }
        if self.buffer.len() < frame_len {
            return Ok(None);
        }

        let mut raw = self.buffer.split_to(frame_len);
        let header = Header::parse(&raw)?;
        raw.advance(HEADER_SIZE);
        Ok(Some(Frame {
            header,
            body: raw.freeze(),
        }))
    }
}
