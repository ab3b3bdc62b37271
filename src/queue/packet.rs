use crate::Error;
use bytes::{BufMut, Bytes, BytesMut};
use mcpipe_protocol::{Frame, Header, Opcode, ProtocolError, Status};
use std::fmt;
use std::time::Instant;

#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketFlags(u16);

impl PacketFlags {
    /// Sitting in a pipeline's send queue.
    pub const ENQUEUED: PacketFlags = PacketFlags(0x01);
    /// Every byte of the packet was handed to the transport.
    pub const FLUSHED: PacketFlags = PacketFlags(0x02);
    /// The completion token has run. Never cleared.
    pub const INVOKED: PacketFlags = PacketFlags(0x04);
    /// Value bytes belong to the caller and have a release callback.
    pub const BORROWED: PacketFlags = PacketFlags(0x08);

    pub fn contains(self, other: PacketFlags) -> bool {
        self.0 & other.0 == other.0
    }

    fn insert(&mut self, other: PacketFlags) {
        self.0 |= other.0
    }

    fn remove(&mut self, other: PacketFlags) {
        self.0 &= !other.0
    }
}

impl fmt::Debug for PacketFlags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let names = [
            (PacketFlags::ENQUEUED, "ENQUEUED"),
            (PacketFlags::FLUSHED, "FLUSHED"),
            (PacketFlags::INVOKED, "INVOKED"),
            (PacketFlags::BORROWED, "BORROWED"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "[{}]", set.join("|"))
    }
}

pub type Release = Box<dyn FnOnce(Vec<Bytes>)>;

/// Value bytes of a request: copied into the engine, or borrowed from the
/// caller, possibly in several fragments, and handed back through `release`
/// exactly once when they are no longer needed for transmission.
pub enum ValueBuf {
    Owned(Bytes),
    Borrowed {
        segments: Vec<Bytes>,
        release: Option<Release>,
    },
}

impl ValueBuf {
    pub fn copied(data: &[u8]) -> ValueBuf {
        ValueBuf::Owned(Bytes::copy_from_slice(data))
    }

    pub fn borrowed<F>(segments: Vec<Bytes>, release: F) -> ValueBuf
    where
        F: FnOnce(Vec<Bytes>) + 'static,
    {
        ValueBuf::Borrowed {
            segments,
            release: Some(Box::new(release)),
        }
    }

    pub fn segments(&self) -> &[Bytes] {
        match self {
            ValueBuf::Owned(value) => std::slice::from_ref(value),
            ValueBuf::Borrowed { segments, .. } => segments,
        }
    }

    pub fn len(&self) -> usize {
        self.segments().iter().map(|segment| segment.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs the release callback if there is one left to run.
    fn release(&mut self) -> bool {
        if let ValueBuf::Borrowed { segments, release } = self {
            if let Some(release) = release.take() {
                release(segments.clone());
                return true;
            }
        }
        false
    }

    /// A copy sharing the same bytes but not the release duty.
    fn share(&self) -> ValueBuf {
        match self {
            ValueBuf::Owned(value) => ValueBuf::Owned(value.clone()),
            ValueBuf::Borrowed { segments, .. } => ValueBuf::Borrowed {
                segments: segments.clone(),
                release: None,
            },
        }
    }
}

impl Drop for ValueBuf {
    fn drop(&mut self) {
        // borrowed storage goes back to its owner even if it never went out
        self.release();
    }
}

impl fmt::Debug for ValueBuf {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ValueBuf::Owned(value) => write!(f, "Owned({} bytes)", value.len()),
            ValueBuf::Borrowed { segments, release } => write!(
                f,
                "Borrowed({} bytes in {} segments, released: {})",
                self.len(),
                segments.len(),
                release.is_none()
            ),
        }
    }
}

/// How a packet picks its destination.
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    /// Hash the key that is sent.
    Key,
    /// Hash a different key than the one sent.
    HashKey(Bytes),
    /// Send to the master of an explicit shard.
    Shard(u16),
    /// Hash the key, send to the given replica of its shard.
    Replica(usize),
}

/// A logical operation as handed to the engine.
#[derive(Debug)]
pub struct Request {
    pub opcode: Opcode,
    pub key: Bytes,
    pub extras: Bytes,
    pub value: Option<ValueBuf>,
    pub cas: u64,
    pub datatype: u8,
    pub route: Route,
}

impl Request {
    pub fn new(opcode: Opcode, key: impl Into<Bytes>) -> Request {
        Request {
            opcode,
            key: key.into(),
            extras: Bytes::new(),
            value: None,
            cas: 0,
            datatype: 0,
            route: Route::Key,
        }
    }

    pub fn extras(mut self, extras: Bytes) -> Self {
        self.extras = extras;
        self
    }

    pub fn value(mut self, value: ValueBuf) -> Self {
        self.value = Some(value);
        self
    }

    pub fn cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    pub fn datatype(mut self, datatype: u8) -> Self {
        self.datatype = datatype;
        self
    }

    pub fn route(mut self, route: Route) -> Self {
        self.route = route;
        self
    }
}

/// A server reply, as delivered to a completion token.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub server: usize,
    pub frame: Frame,
}

impl Response {
    pub fn status(&self) -> Status {
        self.frame.header.status()
    }

    pub fn opcode(&self) -> Opcode {
        self.frame.header.command()
    }

    pub fn cas(&self) -> u64 {
        self.frame.header.cas
    }

    pub fn extras(&self) -> Bytes {
        self.frame.extras()
    }

    pub fn key(&self) -> Bytes {
        self.frame.key()
    }

    pub fn value(&self) -> Bytes {
        self.frame.value()
    }
}

pub type Outcome = std::result::Result<Response, Error>;

pub type Token = Box<dyn FnOnce(Outcome)>;

/// One request on its way through a pipeline.
///
/// The header, extras and key are always owned and serialized once into
/// `head`; the value follows as its own segments so borrowed storage is
/// never copied.
pub struct Packet {
    header: Header,
    extras: Bytes,
    key: Bytes,
    value: Option<ValueBuf>,
    head: Bytes,
    route: Route,
    flags: PacketFlags,
    shard: u16,
    retries: u8,
    start: Instant,
    token: Option<Token>,
}

impl Packet {
    pub fn new(request: Request, token: Token) -> std::result::Result<Packet, ProtocolError> {
        let value_len = request.value.as_ref().map_or(0, |value| value.len());
        let mut header = Header::request(
            request.opcode,
            request.extras.len(),
            request.key.len(),
            value_len,
        )?;
        header.cas = request.cas;
        header.datatype = request.datatype;

        let mut flags = PacketFlags::default();
        if let Some(ValueBuf::Borrowed { .. }) = request.value {
            flags.insert(PacketFlags::BORROWED);
        }

        let mut packet = Packet {
            header,
            extras: request.extras,
            key: request.key,
            value: request.value,
            head: Bytes::new(),
            route: request.route,
            flags,
            shard: 0,
            retries: 0,
            start: Instant::now(),
            token: Some(token),
        };
        packet.seal();
        Ok(packet)
    }

    fn seal(&mut self) {
        let mut head = BytesMut::with_capacity(
            mcpipe_protocol::HEADER_SIZE + self.extras.len() + self.key.len(),
        );
        self.header.encode(&mut head);
        head.put_slice(&self.extras);
        head.put_slice(&self.key);
        self.head = head.freeze();
    }

    /// Points the packet at a shard under an opaque. Only legal while no byte
    /// of it has been written.
    pub fn assign(&mut self, shard: u16, opaque: u32) {
        self.shard = shard;
        self.header.vbucket = shard;
        self.header.opaque = opaque;
        self.seal();
    }

    pub fn opaque(&self) -> u32 {
        self.header.opaque
    }

    pub fn opcode(&self) -> Opcode {
        self.header.command()
    }

    pub fn shard(&self) -> u16 {
        self.shard
    }

    pub fn key(&self) -> &Bytes {
        &self.key
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn retries(&self) -> u8 {
        self.retries
    }

    pub fn start(&self) -> Instant {
        self.start
    }

    pub fn flags(&self) -> PacketFlags {
        self.flags
    }

    pub fn is_flushed(&self) -> bool {
        self.flags.contains(PacketFlags::FLUSHED)
    }

    pub fn is_invoked(&self) -> bool {
        self.flags.contains(PacketFlags::INVOKED)
    }

    /// Serialized size on the wire.
    pub fn len(&self) -> usize {
        self.head.len() + self.value.as_ref().map_or(0, |value| value.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The serialized packet as an ordered list of buffers.
    pub fn segments(&self) -> impl Iterator<Item = &Bytes> {
        std::iter::once(&self.head).chain(
            self.value
                .iter()
                .flat_map(|value| value.segments().iter()),
        )
    }

    pub(crate) fn set_enqueued(&mut self, enqueued: bool) {
        if enqueued {
            self.flags.insert(PacketFlags::ENQUEUED);
        } else {
            self.flags.remove(PacketFlags::ENQUEUED);
        }
    }

    /// Records that every byte went out. Borrowed value storage is released here.
    pub(crate) fn mark_flushed(&mut self) {
        self.flags.insert(PacketFlags::FLUSHED);
        self.release_value();
    }

    pub(crate) fn release_value(&mut self) {
        if let Some(value) = self.value.as_mut() {
            value.release();
        }
    }

    /// Prepares a redirected packet for another trip through a pipeline.
    pub(crate) fn renew(&mut self) {
        self.flags.remove(PacketFlags::FLUSHED);
        self.flags.remove(PacketFlags::ENQUEUED);
        self.retries = self.retries.saturating_add(1);
    }

    /// Splits the completion duty off a packet that must stay where it is
    /// because part of it may already be on the wire. The returned packet
    /// carries the token; `self` is marked invoked and keeps the release duty.
    pub(crate) fn detach(&mut self) -> Packet {
        let detached = Packet {
            header: self.header,
            extras: self.extras.clone(),
            key: self.key.clone(),
            value: self.value.as_ref().map(|value| value.share()),
            head: self.head.clone(),
            route: self.route.clone(),
            flags: PacketFlags(self.flags.0 & PacketFlags::BORROWED.0),
            shard: self.shard,
            retries: self.retries,
            start: self.start,
            token: self.token.take(),
        };
        self.flags.insert(PacketFlags::INVOKED);
        detached
    }

    /// Runs the completion token. Returns `false`, and does nothing, if it
    /// already ran.
    pub fn invoke(&mut self, outcome: Outcome) -> bool {
        if self.is_invoked() {
            log::error!(
                "Packet with opaque {} was already completed, dropping {:?}",
                self.opaque(),
                outcome.as_ref().map(|response| response.status())
            );
            return false;
        }
        self.flags.insert(PacketFlags::INVOKED);
        match self.token.take() {
            Some(token) => {
                token(outcome);
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Packet")
            .field("opcode", &self.opcode())
            .field("opaque", &self.opaque())
            .field("shard", &self.shard)
            .field("len", &self.len())
            .field("flags", &self.flags)
            .field("retries", &self.retries)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    pub type Calls = Rc<RefCell<Vec<(u32, Outcome)>>>;

    /// A packet whose token records its outcome in `calls`.
    pub fn recorded(key: &str, value: &[u8], opaque: u32, calls: &Calls) -> Packet {
        let calls = calls.clone();
        let request = Request::new(Opcode::Set, key.as_bytes().to_vec()).value(ValueBuf::copied(value));
        let mut packet = Packet::new(
            request,
            Box::new(move |outcome| calls.borrow_mut().push((opaque, outcome))),
        )
        .unwrap();
        packet.assign(0, opaque);
        packet
    }

    pub fn flatten(packet: &Packet) -> Vec<u8> {
        packet.segments().flat_map(|segment| segment.iter().cloned()).collect()
    }

    #[test]
    fn serialized_layout() {
        let calls = Calls::default();
        let packet = recorded("key", b"value", 7, &calls);
        let raw = flatten(&packet);
        assert_eq!(raw.len(), packet.len());
        assert_eq!(raw.len(), 24 + 3 + 5);

        let header = Header::parse(&raw).unwrap();
        assert_eq!(header.opaque, 7);
        assert_eq!(header.command(), Opcode::Set);
        assert_eq!(&raw[24..27], b"key");
        assert_eq!(&raw[27..], b"value");
    }

    #[test]
    fn invoke_once() {
        let calls = Calls::default();
        let mut packet = recorded("k", b"v", 1, &calls);
        assert!(packet.invoke(Err(Error::Cancelled)));
        assert!(!packet.invoke(Err(Error::Timeout)));
        assert_eq!(calls.borrow().len(), 1);
        assert_eq!(calls.borrow()[0].1, Err(Error::Cancelled));
    }

    #[test]
    fn borrowed_value_released_once() {
        let released = Rc::new(RefCell::new(Vec::new()));
        let sink = released.clone();
        let value = ValueBuf::borrowed(
            vec![Bytes::from_static(b"ab"), Bytes::from_static(b"cd")],
            move |segments| sink.borrow_mut().push(segments),
        );
        let request = Request::new(Opcode::Set, &b"key"[..]).value(value);
        let mut packet = Packet::new(request, Box::new(|_| {})).unwrap();
        assert!(packet.flags().contains(PacketFlags::BORROWED));
        assert_eq!(packet.len(), 24 + 3 + 4);

        packet.mark_flushed();
        packet.mark_flushed();
        drop(packet);
        assert_eq!(released.borrow().len(), 1);
        assert_eq!(released.borrow()[0].len(), 2);
    }

    #[test]
    fn dropped_unsent_packet_releases() {
        let released = Rc::new(RefCell::new(0));
        let counter = released.clone();
        let value = ValueBuf::borrowed(vec![Bytes::from_static(b"xyz")], move |_| *counter.borrow_mut() += 1);
        let packet = Packet::new(Request::new(Opcode::Set, &b"k"[..]).value(value), Box::new(|_| {})).unwrap();
        drop(packet);
        assert_eq!(*released.borrow(), 1);
    }

    #[test]
    fn detach_moves_token_not_release() {
        let calls = Calls::default();
        let released = Rc::new(RefCell::new(0));
        let counter = released.clone();
        let value = ValueBuf::borrowed(vec![Bytes::from_static(b"xyz")], move |_| *counter.borrow_mut() += 1);
        let sink = calls.clone();
        let mut packet = Packet::new(
            Request::new(Opcode::Set, &b"k"[..]).value(value),
            Box::new(move |outcome| sink.borrow_mut().push((1, outcome))),
        )
        .unwrap();

        let mut detached = packet.detach();
        assert!(packet.is_invoked());
        assert!(!detached.is_invoked());
        assert_eq!(flatten(&detached), flatten(&packet));

        assert!(detached.invoke(Err(Error::Cancelled)));
        drop(detached);
        assert_eq!(*released.borrow(), 0);
        drop(packet);
        assert_eq!(*released.borrow(), 1);
        assert_eq!(calls.borrow().len(), 1);
    }

    #[test]
    fn oversized_key() {
        let key = vec![b'k'; 70_000];
        assert!(Packet::new(Request::new(Opcode::Get, key), Box::new(|_| {})).is_err());
    }
}
