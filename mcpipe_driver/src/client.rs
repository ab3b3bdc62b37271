use super::error::{ClientError, Result};
use bytes::Bytes;
use futures::channel::oneshot;
use log::{debug, trace};
use mcpipe::{Engine, Handle, Outcome, Request, Response, Route, Settings, ValueBuf};
use mcpipe_io::{IoEvent, IoProvider, TimerId, Timers};
use mcpipe_protocol::extras::{parse_counter, parse_flags};
use mcpipe_protocol::{ArithmeticExtras, Opcode, Status, StoreExtras, TouchExtras};
use mcpipe_vbucket::ShardMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

/// A value read from the cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub value: Bytes,
    pub flags: u32,
    pub cas: u64,
}

/// The reply of a request issued with one of the `_async` calls.
pub struct Pending<T> {
    handle: Handle,
    receiver: oneshot::Receiver<Result<T>>,
}

impl<T> Pending<T> {
    pub fn handle(&self) -> Handle {
        self.handle
    }

    fn try_take(&mut self) -> Option<Result<T>> {
        match self.receiver.try_recv() {
            Ok(Some(result)) => Some(result),
            Ok(None) => None,
            Err(oneshot::Canceled) => Some(Err(ClientError::Canceled)),
        }
    }
}

impl<T> Future for Pending<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Result<T>> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(ClientError::Canceled)),
            Poll::Pending => Poll::Pending,
        }
    }
}

fn check(response: &Response) -> Result<()> {
    match response.status() {
        Status::Success => Ok(()),
        status => Err(ClientError::Server(status)),
    }
}

fn to_item(response: Response) -> Result<Option<Item>> {
    match response.status() {
        Status::Success => Ok(Some(Item {
            flags: parse_flags(&response.extras())?,
            value: response.value(),
            cas: response.cas(),
        })),
        Status::KeyNotFound => Ok(None),
        status => Err(ClientError::Server(status)),
    }
}

fn to_cas(response: Response) -> Result<u64> {
    check(&response)?;
    Ok(response.cas())
}

fn to_unit(response: Response) -> Result<()> {
    check(&response)
}

fn to_counter(response: Response) -> Result<u64> {
    check(&response)?;
    Ok(parse_counter(&response.value())?)
}

/// Owns an [`Engine`] and the one timer that expires requests older than
/// `operation_timeout`.
pub struct Client<P: IoProvider> {
    engine: Engine<P>,
    sweep: TimerId,
    sweep_armed: bool,
    timeout: Duration,
}

impl<P: IoProvider> Client<P> {
    pub fn new(mut io: P, settings: Settings) -> Client<P> {
        let sweep = io.create_timer();
        let timeout = settings.operation_timeout;
        Client {
            engine: Engine::new(io, settings),
            sweep,
            sweep_armed: false,
            timeout,
        }
    }

    pub fn engine(&self) -> &Engine<P> {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut Engine<P> {
        &mut self.engine
    }

    pub fn install_topology(&mut self, map: Arc<ShardMap>) -> Option<Arc<ShardMap>> {
        self.engine.install_topology(map)
    }

    /// Queues `request` and returns its reply, still raw.
    pub fn request_async(&mut self, request: Request) -> Result<Pending<Response>> {
        self.submit(request, Ok)
    }

    fn submit<T, F>(&mut self, request: Request, convert: F) -> Result<Pending<T>>
    where
        T: 'static,
        F: FnOnce(Response) -> Result<T> + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        let token = Box::new(move |outcome: Outcome| {
            let result = outcome.map_err(ClientError::from).and_then(convert);
            // the caller may have dropped the future already
            let _ = sender.send(result);
        });
        let handle = self.engine.submit(request, token)?;
        self.arm_sweep(self.timeout)?;
        Ok(Pending { handle, receiver })
    }

    fn arm_sweep(&mut self, after: Duration) -> Result<()> {
        if !self.sweep_armed {
            self.engine.io_mut().schedule_timer(self.sweep, after)?;
            self.sweep_armed = true;
        }
        Ok(())
    }

    fn on_sweep(&mut self) -> Result<()> {
        self.sweep_armed = false;
        let (expired, oldest) = self.engine.expire_older_than(self.timeout);
        if expired > 0 {
            debug!("{} requests expired after {:?}", expired, self.timeout);
        }
        if let Some(oldest) = oldest {
            let due = (oldest + self.timeout).saturating_duration_since(Instant::now());
            self.arm_sweep(due)?;
        }
        Ok(())
    }

    /// Writes everything queued so far, waits up to `timeout` for the network
    /// and completes whatever came back.
    pub fn run_once(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.engine.flush();
        for event in self.engine.step(timeout)? {
            match event {
                IoEvent::Timer { timer } if timer == self.sweep => self.on_sweep()?,
                other => trace!("Ignoring {:?}", other),
            }
        }
        Ok(())
    }

    /// Drives the client until every request issued so far has completed.
    pub fn run_until_idle(&mut self) -> Result<()> {
        while !self.engine.is_idle() {
            self.run_once(Some(self.timeout))?;
        }
        Ok(())
    }

    /// Drives the client until `pending` resolves.
    pub fn wait<T>(&mut self, mut pending: Pending<T>) -> Result<T> {
        loop {
            if let Some(result) = pending.try_take() {
                return result;
            }
            self.run_once(Some(self.timeout))?;
        }
    }

    /// Withdraws a request that has not been written yet.
    pub fn cancel(&mut self, handle: Handle) -> bool {
        self.engine.cancel(handle)
    }

    pub fn get_async(&mut self, key: impl Into<Bytes>) -> Result<Pending<Option<Item>>> {
        self.submit(Request::new(Opcode::Get, key), to_item)
    }

    pub fn get(&mut self, key: impl Into<Bytes>) -> Result<Option<Item>> {
        let pending = self.get_async(key)?;
        self.wait(pending)
    }

    /// Reads the copy held by the `replica`-th replica of the key's shard.
    pub fn get_replica_async(&mut self, key: impl Into<Bytes>, replica: usize) -> Result<Pending<Option<Item>>> {
        let request = Request::new(Opcode::GetReplica, key).route(Route::Replica(replica));
        self.submit(request, to_item)
    }

    pub fn get_replica(&mut self, key: impl Into<Bytes>, replica: usize) -> Result<Option<Item>> {
        let pending = self.get_replica_async(key, replica)?;
        self.wait(pending)
    }

    fn store_async(
        &mut self,
        opcode: Opcode,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        flags: u32,
        expiry: u32,
    ) -> Result<Pending<u64>> {
        let request = Request::new(opcode, key)
            .extras(StoreExtras { flags, expiry }.encode())
            .value(ValueBuf::Owned(value.into()));
        self.submit(request, to_cas)
    }

    /// Stores unconditionally. Resolves to the new CAS.
    pub fn set_async(
        &mut self,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        flags: u32,
        expiry: u32,
    ) -> Result<Pending<u64>> {
        self.store_async(Opcode::Set, key, value, flags, expiry)
    }

    pub fn set(&mut self, key: impl Into<Bytes>, value: impl Into<Bytes>, flags: u32, expiry: u32) -> Result<u64> {
        let pending = self.set_async(key, value, flags, expiry)?;
        self.wait(pending)
    }

    /// Stores only if the key is missing.
    pub fn add_async(
        &mut self,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        flags: u32,
        expiry: u32,
    ) -> Result<Pending<u64>> {
        self.store_async(Opcode::Add, key, value, flags, expiry)
    }

    pub fn add(&mut self, key: impl Into<Bytes>, value: impl Into<Bytes>, flags: u32, expiry: u32) -> Result<u64> {
        let pending = self.add_async(key, value, flags, expiry)?;
        self.wait(pending)
    }

    /// Stores only if the key exists.
    pub fn replace_async(
        &mut self,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        flags: u32,
        expiry: u32,
    ) -> Result<Pending<u64>> {
        self.store_async(Opcode::Replace, key, value, flags, expiry)
    }

    pub fn replace(&mut self, key: impl Into<Bytes>, value: impl Into<Bytes>, flags: u32, expiry: u32) -> Result<u64> {
        let pending = self.replace_async(key, value, flags, expiry)?;
        self.wait(pending)
    }

    pub fn append_async(&mut self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Result<Pending<u64>> {
        let request = Request::new(Opcode::Append, key).value(ValueBuf::Owned(value.into()));
        self.submit(request, to_cas)
    }

    pub fn append(&mut self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Result<u64> {
        let pending = self.append_async(key, value)?;
        self.wait(pending)
    }

    pub fn prepend_async(&mut self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Result<Pending<u64>> {
        let request = Request::new(Opcode::Prepend, key).value(ValueBuf::Owned(value.into()));
        self.submit(request, to_cas)
    }

    pub fn prepend(&mut self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Result<u64> {
        let pending = self.prepend_async(key, value)?;
        self.wait(pending)
    }

    pub fn remove_async(&mut self, key: impl Into<Bytes>) -> Result<Pending<()>> {
        self.submit(Request::new(Opcode::Delete, key), to_unit)
    }

    pub fn remove(&mut self, key: impl Into<Bytes>) -> Result<()> {
        let pending = self.remove_async(key)?;
        self.wait(pending)
    }

    pub fn touch_async(&mut self, key: impl Into<Bytes>, expiry: u32) -> Result<Pending<()>> {
        let request = Request::new(Opcode::Touch, key).extras(TouchExtras { expiry }.encode());
        self.submit(request, to_unit)
    }

    pub fn touch(&mut self, key: impl Into<Bytes>, expiry: u32) -> Result<()> {
        let pending = self.touch_async(key, expiry)?;
        self.wait(pending)
    }

    fn arithmetic_async(
        &mut self,
        opcode: Opcode,
        key: impl Into<Bytes>,
        delta: u64,
        initial: u64,
        expiry: u32,
    ) -> Result<Pending<u64>> {
        let extras = ArithmeticExtras { delta, initial, expiry }.encode();
        self.submit(Request::new(opcode, key).extras(extras), to_counter)
    }

    /// Adds `delta` to a counter, creating it with `initial` unless `expiry`
    /// is [`ArithmeticExtras::NO_CREATE`]. Resolves to the new value.
    pub fn increment_async(
        &mut self,
        key: impl Into<Bytes>,
        delta: u64,
        initial: u64,
        expiry: u32,
    ) -> Result<Pending<u64>> {
        self.arithmetic_async(Opcode::Increment, key, delta, initial, expiry)
    }

    pub fn increment(&mut self, key: impl Into<Bytes>, delta: u64, initial: u64, expiry: u32) -> Result<u64> {
        let pending = self.increment_async(key, delta, initial, expiry)?;
        self.wait(pending)
    }

    pub fn decrement_async(
        &mut self,
        key: impl Into<Bytes>,
        delta: u64,
        initial: u64,
        expiry: u32,
    ) -> Result<Pending<u64>> {
        self.arithmetic_async(Opcode::Decrement, key, delta, initial, expiry)
    }

    pub fn decrement(&mut self, key: impl Into<Bytes>, delta: u64, initial: u64, expiry: u32) -> Result<u64> {
        let pending = self.decrement_async(key, delta, initial, expiry)?;
        self.wait(pending)
    }

    /// Fails everything outstanding and closes every connection.
    pub fn shutdown(&mut self) -> Result<()> {
        self.engine.shutdown();
        self.engine.io_mut().destroy_timer(self.sweep)?;
        self.sweep_armed = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fnv::FnvHashMap;
    use futures::executor::block_on;
    use futures::future::join_all;
    use mcpipe::SettingsBuilder;
    use mcpipe_io::{PollLoop, ThreadedLoop};
    use mcpipe_protocol::extras::parse_store;
    use mcpipe_protocol::{Frame, FrameReader, Header};
    use mcpipe_vbucket::{Crc32Hasher, Target};
    use rand::distributions::Standard;
    use rand::{thread_rng, Rng};
    use std::io::{Read, Write};
    use std::net::{SocketAddr, TcpListener, TcpStream};
    use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
    use std::sync::{Mutex, Once};

    static INIT: Once = Once::new();
    static SERVER_PORT: AtomicU16 = AtomicU16::new(27100);
    static CAS: AtomicU64 = AtomicU64::new(1);

    fn init() {
        INIT.call_once(|| {
            let _ = env_logger::try_init();
        });
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Mode {
        Serve,
        NotMine,
        Silent,
        HangupAfter(usize),
    }

    struct Entry {
        value: Vec<u8>,
        flags: u32,
        cas: u64,
    }

    type Store = Arc<Mutex<FnvHashMap<Vec<u8>, Entry>>>;

    fn setup_node(mode: Mode, store: Store) -> SocketAddr {
        init();
        let server_port = SERVER_PORT.fetch_add(1, Ordering::Relaxed);
        let address: SocketAddr = format!("127.0.0.1:{}", server_port).parse().unwrap();
        let listener = TcpListener::bind(address).unwrap();

        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let stream = match stream {
                    Ok(stream) => stream,
                    Err(_) => break,
                };
                let store = store.clone();
                std::thread::spawn(move || serve(stream, mode, store));
            }
        });
        address
    }

    fn serve(mut stream: TcpStream, mode: Mode, store: Store) {
        let mut reader = FrameReader::default();
        let mut buf = [0u8; 4096];
        let mut handled = 0;
        loop {
            let n = match stream.read(&mut buf) {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            reader.feed(&buf[..n]);
            while let Ok(Some(request)) = reader.next_frame() {
                if mode == Mode::HangupAfter(handled) {
                    return;
                }
                handled += 1;
                let reply = match mode {
                    Mode::Silent => continue,
                    Mode::NotMine => reply(&request, Status::NotMyVbucket, b"", b"", 0),
                    _ => execute(&request, &store),
                };
                if stream.write_all(&reply.to_bytes()).is_err() {
                    return;
                }
            }
        }
    }

    fn reply(request: &Frame, status: Status, extras: &[u8], value: &[u8], cas: u64) -> Frame {
        let mut header = Header::response(request.header.opcode, status, extras.len(), 0, value.len()).unwrap();
        header.opaque = request.header.opaque;
        header.cas = cas;
        Frame::new(header, extras, b"", value)
    }

    fn execute(request: &Frame, store: &Store) -> Frame {
        let mut store = store.lock().unwrap();
        let key = request.key().to_vec();
        match request.header.command() {
            Opcode::Get | Opcode::GetReplica => match store.get(&key) {
                Some(entry) => reply(request, Status::Success, &entry.flags.to_be_bytes(), &entry.value, entry.cas),
                None => reply(request, Status::KeyNotFound, b"", b"", 0),
            },
            opcode @ Opcode::Set | opcode @ Opcode::Add | opcode @ Opcode::Replace => {
                let extras = parse_store(&request.extras()).unwrap();
                let exists = store.contains_key(&key);
                if opcode == Opcode::Add && exists {
                    return reply(request, Status::KeyExists, b"", b"", 0);
                }
                if opcode == Opcode::Replace && !exists {
                    return reply(request, Status::KeyNotFound, b"", b"", 0);
                }
                let cas = CAS.fetch_add(1, Ordering::Relaxed);
                let entry = Entry {
                    value: request.value().to_vec(),
                    flags: extras.flags,
                    cas,
                };
                store.insert(key, entry);
                reply(request, Status::Success, b"", b"", cas)
            }
            opcode @ Opcode::Append | opcode @ Opcode::Prepend => match store.get_mut(&key) {
                Some(entry) => {
                    if opcode == Opcode::Append {
                        entry.value.extend_from_slice(&request.value());
                    } else {
                        let mut value = request.value().to_vec();
                        value.extend_from_slice(&entry.value);
                        entry.value = value;
                    }
                    entry.cas = CAS.fetch_add(1, Ordering::Relaxed);
                    reply(request, Status::Success, b"", b"", entry.cas)
                }
                None => reply(request, Status::NotStored, b"", b"", 0),
            },
            Opcode::Delete => match store.remove(&key) {
                Some(_) => reply(request, Status::Success, b"", b"", 0),
                None => reply(request, Status::KeyNotFound, b"", b"", 0),
            },
            Opcode::Touch => match store.get(&key) {
                Some(entry) => reply(request, Status::Success, b"", b"", entry.cas),
                None => reply(request, Status::KeyNotFound, b"", b"", 0),
            },
            opcode @ Opcode::Increment | opcode @ Opcode::Decrement => {
                let extras = ArithmeticExtras::parse(&request.extras()).unwrap();
                let current = match store.get(&key) {
                    Some(entry) => String::from_utf8_lossy(&entry.value).parse::<u64>().ok(),
                    None if extras.expiry == ArithmeticExtras::NO_CREATE => {
                        return reply(request, Status::KeyNotFound, b"", b"", 0);
                    }
                    None => None,
                };
                let next = match current {
                    None if !store.contains_key(&key) => extras.initial,
                    None => return reply(request, Status::NonNumeric, b"", b"", 0),
                    Some(current) if opcode == Opcode::Increment => current.wrapping_add(extras.delta),
                    Some(current) => current.saturating_sub(extras.delta),
                };
                let cas = CAS.fetch_add(1, Ordering::Relaxed);
                let entry = Entry {
                    value: next.to_string().into_bytes(),
                    flags: 0,
                    cas,
                };
                store.insert(key, entry);
                reply(request, Status::Success, b"", &next.to_be_bytes(), cas)
            }
            _ => reply(request, Status::UnknownCommand, b"", b"", 0),
        }
    }

    fn connect<P: IoProvider>(io: P, servers: Vec<SocketAddr>, replicas: usize, settings: Settings) -> Client<P> {
        let mut client = Client::new(io, settings);
        let map = ShardMap::generate(servers, replicas, 64).unwrap();
        client.install_topology(Arc::new(map));
        client
    }

    fn run_test<P, F>(io: P, nodes: usize, f: F)
    where
        P: IoProvider,
        F: FnOnce(&mut Client<P>),
    {
        let store = Store::default();
        let servers = (0..nodes).map(|_| setup_node(Mode::Serve, store.clone())).collect();
        let mut client = connect(io, servers, 0, Settings::default());
        f(&mut client);
    }

    fn generate_keys(num: usize) -> Vec<Vec<u8>> {
        (0..num)
            .map(|_| thread_rng().sample_iter(&Standard).take(8).collect())
            .collect()
    }

    fn generate_values(num: usize) -> Vec<Vec<u8>> {
        (0..num)
            .map(|_| thread_rng().sample_iter(&Standard).take(256).collect())
            .collect()
    }

    fn set_get<P: IoProvider>(client: &mut Client<P>) {
        for i in 0..100 {
            client
                .set(format!("key{}", i), format!("value{}", i), i, 0)
                .unwrap();
        }

        for i in 0..100 {
            let item = client.get(format!("key{}", i)).unwrap().unwrap();
            assert_eq!(item.value, Bytes::from(format!("value{}", i)));
            assert_eq!(item.flags, i);
        }
    }

    #[test]
    fn set_get_test() {
        run_test(PollLoop::new(), 3, set_get);
    }

    #[test]
    fn set_get_completion_test() {
        run_test(ThreadedLoop::new(), 3, set_get);
    }

    #[test]
    fn set_remove_get_test() {
        run_test(PollLoop::new(), 2, |client| {
            for i in 0..100 {
                client.set(format!("key{}", i), format!("value{}", i), 0, 0).unwrap();
            }

            for i in 0..100 {
                if i % 2 == 0 {
                    client.remove(format!("key{}", i)).unwrap();
                }
            }

            for i in 0..100 {
                let item = client.get(format!("key{}", i)).unwrap();
                if i % 2 == 0 {
                    assert_eq!(item, None);
                } else {
                    assert_eq!(item.unwrap().value, Bytes::from(format!("value{}", i)));
                }
            }

            let err = client.remove("key0").unwrap_err();
            assert_eq!(err.status(), Some(Status::KeyNotFound));
        });
    }

    #[test]
    fn override_test() {
        run_test(PollLoop::new(), 2, |client| {
            let first = client.add("k", "one", 0, 0).unwrap();
            assert_eq!(client.add("k", "two", 0, 0).unwrap_err().status(), Some(Status::KeyExists));

            let second = client.replace("k", "three", 0, 0).unwrap();
            assert!(second > first);
            assert_eq!(client.get("k").unwrap().unwrap().cas, second);
            assert_eq!(
                client.replace("missing", "x", 0, 0).unwrap_err().status(),
                Some(Status::KeyNotFound)
            );

            client.set("k", "four", 0, 0).unwrap();
            assert_eq!(client.get("k").unwrap().unwrap().value, Bytes::from("four"));
        });
    }

    #[test]
    fn append_prepend_test() {
        run_test(PollLoop::new(), 1, |client| {
            client.set("k", "mid", 0, 0).unwrap();
            client.append("k", "-end").unwrap();
            client.prepend("k", "start-").unwrap();
            assert_eq!(client.get("k").unwrap().unwrap().value, Bytes::from("start-mid-end"));
            assert_eq!(client.append("missing", "x").unwrap_err().status(), Some(Status::NotStored));
        });
    }

    #[test]
    fn counter_test() {
        run_test(PollLoop::new(), 2, |client| {
            assert_eq!(client.increment("counter", 5, 10, 0).unwrap(), 10);
            assert_eq!(client.increment("counter", 5, 10, 0).unwrap(), 15);
            assert_eq!(client.decrement("counter", 20, 0, 0).unwrap(), 0);
            let err = client
                .increment("missing", 1, 0, ArithmeticExtras::NO_CREATE)
                .unwrap_err();
            assert_eq!(err.status(), Some(Status::KeyNotFound));
        });
    }

    #[test]
    fn touch_test() {
        run_test(ThreadedLoop::new(), 2, |client| {
            client.set("k", "v", 0, 0).unwrap();
            client.touch("k", 100).unwrap();
            assert_eq!(client.touch("missing", 100).unwrap_err().status(), Some(Status::KeyNotFound));
        });
    }

    fn batch<P: IoProvider>(client: &mut Client<P>) {
        let keys = generate_keys(200);
        let values = generate_values(200);

        let stored: Vec<Pending<u64>> = keys
            .iter()
            .zip(values.iter())
            .map(|(key, value)| client.set_async(key.clone(), value.clone(), 0, 0).unwrap())
            .collect();
        client.run_until_idle().unwrap();
        for cas in block_on(join_all(stored)) {
            assert!(cas.unwrap() > 0);
        }

        let read: Vec<Pending<Option<Item>>> = keys.iter().map(|key| client.get_async(key.clone()).unwrap()).collect();
        client.run_until_idle().unwrap();
        for (item, value) in block_on(join_all(read)).into_iter().zip(values.iter()) {
            assert_eq!(item.unwrap().unwrap().value, Bytes::from(value.clone()));
        }
    }

    #[test]
    fn async_batch_test() {
        run_test(PollLoop::new(), 4, batch);
    }

    #[test]
    fn async_batch_completion_test() {
        run_test(ThreadedLoop::new(), 4, batch);
    }

    #[test]
    fn replica_read_test() {
        let store = Store::default();
        let servers = (0..3).map(|_| setup_node(Mode::Serve, store.clone())).collect();
        let mut client = connect(PollLoop::new(), servers, 1, Settings::default());
        client.set("k", "v", 0, 0).unwrap();
        assert_eq!(client.get_replica("k", 0).unwrap().unwrap().value, Bytes::from("v"));
        match client.get_replica("k", 1) {
            Err(ClientError::Engine(mcpipe::Error::Routing(_))) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn not_my_vbucket_test() {
        let store = Store::default();
        let servers = vec![
            setup_node(Mode::NotMine, store.clone()),
            setup_node(Mode::Serve, store.clone()),
        ];
        let mut client = connect(PollLoop::new(), servers, 0, Settings::default());

        for i in 0..50 {
            client.set(format!("key{}", i), format!("value{}", i), 0, 0).unwrap();
        }
        for i in 0..50 {
            let item = client.get(format!("key{}", i)).unwrap().unwrap();
            assert_eq!(item.value, Bytes::from(format!("value{}", i)));
        }

        // the shards of every key written now point at the serving node
        let map = client.engine().router().snapshot().unwrap();
        assert!(map.generation() > 0);
        for i in 0..50 {
            let key = format!("key{}", i);
            let resolution = map.resolve(Target::Key(key.as_bytes()), &Crc32Hasher).unwrap();
            assert_eq!(resolution.master, 1);
        }
    }

    #[test]
    fn timeout_test() {
        let servers = vec![setup_node(Mode::Silent, Store::default())];
        let settings = SettingsBuilder::default()
            .operation_timeout(Duration::from_millis(100))
            .build();
        let mut client = connect(PollLoop::new(), servers, 0, settings);

        let start = Instant::now();
        match client.get("k") {
            Err(ClientError::Engine(mcpipe::Error::Timeout)) => {}
            other => panic!("unexpected {:?}", other),
        }
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert!(client.engine().is_idle());
    }

    #[test]
    fn connection_drop_test() {
        let servers = vec![setup_node(Mode::HangupAfter(3), Store::default())];
        let mut client = connect(ThreadedLoop::new(), servers, 0, Settings::default());

        for i in 0..3 {
            client.set(format!("key{}", i), "v", 0, 0).unwrap();
        }
        match client.set("key3", "v", 0, 0) {
            Err(ClientError::Engine(mcpipe::Error::Transport(_))) => {}
            other => panic!("unexpected {:?}", other),
        }

        // a fresh connection serves the next request
        client.set("key3", "v", 0, 0).unwrap();
        assert_eq!(client.get("key3").unwrap().unwrap().value, Bytes::from("v"));
    }

    #[test]
    fn cancel_test() {
        run_test(PollLoop::new(), 1, |client| {
            let pending = client.get_async("k").unwrap();
            assert!(client.cancel(pending.handle()));
            match block_on(pending) {
                Err(ClientError::Engine(mcpipe::Error::Cancelled)) => {}
                other => panic!("unexpected {:?}", other),
            }
        });
    }

    #[test]
    fn shutdown_test() {
        run_test(PollLoop::new(), 1, |client| {
            let pending = client.set_async("k", "v", 0, 0).unwrap();
            client.shutdown().unwrap();
            match block_on(pending) {
                Err(ClientError::Engine(mcpipe::Error::Shutdown)) => {}
                other => panic!("unexpected {:?}", other),
            }
            assert!(client.get("k").is_err());
        });
    }
}
