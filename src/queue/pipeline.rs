use super::packet::{Outcome, Packet};
use crate::Error;
use bytes::Bytes;
use fnv::{FnvHashMap, FnvHashSet};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Instant;

quick_error! {
    #[derive(Debug, Clone, PartialEq)]
    pub enum EnqueueError {
        AlreadyEnqueued(opaque: u32) {
            display("Packet {} is already in a pipeline", opaque)
        }
        OpaqueInUse(opaque: u32) {
            display("Opaque {} is already in flight on this pipeline", opaque)
        }
    }
}

/// A packet the pipeline refused, handed back so its token is not lost.
#[derive(Debug)]
pub struct Rejected {
    pub reason: EnqueueError,
    pub packet: Packet,
}

/// Ordered send queue and awaiting-response index of one connection.
///
/// The flush cursor is kept as two byte counts relative to the head of the
/// send queue: `offset` bytes are known to be written, and `submitted` more
/// have been handed to the transport without an answer yet (completion model
/// only). A packet is *touched* once any of its bytes lies within
/// `offset + submitted`; touched packets never move.
pub struct Pipeline {
    index: usize,
    addr: SocketAddr,
    queue: VecDeque<Packet>,
    awaiting: FnvHashMap<u32, Packet>,
    opaques: FnvHashSet<u32>,
    offset: usize,
    submitted: usize,
    backlog: usize,
}

impl Pipeline {
    pub fn new(index: usize, addr: SocketAddr) -> Pipeline {
        Pipeline {
            index,
            addr,
            queue: VecDeque::new(),
            awaiting: FnvHashMap::default(),
            opaques: FnvHashSet::default(),
            offset: 0,
            submitted: 0,
            backlog: 0,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn set_index(&mut self, index: usize) {
        self.index = index;
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn has_opaque(&self, opaque: u32) -> bool {
        self.opaques.contains(&opaque)
    }

    /// Bytes still to be handed to the transport.
    pub fn unflushed_bytes(&self) -> usize {
        self.backlog - self.offset - self.submitted
    }

    pub fn has_unflushed(&self) -> bool {
        self.unflushed_bytes() > 0
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn awaiting(&self) -> usize {
        self.awaiting.len()
    }

    /// Packets whose token has not run yet.
    pub fn pending(&self) -> usize {
        self.queue.iter().filter(|packet| !packet.is_invoked()).count()
            + self.awaiting.values().filter(|packet| !packet.is_invoked()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty() && self.awaiting.is_empty()
    }

    fn touched(&self) -> usize {
        self.offset + self.submitted
    }

    pub fn enqueue(&mut self, mut packet: Packet) -> std::result::Result<(), Rejected> {
        if let Err(reason) = self.check(&packet) {
            return Err(Rejected { reason, packet });
        }
        packet.set_enqueued(true);
        self.opaques.insert(packet.opaque());
        self.backlog += packet.len();
        self.queue.push_back(packet);
        Ok(())
    }

    fn check(&self, packet: &Packet) -> std::result::Result<(), EnqueueError> {
        if packet.flags().contains(super::PacketFlags::ENQUEUED) {
            return Err(EnqueueError::AlreadyEnqueued(packet.opaque()));
        }
        if self.opaques.contains(&packet.opaque()) {
            return Err(EnqueueError::OpaqueInUse(packet.opaque()));
        }
        Ok(())
    }

    /// Puts a redirected packet back, ordered by creation time among the
    /// untouched part of the queue.
    pub fn reenqueue(&mut self, mut packet: Packet) -> std::result::Result<(), Rejected> {
        if let Err(reason) = self.check(&packet) {
            return Err(Rejected { reason, packet });
        }

        let mut position = 0;
        let mut first_free = 0;
        for (ix, queued) in self.queue.iter().enumerate() {
            if position < self.touched() {
                first_free = ix + 1;
            }
            position += queued.len();
        }

        let mut insert_at = self.queue.len();
        while insert_at > first_free && self.queue[insert_at - 1].start() > packet.start() {
            insert_at -= 1;
        }

        packet.set_enqueued(true);
        self.opaques.insert(packet.opaque());
        self.backlog += packet.len();
        self.queue.insert(insert_at, packet);
        Ok(())
    }

    fn collect_iovecs(&self, mut skip: usize, max: usize) -> (Vec<Bytes>, usize) {
        let mut iovecs = Vec::new();
        let mut total = 0;
        for segment in self.queue.iter().flat_map(|packet| packet.segments()) {
            if iovecs.len() >= max {
                break;
            }
            if skip >= segment.len() {
                skip -= segment.len();
                continue;
            }
            let part = segment.slice(skip..);
            skip = 0;
            total += part.len();
            iovecs.push(part);
        }
        (iovecs, total)
    }

    /// Up to `max` buffers covering the unwritten backlog, and their byte total.
    /// Does not move the cursor.
    pub fn fill_iovecs(&self, max: usize) -> (Vec<Bytes>, usize) {
        self.collect_iovecs(self.offset, max)
    }

    /// Like `fill_iovecs`, starting `skip` bytes past the cursor.
    pub fn fill_iovecs_after(&self, skip: usize, max: usize) -> (Vec<Bytes>, usize) {
        self.collect_iovecs(self.offset + skip, max)
    }

    /// Hands the next unsubmitted buffers to an asynchronous write. The bytes
    /// stay accounted as submitted until `complete_write` reports on them.
    pub fn claim_iovecs(&mut self, max: usize) -> (Vec<Bytes>, usize) {
        let (iovecs, total) = self.collect_iovecs(self.touched(), max);
        self.submitted += total;
        (iovecs, total)
    }

    /// Reports a finished asynchronous write of `attempted` claimed bytes.
    pub fn complete_write(&mut self, consumed: usize, attempted: usize) -> usize {
        debug_assert!(attempted <= self.submitted);
        self.submitted -= std::cmp::min(attempted, self.submitted);
        self.mark_flushed(consumed, attempted)
    }

    /// Advances the cursor by `consumed` bytes. Packets whose last byte is
    /// passed become flushed and move to the awaiting index; a packet that
    /// was already completed while being written is dropped instead.
    /// Returns how many packets were flushed.
    pub fn mark_flushed(&mut self, consumed: usize, attempted: usize) -> usize {
        debug_assert!(consumed <= attempted);
        let mut remaining = self.offset + consumed;
        let mut flushed = 0;

        while let Some(front) = self.queue.front() {
            let len = front.len();
            if remaining < len {
                break;
            }
            remaining -= len;
            self.backlog -= len;
            if let Some(mut packet) = self.queue.pop_front() {
                packet.set_enqueued(false);
                packet.mark_flushed();
                flushed += 1;
                if packet.is_invoked() {
                    self.opaques.remove(&packet.opaque());
                } else {
                    self.awaiting.insert(packet.opaque(), packet);
                }
            }
        }

        if remaining > 0 && self.queue.is_empty() {
            log::error!(
                "<{}> (IX={}) Flushed {} bytes past the end of the backlog",
                self.addr,
                self.index,
                remaining
            );
            remaining = 0;
        }
        self.offset = remaining;
        flushed
    }

    fn position_of(&self, opaque: u32) -> Option<(usize, usize)> {
        let mut position = 0;
        for (ix, packet) in self.queue.iter().enumerate() {
            if packet.opaque() == opaque {
                return Some((ix, position));
            }
            position += packet.len();
        }
        None
    }

    fn remove_at(&mut self, ix: usize) -> Option<Packet> {
        let mut packet = self.queue.remove(ix)?;
        self.backlog -= packet.len();
        self.opaques.remove(&packet.opaque());
        packet.set_enqueued(false);
        Some(packet)
    }

    /// Takes out the packet carrying `opaque` so its token can run.
    ///
    /// A packet that is waiting for its response, or that has not been
    /// touched, leaves the pipeline. A touched packet has to stay for the
    /// cursor's sake; it is marked completed and a detached copy holding the
    /// token is returned instead.
    pub fn remove_by_opaque(&mut self, opaque: u32) -> Option<Packet> {
        if let Some(packet) = self.awaiting.remove(&opaque) {
            self.opaques.remove(&opaque);
            return Some(packet);
        }
        let (ix, position) = self.position_of(opaque)?;
        if self.queue[ix].is_invoked() {
            return None;
        }
        if position < self.touched() {
            Some(self.queue[ix].detach())
        } else {
            self.remove_at(ix)
        }
    }

    /// Finds the request a reply answers. Only flushed packets and packets
    /// whose bytes already went to the transport can have been answered; a
    /// reply naming an untouched packet is stale and leaves it queued.
    pub fn take_reply(&mut self, opaque: u32) -> Option<Packet> {
        if let Some(packet) = self.awaiting.remove(&opaque) {
            self.opaques.remove(&opaque);
            return Some(packet);
        }
        let (ix, position) = self.position_of(opaque)?;
        if position >= self.touched() || self.queue[ix].is_invoked() {
            return None;
        }
        Some(self.queue[ix].detach())
    }

    /// Like `remove_by_opaque`, but only for packets not yet flushed.
    pub fn cancel(&mut self, opaque: u32) -> Option<Packet> {
        if self.awaiting.contains_key(&opaque) {
            return None;
        }
        self.remove_by_opaque(opaque)
    }

    /// Removes every untouched packet, for relocation to other pipelines.
    /// Packets already completed are dropped.
    pub fn take_unstarted(&mut self) -> Vec<Packet> {
        let mut position = 0;
        let mut first_free = self.queue.len();
        for (ix, packet) in self.queue.iter().enumerate() {
            if position >= self.touched() {
                first_free = ix;
                break;
            }
            position += packet.len();
        }

        let taken: Vec<Packet> = self.queue.drain(first_free..).collect();
        let mut live = Vec::with_capacity(taken.len());
        for mut packet in taken {
            self.backlog -= packet.len();
            self.opaques.remove(&packet.opaque());
            packet.set_enqueued(false);
            if !packet.is_invoked() {
                live.push(packet);
            }
        }
        live
    }

    fn fail_where<P, F>(&mut self, error: &Error, mut predicate: P, mut callback: F) -> usize
    where
        P: FnMut(&Packet) -> bool,
        F: FnMut(&mut Packet, Error),
    {
        let mut failed = 0;
        let mut fail = |packet: &mut Packet| {
            callback(packet, error.clone());
            if !packet.is_invoked() {
                packet.invoke(Err(error.clone()));
            }
            failed += 1;
        };

        for packet in self.queue.iter_mut() {
            if !packet.is_invoked() && predicate(packet) {
                fail(packet);
            }
        }

        let expired: Vec<u32> = self
            .awaiting
            .iter()
            .filter(|(_, packet)| !packet.is_invoked() && predicate(packet))
            .map(|(opaque, _)| *opaque)
            .collect();
        for opaque in expired {
            if let Some(mut packet) = self.awaiting.remove(&opaque) {
                self.opaques.remove(&opaque);
                fail(&mut packet);
            }
        }
        failed
    }

    /// Fails every packet whose token has not run. `callback` sees each packet
    /// with the error; if it does not complete the packet, the pipeline does.
    /// Unflushed packets stay queued (marked completed) until the connection
    /// has drained and `release_unflushed` is called.
    pub fn fail_all<F>(&mut self, error: &Error, callback: F) -> usize
    where
        F: FnMut(&mut Packet, Error),
    {
        self.fail_where(error, |_| true, callback)
    }

    /// Fails packets created before `threshold`. Returns how many failed and
    /// the creation time of the oldest packet still pending.
    pub fn fail_older_than<F>(&mut self, threshold: Instant, error: &Error, callback: F) -> (usize, Option<Instant>)
    where
        F: FnMut(&mut Packet, Error),
    {
        let failed = self.fail_where(error, |packet| packet.start() < threshold, callback);

        // untouched expired packets have no reason to stay
        let mut position = 0;
        let touched = self.touched();
        let mut ix = 0;
        while ix < self.queue.len() {
            let len = self.queue[ix].len();
            if position >= touched && self.queue[ix].is_invoked() {
                self.remove_at(ix);
            } else {
                position += len;
                ix += 1;
            }
        }

        let oldest = self
            .queue
            .iter()
            .chain(self.awaiting.values())
            .filter(|packet| !packet.is_invoked())
            .map(|packet| packet.start())
            .min();
        (failed, oldest)
    }

    /// Pretends the remaining backlog was written: used once a dead
    /// connection has no operation left in flight. Release callbacks fire,
    /// and every packet still holding its token is failed with `error`.
    pub fn release_unflushed(&mut self, error: &Error) -> usize {
        let mut released = 0;
        while let Some(mut packet) = self.queue.pop_front() {
            self.opaques.remove(&packet.opaque());
            packet.set_enqueued(false);
            packet.mark_flushed();
            if !packet.is_invoked() {
                log::warn!(
                    "<{}> (IX={}) Unflushed packet {} was never failed",
                    self.addr,
                    self.index,
                    packet.opaque()
                );
                packet.invoke(Err(error.clone()));
            }
            released += 1;
        }
        self.offset = 0;
        self.submitted = 0;
        self.backlog = 0;
        released
    }

    pub(crate) fn complete(&mut self, opaque: u32, outcome: Outcome) -> bool {
        match self.remove_by_opaque(opaque) {
            Some(mut packet) => packet.invoke(outcome),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::packet::tests::{flatten, recorded, Calls};
    use crate::queue::{Request, ValueBuf};
    use crate::TransportError;
    use mcpipe_protocol::Opcode;
    use std::cell::RefCell;
    use std::io::ErrorKind;
    use std::rc::Rc;

    fn pipeline() -> Pipeline {
        Pipeline::new(0, "127.0.0.1:11210".parse().unwrap())
    }

    fn concat(iovecs: &[Bytes]) -> Vec<u8> {
        iovecs.iter().flat_map(|iov| iov.iter().cloned()).collect()
    }

    fn broken() -> Error {
        Error::Transport(TransportError::new(ErrorKind::ConnectionReset, "reset"))
    }

    #[test]
    fn enqueue_rejects_misuse() {
        let calls = Calls::default();
        let mut pl = pipeline();
        pl.enqueue(recorded("a", b"1", 1, &calls)).unwrap();

        let rejected = pl.enqueue(recorded("b", b"2", 1, &calls)).unwrap_err();
        assert_eq!(rejected.reason, EnqueueError::OpaqueInUse(1));

        let mut packet = recorded("c", b"3", 2, &calls);
        packet.set_enqueued(true);
        let rejected = pl.enqueue(packet).unwrap_err();
        assert_eq!(rejected.reason, EnqueueError::AlreadyEnqueued(2));
        assert_eq!(pl.queued(), 1);
    }

    #[test]
    fn fill_is_idempotent() {
        let calls = Calls::default();
        let mut pl = pipeline();
        pl.enqueue(recorded("a", b"10 bytes..", 1, &calls)).unwrap();
        pl.enqueue(recorded("b", b"20 bytes............", 2, &calls)).unwrap();

        let first = pl.fill_iovecs(32);
        let second = pl.fill_iovecs(32);
        assert_eq!(first, second);
        assert_eq!(first.1, 25 + 10 + 25 + 20);
        assert_eq!(first.0.len(), 4);

        let (limited, total) = pl.fill_iovecs(3);
        assert_eq!(limited.len(), 3);
        assert_eq!(total, 25 + 10 + 25);
    }

    // packets a, b, c of 30, 50 and 25 bytes
    fn abc(calls: &Calls) -> Pipeline {
        let mut pl = pipeline();
        pl.enqueue(recorded("a", &[b'a'; 5], 1, calls)).unwrap();
        pl.enqueue(recorded("b", &[b'b'; 25], 2, calls)).unwrap();
        pl.enqueue(recorded("c", &[], 3, calls)).unwrap();
        assert_eq!(pl.queue[0].len(), 30);
        assert_eq!(pl.queue[1].len(), 50);
        assert_eq!(pl.queue[2].len(), 25);
        pl
    }

    #[test]
    fn partial_flush_scenario() {
        let calls = Calls::default();
        let mut pl = abc(&calls);
        let everything = concat(&pl.fill_iovecs(32).0);

        assert_eq!(pl.mark_flushed(45, 105), 1);
        assert!(pl.awaiting.contains_key(&1));
        assert_eq!(pl.queued(), 2);

        let (rest, total) = pl.fill_iovecs(32);
        assert_eq!(total, 60);
        assert_eq!(concat(&rest), &everything[45..]);
        assert_eq!(&concat(&rest)[..35], &flatten(&pl.queue[0])[15..]);

        assert_eq!(pl.mark_flushed(35, 60), 1);
        assert!(pl.awaiting.contains_key(&2));
        assert_eq!(pl.unflushed_bytes(), 25);
        assert!(calls.borrow().is_empty());
    }

    #[test]
    fn chunking_does_not_matter() {
        let calls = Calls::default();
        let mut bytewise = abc(&calls);
        let mut at_once = abc(&calls);
        let total = bytewise.fill_iovecs(32).1;

        let mut written = Vec::new();
        for _ in 0..total {
            let (iovecs, left) = bytewise.fill_iovecs(32);
            written.push(iovecs[0][0]);
            bytewise.mark_flushed(1, left);
        }
        let expected = concat(&at_once.fill_iovecs(32).0);
        at_once.mark_flushed(total, total);

        assert_eq!(written, expected);
        let mut a: Vec<u32> = bytewise.awaiting.keys().cloned().collect();
        let mut b: Vec<u32> = at_once.awaiting.keys().cloned().collect();
        a.sort();
        b.sort();
        assert_eq!(a, b);
        assert_eq!(a, vec![1, 2, 3]);
        assert_eq!(bytewise.unflushed_bytes(), 0);
    }

    #[test]
    fn borrowed_value_released_on_flush() {
        let released = Rc::new(RefCell::new(0));
        let counter = released.clone();
        let value = ValueBuf::borrowed(
            vec![Bytes::from_static(b"left"), Bytes::from_static(b"right")],
            move |_| *counter.borrow_mut() += 1,
        );
        let mut packet = Packet::new(
            Request::new(Opcode::Set, &b"key"[..]).value(value),
            Box::new(|_| {}),
        )
        .unwrap();
        packet.assign(0, 9);
        let len = packet.len();

        let mut pl = pipeline();
        pl.enqueue(packet).unwrap();
        pl.mark_flushed(len - 1, len);
        assert_eq!(*released.borrow(), 0);
        pl.mark_flushed(1, 1);
        assert_eq!(*released.borrow(), 1);

        // response arrives, packet leaves, nothing is released twice
        assert!(pl.complete(9, Err(Error::Cancelled)));
        assert_eq!(*released.borrow(), 1);
    }

    #[test]
    fn fail_all_exactly_once() {
        let calls = Calls::default();
        let mut pl = pipeline();
        for opaque in 1..=3 {
            pl.enqueue(recorded("k", b"v", opaque, &calls)).unwrap();
        }
        let first_two = pl.queue[0].len() + pl.queue[1].len();
        pl.mark_flushed(first_two, first_two);

        let mut seen = Vec::new();
        let failed = pl.fail_all(&broken(), |packet, err| {
            seen.push(packet.opaque());
            packet.invoke(Err(err));
        });
        assert_eq!(failed, 3);
        seen.sort();
        assert_eq!(seen, vec![1, 2, 3]);

        assert_eq!(pl.fail_all(&broken(), |_, _| panic!("invoked twice")), 0);
        // a late response for a failed packet is ignored
        assert!(!pl.complete(1, Err(Error::Timeout)));
        assert_eq!(pl.release_unflushed(&broken()), 1);

        let calls = calls.borrow();
        assert_eq!(calls.len(), 3);
        assert!(calls.iter().all(|(_, outcome)| *outcome == Err(broken())));
        assert!(pl.is_empty());
    }

    #[test]
    fn fail_all_on_empty() {
        let mut pl = pipeline();
        assert_eq!(pl.fail_all(&broken(), |_, _| panic!("nothing to fail")), 0);
        assert!(pl.is_empty());
    }

    #[test]
    fn callback_may_leave_completion_to_pipeline() {
        let calls = Calls::default();
        let mut pl = pipeline();
        pl.enqueue(recorded("k", b"v", 1, &calls)).unwrap();
        pl.fail_all(&Error::Shutdown, |_, _| {});
        assert_eq!(calls.borrow().len(), 1);
        assert_eq!(calls.borrow()[0].1, Err(Error::Shutdown));
    }

    #[test]
    fn remove_touched_packet_detaches() {
        let calls = Calls::default();
        let mut pl = abc(&calls);
        pl.mark_flushed(10, 105);

        let mut head = pl.remove_by_opaque(1).unwrap();
        assert!(head.invoke(Err(Error::Cancelled)));
        assert_eq!(pl.queued(), 3);
        assert!(pl.queue[0].is_invoked());
        assert_eq!(pl.remove_by_opaque(1).map(|p| p.opaque()), None);

        // an untouched packet leaves for good
        let middle = pl.remove_by_opaque(2).unwrap();
        assert_eq!(middle.opaque(), 2);
        assert_eq!(pl.queued(), 2);
        assert_eq!(pl.unflushed_bytes(), 20 + 25);

        // finishing the detached head drops it instead of awaiting a reply
        pl.mark_flushed(20, 45);
        assert_eq!(pl.awaiting(), 0);
        assert_eq!(pl.queued(), 1);
    }

    #[test]
    fn replies_match_sent_packets_only() {
        let calls = Calls::default();
        let mut pl = abc(&calls);
        pl.mark_flushed(40, 105);
        assert_eq!(pl.awaiting(), 1);

        // nothing of "c" was written, so no reply can name it
        assert!(pl.take_reply(3).is_none());
        assert_eq!(pl.queued(), 2);
        assert_eq!(pl.unflushed_bytes(), 40 + 25);

        // "b" is partly on the wire: it completes but keeps its bytes queued
        let mut middle = pl.take_reply(2).unwrap();
        assert!(middle.invoke(Err(Error::Cancelled)));
        assert_eq!(pl.queued(), 2);
        assert!(pl.take_reply(2).is_none());

        assert_eq!(pl.take_reply(1).map(|p| p.opaque()), Some(1));
        assert_eq!(pl.awaiting(), 0);
    }

    #[test]
    fn cancel_only_before_flush() {
        let calls = Calls::default();
        let mut pl = abc(&calls);
        pl.mark_flushed(30, 105);
        assert!(pl.cancel(1).is_none());
        assert_eq!(pl.cancel(3).map(|p| p.opaque()), Some(3));
        assert!(pl.has_opaque(1));
        assert!(!pl.has_opaque(3));
    }

    #[test]
    fn reenqueue_orders_by_start() {
        let calls = Calls::default();
        let early = recorded("early", b"", 10, &calls);
        let mut pl = abc(&calls);
        pl.mark_flushed(5, 105);

        let mut later = pl.take_unstarted();
        assert_eq!(later.len(), 2);
        assert_eq!(pl.queued(), 1);

        pl.reenqueue(later.pop().unwrap()).unwrap();
        pl.reenqueue(early).unwrap();
        pl.reenqueue(later.pop().unwrap()).unwrap();

        let order: Vec<u32> = pl.queue.iter().map(|p| p.opaque()).collect();
        // the partly written head keeps its place
        assert_eq!(order, vec![1, 10, 2, 3]);
    }

    #[test]
    fn claimed_bytes_are_touched() {
        let calls = Calls::default();
        let mut pl = abc(&calls);
        let (iovecs, total) = pl.claim_iovecs(2);
        assert_eq!(iovecs.len(), 2);
        assert_eq!(total, 30);

        // a is in flight, so it is not relocated
        assert_eq!(pl.take_unstarted().len(), 2);
        assert_eq!(pl.claim_iovecs(32).1, 0);

        assert_eq!(pl.complete_write(30, 30), 1);
        assert_eq!(pl.awaiting(), 1);
        assert_eq!(pl.unflushed_bytes(), 0);
    }

    #[test]
    fn expire_old_packets() {
        let calls = Calls::default();
        let mut pl = abc(&calls);
        pl.mark_flushed(40, 105);
        std::thread::sleep(std::time::Duration::from_millis(2));
        let threshold = Instant::now();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let fresh = recorded("fresh", b"", 4, &calls);
        let fresh_start = fresh.start();
        pl.enqueue(fresh).unwrap();

        let (failed, oldest) = pl.fail_older_than(threshold, &Error::Timeout, |_, _| {});
        assert_eq!(failed, 3);
        assert_eq!(oldest, Some(fresh_start));
        // b is partly written and stays, c is dropped
        assert_eq!(pl.queued(), 2);
        assert_eq!(pl.awaiting(), 0);
        assert_eq!(pl.pending(), 1);
        assert_eq!(calls.borrow().len(), 3);
    }
}
