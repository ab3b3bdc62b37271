use crate::queue::Packet;
use crate::Error;
use std::time::{Duration, Instant};

/// Packets waiting out a NOT_MY_VBUCKET backoff before they are routed again.
///
/// Entries are kept sorted by the time they become due.
pub struct RetryQueue {
    entries: Vec<(Instant, Packet)>,
    interval: Duration,
    backoff: f64,
}

impl RetryQueue {
    pub fn new(interval: Duration, backoff: f64) -> RetryQueue {
        RetryQueue {
            entries: Vec::new(),
            interval,
            backoff,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// How long a packet redirected `retries` times waits before its next try.
    pub fn delay(&self, retries: u8) -> Duration {
        let factor = std::cmp::max(retries, 1) as f64 * self.backoff.max(1.0);
        Duration::from_nanos((self.interval.as_nanos() as f64 * factor).round() as u64)
    }

    pub fn push(&mut self, packet: Packet, now: Instant) -> Instant {
        let trytime = now + self.delay(packet.retries());
        let at = self
            .entries
            .iter()
            .position(|(due, _)| *due > trytime)
            .unwrap_or_else(|| self.entries.len());
        log::trace!(
            "Packet {} retries in {:?} (attempt {})",
            packet.opaque(),
            trytime - now,
            packet.retries()
        );
        self.entries.insert(at, (trytime, packet));
        trytime
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.first().map(|(due, _)| *due)
    }

    /// Removes and returns every packet due at `now`, oldest deadline first.
    pub fn due(&mut self, now: Instant) -> Vec<Packet> {
        let ready = self
            .entries
            .iter()
            .position(|(due, _)| *due > now)
            .unwrap_or_else(|| self.entries.len());
        self.entries.drain(..ready).map(|(_, packet)| packet).collect()
    }

    pub fn contains(&self, opaque: u32) -> bool {
        self.entries.iter().any(|(_, packet)| packet.opaque() == opaque)
    }

    pub fn take(&mut self, opaque: u32) -> Option<Packet> {
        let at = self
            .entries
            .iter()
            .position(|(_, packet)| packet.opaque() == opaque)?;
        Some(self.entries.remove(at).1)
    }

    pub fn fail_all(&mut self, error: &Error) -> usize {
        let mut failed = 0;
        for (_, mut packet) in self.entries.drain(..) {
            if packet.invoke(Err(error.clone())) {
                failed += 1;
            }
        }
        failed
    }

    /// Fails packets created before `threshold`; returns the count and the
    /// creation time of the oldest packet left.
    pub fn fail_older_than(&mut self, threshold: Instant, error: &Error) -> (usize, Option<Instant>) {
        let mut failed = 0;
        let mut kept = Vec::with_capacity(self.entries.len());
        for (due, mut packet) in self.entries.drain(..) {
            if packet.start() < threshold {
                if packet.invoke(Err(error.clone())) {
                    failed += 1;
                }
            } else {
                kept.push((due, packet));
            }
        }
        self.entries = kept;
        let oldest = self.entries.iter().map(|(_, packet)| packet.start()).min();
        (failed, oldest)
    }
}
