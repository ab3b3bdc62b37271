use super::{IoError, Result, TimerId};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Timers shared by both reference loops: each timer is armed at most once
/// at a time and fires once per `schedule`.
#[derive(Default)]
pub(crate) struct TimerTable {
    next_id: u64,
    deadlines: BTreeMap<TimerId, Option<Instant>>,
}

impl TimerTable {
    pub fn create(&mut self) -> TimerId {
        self.next_id += 1;
        let id = TimerId(self.next_id);
        self.deadlines.insert(id, None);
        id
    }

    pub fn schedule(&mut self, timer: TimerId, after: Duration) -> Result<()> {
        let deadline = self
            .deadlines
            .get_mut(&timer)
            .ok_or(IoError::UnknownTimer(timer))?;
        *deadline = Some(Instant::now() + after);
        Ok(())
    }

    pub fn cancel(&mut self, timer: TimerId) -> Result<()> {
        let deadline = self
            .deadlines
            .get_mut(&timer)
            .ok_or(IoError::UnknownTimer(timer))?;
        *deadline = None;
        Ok(())
    }

    pub fn destroy(&mut self, timer: TimerId) -> Result<()> {
        self.deadlines
            .remove(&timer)
            .map(|_| ())
            .ok_or(IoError::UnknownTimer(timer))
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().filter_map(|deadline| *deadline).min()
    }

    /// Disarms and returns every timer due at `now`.
    pub fn expire(&mut self, now: Instant) -> Vec<TimerId> {
        let mut fired = Vec::new();
        for (id, deadline) in self.deadlines.iter_mut() {
            if deadline.map_or(false, |at| at <= now) {
                *deadline = None;
                fired.push(*id);
            }
        }
        fired
    }

    /// How long a wait may block: the caller's timeout capped by the next timer.
    pub fn wait_budget(&self, timeout: Option<Duration>) -> Option<Duration> {
        let until_timer = self
            .next_deadline()
            .map(|at| at.saturating_duration_since(Instant::now()));
        match (timeout, until_timer) {
            (Some(a), Some(b)) => Some(std::cmp::min(a, b)),
            (a, b) => a.or(b),
        }
    }
}
