//! Routing of requests onto per-server pipelines.

pub(crate) mod packet;
mod pipeline;

pub use packet::{Outcome, Packet, PacketFlags, Release, Request, Response, Route, Token, ValueBuf};
pub use pipeline::{EnqueueError, Pipeline, Rejected};

use crate::retry::RetryQueue;
use crate::{Error, Result};
use mcpipe_vbucket::{KeyHasher, Router, RoutingError, ShardMap, Target};
use std::sync::Arc;
use std::time::Instant;

pub type DynRouter = Router<Box<dyn KeyHasher>>;

/// Correlates a submitted request with its completion. Stays valid across
/// redirects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(pub u32);

/// What changed when a topology version was installed.
pub struct Installed {
    pub previous: Option<Arc<ShardMap>>,
    /// Pipelines of servers that left the cluster, still holding whatever
    /// was written to them.
    pub removed: Vec<Pipeline>,
    /// For each old pipeline index, its index in the new topology.
    pub moved: Vec<Option<usize>>,
    pub relocated: usize,
}

/// Owns the pipelines of one topology and decides where each packet goes.
pub struct CommandQueue {
    router: DynRouter,
    pipelines: Vec<Pipeline>,
    retries: RetryQueue,
    seq: u32,
    depth: usize,
    staged: Vec<(usize, Packet)>,
}

impl CommandQueue {
    pub fn new(router: DynRouter, retries: RetryQueue) -> CommandQueue {
        CommandQueue {
            router,
            pipelines: Vec::new(),
            retries,
            seq: 0,
            depth: 0,
            staged: Vec::new(),
        }
    }

    pub fn router(&self) -> &DynRouter {
        &self.router
    }

    pub fn pipelines(&self) -> &[Pipeline] {
        &self.pipelines
    }

    pub fn pipeline(&self, index: usize) -> Option<&Pipeline> {
        self.pipelines.get(index)
    }

    pub fn pipeline_mut(&mut self, index: usize) -> Option<&mut Pipeline> {
        self.pipelines.get_mut(index)
    }

    pub fn retries(&self) -> &RetryQueue {
        &self.retries
    }

    pub fn retries_mut(&mut self) -> &mut RetryQueue {
        &mut self.retries
    }

    /// Requests whose completion has not run yet.
    pub fn pending(&self) -> usize {
        self.pipelines.iter().map(|pipeline| pipeline.pending()).sum::<usize>()
            + self.retries.len()
            + self.staged.len()
    }

    fn in_flight(&self, opaque: u32) -> bool {
        self.pipelines.iter().any(|pipeline| pipeline.has_opaque(opaque))
            || self.retries.contains(opaque)
            || self.staged.iter().any(|(_, packet)| packet.opaque() == opaque)
    }

    fn next_opaque(&mut self) -> u32 {
        loop {
            self.seq = self.seq.wrapping_add(1);
            if !self.in_flight(self.seq) {
                return self.seq;
            }
        }
    }

    /// Where `packet` should go under the current topology: its shard and the
    /// pipeline index.
    pub fn resolve_packet(&self, packet: &Packet) -> std::result::Result<(u16, usize), RoutingError> {
        let resolution = match packet.route() {
            Route::Key | Route::Replica(_) => self.router.resolve(Target::Key(packet.key())),
            Route::HashKey(key) => self.router.resolve(Target::Key(key)),
            Route::Shard(id) => self.router.resolve(Target::Shard(*id)),
        }?;
        let index = match packet.route() {
            Route::Replica(ix) => resolution
                .replicas
                .get(*ix)
                .cloned()
                .flatten()
                .ok_or(RoutingError::NoMatchingServer(resolution.shard))?,
            _ => resolution.master,
        };
        if index >= self.pipelines.len() {
            return Err(RoutingError::NoMatchingServer(resolution.shard));
        }
        Ok((resolution.shard, index))
    }

    /// Builds a packet for `request` and queues it on its server's pipeline,
    /// or stages it while a scheduling context is open. Nothing is written
    /// until the pipeline is flushed.
    ///
    /// On error the token is dropped without running.
    pub fn submit(&mut self, request: Request, token: Token) -> Result<(Handle, usize)> {
        let mut packet = Packet::new(request, token)?;
        let (shard, index) = self.resolve_packet(&packet)?;
        let opaque = self.next_opaque();
        packet.assign(shard, opaque);

        if self.depth > 0 {
            self.staged.push((index, packet));
        } else {
            self.place(index, packet).map_err(|(_, err)| err)?;
        }
        Ok((Handle(opaque), index))
    }

    fn place(&mut self, index: usize, packet: Packet) -> std::result::Result<(), (Packet, Error)> {
        match self.pipelines.get_mut(index) {
            Some(pipeline) => pipeline.enqueue(packet).map_err(|rejected| {
                log::error!("Pipeline {} refused packet: {}", index, rejected.reason);
                (rejected.packet, Error::Cancelled)
            }),
            None => {
                let shard = packet.shard();
                Err((packet, RoutingError::NoMatchingServer(shard).into()))
            }
        }
    }

    /// Routes a packet again after it was renewed. Returns the pipeline it
    /// now sits on, or the packet with the reason it could not be placed.
    pub(crate) fn redirect(&mut self, mut packet: Packet) -> std::result::Result<usize, (Packet, Error)> {
        let (shard, index) = match self.resolve_packet(&packet) {
            Ok(target) => target,
            Err(err) => return Err((packet, err.into())),
        };
        if packet.shard() != shard {
            let opaque = packet.opaque();
            packet.assign(shard, opaque);
        }
        match self.pipelines.get_mut(index) {
            Some(pipeline) => pipeline.reenqueue(packet).map(|_| index).map_err(|rejected| {
                log::error!("Pipeline {} refused redirected packet: {}", index, rejected.reason);
                (rejected.packet, Error::Cancelled)
            }),
            None => Err((packet, RoutingError::NoMatchingServer(shard).into())),
        }
    }

    pub fn sched_enter(&mut self) {
        self.depth += 1;
    }

    /// Closes a scheduling context. When the outermost one closes, staged
    /// packets are committed to their pipelines; the indices of the
    /// pipelines that received packets are returned.
    pub fn sched_leave(&mut self) -> Vec<usize> {
        if self.depth == 0 {
            log::warn!("sched_leave without a matching sched_enter");
            return Vec::new();
        }
        self.depth -= 1;
        if self.depth > 0 {
            return Vec::new();
        }

        let mut touched = Vec::new();
        for (index, packet) in std::mem::replace(&mut self.staged, Vec::new()) {
            match self.place(index, packet) {
                Ok(()) => {
                    if !touched.contains(&index) {
                        touched.push(index);
                    }
                }
                Err((mut packet, err)) => {
                    packet.invoke(Err(err));
                }
            }
        }
        touched
    }

    /// Discards every staged packet. Their completions never run; borrowed
    /// values are released.
    pub fn sched_fail(&mut self) -> usize {
        self.depth = self.depth.saturating_sub(1);
        let dropped = self.staged.len();
        self.staged.clear();
        dropped
    }

    pub fn is_scheduling(&self) -> bool {
        self.depth > 0
    }

    /// Installs a topology version, reusing the pipeline of every server that
    /// stays and moving requests nothing has been written for onto the
    /// pipeline their shard now maps to. Requests that can no longer be routed
    /// fail with the routing error.
    pub fn install(&mut self, map: Arc<ShardMap>) -> Installed {
        let previous = self.router.update(map.clone());

        let mut old: Vec<Option<Pipeline>> = std::mem::replace(&mut self.pipelines, Vec::new())
            .into_iter()
            .map(Some)
            .collect();
        let mut moved = vec![None; old.len()];

        for (index, addr) in map.servers().iter().enumerate() {
            let reused = old
                .iter()
                .position(|slot| slot.as_ref().map_or(false, |pipeline| pipeline.addr() == *addr));
            let pipeline = match reused {
                Some(from) => {
                    moved[from] = Some(index);
                    let mut pipeline = old[from].take();
                    if let Some(pipeline) = pipeline.as_mut() {
                        pipeline.set_index(index);
                    }
                    pipeline
                }
                None => None,
            };
            self.pipelines
                .push(pipeline.unwrap_or_else(|| Pipeline::new(index, *addr)));
        }
        let mut removed: Vec<Pipeline> = old.into_iter().flatten().collect();

        let mut homeless = Vec::new();
        for pipeline in self.pipelines.iter_mut().chain(removed.iter_mut()) {
            homeless.extend(pipeline.take_unstarted());
        }
        homeless.sort_by_key(|packet| packet.start());

        let mut relocated = 0;
        for packet in homeless {
            match self.redirect(packet) {
                Ok(_) => relocated += 1,
                Err((mut packet, err)) => {
                    packet.invoke(Err(err));
                }
            }
        }

        let staged = std::mem::replace(&mut self.staged, Vec::new());
        for (_, mut packet) in staged {
            match self.resolve_packet(&packet) {
                Ok((shard, index)) => {
                    let opaque = packet.opaque();
                    packet.assign(shard, opaque);
                    self.staged.push((index, packet));
                }
                Err(err) => {
                    packet.invoke(Err(err.into()));
                }
            }
        }

        Installed {
            previous,
            removed,
            moved,
            relocated,
        }
    }

    /// Swaps in an empty pipeline for the same server and returns the old one,
    /// for a connection that failed.
    pub fn replace_pipeline(&mut self, index: usize) -> Option<Pipeline> {
        let addr = self.pipelines.get(index)?.addr();
        Some(std::mem::replace(
            &mut self.pipelines[index],
            Pipeline::new(index, addr),
        ))
    }

    pub(crate) fn take_pipelines(&mut self) -> Vec<Pipeline> {
        std::mem::replace(&mut self.pipelines, Vec::new())
    }

    /// Takes the request out of wherever it waits so the caller can complete
    /// it. When `flushed` is false, requests already written are left alone.
    pub(crate) fn take(&mut self, handle: Handle, flushed: bool) -> Option<Packet> {
        let opaque = handle.0;
        if let Some(at) = self.staged.iter().position(|(_, packet)| packet.opaque() == opaque) {
            return Some(self.staged.remove(at).1);
        }
        if let Some(packet) = self.retries.take(opaque) {
            return Some(packet);
        }
        self.pipelines.iter_mut().find_map(|pipeline| {
            if flushed {
                pipeline.remove_by_opaque(opaque)
            } else {
                pipeline.cancel(opaque)
            }
        })
    }

    /// Fails every request created before `threshold`. Returns the count and
    /// the creation time of the oldest request still pending.
    pub fn fail_older_than(&mut self, threshold: Instant, error: &Error) -> (usize, Option<Instant>) {
        let (mut failed, mut oldest) = self.retries.fail_older_than(threshold, error);
        for pipeline in self.pipelines.iter_mut() {
            let (count, first) = pipeline.fail_older_than(threshold, error, |_, _| {});
            failed += count;
            oldest = match (oldest, first) {
                (Some(a), Some(b)) => Some(std::cmp::min(a, b)),
                (a, b) => a.or(b),
            };
        }
        (failed, oldest)
    }

    /// Fails everything: staged, waiting to retry, queued and awaiting a reply.
    pub fn fail_all(&mut self, error: &Error) -> usize {
        let mut failed = 0;
        for (_, mut packet) in self.staged.drain(..) {
            if packet.invoke(Err(error.clone())) {
                failed += 1;
            }
        }
        failed += self.retries.fail_all(error);
        for pipeline in self.pipelines.iter_mut() {
            failed += pipeline.fail_all(error, |_, _| {});
        }
        failed
    }
}
