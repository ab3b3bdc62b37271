use crate::dispatch::{Dispatch, Dispatcher, TopologyListener};
use crate::error::TransportError;
use crate::queue::{CommandQueue, DynRouter, Handle, Pipeline, Request, Token};
use crate::retry::RetryQueue;
use crate::server::Server;
use crate::settings::Settings;
use crate::{Error, Result};
use log::{debug, error, info, trace, warn};
use mcpipe_io::{IoEvent, IoOps, IoProvider, SocketId, TimerId, Timers};
use mcpipe_protocol::Frame;
use mcpipe_vbucket::{ConfigDiff, Crc32Hasher, KeyHasher, Router, ShardMap};
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Owner {
    Active(usize),
    Draining(usize),
}

/// Drives requests from submission to completion over an [`IoProvider`].
///
/// The engine never blocks and never waits on its own. The host calls
/// `flush` after submitting, runs the provider, and hands every event it
/// collects to `handle_event` (or lets `step` do both).
pub struct Engine<P: IoProvider> {
    io: P,
    settings: Settings,
    queue: CommandQueue,
    servers: Vec<Server>,
    draining: Vec<(Server, Pipeline, Error)>,
    dispatcher: Dispatcher,
    retry_timer: TimerId,
    retry_at: Option<Instant>,
    closed: bool,
}

impl<P: IoProvider> Engine<P> {
    pub fn new(io: P, settings: Settings) -> Engine<P> {
        Engine::with_hasher(io, settings, Crc32Hasher)
    }

    pub fn with_hasher<H: KeyHasher + 'static>(mut io: P, settings: Settings, hasher: H) -> Engine<P> {
        let retry_timer = io.create_timer();
        let router: DynRouter = Router::with_hasher(Box::new(hasher) as Box<dyn KeyHasher>);
        let retries = RetryQueue::new(settings.retry_interval, settings.retry_backoff);
        Engine {
            io,
            queue: CommandQueue::new(router, retries),
            servers: Vec::new(),
            draining: Vec::new(),
            dispatcher: Dispatcher::new(&settings),
            retry_timer,
            retry_at: None,
            closed: false,
            settings,
        }
    }

    pub fn io(&self) -> &P {
        &self.io
    }

    pub fn io_mut(&mut self) -> &mut P {
        &mut self.io
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn router(&self) -> &DynRouter {
        self.queue.router()
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    pub fn servers(&self) -> &[Server] {
        &self.servers
    }

    pub fn set_topology_listener<L: TopologyListener + 'static>(&mut self, listener: L) {
        self.dispatcher.set_listener(Box::new(listener));
    }

    /// Requests whose completion has not run yet.
    pub fn pending(&self) -> usize {
        self.queue.pending()
    }

    /// Nothing pending and no failed connection still draining.
    pub fn is_idle(&self) -> bool {
        self.pending() == 0 && self.draining.is_empty()
    }

    /// Installs a topology version. Connections to servers that stay are
    /// kept; requests queued for servers that left are routed again, and the
    /// ones already written to them fail.
    pub fn install_topology(&mut self, map: Arc<ShardMap>) -> Option<Arc<ShardMap>> {
        if let Some(previous) = self.queue.router().snapshot() {
            let diff = ConfigDiff::between(&previous, &map);
            let change = diff.change_type();
            info!(
                "Topology {}.{} -> {}.{}: {} servers added, {} removed, {:?} shards moved (map modified: {}, servers modified: {})",
                previous.revision(),
                previous.generation(),
                map.revision(),
                map.generation(),
                diff.servers_added.len(),
                diff.servers_removed.len(),
                diff.master_changes,
                change.map_modified,
                change.servers_modified
            );
        } else {
            info!(
                "Topology {} installed with {} servers and {} shards",
                map.revision(),
                map.num_servers(),
                map.num_shards()
            );
        }

        let installed = self.queue.install(map.clone());
        if installed.relocated > 0 {
            debug!("{} queued requests routed again", installed.relocated);
        }

        let mut old: Vec<Option<Server>> = std::mem::replace(&mut self.servers, Vec::new())
            .into_iter()
            .map(Some)
            .collect();
        for (index, addr) in map.servers().iter().enumerate() {
            let kept = installed
                .moved
                .iter()
                .position(|moved| *moved == Some(index))
                .and_then(|from| old.get_mut(from).and_then(|slot| slot.take()));
            let server = match kept {
                Some(mut server) => {
                    server.set_index(index);
                    server
                }
                None => Server::new(index, *addr, &self.settings),
            };
            self.servers.push(server);
        }

        for mut pipeline in installed.removed {
            let err = Error::Transport(TransportError::new(
                ErrorKind::ConnectionAborted,
                format!("{} left the cluster", pipeline.addr()),
            ));
            let failed = pipeline.fail_all(&err, |_, _| {});
            debug!("<{}> (IX={}) Removed, {} requests failed", pipeline.addr(), pipeline.index(), failed);
            match old.get_mut(pipeline.index()).and_then(|slot| slot.take()) {
                Some(server) => self.retire(server, pipeline, err),
                None => {
                    pipeline.release_unflushed(&err);
                }
            }
        }

        self.flush();
        installed.previous
    }

    /// Queues a request. Nothing is sent before the next `flush`.
    ///
    /// When this fails the token is dropped without being called.
    pub fn submit(&mut self, request: Request, token: Token) -> Result<Handle> {
        if self.closed {
            return Err(Error::Shutdown);
        }
        let (handle, index) = self.queue.submit(request, token)?;
        trace!("Request {} queued for IX={}", handle.0, index);
        Ok(handle)
    }

    pub fn sched_enter(&mut self) {
        self.queue.sched_enter();
    }

    /// Commits the requests submitted since the matching `sched_enter`,
    /// optionally flushing the pipelines that received them.
    pub fn sched_leave(&mut self, flush: bool) {
        let touched = self.queue.sched_leave();
        if flush {
            for index in touched {
                self.flush_server(index);
            }
        }
    }

    /// Drops the requests submitted since the matching `sched_enter` without
    /// calling their completions.
    pub fn sched_fail(&mut self) -> usize {
        self.queue.sched_fail()
    }

    /// Cancels a request that has not been written yet. Its completion runs
    /// with `Cancelled`.
    pub fn cancel(&mut self, handle: Handle) -> bool {
        self.complete_early(handle, false, Error::Cancelled)
    }

    /// Completes a request with `error` wherever it is, typically a timeout
    /// raised by the caller. A reply arriving later is dropped.
    pub fn expire(&mut self, handle: Handle, error: Error) -> bool {
        self.complete_early(handle, true, error)
    }

    fn complete_early(&mut self, handle: Handle, flushed: bool, error: Error) -> bool {
        let completed = match self.queue.take(handle, flushed) {
            Some(mut packet) => packet.invoke(Err(error)),
            None => false,
        };
        self.arm_retry();
        completed
    }

    /// Times out every request older than `age`. Returns how many failed and
    /// when the oldest remaining request was created.
    pub fn expire_older_than(&mut self, age: Duration) -> (usize, Option<Instant>) {
        let threshold = match Instant::now().checked_sub(age) {
            Some(threshold) => threshold,
            None => return (0, None),
        };
        let (failed, oldest) = self.queue.fail_older_than(threshold, &Error::Timeout);
        if failed > 0 {
            debug!("{} requests timed out", failed);
        }
        self.arm_retry();
        (failed, oldest)
    }

    /// Starts writing every pipeline with unsent bytes, connecting first
    /// where needed.
    pub fn flush(&mut self) {
        for index in 0..self.servers.len() {
            let backlog = self
                .queue
                .pipeline(index)
                .map_or(false, |pipeline| pipeline.has_unflushed());
            if backlog {
                self.flush_server(index);
            }
        }
    }

    fn flush_server(&mut self, index: usize) {
        let result = match self.servers.get(index) {
            Some(server) if server.is_idle() => self.connect(index),
            Some(_) => self.write(index),
            None => Ok(()),
        };
        if let Err(err) = result {
            self.fail_server(index, err);
        }
    }

    fn connect(&mut self, index: usize) -> Result<()> {
        let server = &mut self.servers[index];
        match self.io.ops() {
            IoOps::Readiness(ops) => server.connect_readiness(ops)?,
            IoOps::Completion(ops) => server.connect_completion(ops)?,
        }
        if server.is_connecting() {
            let timer = self.io.create_timer();
            self.io.schedule_timer(timer, self.settings.connect_timeout)?;
            server.connect_timer = Some(timer);
        }
        Ok(())
    }

    fn write(&mut self, index: usize) -> Result<()> {
        let server = &mut self.servers[index];
        let pipeline = match self.queue.pipeline_mut(index) {
            Some(pipeline) => pipeline,
            None => return Ok(()),
        };
        match self.io.ops() {
            IoOps::Readiness(ops) => server.flush_readiness(ops, pipeline),
            IoOps::Completion(ops) => server.flush_completion(ops, pipeline),
        }
    }

    fn owner(&self, socket: SocketId) -> Option<Owner> {
        if let Some(index) = self.servers.iter().position(|server| server.socket() == Some(socket)) {
            return Some(Owner::Active(index));
        }
        self.draining
            .iter()
            .position(|(server, _, _)| server.socket() == Some(socket))
            .map(Owner::Draining)
    }

    fn cancel_connect_timer(&mut self, index: usize) {
        if let Some(timer) = self.servers.get_mut(index).and_then(|server| server.connect_timer.take()) {
            if let Err(err) = self.io.destroy_timer(timer) {
                debug!("Destroying connect timer {}: {}", timer, err);
            }
        }
    }

    /// Acts on one event from the provider. Events that do not concern the
    /// engine, such as timers the host created, are handed back.
    pub fn handle_event(&mut self, event: IoEvent) -> Option<IoEvent> {
        if let IoEvent::Timer { timer } = event {
            return self.on_timer(timer);
        }
        let owner = match event.socket().and_then(|socket| self.owner(socket)) {
            Some(owner) => owner,
            None => {
                trace!("Event for a socket nobody owns: {:?}", event);
                return None;
            }
        };
        let index = match owner {
            Owner::Active(index) => index,
            Owner::Draining(slot) => {
                self.on_draining_event(slot, event);
                return None;
            }
        };

        let mut frames = Vec::new();
        let result = {
            let server = &mut self.servers[index];
            let pipeline = match self.queue.pipeline_mut(index) {
                Some(pipeline) => pipeline,
                None => return None,
            };
            match (self.io.ops(), event) {
                (IoOps::Readiness(ops), IoEvent::Ready { ready, .. }) => {
                    server.on_ready(ops, pipeline, ready, &mut frames)
                }
                (IoOps::Completion(ops), IoEvent::Connected { result, .. }) => {
                    server.on_connected(ops, pipeline, result)
                }
                (IoOps::Completion(_), IoEvent::WriteDone { result, bufs, .. }) => {
                    server.on_write_done(pipeline, result, &bufs)
                }
                (IoOps::Completion(ops), IoEvent::ReadDone { result, buf, .. }) => {
                    server.on_read_done(ops, result, buf, &mut frames)
                }
                (_, IoEvent::Closed { .. }) => Err(Error::Transport(TransportError::new(
                    ErrorKind::ConnectionAborted,
                    "socket closed underneath",
                ))),
                (_, other) => {
                    warn!("(IX={}) Event does not match the provider model: {:?}", index, other);
                    Ok(())
                }
            }
        };

        if self.servers.get(index).map_or(false, |server| server.is_connected()) {
            self.cancel_connect_timer(index);
        }
        self.deliver(index, frames);
        if let Err(err) = result {
            self.fail_server(index, err);
        }
        None
    }

    fn on_draining_event(&mut self, slot: usize, event: IoEvent) {
        match event {
            IoEvent::Closed { .. } => {
                let (mut server, mut pipeline, err) = self.draining.remove(slot);
                server.on_closed();
                let released = pipeline.release_unflushed(&err);
                debug!(
                    "<{}> (IX={}) Drained, {} unsent requests released",
                    server.addr(),
                    server.index(),
                    released
                );
            }
            other => trace!("Completion on a failed connection: {:?}", other),
        }
    }

    fn on_timer(&mut self, timer: TimerId) -> Option<IoEvent> {
        if timer == self.retry_timer {
            self.run_retries();
            return None;
        }
        let index = self
            .servers
            .iter()
            .position(|server| server.connect_timer == Some(timer));
        match index {
            Some(index) => {
                self.cancel_connect_timer(index);
                if self.servers[index].is_connecting() {
                    let err = Error::Transport(TransportError::new(
                        ErrorKind::TimedOut,
                        format!("connect timed out after {:?}", self.settings.connect_timeout),
                    ));
                    self.fail_server(index, err);
                }
                None
            }
            None => Some(IoEvent::Timer { timer }),
        }
    }

    fn deliver(&mut self, index: usize, frames: Vec<Frame>) {
        if frames.is_empty() {
            return;
        }
        let now = Instant::now();
        let mut targets = Vec::new();
        for frame in frames {
            match self.dispatcher.dispatch(&mut self.queue, index, frame, now) {
                Dispatch::Redirected(target) => {
                    if !targets.contains(&target) {
                        targets.push(target);
                    }
                }
                Dispatch::Deferred => self.arm_retry(),
                _ => {}
            }
        }
        for target in targets {
            self.flush_server(target);
        }
    }

    fn arm_retry(&mut self) {
        match self.queue.retries().next_deadline() {
            Some(deadline) if self.retry_at != Some(deadline) => {
                let after = deadline.saturating_duration_since(Instant::now());
                match self.io.schedule_timer(self.retry_timer, after) {
                    Ok(()) => self.retry_at = Some(deadline),
                    Err(err) => error!("Cannot arm the retry timer: {}", err),
                }
            }
            None if self.retry_at.is_some() => {
                self.retry_at = None;
                if let Err(err) = self.io.cancel_timer(self.retry_timer) {
                    debug!("Cancelling the retry timer: {}", err);
                }
            }
            _ => {}
        }
    }

    fn run_retries(&mut self) {
        self.retry_at = None;
        let mut targets = Vec::new();
        for packet in self.queue.retries_mut().due(Instant::now()) {
            let opaque = packet.opaque();
            match self.queue.redirect(packet) {
                Ok(target) => {
                    trace!("Retrying request {} on IX={}", opaque, target);
                    if !targets.contains(&target) {
                        targets.push(target);
                    }
                }
                Err((mut packet, err)) => {
                    packet.invoke(Err(err));
                }
            }
        }
        for target in targets {
            self.flush_server(target);
        }
        self.arm_retry();
    }

    /// Fails every request the connection carried and starts over with a
    /// fresh connection for the requests that come next.
    fn fail_server(&mut self, index: usize, err: Error) {
        let addr = match self.servers.get(index) {
            Some(server) => server.addr(),
            None => return,
        };
        self.cancel_connect_timer(index);
        let server = std::mem::replace(&mut self.servers[index], Server::new(index, addr, &self.settings));
        let mut pipeline = match self.queue.replace_pipeline(index) {
            Some(pipeline) => pipeline,
            None => return,
        };
        let failed = pipeline.fail_all(&err, |_, _| {});
        warn!("<{}> (IX={}) Connection failed, {} requests failed: {}", addr, index, failed, err);
        self.retire(server, pipeline, err);
    }

    fn retire(&mut self, mut server: Server, mut pipeline: Pipeline, err: Error) {
        if let Some(timer) = server.connect_timer.take() {
            if let Err(err) = self.io.destroy_timer(timer) {
                debug!("Destroying connect timer {}: {}", timer, err);
            }
        }
        let closed = match self.io.ops() {
            IoOps::Readiness(ops) => server.close_readiness(ops),
            IoOps::Completion(ops) => server.close_completion(ops),
        };
        if closed {
            pipeline.release_unflushed(&err);
        } else {
            debug!(
                "<{}> (IX={}) Draining {} outstanding operations",
                server.addr(),
                server.index(),
                server.operations_pending()
            );
            self.draining.push((server, pipeline, err));
        }
    }

    /// Waits on the provider once and handles what it reports. Returns the
    /// events that were not for the engine.
    pub fn step(&mut self, timeout: Option<Duration>) -> Result<Vec<IoEvent>> {
        let events = self.io.wait(timeout)?;
        let mut unhandled = Vec::new();
        for event in events {
            if let Some(event) = self.handle_event(event) {
                unhandled.push(event);
            }
        }
        Ok(unhandled)
    }

    /// Fails everything with `Shutdown`, forgets the topology, then closes
    /// every connection. Completion providers still report the closes, so
    /// keep stepping until `is_idle`.
    pub fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let failed = self.queue.fail_all(&Error::Shutdown);
        info!("Shutting down, {} requests failed", failed);

        self.queue.router().clear();
        let pipelines = self.queue.take_pipelines();
        let servers = std::mem::replace(&mut self.servers, Vec::new());
        for (server, pipeline) in servers.into_iter().zip(pipelines) {
            self.retire(server, pipeline, Error::Shutdown);
        }

        self.retry_at = None;
        if let Err(err) = self.io.destroy_timer(self.retry_timer) {
            debug!("Destroying the retry timer: {}", err);
        }
    }
}
