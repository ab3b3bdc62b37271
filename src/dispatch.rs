use crate::queue::{CommandQueue, Response};
use crate::settings::Settings;
use crate::Error;
use bytes::Bytes;
use mcpipe_protocol::{Frame, Header, Magic, ProtocolError, ServerOpcode, Status, HEADER_SIZE};
use std::time::Instant;

/// Receives cluster configuration the servers push or attach to
/// NOT_MY_VBUCKET replies. Whoever implements it is in charge of fetching
/// and installing new topology versions.
pub trait TopologyListener {
    fn on_topology_hint(&mut self, index: usize, config: Bytes);
}

impl<F: FnMut(usize, Bytes)> TopologyListener for F {
    fn on_topology_hint(&mut self, index: usize, config: Bytes) {
        self(index, config)
    }
}

/// What became of one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// The request's completion ran with the reply.
    Completed,
    /// Nothing waits for this opaque any more.
    Stale,
    /// The request moved to another pipeline, which needs flushing.
    Redirected(usize),
    /// The request waits in the retry queue.
    Deferred,
    /// The request failed after too many redirects.
    Exhausted,
    /// A server request carrying a topology hint.
    Notified,
}

pub struct Dispatcher {
    max_redirects: u8,
    listener: Option<Box<dyn TopologyListener>>,
    stale: u64,
}

impl Dispatcher {
    pub fn new(settings: &Settings) -> Dispatcher {
        Dispatcher {
            max_redirects: settings.max_redirects,
            listener: None,
            stale: 0,
        }
    }

    pub fn set_listener(&mut self, listener: Box<dyn TopologyListener>) {
        self.listener = Some(listener);
    }

    /// Replies that arrived for nothing.
    pub fn stale_frames(&self) -> u64 {
        self.stale
    }

    fn notify(&mut self, index: usize, config: Bytes) {
        match self.listener.as_mut() {
            Some(listener) => listener.on_topology_hint(index, config),
            None => log::debug!("(IX={}) Topology hint of {} bytes ignored, no listener", index, config.len()),
        }
    }

    /// Dispatches a frame given as raw header bytes and body.
    pub fn on_frame(
        &mut self,
        queue: &mut CommandQueue,
        index: usize,
        raw_header: &[u8],
        raw_body: Bytes,
        now: Instant,
    ) -> Result<Dispatch, ProtocolError> {
        if raw_header.len() < HEADER_SIZE {
            return Err(ProtocolError::ShortHeader(raw_header.len()));
        }
        let header = Header::parse(raw_header)?;
        if raw_body.len() != header.body_len as usize {
            return Err(ProtocolError::BodyLength(
                header.body_len,
                header.extras_len,
                header.key_len,
            ));
        }
        Ok(self.dispatch(
            queue,
            index,
            Frame {
                header,
                body: raw_body,
            },
            now,
        ))
    }

    /// Hands a reply read from pipeline `index` to the request it answers.
    pub fn dispatch(&mut self, queue: &mut CommandQueue, index: usize, frame: Frame, now: Instant) -> Dispatch {
        if frame.header.magic == Magic::ServerRequest {
            return self.server_request(index, frame);
        }

        let opaque = frame.header.opaque;
        let packet = queue
            .pipeline_mut(index)
            .and_then(|pipeline| pipeline.take_reply(opaque));
        let mut packet = match packet {
            Some(packet) => packet,
            None => {
                self.stale += 1;
                log::debug!(
                    "(IX={}) Dropping {:?} reply for unknown opaque {}",
                    index,
                    frame.header.status(),
                    opaque
                );
                return Dispatch::Stale;
            }
        };

        if frame.header.status() != Status::NotMyVbucket {
            packet.invoke(Ok(Response { server: index, frame }));
            return Dispatch::Completed;
        }

        let config = frame.value();
        if !config.is_empty() {
            self.notify(index, config);
        }

        if packet.retries() >= self.max_redirects {
            log::warn!(
                "(IX={}) Packet {} for shard {} bounced {} times",
                index,
                opaque,
                packet.shard(),
                packet.retries()
            );
            let retries = packet.retries();
            packet.invoke(Err(Error::TopologyExhausted(retries)));
            return Dispatch::Exhausted;
        }

        packet.renew();
        queue.router().remap_master(packet.shard(), index);
        match queue.resolve_packet(&packet) {
            Ok((_, target)) if target == index => {
                queue.retries_mut().push(packet, now);
                Dispatch::Deferred
            }
            Ok(_) => match queue.redirect(packet) {
                Ok(target) => {
                    log::debug!("(IX={}) Packet {} redirected to IX={}", index, opaque, target);
                    Dispatch::Redirected(target)
                }
                Err((mut packet, err)) => {
                    packet.invoke(Err(err));
                    Dispatch::Completed
                }
            },
            Err(err) => {
                packet.invoke(Err(err.into()));
                Dispatch::Completed
            }
        }
    }

    fn server_request(&mut self, index: usize, frame: Frame) -> Dispatch {
        match ServerOpcode::from(frame.header.opcode) {
            ServerOpcode::ClusterMapChangeNotification => {
                log::info!("(IX={}) Server pushed a cluster map change", index);
                self.notify(index, frame.value());
                Dispatch::Notified
            }
            other => {
                log::debug!("(IX={}) Ignoring server request {:?}", index, other);
                Dispatch::Stale
            }
        }
    }
}
