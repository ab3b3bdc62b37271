use super::{KeyHasher, Result, RoutingError};
use std::net::SocketAddr;

pub const MAX_REPLICAS: usize = 4;
/// Shard ids travel as 16 bit fields.
pub const MAX_SHARDS: usize = u16::MAX as usize + 1;

/// Owner of one shard: a master connection index followed by its replicas.
/// `None` marks a slot the cluster has not assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shard {
    pub master: Option<usize>,
    pub replicas: Vec<Option<usize>>,
}

impl Shard {
    fn servers(&self) -> impl Iterator<Item = usize> + '_ {
        std::iter::once(self.master)
            .chain(self.replicas.iter().cloned())
            .flatten()
    }
}

/// What a key (or an explicit shard id) resolves to in one topology version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub shard: u16,
    pub master: usize,
    pub replicas: Vec<Option<usize>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target<'a> {
    Key(&'a [u8]),
    Shard(u16),
}

/// An immutable topology version. Updates build a new map rather than
/// touching one that may still be referenced.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardMap {
    revision: u64,
    generation: u32,
    servers: Vec<SocketAddr>,
    num_replicas: usize,
    shards: Vec<Shard>,
    forward: Option<Vec<Shard>>,
    // number of shards each server holds, as master or replica
    owned: Vec<usize>,
}

impl ShardMap {
    pub fn new(
        revision: u64,
        servers: Vec<SocketAddr>,
        num_replicas: usize,
        shards: Vec<Shard>,
    ) -> Result<ShardMap> {
        if num_replicas > MAX_REPLICAS {
            return Err(RoutingError::InvalidMap(format!(
                "{} replicas, at most {} are supported",
                num_replicas, MAX_REPLICAS
            )));
        }
        check_shard_count(shards.len())?;
        for (id, shard) in shards.iter().enumerate() {
            check_shard(id, shard, servers.len(), num_replicas)?;
        }

        let mut map = ShardMap {
            revision,
            generation: 0,
            servers,
            num_replicas,
            shards,
            forward: None,
            owned: Vec::new(),
        };
        map.count_owned();
        Ok(map)
    }

    /// Attaches the fast-forward map a rebalance publishes ahead of time. It is
    /// consulted when a server rejects a shard it is still master of.
    pub fn with_forward(mut self, forward: Vec<Shard>) -> Result<ShardMap> {
        if forward.len() != self.shards.len() {
            return Err(RoutingError::InvalidMap(format!(
                "forward map has {} shards, map has {}",
                forward.len(),
                self.shards.len()
            )));
        }
        for (id, shard) in forward.iter().enumerate() {
            check_shard(id, shard, self.servers.len(), self.num_replicas)?;
        }
        self.forward = Some(forward);
        Ok(self)
    }

    /// Builds a uniform map: masters are assigned round robin and replica `j`
    /// of a shard lives `j` servers after its master.
    pub fn generate(servers: Vec<SocketAddr>, num_replicas: usize, num_shards: usize) -> Result<ShardMap> {
        if servers.is_empty() || num_replicas >= servers.len() {
            return Err(RoutingError::InvalidMap(format!(
                "{} servers cannot hold {} replicas",
                servers.len(),
                num_replicas
            )));
        }
        check_shard_count(num_shards)?;

        let nservers = servers.len();
        let shards = (0..num_shards)
            .map(|id| {
                let master = id % nservers;
                Shard {
                    master: Some(master),
                    replicas: (1..=num_replicas)
                        .map(|j| Some((master + j) % nservers))
                        .collect(),
                }
            })
            .collect();
        ShardMap::new(1, servers, num_replicas, shards)
    }

    fn count_owned(&mut self) {
        let mut owned = vec![0; self.servers.len()];
        for shard in self.shards.iter() {
            for ix in shard.servers() {
                owned[ix] += 1;
            }
        }
        self.owned = owned;
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Bumped every time a local remap derives a new map from this revision.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn servers(&self) -> &[SocketAddr] {
        &self.servers
    }

    pub fn server(&self, index: usize) -> Option<SocketAddr> {
        self.servers.get(index).cloned()
    }

    pub fn num_servers(&self) -> usize {
        self.servers.len()
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    pub fn num_replicas(&self) -> usize {
        self.num_replicas
    }

    pub fn shard(&self, id: u16) -> Option<&Shard> {
        self.shards.get(id as usize)
    }

    pub fn master(&self, id: u16) -> Option<usize> {
        self.shard(id).and_then(|shard| shard.master)
    }

    pub fn replica(&self, id: u16, ix: usize) -> Option<usize> {
        self.shard(id)
            .and_then(|shard| shard.replicas.get(ix).cloned())
            .and_then(|replica| replica)
    }

    /// Whether the server holds any shard at all.
    pub fn owns_shards(&self, index: usize) -> bool {
        self.owned.get(index).map_or(false, |count| *count > 0)
    }

    pub fn shard_of<H: KeyHasher + ?Sized>(&self, key: &[u8], hasher: &H) -> Result<u16> {
        if self.shards.is_empty() {
            return Err(RoutingError::EmptyTopology);
        }
        Ok((hasher.digest(key) as usize % self.shards.len()) as u16)
    }

    pub fn resolve<H: KeyHasher + ?Sized>(&self, target: Target, hasher: &H) -> Result<Resolution> {
        let id = match target {
            Target::Key(key) => self.shard_of(key, hasher)?,
            Target::Shard(id) => {
                if self.shards.is_empty() {
                    return Err(RoutingError::EmptyTopology);
                }
                id
            }
        };
        let shard = self
            .shard(id)
            .ok_or_else(|| RoutingError::ShardOutOfRange(id, self.shards.len()))?;
        let master = shard.master.ok_or(RoutingError::NoMatchingServer(id))?;
        Ok(Resolution {
            shard: id,
            master,
            replicas: shard.replicas.clone(),
        })
    }

    /// Reacts to `rejected` answering NOT_MY_VBUCKET for shard `id`.
    ///
    /// Returns `None` when the map already points elsewhere, or when no other
    /// server can take the shard. Otherwise returns a new map in which the
    /// shard has moved: to its fast-forward owner if one is known, else to the
    /// next server (round robin) that owns any shard.
    pub fn with_remapped_master(&self, id: u16, rejected: usize) -> Option<ShardMap> {
        let current = self.master(id)?;
        if current != rejected {
            return None;
        }

        let mut next = self.clone();
        next.generation += 1;
        let slot = id as usize;

        let mut master = current;
        if let Some(forward) = self.forward.as_ref() {
            next.shards[slot] = forward[slot].clone();
            master = forward[slot].master?;
        }

        if master == rejected {
            let nservers = self.servers.len();
            let mut candidate = master;
            let mut found = None;
            for _ in 0..nservers {
                candidate = (candidate + 1) % nservers;
                if self.owns_shards(candidate) {
                    found = Some(candidate);
                    break;
                }
            }
            master = found?;
            next.shards[slot].master = Some(master);
        }

        if master == rejected {
            return None;
        }
        next.count_owned();
        Some(next)
    }
}

fn check_shard(id: usize, shard: &Shard, nservers: usize, num_replicas: usize) -> Result<()> {
    if shard.replicas.len() != num_replicas {
        return Err(RoutingError::InvalidMap(format!(
            "shard {} lists {} replicas, expected {}",
            id,
            shard.replicas.len(),
            num_replicas
        )));
    }
    if let Some(ix) = shard.servers().find(|ix| *ix >= nservers) {
        return Err(RoutingError::InvalidMap(format!(
            "shard {} names server {} of {}",
            id, ix, nservers
        )));
    }
    Ok(())
}

fn check_shard_count(count: usize) -> Result<()> {
    if count > MAX_SHARDS {
        return Err(RoutingError::InvalidMap(format!(
            "{} shards, at most {} are supported",
            count, MAX_SHARDS
        )));
    }
    Ok(())
}
