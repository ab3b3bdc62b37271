use super::{Crc32Hasher, KeyHasher, Resolution, Result, RoutingError, ShardMap, Target};
use crossbeam::sync::ShardedLock;
use std::sync::Arc;

/// Resolves keys against the current topology snapshot.
///
/// The snapshot is swapped wholesale; a caller holding an `Arc<ShardMap>` from
/// `snapshot()` or `update()` keeps resolving against that version.
pub struct Router<H: KeyHasher = Crc32Hasher> {
    current: ShardedLock<Option<Arc<ShardMap>>>,
    hasher: H,
}

impl Default for Router<Crc32Hasher> {
    fn default() -> Router<Crc32Hasher> {
        Router::with_hasher(Crc32Hasher)
    }
}

impl<H: KeyHasher> Router<H> {
    pub fn with_hasher(hasher: H) -> Router<H> {
        Router {
            current: ShardedLock::new(None),
            hasher,
        }
    }

    pub fn hasher(&self) -> &H {
        &self.hasher
    }

    pub fn snapshot(&self) -> Option<Arc<ShardMap>> {
        let current = self.current.read().unwrap_or_else(|poison| poison.into_inner());
        current.clone()
    }

    pub fn resolve(&self, target: Target) -> Result<Resolution> {
        let map = self.snapshot().ok_or(RoutingError::NoTopology)?;
        map.resolve(target, &self.hasher)
    }

    /// Installs `map` and returns the version it replaced.
    pub fn update(&self, map: Arc<ShardMap>) -> Option<Arc<ShardMap>> {
        let mut current = self.current.write().unwrap_or_else(|poison| poison.into_inner());
        log::debug!(
            "Installing topology revision {} ({} servers, {} shards)",
            map.revision(),
            map.num_servers(),
            map.num_shards()
        );
        current.replace(map)
    }

    pub fn clear(&self) -> Option<Arc<ShardMap>> {
        let mut current = self.current.write().unwrap_or_else(|poison| poison.into_inner());
        current.take()
    }

    /// Applies the NOT_MY_VBUCKET heuristic to the current snapshot, installing
    /// the derived map when it moves the shard. Returns the master the shard
    /// should be sent to next, if any server other than `rejected` qualifies.
    pub fn remap_master(&self, shard: u16, rejected: usize) -> Option<usize> {
        let mut current = self.current.write().unwrap_or_else(|poison| poison.into_inner());
        let map = current.as_ref()?;
        match map.with_remapped_master(shard, rejected) {
            Some(next) => {
                let master = next.master(shard);
                log::debug!(
                    "Shard {} moved from server {} to {:?} (revision {}.{})",
                    shard,
                    rejected,
                    master,
                    next.revision(),
                    next.generation()
                );
                *current = Some(Arc::new(next));
                master
            }
            None => map.master(shard).filter(|master| *master != rejected),
        }
    }
}
