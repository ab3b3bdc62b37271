//! Key to shard to server routing.
//!
//! A [`ShardMap`] is one immutable topology version: a list of servers and,
//! for every shard, the index of its master and of its replicas. Keys are
//! hashed onto shards with a [`KeyHasher`]; the default is the vbucket CRC32.
//! A [`Router`] publishes the current map and swaps it atomically when the
//! cluster reports a new one, while older snapshots stay usable for whoever
//! still holds them.

#[macro_use]
extern crate quick_error;

mod diff;
mod error;
mod hash;
mod map;
mod router;

pub use diff::{ChangeType, ConfigDiff};
pub use error::{Result, RoutingError};
pub use hash::{Crc32Hasher, FnvKeyHasher, KeyHasher};
pub use map::{Resolution, Shard, ShardMap, Target, MAX_REPLICAS, MAX_SHARDS};
pub use router::Router;
