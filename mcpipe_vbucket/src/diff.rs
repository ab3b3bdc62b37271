use super::ShardMap;
use std::net::SocketAddr;

/// Differences between two topology versions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigDiff {
    pub servers_added: Vec<SocketAddr>,
    pub servers_removed: Vec<SocketAddr>,
    /// The server list was reordered or resized, so connection indices moved.
    pub sequence_changed: bool,
    /// Shards whose master changed, `None` when the shard counts differ.
    pub master_changes: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChangeType {
    pub map_modified: bool,
    pub servers_modified: bool,
}

impl ConfigDiff {
    pub fn between(from: &ShardMap, to: &ShardMap) -> ConfigDiff {
        let servers_added = missing_from(to.servers(), from.servers());
        let servers_removed = missing_from(from.servers(), to.servers());
        let sequence_changed = from.servers() != to.servers();

        let master_changes = if from.num_shards() == to.num_shards() {
            Some(
                (0..from.num_shards() as u16)
                    .filter(|id| from.master(*id) != to.master(*id))
                    .count(),
            )
        } else {
            None
        };

        ConfigDiff {
            servers_added,
            servers_removed,
            sequence_changed,
            master_changes,
        }
    }

    pub fn change_type(&self) -> ChangeType {
        ChangeType {
            map_modified: self.master_changes != Some(0),
            servers_modified: !self.servers_added.is_empty()
                || !self.servers_removed.is_empty()
                || self.sequence_changed,
        }
    }
}

fn missing_from(servers: &[SocketAddr], other: &[SocketAddr]) -> Vec<SocketAddr> {
    servers
        .iter()
        .filter(|server| !other.contains(server))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn servers(ports: &[u16]) -> Vec<SocketAddr> {
        ports
            .iter()
            .map(|port| SocketAddr::from(([127, 0, 0, 1], *port)))
            .collect()
    }

    #[test]
    fn identical_maps() {
        let map = ShardMap::generate(servers(&[1, 2]), 1, 8).unwrap();
        let diff = ConfigDiff::between(&map, &map.clone());
        assert_eq!(diff.master_changes, Some(0));
        assert_eq!(diff.change_type(), ChangeType::default());
    }

    #[test]
    fn server_added() {
        let from = ShardMap::generate(servers(&[1, 2]), 0, 4).unwrap();
        let to = ShardMap::generate(servers(&[1, 2, 3]), 0, 4).unwrap();
        let diff = ConfigDiff::between(&from, &to);
        assert_eq!(diff.servers_added, servers(&[3]));
        assert!(diff.servers_removed.is_empty());
        assert!(diff.sequence_changed);
        // masters 0,1,0,1 become 0,1,2,0
        assert_eq!(diff.master_changes, Some(2));
        assert_eq!(
            diff.change_type(),
            ChangeType {
                map_modified: true,
                servers_modified: true
            }
        );
    }

    #[test]
    fn shard_count_changed() {
        let from = ShardMap::generate(servers(&[1]), 0, 2).unwrap();
        let to = ShardMap::generate(servers(&[1]), 0, 4).unwrap();
        let diff = ConfigDiff::between(&from, &to);
        assert_eq!(diff.master_changes, None);
        assert!(diff.change_type().map_modified);
        assert!(!diff.change_type().servers_modified);
    }
}
