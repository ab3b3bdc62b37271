quick_error! {
    #[derive(Debug, Clone, PartialEq)]
    pub enum RoutingError {
        NoTopology {
            display("No topology has been installed")
        }
        EmptyTopology {
            display("The installed topology has no shards")
        }
        ShardOutOfRange(shard: u16, nshards: usize) {
            display("Shard {} is out of range, topology has {} shards", shard, nshards)
        }
        NoMatchingServer(shard: u16) {
            display("Shard {} has no master server", shard)
        }
        InvalidMap(reason: String) {
            display("Invalid shard map: {}", reason)
        }
    }
}

pub type Result<T> = std::result::Result<T, RoutingError>;
