//! Per-component configuration.
//!
//! Each component gets its own `Conf` struct with a `Default` impl carrying
//! the documented defaults, mirroring `control.Conf` / `pusher.Conf`'s split
//! rather than one monolithic settings blob. Loading these from a file or
//! environment is left to the binary entry point (`main.rs`) — nothing here
//! parses TOML or env vars itself.

use std::time::Duration;

/// Configuration for the controller and LSM holder (component D/J).
#[derive(Debug, Clone)]
pub struct ControlConf {
    pub controller_metadata_bucket_name: String,
    pub controller_metadata_key: String,
    pub sstable_bucket_name: String,
    pub table_notification_interval: Duration,
    pub sequences_block_size: u64,
    pub lsm_state_write_interval: Duration,
    pub object_store_call_timeout: Duration,
    pub l0_max_tables: usize,
}

impl Default for ControlConf {
    fn default() -> Self {
        Self {
            controller_metadata_bucket_name: "controller-meta-data".to_string(),
            controller_metadata_key: "controller-meta-data".to_string(),
            sstable_bucket_name: "tektite-data".to_string(),
            table_notification_interval: Duration::from_secs(5),
            sequences_block_size: 100,
            lsm_state_write_interval: Duration::from_millis(10),
            object_store_call_timeout: Duration::from_secs(5),
            l0_max_tables: 4,
        }
    }
}

/// Configuration for the table pusher (component G).
#[derive(Debug, Clone)]
pub struct PusherConf {
    pub write_timeout: Duration,
    pub availability_retry_interval: Duration,
    pub buffer_max_size_bytes: usize,
    pub data_bucket_name: String,
    pub offset_snapshot_interval: Duration,
    pub compacted_topic_last_offset_snapshot_interval: Duration,
    /// Codec applied to tables the pusher flushes. Mirrors the original
    /// implementation's `TableCompressionType` pusher setting.
    pub table_compression: crate::lsm::sstable::Codec,
    pub table_block_size_target: usize,
}

impl Default for PusherConf {
    fn default() -> Self {
        Self {
            write_timeout: Duration::from_millis(200),
            availability_retry_interval: Duration::from_secs(1),
            buffer_max_size_bytes: 4 * 1024 * 1024,
            data_bucket_name: "tektite-data".to_string(),
            offset_snapshot_interval: Duration::from_secs(5),
            compacted_topic_last_offset_snapshot_interval: Duration::from_secs(5),
            table_compression: crate::lsm::sstable::Codec::None,
            table_block_size_target: 64 * 1024,
        }
    }
}

/// Configuration for the batch fetcher (component H).
#[derive(Debug, Clone)]
pub struct FetcherConf {
    pub max_fetch_wait: Duration,
    pub min_fetch_bytes: usize,
    pub max_fetch_bytes: usize,
}

impl Default for FetcherConf {
    fn default() -> Self {
        Self {
            max_fetch_wait: Duration::from_millis(500),
            min_fetch_bytes: 1,
            max_fetch_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Configuration for the fetch cache (component F).
#[derive(Debug, Clone)]
pub struct FetchCacheConf {
    pub max_size_bytes: u64,
    pub partition_hash_cache_capacity: usize,
}

impl Default for FetchCacheConf {
    fn default() -> Self {
        Self {
            max_size_bytes: 256 * 1024 * 1024,
            partition_hash_cache_capacity: 10_000,
        }
    }
}

/// Configuration for the object-store-mediated membership protocol
/// (component I groundwork).
#[derive(Debug, Clone)]
pub struct MembershipConf {
    pub membership_bucket_name: String,
    pub membership_update_interval: Duration,
    pub membership_eviction_interval: Duration,
}

impl Default for MembershipConf {
    fn default() -> Self {
        Self {
            membership_bucket_name: "controller-meta-data".to_string(),
            membership_update_interval: Duration::from_secs(5),
            membership_eviction_interval: Duration::from_secs(20),
        }
    }
}

/// Top-level configuration aggregating every component's `Conf`.
#[derive(Debug, Clone, Default)]
pub struct AgentConf {
    pub control: ControlConf,
    pub pusher: PusherConf,
    pub fetcher: FetcherConf,
    pub fetch_cache: FetchCacheConf,
    pub membership: MembershipConf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = ControlConf::default();
        assert_eq!(c.sequences_block_size, 100);
        assert_eq!(c.lsm_state_write_interval, Duration::from_millis(10));

        let p = PusherConf::default();
        assert_eq!(p.write_timeout, Duration::from_millis(200));
        assert_eq!(p.buffer_max_size_bytes, 4 * 1024 * 1024);
    }
}
