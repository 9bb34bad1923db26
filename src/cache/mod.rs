//! Caching layer: deterministic partition-hash prefixes (§4.E) and the
//! distributed, rendezvous-hashed SSTable byte cache (§4.F).

pub mod fetch_cache;
pub mod partition_hash;

pub use fetch_cache::{rendezvous_owner, FetchCache, FetchCacheConf, RemoteTableFetch};
pub use partition_hash::PartitionHashCache;
