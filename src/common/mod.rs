//! Shared types used across every component: node identifiers, the platform
//! guard run at startup (`common.Is64BitArch()`), and the bounded LRU map
//! used by the partition-hash cache.

use std::time::Duration;

/// Identifier for a cluster member (a listen address works just as well;
/// this stays an opaque string so transport and membership don't need to
/// agree on a richer type).
pub type NodeId = String;

/// A table identifier — a content- or time-derived byte string, stable and
/// globally unique (§3 "SSTable").
pub type TableId = String;

/// Monotonically increasing sequence number guarding the LSM master record.
pub type LsmSequence = u64;

/// Monotonically increasing cluster membership version (§3 "Cluster
/// membership state").
pub type ClusterVersion = u64;

pub mod bounded_map;
pub use bounded_map::BoundedHashMap;

/// Fail fast if running on a platform where `usize` isn't 8 bytes wide —
/// several of the on-object encodings assume a 64-bit address space,
/// mirroring the startup guard in `common.Is64BitArch()` (`agent.go`).
pub fn require_64_bit() -> crate::error::Result<()> {
    if std::mem::size_of::<usize>() != 8 {
        return Err(crate::error::TektiteError::fatal(
            "tektite requires a 64-bit platform",
        ));
    }
    Ok(())
}

/// Default deadline applied to object-store calls absent a more specific
/// configured timeout (§5, mirrors `objectStoreCallTimeout` in the original
/// implementation's LSM holder).
pub const DEFAULT_OBJECT_STORE_CALL_TIMEOUT: Duration = Duration::from_secs(5);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_guard_passes_on_64_bit_test_host() {
        assert!(require_64_bit().is_ok());
    }
}
