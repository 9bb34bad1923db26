//! The LSM tree: key/value representation (§3), the merging iterator
//! (§4.A), the SSTable file format (§4.B), the in-memory level tree
//! (§4.C), and the etag-guarded metadata custodian that persists it
//! (§4.D).

pub mod holder;
pub mod iterator;
pub mod key;
pub mod manager;
pub mod sstable;

pub use holder::LsmHolder;
pub use iterator::{LsmIterator, MergingIterator, StaticIterator};
pub use key::{Entry, LsmKey, LsmValue};
pub use manager::{Addition, CompactionJob, LsmManager, MasterRecord, OverlappingTables, RegistrationBatch};
pub use sstable::{Codec, SsTableBuilder, SsTableIterator, SsTableReader};
