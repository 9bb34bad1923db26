//! Low-level storage helpers shared by the LSM layer.
//!
//! The only thing left here after the object-store rewrite is the
//! hardware-accelerated checksum used to validate SSTable blocks
//! (`lsm::sstable` is the actual file format now).

pub mod checksum;

pub use checksum::hardware_crc32c;
