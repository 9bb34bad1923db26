//! Kafka-wire-compatible event streaming engine whose durability substrate
//! is an object store rather than replicated local disks. The crate is
//! organized bottom-up: [`lsm`] is the tree itself (iterator, SSTable
//! format, in-memory level manager, and the etag-guarded holder that
//! persists it), [`objectstore`] and [`networking`] are the two external
//! seams the tree is built on, [`cache`] amortizes partition hashing and
//! remote table reads, and [`pusher`]/[`fetcher`]/[`controller`] compose
//! those into the write and read paths a Kafka dispatcher would sit in
//! front of. [`agent`] is the composition root.

pub mod agent;
pub mod cache;
pub mod common;
pub mod config;
pub mod controller;
pub mod error;
pub mod fetcher;
pub mod kafka_protocol;
pub mod lsm;
pub mod networking;
pub mod objectstore;
pub mod pusher;
pub mod storage;

pub use error::{Result, TektiteError};
