//! ShmStructs - shared-memory data structures for multi-process use
//!
//! This library provides typed containers whose backing storage is a named,
//! growable shared-memory segment that several processes can attach to,
//! mutate, and observe concurrently.
//!
//! # Architecture
//!
//! - **Pool**: a named file- or shm-backed mapping that grows on demand;
//!   attached processes remap lazily when another process has expanded it
//! - **Allocator**: an offset-based sub-allocator layered inside the pool,
//!   so links stay valid at whatever address each process maps the segment
//! - **PrefixTree**: a radix trie of byte-string keys to tagged values
//!   (null, bool, int, double, string), built on the allocator
//!
//! # Concurrency
//!
//! The structures follow a Single Writer Multiple Readers discipline:
//! readers in other processes run lock-free against acquire/release
//! published words, while writer coordination is left to the caller (the
//! pool header reserves space for a shared lock).

pub mod allocator;
pub mod error;
pub mod pool;
pub mod prefix_tree;

pub use allocator::{Allocator, SimpleAllocator};
pub use error::{Error, Result};
pub use pool::{Backing, Pool, PoolOptions, POOL_HEADER_SIZE};
pub use prefix_tree::{PrefixTree, Value, ValueType};
