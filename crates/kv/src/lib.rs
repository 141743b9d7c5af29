//! Shared key-value store adapter.
//!
//! Every windrose replica coordinates through one external key-value +
//! pub/sub service. This crate provides the seam: the [`KvStore`] trait with
//! the operations the redirector actually uses, a Redis-backed
//! implementation for production, an in-memory implementation for tests, the
//! cluster-wide named lock, and the key/channel schema.

pub mod backends;
pub mod error;
pub mod keys;
pub mod lock;
pub mod traits;

pub use backends::memory::MemoryStore;
pub use backends::redis::RedisStore;
pub use error::{KvError, KvResult};
pub use lock::{ClusterLock, LockToken};
pub use traits::{KvEvent, KvStore, WriteOp};
