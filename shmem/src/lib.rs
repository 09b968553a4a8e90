pub mod channel;
pub mod core;
mod errors;
pub mod lifecycle;
pub mod pool;
pub mod reader;
pub mod segment;
pub mod store;
pub mod writer;

#[cfg(test)]
mod tests;

pub use crate::core::{ResourcePath, SegmentName, ShmemConfig, Status};
pub use errors::{Result, ShmemLibError};
pub use lifecycle::{Shutdown, WorkerPool};
pub use reader::{CacheProxy, ProxyConfig, ResponseSink};
pub use store::ContentStore;
pub use writer::{CacheConfig, CacheDaemon};

pub const MAX_PATH_LEN: usize = crate::core::MAX_PATH_LEN;
pub const MAX_SHMNAME_LEN: usize = crate::core::MAX_SHMNAME_LEN;
