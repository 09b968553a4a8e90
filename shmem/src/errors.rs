use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShmemLibError {
    #[error("Shared memory error: {0}")]
    SharedMemory(#[from] shared_memory::ShmemError),
    // raw_sync reports failures as a non-Send Box<dyn Error>; only its message is kept.
    #[error("Lock error: {0}")]
    Lock(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Message queue error: {0}")]
    Channel(#[from] nix::Error),
    #[error("Message queue is full")]
    ChannelFull,
    #[error("Signal handling error: {0}")]
    SignalHook(io::Error),
    #[error("{field} exceeds {max} bytes: {len} bytes given")]
    TooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Transfer incomplete: {received} of {expected} bytes")]
    TransferIncomplete { received: u64, expected: u64 },
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Mutex was poisoned")]
    PoisonedLock,
    #[error("Shutting down")]
    Closed,
}

impl ShmemLibError {
    pub(crate) fn lock(err: Box<dyn std::error::Error>) -> Self {
        ShmemLibError::Lock(err.to_string())
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        ShmemLibError::Protocol(msg.into())
    }
}

impl<T> From<std::sync::PoisonError<T>> for ShmemLibError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        ShmemLibError::PoisonedLock
    }
}

pub type Result<T> = std::result::Result<T, ShmemLibError>;
