use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{info, warn};
use nix::errno::Errno;
use nix::mqueue::{
    mq_close, mq_open, mq_send, mq_timedreceive, mq_unlink, MQ_OFlag, MqAttr, MqdT,
};
use nix::sys::stat::{fstat, Mode};
use nix::sys::time::TimeSpec;
use nix::time::{clock_gettime, ClockId};

use crate::core::{ResourcePath, SegmentName, MAX_MSG_NUM, MAX_MSG_SIZE, MAX_PATH_LEN, MAX_SHMNAME_LEN};
use crate::errors::{Result, ShmemLibError};
use crate::lifecycle::Shutdown;

const PATH_OFFSET: usize = 0;
const NAME_OFFSET: usize = PATH_OFFSET + MAX_PATH_LEN;
const COUNT_OFFSET: usize = NAME_OFFSET + MAX_SHMNAME_LEN;
const SIZE_OFFSET: usize = COUNT_OFFSET + 8;
const SESSION_OFFSET: usize = SIZE_OFFSET + 8;
pub const REQUEST_WIRE_SIZE: usize = SESSION_OFFSET + 8;

const _: () = assert!(REQUEST_WIRE_SIZE <= MAX_MSG_SIZE);

/// One dispatch from a front-end worker to the back-end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub path: ResourcePath,
    pub segment_name: SegmentName,
    pub segment_count: u64,
    pub segment_size: u64,
    /// Identifies the front-end run that created the segment.
    pub session: u64,
}

#[inline]
fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

impl Request {
    pub fn encode(&self) -> [u8; REQUEST_WIRE_SIZE] {
        let mut buf = [0u8; REQUEST_WIRE_SIZE];
        self.path.write_to(&mut buf[PATH_OFFSET..NAME_OFFSET]);
        self.segment_name.write_to(&mut buf[NAME_OFFSET..COUNT_OFFSET]);
        buf[COUNT_OFFSET..SIZE_OFFSET].copy_from_slice(&self.segment_count.to_le_bytes());
        buf[SIZE_OFFSET..SESSION_OFFSET].copy_from_slice(&self.segment_size.to_le_bytes());
        buf[SESSION_OFFSET..].copy_from_slice(&self.session.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Request> {
        if buf.len() != REQUEST_WIRE_SIZE {
            return Err(ShmemLibError::protocol(format!(
                "request of {} bytes, expected {}",
                buf.len(),
                REQUEST_WIRE_SIZE
            )));
        }
        Ok(Request {
            path: ResourcePath::read_from("path", &buf[PATH_OFFSET..NAME_OFFSET])?,
            segment_name: SegmentName::read_from("segment name", &buf[NAME_OFFSET..COUNT_OFFSET])?,
            segment_count: read_u64(buf, COUNT_OFFSET),
            segment_size: read_u64(buf, SIZE_OFFSET),
            session: read_u64(buf, SESSION_OFFSET),
        })
    }
}

/// Device and inode of the queue behind a descriptor.
fn queue_identity(mqd: &MqdT) -> Result<(u64, u64)> {
    let stat = fstat(mqd.as_raw_fd())?;
    Ok((stat.st_dev as u64, stat.st_ino as u64))
}

fn close_queue(mqd: Option<MqdT>) {
    if let Some(mqd) = mqd {
        if let Err(e) = mq_close(mqd) {
            warn!("mq_close failed: {}", e);
        }
    }
}

/// Front-end end of the channel. Creates the queue and unlinks it once.
pub struct RequestSender {
    name: String,
    blocking: Option<MqdT>,
    nonblocking: Option<MqdT>,
    unlinked: AtomicBool,
}

impl RequestSender {
    /// Creates a fresh queue of `MAX_MSG_NUM` messages of `MAX_MSG_SIZE`
    /// bytes, replacing any queue a previous run left behind.
    pub fn create(name: &str) -> Result<RequestSender> {
        match mq_unlink(name) {
            Ok(()) => warn!("Removed stale message queue {}", name),
            Err(Errno::ENOENT) => {}
            Err(e) => return Err(e.into()),
        }
        let attr = MqAttr::new(0, MAX_MSG_NUM as _, MAX_MSG_SIZE as _, 0);
        let mode = Mode::from_bits_truncate(0o660);
        let blocking = mq_open(
            name,
            MQ_OFlag::O_CREAT | MQ_OFlag::O_EXCL | MQ_OFlag::O_WRONLY,
            mode,
            Some(&attr),
        )?;
        let nonblocking = match mq_open(name, MQ_OFlag::O_WRONLY | MQ_OFlag::O_NONBLOCK, mode, None) {
            Ok(mqd) => mqd,
            Err(e) => {
                close_queue(Some(blocking));
                let _ = mq_unlink(name);
                return Err(e.into());
            }
        };
        info!("Created message queue {} ({} x {} bytes)", name, MAX_MSG_NUM, MAX_MSG_SIZE);
        Ok(RequestSender {
            name: name.to_string(),
            blocking: Some(blocking),
            nonblocking: Some(nonblocking),
            unlinked: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sends without blocking; `ChannelFull` when the queue is at capacity.
    pub fn try_send(&self, request: &Request) -> Result<()> {
        let mqd = self.nonblocking.as_ref().ok_or(ShmemLibError::Closed)?;
        match mq_send(mqd, &request.encode(), 0) {
            Ok(()) => Ok(()),
            Err(Errno::EAGAIN) => Err(ShmemLibError::ChannelFull),
            Err(e) => Err(e.into()),
        }
    }

    /// Sends, blocking while the queue is full.
    pub fn send(&self, request: &Request) -> Result<()> {
        let mqd = self.blocking.as_ref().ok_or(ShmemLibError::Closed)?;
        let message = request.encode();
        loop {
            match mq_send(mqd, &message, 0) {
                Err(Errno::EINTR) => continue,
                other => return other.map_err(Into::into),
            }
        }
    }

    /// Removes the queue name. Returns false if already unlinked.
    pub fn unlink(&self) -> bool {
        if self.unlinked.swap(true, Ordering::SeqCst) {
            return false;
        }
        match mq_unlink(self.name.as_str()) {
            Ok(()) | Err(Errno::ENOENT) => info!("Unlinked message queue {}", self.name),
            Err(e) => warn!("Failed to unlink message queue {}: {}", self.name, e),
        }
        true
    }
}

impl Drop for RequestSender {
    fn drop(&mut self) {
        close_queue(self.blocking.take());
        close_queue(self.nonblocking.take());
        self.unlink();
    }
}

/// Back-end end of the channel. Never creates or unlinks the queue.
pub struct RequestReceiver {
    name: String,
    mqd: Option<MqdT>,
}

impl RequestReceiver {
    pub fn open(name: &str) -> Result<RequestReceiver> {
        let mqd = mq_open(name, MQ_OFlag::O_RDONLY, Mode::empty(), None)?;
        Ok(RequestReceiver {
            name: name.to_string(),
            mqd: Some(mqd),
        })
    }

    /// Polls with a fixed `backoff` until the front-end has created the
    /// queue. `None` if shutdown was triggered first.
    pub fn open_with_retry(
        name: &str,
        backoff: Duration,
        shutdown: &Shutdown,
    ) -> Result<Option<RequestReceiver>> {
        loop {
            match RequestReceiver::open(name) {
                Ok(receiver) => {
                    info!("Opened message queue {}", name);
                    return Ok(Some(receiver));
                }
                Err(ShmemLibError::Channel(Errno::ENOENT)) => {
                    info!("Waiting for message queue {}", name);
                }
                Err(e) => return Err(e),
            }
            if shutdown.wait_timeout(backoff) {
                return Ok(None);
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn mqd(&self) -> Result<&MqdT> {
        self.mqd.as_ref().ok_or(ShmemLibError::Closed)
    }

    /// True once the name no longer refers to the queue this receiver holds:
    /// the front-end unlinked it, and may have created a new one since.
    pub fn is_stale(&self) -> Result<bool> {
        let current = match mq_open(self.name.as_str(), MQ_OFlag::O_RDONLY, Mode::empty(), None) {
            Ok(mqd) => mqd,
            Err(Errno::ENOENT) => return Ok(true),
            Err(e) => return Err(e.into()),
        };
        let named = queue_identity(&current);
        close_queue(Some(current));
        Ok(named? != queue_identity(self.mqd()?)?)
    }

    /// Waits up to `timeout` for a request.
    pub fn receive_timeout(&self, timeout: Duration) -> Result<Option<Request>> {
        let mut buf = [0u8; MAX_MSG_SIZE];
        let mut priority = 0u32;
        let deadline = clock_gettime(ClockId::CLOCK_REALTIME)? + TimeSpec::from_duration(timeout);
        loop {
            match mq_timedreceive(self.mqd()?, &mut buf, &mut priority, &deadline) {
                Ok(len) => return Request::decode(&buf[..len]).map(Some),
                Err(Errno::ETIMEDOUT) => return Ok(None),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Drop for RequestReceiver {
    fn drop(&mut self) {
        close_queue(self.mqd.take());
    }
}
