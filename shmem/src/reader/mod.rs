//! Front-end side: owns the segments and the request channel, and reads each
//! transfer off a segment into whatever the network layer provides.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use log::{debug, info, warn};
use serde_derive::{Deserialize, Serialize};

use crate::channel::{Request, RequestSender, REQUEST_WIRE_SIZE};
use crate::core::{segment_name, ResourcePath, ShmemConfig, Status};
use crate::errors::{Result, ShmemLibError};
use crate::pool::{SegmentPool, SegmentRegistry};
use crate::segment::{payload_capacity, ConsumerTurn, Segment};

pub const MAX_PORT: u16 = 50240;
pub const MAX_PROXY_THREADS: usize = 420;
/// A segment must at least be able to carry one request record.
pub const MIN_SEGMENT_SIZE: usize = REQUEST_WIRE_SIZE + 1;

/// Where a transfer's response goes. Implemented by the network framework.
pub trait ResponseSink {
    fn send_header(&mut self, status: Status, content_length: u64) -> io::Result<()>;

    /// Writes some prefix of `data`, returning how much.
    fn send_body(&mut self, data: &[u8]) -> io::Result<usize>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub shmem: ShmemConfig,
    pub port: u16,
    pub nthreads: usize,
    pub nsegments: usize,
    pub segment_size: usize,
    pub shutdown_grace_ms: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            shmem: ShmemConfig::default(),
            port: 10823,
            nthreads: 34,
            nsegments: 7,
            segment_size: 5701,
            shutdown_grace_ms: 3000,
        }
    }
}

impl ProxyConfig {
    pub fn validate(&self) -> Result<()> {
        self.shmem.validate()?;
        if self.port > MAX_PORT {
            return Err(ShmemLibError::Config(format!(
                "port must be at most {}, got {}",
                MAX_PORT, self.port
            )));
        }
        if self.nthreads < 1 || self.nthreads > MAX_PROXY_THREADS {
            return Err(ShmemLibError::Config(format!(
                "nthreads must be in 1..={}, got {}",
                MAX_PROXY_THREADS, self.nthreads
            )));
        }
        if self.nsegments < 1 {
            return Err(ShmemLibError::Config("nsegments must be at least 1".into()));
        }
        if self.segment_size < MIN_SEGMENT_SIZE || payload_capacity(self.segment_size).is_none() {
            return Err(ShmemLibError::Config(format!(
                "segment_size {} leaves no payload; use at least {} bytes",
                self.segment_size,
                MIN_SEGMENT_SIZE.max(crate::segment::header_size() + 1)
            )));
        }
        // The longest generated name must fit.
        segment_name(&self.shmem.segment_prefix, self.nsegments - 1)?;
        Ok(())
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Distinct per front-end instance, so the back-end never mistakes a
/// restarted front-end's segments for the mappings it already holds.
fn next_session() -> u64 {
    static INSTANCES: AtomicU64 = AtomicU64::new(0);
    u64::from(std::process::id()) << 32 | INSTANCES.fetch_add(1, Ordering::SeqCst)
}

/// Process-wide front-end state: the segment pool and the request channel.
pub struct CacheProxy {
    pool: SegmentPool,
    sender: RequestSender,
    session: u64,
}

impl CacheProxy {
    /// Creates every segment and the channel. Leftovers from a crashed run
    /// under the same names are replaced.
    pub fn new(cfg: &ProxyConfig) -> Result<CacheProxy> {
        cfg.validate()?;
        let registry =
            SegmentRegistry::create(&cfg.shmem.segment_prefix, cfg.nsegments, cfg.segment_size)?;
        let pool = SegmentPool::new(registry)?;
        let sender = RequestSender::create(&cfg.shmem.channel_name)?;
        let session = next_session();
        info!(
            "Cache proxy ready: {} segments x {} bytes, session {}",
            cfg.nsegments, cfg.segment_size, session
        );
        Ok(CacheProxy {
            pool,
            sender,
            session,
        })
    }

    pub fn pool(&self) -> &SegmentPool {
        &self.pool
    }

    /// Serves `path` into `sink` and returns the body bytes forwarded.
    ///
    /// Blocks while every segment is busy. On failure the segment is drained
    /// and returned; the client gets an ERROR header if nothing was sent yet,
    /// otherwise the response is left cut short.
    pub fn handle<S>(&self, sink: &mut S, path: &str) -> Result<u64>
    where
        S: ResponseSink + ?Sized,
    {
        let mut header_sent = false;
        let result = self.transfer(sink, path, &mut header_sent);
        if let Err(e) = &result {
            warn!("Request for {} failed: {}", path, e);
            if !header_sent {
                if let Err(e) = sink.send_header(Status::Error, 0) {
                    debug!("Could not report failure for {}: {}", path, e);
                }
            }
        }
        result
    }

    fn transfer<S>(&self, sink: &mut S, path: &str, header_sent: &mut bool) -> Result<u64>
    where
        S: ResponseSink + ?Sized,
    {
        let path = ResourcePath::new("path", path)?;
        let lease = self.pool.acquire()?.ok_or(ShmemLibError::Closed)?;
        let request = Request {
            path: path.clone(),
            segment_name: lease.name().clone(),
            segment_count: self.pool.capacity() as u64,
            segment_size: lease.size() as u64,
            session: self.session,
        };
        self.dispatch(&request)?;
        match consume(&lease, &path, sink, header_sent) {
            Ok(outcome) => outcome,
            Err(e) => {
                lease.retire();
                Err(e)
            }
        }
    }

    fn dispatch(&self, request: &Request) -> Result<()> {
        match self.sender.try_send(request) {
            Err(ShmemLibError::ChannelFull) => {
                debug!("Request channel full, waiting to send {}", request.path);
                self.sender.send(request)
            }
            other => other,
        }
    }

    /// Wakes every worker waiting for a segment. Transfers already running
    /// are not interrupted.
    pub fn close(&self) {
        self.pool.close();
    }

    /// Unlinks all segments and the channel. Safe to call more than once.
    pub fn teardown(&self) {
        self.pool.teardown();
        self.sender.unlink();
    }
}

/// Reads one transfer off `segment` into `sink`.
///
/// The outer error means the baton itself failed and the segment can no
/// longer be trusted. Otherwise the segment has been drained, reset and the
/// baton restored, and the inner result reports the transfer.
fn consume<S>(
    segment: &Segment,
    path: &ResourcePath,
    sink: &mut S,
    header_sent: &mut bool,
) -> Result<Result<u64>>
where
    S: ResponseSink + ?Sized,
{
    let turn = segment.consumer_turn()?;
    let (turn, outcome) = forward(turn, path, sink, header_sent)?;
    let turn = if turn.is_done() {
        turn
    } else {
        debug!("Cancelling transfer on {}", segment.name());
        turn.drain()?
    };
    turn.release()?;
    Ok(outcome)
}

fn forward<'a, S>(
    turn: ConsumerTurn<'a>,
    path: &ResourcePath,
    sink: &mut S,
    header_sent: &mut bool,
) -> Result<(ConsumerTurn<'a>, Result<u64>)>
where
    S: ResponseSink + ?Sized,
{
    match turn.path() {
        Ok(announced) if announced == *path => {}
        Ok(announced) => {
            let err = ShmemLibError::protocol(format!(
                "{} answered for {}, expected {}",
                turn.segment_name(),
                announced,
                path
            ));
            return Ok((turn, Err(err)));
        }
        Err(e) => return Ok((turn, Err(e))),
    }
    let status = match turn.status() {
        Ok(status) => status,
        Err(e) => return Ok((turn, Err(e))),
    };
    *header_sent = true;
    if status != Status::Ok {
        let sent = sink.send_header(status, 0).map(|()| 0).map_err(Into::into);
        return Ok((turn, sent));
    }

    let total = turn.total_length();
    if let Err(e) = sink.send_header(Status::Ok, total) {
        return Ok((turn, Err(e.into())));
    }
    let mut turn = turn;
    let mut received = 0u64;
    while !turn.is_done() {
        let chunk = match turn.chunk() {
            Ok(chunk) => chunk,
            Err(e) => return Ok((turn, Err(e))),
        };
        let len = chunk.len() as u64;
        if len == 0 || received + len > total {
            let err = ShmemLibError::protocol(format!(
                "chunk of {} bytes after {} of {}",
                len, received, total
            ));
            return Ok((turn, Err(err)));
        }
        if let Err(e) = send_all(sink, chunk) {
            return Ok((turn, Err(e.into())));
        }
        received += len;
        turn = turn.hand_off()?;
    }
    if received < total {
        return Ok((
            turn,
            Err(ShmemLibError::TransferIncomplete {
                received,
                expected: total,
            }),
        ));
    }
    Ok((turn, Ok(received)))
}

fn send_all<S>(sink: &mut S, mut data: &[u8]) -> io::Result<()>
where
    S: ResponseSink + ?Sized,
{
    while !data.is_empty() {
        match sink.send_body(data) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => data = &data[n..],
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::thread;

    use tempfile::tempdir;

    use super::*;
    use crate::core::SegmentName;
    use crate::segment::header_size;
    use crate::store::ContentStore;
    use crate::tests::{content, unique_name};
    use crate::writer::produce;

    struct Chunked {
        body: Vec<u8>,
        max: usize,
    }

    impl ResponseSink for Chunked {
        fn send_header(&mut self, _: Status, _: u64) -> io::Result<()> {
            Ok(())
        }

        fn send_body(&mut self, data: &[u8]) -> io::Result<usize> {
            let n = data.len().min(self.max);
            self.body.extend_from_slice(&data[..n]);
            Ok(n)
        }
    }

    #[test]
    fn send_all_retries_partial_writes() {
        let mut sink = Chunked {
            body: Vec::new(),
            max: 3,
        };
        send_all(&mut sink, b"0123456789").unwrap();
        assert_eq!(sink.body, b"0123456789");

        let mut stuck = Chunked {
            body: Vec::new(),
            max: 0,
        };
        assert_eq!(
            send_all(&mut stuck, b"x").unwrap_err().kind(),
            io::ErrorKind::WriteZero
        );
    }

    #[test]
    fn config_ranges() {
        assert!(ProxyConfig::default().validate().is_ok());
        let bad = [
            ProxyConfig {
                port: MAX_PORT + 1,
                ..Default::default()
            },
            ProxyConfig {
                nthreads: 0,
                ..Default::default()
            },
            ProxyConfig {
                nthreads: MAX_PROXY_THREADS + 1,
                ..Default::default()
            },
            ProxyConfig {
                nsegments: 0,
                ..Default::default()
            },
            ProxyConfig {
                segment_size: MIN_SEGMENT_SIZE - 1,
                ..Default::default()
            },
            ProxyConfig {
                segment_size: crate::segment::header_size(),
                ..Default::default()
            },
        ];
        for cfg in bad.iter() {
            assert!(cfg.validate().is_err(), "{:?} accepted", cfg);
        }
    }

    #[test]
    fn answer_for_another_path_is_rejected() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("other");
        fs::write(&file, content(200, 5)).unwrap();
        let manifest = dir.path().join("locals.txt");
        fs::write(&manifest, format!("/other {}\n", file.display())).unwrap();
        let store = ContentStore::open(&manifest, Duration::ZERO).unwrap();

        let size = header_size() + 32;
        let name = SegmentName::new("segment name", &unique_name("pm")).unwrap();
        let front = Segment::create(name.clone(), size).unwrap();
        let back = Segment::attach(&name, size).unwrap();
        let producer = thread::spawn(move || {
            let other = ResourcePath::new("path", "/other").unwrap();
            produce(&back, &other, &store).unwrap()
        });

        let mut sink = Chunked {
            body: Vec::new(),
            max: usize::MAX,
        };
        let mut header_sent = false;
        let wanted = ResourcePath::new("path", "/wanted").unwrap();
        let outcome = consume(&front, &wanted, &mut sink, &mut header_sent).unwrap();
        assert!(matches!(outcome, Err(ShmemLibError::Protocol(_))));
        assert!(!header_sent);
        assert!(sink.body.is_empty());
        // The producer was cancelled after its first chunk.
        assert_eq!(producer.join().unwrap(), 32);
        assert!(front.is_clean());
        front.unlink().unwrap();
    }
}
