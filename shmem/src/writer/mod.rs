//! Back-end side: the intake loop that drains the request channel, the
//! workers that resolve paths against the [`ContentStore`], and the producer
//! half of the baton that streams file bytes into the front-end's segments.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info, warn};
use serde_derive::{Deserialize, Serialize};

use crate::channel::{Request, RequestReceiver};
use crate::core::{ResourcePath, SegmentName, ShmemConfig, Status};
use crate::errors::{Result, ShmemLibError};
use crate::lifecycle::{Shutdown, WorkerPool};
use crate::pool::BlockingQueue;
use crate::segment::Segment;
use crate::store::{ContentStore, MAX_LOOKUP_DELAY};

pub const MAX_CACHE_THREADS: usize = 235_711;

/// How long one timed receive blocks before the intake loop re-checks
/// shutdown.
const INTAKE_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub shmem: ShmemConfig,
    pub manifest: String,
    pub nthreads: usize,
    pub delay_us: u64,
    pub channel_backoff_ms: u64,
    pub shutdown_grace_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            shmem: ShmemConfig::default(),
            manifest: "locals.txt".to_string(),
            nthreads: 7,
            delay_us: 0,
            channel_backoff_ms: 1000,
            shutdown_grace_ms: 3000,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<()> {
        self.shmem.validate()?;
        if self.nthreads < 1 || self.nthreads > MAX_CACHE_THREADS {
            return Err(ShmemLibError::Config(format!(
                "nthreads must be in 1..={}, got {}",
                MAX_CACHE_THREADS, self.nthreads
            )));
        }
        if self.delay() > MAX_LOOKUP_DELAY {
            return Err(ShmemLibError::Config(format!(
                "delay_us must be at most {}, got {}",
                MAX_LOOKUP_DELAY.as_micros(),
                self.delay_us
            )));
        }
        if self.channel_backoff_ms == 0 {
            return Err(ShmemLibError::Config("channel_backoff_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn delay(&self) -> Duration {
        Duration::from_micros(self.delay_us)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Streams one request into `segment`.
///
/// Waits for write permission, announces the lookup result, then stages the
/// file one payload-sized chunk per turn until every byte was handed over or
/// the consumer cancelled. Always ends with [`ProducerTurn::finish`] so the
/// consumer is never left waiting. Returns the bytes handed over.
///
/// [`ProducerTurn::finish`]: crate::segment::ProducerTurn::finish
pub fn produce(segment: &Segment, path: &ResourcePath, store: &ContentStore) -> Result<u64> {
    let looked_up = store.lookup(path.as_str());
    let mut turn = segment.producer_turn()?;
    let hit = match looked_up {
        Ok(Some(hit)) => hit,
        Ok(None) => {
            turn.announce(path, Status::NotFound, 0);
            turn.finish()?;
            return Ok(0);
        }
        Err(e) => {
            turn.announce(path, Status::Error, 0);
            turn.finish()?;
            return Err(e);
        }
    };

    let total = hit.len;
    let capacity = segment.capacity() as u64;
    turn.announce(path, Status::Ok, total);
    let mut sent = 0u64;
    while sent < total {
        if turn.is_cancelled() {
            debug!("{} cancelled after {} of {} bytes", path, sent, total);
            break;
        }
        let want = capacity.min(total - sent) as usize;
        let read = hit.read_at(&mut turn.payload_mut()[..want], sent);
        let n = match read {
            Ok(0) => {
                warn!("{} shrank to {} bytes while streaming", hit.path.display(), sent);
                break;
            }
            Ok(n) => n,
            Err(e) => {
                turn.finish()?;
                return Err(e.into());
            }
        };
        turn.stage(n)?;
        sent += n as u64;
        turn = turn.hand_off()?;
    }
    turn.finish()?;
    Ok(sent)
}

struct Attachment {
    session: u64,
    size: usize,
    segment: Arc<Segment>,
}

/// Segments the back-end has mapped, keyed by name.
///
/// An entry stamped with another session or size is a mapping of a segment
/// a previous front-end run created; it is dropped and the name attached
/// again.
#[derive(Default)]
pub struct AttachmentCache {
    entries: Mutex<HashMap<SegmentName, Attachment>>,
}

impl AttachmentCache {
    pub fn new() -> AttachmentCache {
        AttachmentCache::default()
    }

    pub fn get(&self, request: &Request) -> Result<Arc<Segment>> {
        let size = usize::try_from(request.segment_size).map_err(|_| {
            ShmemLibError::protocol(format!("segment size {} out of range", request.segment_size))
        })?;
        let mut entries = self.entries.lock()?;
        if let Some(found) = entries.get(&request.segment_name) {
            if found.session == request.session && found.size == size {
                return Ok(Arc::clone(&found.segment));
            }
            info!(
                "Segment {} belongs to session {}, re-attaching for session {}",
                request.segment_name, found.session, request.session
            );
        }
        let segment = Arc::new(Segment::attach(&request.segment_name, size)?);
        debug!(
            "Attached segment {} ({} bytes, {} in session {})",
            request.segment_name, size, request.segment_count, request.session
        );
        entries.insert(
            request.segment_name.clone(),
            Attachment {
                session: request.session,
                size,
                segment: Arc::clone(&segment),
            },
        );
        Ok(segment)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct Backend {
    store: ContentStore,
    attachments: AttachmentCache,
    intake: BlockingQueue<Request>,
}

impl Backend {
    /// Feeds the intake queue until shutdown. A front-end restart replaces
    /// the channel under the same name; the loop then reopens it.
    fn run_intake(&self, channel_name: &str, backoff: Duration, shutdown: &Shutdown) {
        while !shutdown.is_triggered() {
            let receiver = match RequestReceiver::open_with_retry(channel_name, backoff, shutdown) {
                Ok(Some(receiver)) => receiver,
                Ok(None) => break,
                Err(e) => {
                    error!("Cannot open message queue {}: {}", channel_name, e);
                    shutdown.trigger();
                    break;
                }
            };
            self.listen(&receiver, shutdown);
        }
        self.intake.close();
    }

    /// Returns on shutdown or once `receiver` no longer holds the named queue.
    fn listen(&self, receiver: &RequestReceiver, shutdown: &Shutdown) {
        while !shutdown.is_triggered() {
            match receiver.receive_timeout(INTAKE_SLICE) {
                Ok(Some(request)) => {
                    if let Err(e) = self.intake.push(request) {
                        error!("Dropping request: {}", e);
                    }
                }
                Ok(None) => match receiver.is_stale() {
                    Ok(false) => {}
                    Ok(true) => {
                        info!("Message queue {} was removed, reopening", receiver.name());
                        return;
                    }
                    Err(e) => warn!("Cannot check message queue {}: {}", receiver.name(), e),
                },
                Err(ShmemLibError::Protocol(msg)) => warn!("Discarding malformed request: {}", msg),
                Err(e) => {
                    error!("Message queue {} failed: {}", receiver.name(), e);
                    shutdown.trigger();
                }
            }
        }
    }

    fn run_worker(&self, shutdown: &Shutdown) {
        while !shutdown.is_triggered() {
            match self.intake.pop() {
                Ok(Some(request)) => self.serve(request),
                Ok(None) => break,
                Err(e) => {
                    error!("Intake queue failed: {}", e);
                    break;
                }
            }
        }
    }

    fn serve(&self, request: Request) {
        let segment = match self.attachments.get(&request) {
            Ok(segment) => segment,
            Err(e) => {
                error!(
                    "Cannot attach {} for {}: {}; the front-end worker waiting on it stays blocked and the segment is lost until it restarts",
                    request.segment_name, request.path, e
                );
                return;
            }
        };
        match produce(&segment, &request.path, &self.store) {
            Ok(n) => debug!("Served {} ({} bytes) via {}", request.path, n, request.segment_name),
            Err(e) => error!("Failed to serve {} via {}: {}", request.path, request.segment_name, e),
        }
    }
}

/// The running back-end: one intake thread feeding `nthreads` workers.
pub struct CacheDaemon {
    backend: Arc<Backend>,
    intake: WorkerPool,
    workers: WorkerPool,
    grace: Duration,
}

impl CacheDaemon {
    pub fn start(cfg: &CacheConfig, store: ContentStore, shutdown: &Shutdown) -> Result<CacheDaemon> {
        cfg.validate()?;
        let backend = Arc::new(Backend {
            store,
            attachments: AttachmentCache::new(),
            intake: BlockingQueue::new(),
        });
        {
            let backend = Arc::clone(&backend);
            shutdown.on_trigger(move || backend.intake.close());
        }
        let workers = {
            let backend = Arc::clone(&backend);
            let shutdown = shutdown.clone();
            WorkerPool::spawn("cache", cfg.nthreads, move |_| backend.run_worker(&shutdown))?
        };
        let intake = {
            let backend = Arc::clone(&backend);
            let shutdown = shutdown.clone();
            let channel_name = cfg.shmem.channel_name.clone();
            let backoff = Duration::from_millis(cfg.channel_backoff_ms);
            WorkerPool::spawn("intake", 1, move |_| {
                backend.run_intake(&channel_name, backoff, &shutdown)
            })?
        };
        Ok(CacheDaemon {
            backend,
            intake,
            workers,
            grace: cfg.shutdown_grace(),
        })
    }

    /// Waits out the shutdown grace period. Returns the number of threads
    /// still stuck, typically on a baton the front-end abandoned.
    pub fn join(self) -> usize {
        self.backend.intake.close();
        self.intake.join_with_grace(self.grace) + self.workers.join_with_grace(self.grace)
    }
}
