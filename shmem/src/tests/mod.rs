use std::fs;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::{tempdir, TempDir};

use crate::core::{ShmemConfig, Status};
use crate::lifecycle::Shutdown;
use crate::reader::{CacheProxy, ProxyConfig, ResponseSink};
use crate::store::ContentStore;
use crate::writer::{CacheConfig, CacheDaemon};


/// A POSIX name no other test, or concurrent test run, uses.
pub(crate) fn unique_name(tag: &str) -> String {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    format!(
        "/sc{}-{}{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::SeqCst),
        tag
    )
}

/// Deterministic, non-repeating-looking file content.
pub(crate) fn content(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

/// Front-end and back-end running in one process over fresh names.
pub(crate) struct Harness {
    pub proxy: Arc<CacheProxy>,
    proxy_cfg: ProxyConfig,
    daemon: Option<CacheDaemon>,
    shutdown: Shutdown,
    _dir: TempDir,
}

impl Harness {
    pub fn start(
        nsegments: usize,
        segment_size: usize,
        files: &[(&str, &[u8])],
        delay: Duration,
    ) -> Harness {
        let dir = tempdir().unwrap();
        let mut manifest = String::new();
        for (i, (key, body)) in files.iter().enumerate() {
            let path = dir.path().join(format!("f{}", i));
            fs::write(&path, body).unwrap();
            manifest.push_str(&format!("{} {}\n", key, path.display()));
        }
        let manifest_path = dir.path().join("locals.txt");
        fs::write(&manifest_path, manifest).unwrap();

        let shmem = ShmemConfig {
            channel_name: unique_name("q"),
            segment_prefix: format!("{}-", unique_name("s")),
        };
        let proxy_cfg = ProxyConfig {
            shmem: shmem.clone(),
            nthreads: 4,
            nsegments,
            segment_size,
            shutdown_grace_ms: 1000,
            ..Default::default()
        };
        let proxy = CacheProxy::new(&proxy_cfg).unwrap();
        let cache_cfg = CacheConfig {
            shmem,
            manifest: manifest_path.display().to_string(),
            nthreads: 4,
            delay_us: delay.as_micros() as u64,
            channel_backoff_ms: 10,
            shutdown_grace_ms: 1000,
        };
        let store = ContentStore::open(&manifest_path, delay).unwrap();
        let shutdown = Shutdown::new();
        let daemon = CacheDaemon::start(&cache_cfg, store, &shutdown).unwrap();
        Harness {
            proxy: Arc::new(proxy),
            proxy_cfg,
            daemon: Some(daemon),
            shutdown,
            _dir: dir,
        }
    }

    /// Replaces the front-end with a fresh one under the same names while the
    /// back-end keeps running.
    pub fn restart_proxy(&mut self) {
        self.proxy.close();
        self.proxy.teardown();
        self.proxy = Arc::new(CacheProxy::new(&self.proxy_cfg).unwrap());
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.trigger();
        if let Some(daemon) = self.daemon.take() {
            let stuck = daemon.join();
            if !std::thread::panicking() {
                assert_eq!(stuck, 0, "back-end workers did not stop");
            }
        }
        self.proxy.close();
        self.proxy.teardown();
    }
}

#[derive(Default)]
pub(crate) struct RecordingSink {
    pub header: Option<(Status, u64)>,
    pub body: Vec<u8>,
    pub chunks: usize,
    pub fail_body: bool,
    pub first: Option<Instant>,
    pub last: Option<Instant>,
}

impl RecordingSink {
    fn touch(&mut self) {
        let now = Instant::now();
        self.first.get_or_insert(now);
        self.last = Some(now);
    }
}

impl ResponseSink for RecordingSink {
    fn send_header(&mut self, status: Status, content_length: u64) -> io::Result<()> {
        assert!(self.header.is_none(), "header sent twice");
        self.touch();
        self.header = Some((status, content_length));
        Ok(())
    }

    fn send_body(&mut self, data: &[u8]) -> io::Result<usize> {
        self.touch();
        if self.fail_body {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "client went away"));
        }
        self.chunks += 1;
        self.body.extend_from_slice(data);
        Ok(data.len())
    }
}
