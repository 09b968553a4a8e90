//! A small GETFILE server: one acceptor thread feeding a connection queue,
//! drained by a fixed pool of workers that hand each request to the proxy.
//!
//! Request: `GETFILE GET <path>\r\n\r\n`. Responses:
//! `GETFILE OK <len>\r\n\r\n<body>`, `GETFILE FILE_NOT_FOUND\r\n\r\n`,
//! `GETFILE ERROR\r\n\r\n`, `GETFILE INVALID\r\n\r\n`.

use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;

use log::{debug, info, warn};
use shmem::lifecycle::{Shutdown, WorkerPool};
use shmem::pool::BlockingQueue;
use shmem::{CacheProxy, ResponseSink, Status};

pub const MAX_REQUEST_HEADER: usize = 1024;

const SCHEME: &str = "GETFILE";
const TERMINATOR: &[u8] = b"\r\n\r\n";

/// Path of a well-formed `GETFILE GET` header, without the terminator.
pub fn parse_request(header: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(header).ok()?;
    let mut parts = text.split(' ');
    if parts.next()? != SCHEME || parts.next()? != "GET" {
        return None;
    }
    let path = parts.next()?;
    if parts.next().is_some() || !path.starts_with('/') || path.contains(char::is_whitespace) {
        return None;
    }
    Some(path.to_string())
}

/// Reads up to the blank line ending the header. `None` for a malformed,
/// oversized or truncated header.
pub fn read_request<R: Read>(stream: &mut R) -> io::Result<Option<String>> {
    let mut buf = [0u8; MAX_REQUEST_HEADER];
    let mut len = 0;
    loop {
        if let Some(end) = buf[..len].windows(TERMINATOR.len()).position(|w| w == TERMINATOR) {
            return Ok(parse_request(&buf[..end]));
        }
        if len == buf.len() {
            return Ok(None);
        }
        match stream.read(&mut buf[len..]) {
            Ok(0) => return Ok(None),
            Ok(n) => len += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// The response side of one connection.
pub struct GfContext<W: Write> {
    out: W,
}

impl<W: Write> GfContext<W> {
    pub fn new(out: W) -> Self {
        GfContext { out }
    }

    pub fn send_invalid(&mut self) -> io::Result<()> {
        write!(self.out, "{} INVALID\r\n\r\n", SCHEME)
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> ResponseSink for GfContext<W> {
    fn send_header(&mut self, status: Status, content_length: u64) -> io::Result<()> {
        match status {
            Status::Ok => write!(self.out, "{} OK {}\r\n\r\n", SCHEME, content_length),
            Status::NotFound => write!(self.out, "{} FILE_NOT_FOUND\r\n\r\n", SCHEME),
            Status::Error => write!(self.out, "{} ERROR\r\n\r\n", SCHEME),
        }
    }

    fn send_body(&mut self, data: &[u8]) -> io::Result<usize> {
        self.out.write(data)
    }
}

fn handle_connection(proxy: &CacheProxy, mut stream: TcpStream) {
    let path = match read_request(&mut stream) {
        Ok(Some(path)) => path,
        Ok(None) => {
            if let Err(e) = GfContext::new(&mut stream).send_invalid() {
                debug!("Could not reject request: {}", e);
            }
            return;
        }
        Err(e) => {
            debug!("Could not read request: {}", e);
            return;
        }
    };
    let mut ctx = GfContext::new(&mut stream);
    if let Ok(n) = proxy.handle(&mut ctx, &path) {
        debug!("Sent {} ({} bytes)", path, n);
    }
}

pub struct GfServer {
    listener: TcpListener,
    port: u16,
    connections: Arc<BlockingQueue<TcpStream>>,
}

impl GfServer {
    pub fn bind(port: u16) -> io::Result<GfServer> {
        let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))?;
        let port = listener.local_addr()?.port();
        info!("Listening on port {}", port);
        Ok(GfServer {
            listener,
            port,
            connections: Arc::new(BlockingQueue::new()),
        })
    }

    /// Starts the workers and arranges for shutdown to close the connection
    /// queue and wake the acceptor.
    pub fn start(
        &self,
        proxy: &Arc<CacheProxy>,
        nthreads: usize,
        shutdown: &Shutdown,
    ) -> shmem::Result<WorkerPool> {
        {
            let connections = Arc::clone(&self.connections);
            let port = self.port;
            shutdown.on_trigger(move || {
                connections.close();
                // Unblocks accept(); the connection itself is discarded.
                let _ = TcpStream::connect((Ipv4Addr::LOCALHOST, port));
            });
        }
        let connections = Arc::clone(&self.connections);
        let proxy = Arc::clone(proxy);
        WorkerPool::spawn("gf", nthreads, move |_| {
            while let Ok(Some(stream)) = connections.pop() {
                handle_connection(&proxy, stream);
            }
        })
    }

    /// Accepts until shutdown.
    pub fn run(&self, shutdown: &Shutdown) {
        for stream in self.listener.incoming() {
            if shutdown.is_triggered() {
                break;
            }
            match stream {
                Ok(stream) => {
                    if let Err(e) = self.connections.push(stream) {
                        warn!("Dropping connection: {}", e);
                    }
                }
                Err(e) => warn!("accept failed: {}", e),
            }
        }
        info!("Stopped accepting connections");
    }
}
