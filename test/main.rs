//! Runs `simplecached` and `webproxy` as real processes, fetches files over
//! GETFILE from several clients at once, then stops both with SIGTERM and
//! checks that the proxy removed its shared memory.

use std::fs;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tempfile::Builder;

const PORT: u16 = 18723;
const NSEGMENTS: usize = 3;

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("..")
}

fn build_binaries(root: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let cargo = std::env::var("CARGO").unwrap_or_else(|_| "cargo".to_string());
    let status = Command::new(cargo)
        .current_dir(root)
        .args(["build", "--package", "webproxy", "--package", "simplecached"])
        .status()?;
    if !status.success() {
        return Err(format!("cargo build failed: {}", status).into());
    }
    Ok(())
}

fn fetch(path: &str) -> std::io::Result<Vec<u8>> {
    let mut stream = TcpStream::connect(("127.0.0.1", PORT))?;
    write!(stream, "GETFILE GET {}\r\n\r\n", path)?;
    let mut response = Vec::new();
    stream.read_to_end(&mut response)?;
    Ok(response)
}

fn wait_for_port(deadline: Duration) -> Result<(), Box<dyn std::error::Error>> {
    let start = Instant::now();
    while TcpStream::connect(("127.0.0.1", PORT)).is_err() {
        if start.elapsed() > deadline {
            return Err("webproxy did not start listening".into());
        }
        thread::sleep(Duration::from_millis(100));
    }
    Ok(())
}

fn stop(child: &mut Child, name: &str) -> Result<(), Box<dyn std::error::Error>> {
    kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM)?;
    let status = child.wait()?;
    println!("[{}] exited with {}", name, status);
    if !status.success() {
        return Err(format!("{} exited with {}", name, status).into());
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let root = workspace_root();
    build_binaries(&root)?;
    let bin = root.join("target").join("debug");

    let dir = Builder::new().prefix("shmcache_e2e").tempdir()?;
    let tag = std::process::id();
    let channel = format!("/e2e{}-req", tag);
    let prefix = format!("/e2e{}-seg-", tag);
    let shmem_section = format!(
        "[shmem]\nchannel_name = \"{}\"\nsegment_prefix = \"{}\"\n",
        channel, prefix
    );

    let mut manifest = String::new();
    let mut files = Vec::new();
    for (i, len) in [0usize, 1, 5000, 10_000, 123_457].iter().enumerate() {
        let body: Vec<u8> = (0..*len).map(|b| (b * 7 + i) as u8).collect();
        let path = dir.path().join(format!("file{}", i));
        fs::write(&path, &body)?;
        let key = format!("/file{}.bin", i);
        manifest.push_str(&format!("{} {}\n", key, path.display()));
        files.push((key, body));
    }
    let manifest_path = dir.path().join("locals.txt");
    fs::write(&manifest_path, manifest)?;

    let cache_config = dir.path().join("simplecached.toml");
    fs::write(
        &cache_config,
        format!(
            "manifest = \"{}\"\nnthreads = 4\nchannel_backoff_ms = 100\n{}",
            manifest_path.display(),
            shmem_section
        ),
    )?;
    let proxy_config = dir.path().join("webproxy.toml");
    fs::write(
        &proxy_config,
        format!(
            "port = {}\nnthreads = 8\nnsegments = {}\nsegment_size = 5701\n{}",
            PORT, NSEGMENTS, shmem_section
        ),
    )?;

    // The back-end starts first and waits for the proxy's channel.
    let mut cache = Command::new(bin.join("simplecached"))
        .arg("-c")
        .arg(&cache_config)
        .spawn()?;
    thread::sleep(Duration::from_millis(300));
    let mut proxy = Command::new(bin.join("webproxy"))
        .arg("-c")
        .arg(&proxy_config)
        .spawn()?;
    wait_for_port(Duration::from_secs(10))?;

    let clients: Vec<_> = (0..8)
        .map(|t| {
            let files = files.clone();
            thread::spawn(move || -> Result<usize, String> {
                let mut checked = 0;
                for i in 0..files.len() * 2 {
                    let (key, body) = &files[(t + i) % files.len()];
                    let response = fetch(key).map_err(|e| e.to_string())?;
                    let header = format!("GETFILE OK {}\r\n\r\n", body.len());
                    if !response.starts_with(header.as_bytes())
                        || &response[header.len()..] != body.as_slice()
                    {
                        return Err(format!("bad response for {}", key));
                    }
                    checked += 1;
                }
                Ok(checked)
            })
        })
        .collect();
    let mut total = 0;
    for client in clients {
        total += client.join().map_err(|_| "client panicked")??;
    }
    println!("[driver] verified {} responses", total);

    assert_eq!(fetch("/missing.bin")?, b"GETFILE FILE_NOT_FOUND\r\n\r\n");
    assert_eq!(fetch("no-slash")?, b"GETFILE INVALID\r\n\r\n");

    stop(&mut proxy, "webproxy")?;
    stop(&mut cache, "simplecached")?;

    let leftovers: Vec<PathBuf> = (0..NSEGMENTS)
        .map(|i| Path::new("/dev/shm").join(format!("{}{}", &prefix[1..], i)))
        .chain(std::iter::once(Path::new("/dev/mqueue").join(&channel[1..])))
        .filter(|path| path.exists())
        .collect();
    if !leftovers.is_empty() {
        return Err(format!("shared memory left behind: {:?}", leftovers).into());
    }
    println!("[driver] all checks passed");
    Ok(())
}
