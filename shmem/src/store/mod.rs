use std::fs::{self, File};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use log::{info, warn};

use crate::errors::{Result, ShmemLibError};

/// Upper bound of the artificial lookup delay.
pub const MAX_LOOKUP_DELAY: Duration = Duration::from_micros(2_500_000);

struct Entry {
    key: String,
    path: PathBuf,
    file: File,
}

/// Read-only key → file mapping built once from a manifest.
pub struct ContentStore {
    entries: Vec<Entry>,
    delay: Duration,
}

/// A hit: the open file and its length at lookup time.
pub struct Resolved<'a> {
    pub path: &'a Path,
    pub file: &'a File,
    pub len: u64,
}

impl<'a> Resolved<'a> {
    /// Positioned read, so workers sharing a descriptor never race on an
    /// offset. Fills `buf` unless end of file comes first.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.file.read_at(&mut buf[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }
}

impl ContentStore {
    /// Reads `key path` lines from `manifest` and opens every file. Any file
    /// that cannot be opened fails the whole store.
    pub fn open(manifest: &Path, delay: Duration) -> Result<ContentStore> {
        if delay > MAX_LOOKUP_DELAY {
            return Err(ShmemLibError::Config(format!(
                "lookup delay {:?} exceeds {:?}",
                delay, MAX_LOOKUP_DELAY
            )));
        }
        let text = fs::read_to_string(manifest).map_err(|e| {
            ShmemLibError::Config(format!("cannot read manifest {}: {}", manifest.display(), e))
        })?;
        let mut entries = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let mut fields = line.split_whitespace();
            let key = match fields.next() {
                Some(key) => key,
                None => continue,
            };
            let path = fields.next().ok_or_else(|| {
                ShmemLibError::Config(format!(
                    "{}:{}: entry {:?} has no path",
                    manifest.display(),
                    lineno + 1,
                    key
                ))
            })?;
            let file = File::open(path).map_err(|e| {
                ShmemLibError::Config(format!("cannot open {} for {}: {}", path, key, e))
            })?;
            entries.push(Entry {
                key: key.to_string(),
                path: PathBuf::from(path),
                file,
            });
        }
        // Stable sort keeps manifest order among equal keys; the first wins.
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries.dedup_by(|later, first| {
            let dup = later.key == first.key;
            if dup {
                warn!("Duplicate key {} ignored: {}", later.key, later.path.display());
            }
            dup
        });
        info!("Loaded {} entries from {}", entries.len(), manifest.display());
        Ok(ContentStore { entries, delay })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Binary search for `key`. A hit reports the file's current length.
    pub fn lookup(&self, key: &str) -> Result<Option<Resolved<'_>>> {
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        let entry = match self.entries.binary_search_by(|e| e.key.as_str().cmp(key)) {
            Ok(index) => &self.entries[index],
            Err(_) => return Ok(None),
        };
        let len = entry.file.metadata()?.len();
        Ok(Some(Resolved {
            path: &entry.path,
            file: &entry.file,
            len,
        }))
    }
}
