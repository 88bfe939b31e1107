#![allow(dead_code, missing_docs, clippy::unwrap_used)]

use std::collections::HashMap;
use std::ffi::OsString;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use accession_fs::cache::PoolConfig;
use accession_fs::fs::{AccessionFs, FsOptions, HandleId, InodeAddr, InodeKind};
use accession_fs::remote::{DirectoryLister, FetchError, ListPage, ListedEntry, RangeFetcher};
use accession_locator::models::{Accession, FileRecord};
use bytes::Bytes;
use bytesize::ByteSize;

pub type TestFs = AccessionFs<ScriptedLister, CountingFetcher>;

/// The byte every test file holds at absolute position `pos`.
pub fn byte_at(pos: u64) -> u8 {
    (pos % 251) as u8
}

pub fn file(name: &str, size: &str) -> FileRecord {
    FileRecord {
        name: name.to_owned(),
        size: size.to_owned(),
        link: format!("https://objects.example/{name}"),
        md5: Some(format!("md5-{name}")),
        service: Some("s3".to_owned()),
    }
}

pub fn accession(id: &str, files: Vec<FileRecord>) -> Accession {
    Accession {
        id: id.to_owned(),
        files,
        status: None,
        message: None,
    }
}

pub fn listed(name: &str, kind: InodeKind, size: u64, mtime_secs: u64) -> ListedEntry {
    ListedEntry {
        name: OsString::from(name),
        kind,
        size,
        mtime: SystemTime::UNIX_EPOCH + Duration::from_secs(mtime_secs),
        etag: Some(format!("etag-{name}")),
        storage_class: Some("STANDARD".to_owned()),
        link: (kind == InodeKind::File).then(|| format!("https://objects.example/{name}")),
    }
}

/// A lister serving fixed per-path listings in pages of `page_size`.
#[derive(Clone)]
pub struct ScriptedLister {
    dirs: Arc<Mutex<HashMap<String, Vec<ListedEntry>>>>,
    page_size: usize,
    delay: Duration,
    calls: Arc<AtomicUsize>,
    fail: Arc<AtomicBool>,
}

impl ScriptedLister {
    pub fn new(page_size: usize) -> Self {
        Self {
            dirs: Arc::new(Mutex::new(HashMap::new())),
            page_size,
            delay: Duration::ZERO,
            calls: Arc::new(AtomicUsize::new(0)),
            fail: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_dir(self, path: &str, entries: Vec<ListedEntry>) -> Self {
        self.set_dir(path, entries);
        self
    }

    /// Make every page take `delay` to arrive.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn set_dir(&self, path: &str, entries: Vec<ListedEntry>) {
        self.dirs.lock().unwrap().insert(path.to_owned(), entries);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl DirectoryLister for ScriptedLister {
    async fn list(&self, path: &str, continuation: Option<&str>) -> Result<ListPage, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(FetchError::Status(503));
        }
        let start: usize = continuation.map_or(0, |c| c.parse().unwrap());
        let dirs = self.dirs.lock().unwrap();
        let entries = dirs.get(path).map(Vec::as_slice).unwrap_or_default();
        if start >= entries.len() {
            return Ok(ListPage::default());
        }
        let end = (start + self.page_size).min(entries.len());
        Ok(ListPage {
            entries: entries[start..end].to_vec(),
            continuation: Some(end.to_string()),
        })
    }
}

/// A fetcher that synthesizes bytes with [`byte_at`], counting and optionally delaying calls.
#[derive(Clone, Default)]
pub struct CountingFetcher {
    calls: Arc<AtomicUsize>,
    ranges: Arc<Mutex<Vec<Range<u64>>>>,
    delay: Duration,
    failures_left: Arc<AtomicUsize>,
}

impl CountingFetcher {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// Make the next `n` fetches fail.
    pub fn fail_next(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn ranges(&self) -> Vec<Range<u64>> {
        self.ranges.lock().unwrap().clone()
    }
}

impl RangeFetcher for CountingFetcher {
    async fn fetch(&self, _link: &str, range: Range<u64>) -> Result<Bytes, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.ranges.lock().unwrap().push(range.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(FetchError::Connection("reset by peer".to_owned()));
        }
        Ok(range.map(byte_at).collect::<Vec<_>>().into())
    }
}

pub fn options() -> FsOptions {
    FsOptions {
        stat_ttl: Duration::from_secs(60),
        type_ttl: Duration::from_secs(60),
        uid: 1000,
        gid: 1000,
    }
}

/// A pool of `chunks` chunks of `chunk` bytes each.
pub fn pool(chunk: u64, chunks: u64) -> PoolConfig {
    PoolConfig {
        max_memory: ByteSize::b(chunk * chunks),
        chunk_size: ByteSize::b(chunk),
        max_idle: 4,
    }
}

pub fn build(payload: &[Accession], lister: ScriptedLister, fetcher: CountingFetcher) -> TestFs {
    build_with(payload, lister, fetcher, options())
}

pub fn build_with(
    payload: &[Accession],
    lister: ScriptedLister,
    fetcher: CountingFetcher,
    options: FsOptions,
) -> TestFs {
    AccessionFs::new(payload, lister, fetcher, options, pool(64, 64)).unwrap()
}

/// One entry as handed to the filler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listed {
    pub name: OsString,
    pub addr: InodeAddr,
    pub kind: InodeKind,
    pub offset: u64,
}

/// Read from `offset`, accepting at most `room` entries before reporting full.
pub async fn read_dir_once(fs: &TestFs, handle: HandleId, offset: u64, room: usize) -> Vec<Listed> {
    let mut out = Vec::new();
    fs.read_directory(handle, offset, |entry| {
        if out.len() == room {
            return true;
        }
        out.push(Listed {
            name: entry.name.to_os_string(),
            addr: entry.addr,
            kind: entry.kind,
            offset: entry.offset,
        });
        false
    })
    .await
    .unwrap();
    out
}

/// List a directory to the end in batches of `room` entries per call.
pub async fn read_dir_all(fs: &TestFs, handle: HandleId, room: usize) -> Vec<Listed> {
    let mut all = Vec::new();
    let mut offset = 0;
    loop {
        let batch = read_dir_once(fs, handle, offset, room).await;
        let Some(last) = batch.last() else {
            return all;
        };
        offset = last.offset;
        all.extend(batch);
    }
}
