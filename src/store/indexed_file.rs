//! Lazily-opened handles to indexed store files.
//!
//! An indexed store file holds one framed [`proto::StoreFileHeader`] at
//! offset 0 followed by one framed [`proto::ValueStream`] per variable; the
//! header maps each variable to the byte offset of its stream. A handle is
//! created closed and cheap; the header (offsets, Bloom filter, timestamp
//! bounds) is cached across open/close cycles, while the file descriptor and
//! the decoded-stream cache live only while the file is open.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bloomy::BloomFilter;
use crossbeam_utils::atomic::AtomicCell;
use snafu::{ResultExt, Snafu};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

use crate::proto;
use crate::protofile::{ReadError, RecordReader};
use crate::variable::Variable;

/// Process-wide cap on simultaneously open indexed store files.
pub const OPEN_FILE_LIMIT: usize = 500;

/// Error that occurred during calls to [`IndexedStoreFile`].
#[derive(Debug, Snafu)]
pub enum StoreFileError {
    #[snafu(display("error opening indexed store file {}: {}", path.display(), source))]
    Open { path: PathBuf, source: ReadError },

    /// The first record of the file did not decode as a header.
    ///
    /// This is fatal for the file: without the header there are no offsets
    /// to read streams from, so the caller excludes the file from queries.
    #[snafu(display("can't read header from indexed store file {}", path.display()))]
    MissingHeader { path: PathBuf },
}

/// Header-derived state that survives close.
struct HeaderCache {
    /// Canonical variable → byte offset of its framed stream.
    offsets: BTreeMap<String, u64>,
    /// Built over variable names only, so exact-name queries can skip the
    /// file without touching the body. Wildcard-named queries bypass it.
    bloom: BloomFilter<String>,
}

struct OpenHandle {
    reader: RecordReader,
    _permit: OwnedSemaphorePermit,
}

struct Inner {
    header: Option<HeaderCache>,
    open: Option<OpenHandle>,
    /// Decoded streams, memoized while the file handle is open.
    stream_cache: HashMap<String, proto::ValueStream>,
}

pub struct IndexedStoreFile {
    path: PathBuf,
    /// True maximum data timestamp, parsed from the
    /// `datastore.<max_ts_ms>.bin` filename. The header's `end_timestamp`
    /// field records the minimum in the historical on-disk format, so the
    /// filename is the authoritative source for range pruning.
    max_timestamp: u64,
    min_timestamp: AtomicU64,
    is_open: AtomicBool,
    last_use: AtomicCell<Instant>,
    fd_semaphore: Arc<Semaphore>,
    inner: Mutex<Inner>,
}

impl IndexedStoreFile {
    /// Creates a closed handle. No I/O happens until `open` or
    /// `get_streams`.
    pub fn new(path: impl Into<PathBuf>, fd_semaphore: Arc<Semaphore>) -> IndexedStoreFile {
        let path = path.into();
        let max_timestamp = parse_datastore_timestamp(&path).unwrap_or(u64::MAX);
        IndexedStoreFile {
            path,
            max_timestamp,
            min_timestamp: AtomicU64::new(0),
            is_open: AtomicBool::new(false),
            last_use: AtomicCell::new(Instant::now()),
            fd_semaphore,
            inner: Mutex::new(Inner {
                header: None,
                open: None,
                stream_cache: HashMap::new(),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn max_timestamp(&self) -> u64 {
        self.max_timestamp
    }

    /// Minimum data timestamp, or 0 until the header has been loaded.
    pub fn min_timestamp(&self) -> u64 {
        self.min_timestamp.load(Ordering::Acquire)
    }

    pub fn is_open(&self) -> bool {
        self.is_open.load(Ordering::Acquire)
    }

    pub fn last_use(&self) -> Instant {
        self.last_use.load()
    }

    /// Whether this file's timestamp window overlaps the query range.
    /// Unbounded endpoints are treated as infinite.
    pub fn overlaps(&self, min_timestamp: Option<u64>, max_timestamp: Option<u64>) -> bool {
        if let Some(min) = min_timestamp {
            if min > self.max_timestamp {
                return false;
            }
        }
        if let Some(max) = max_timestamp {
            if max < self.min_timestamp() {
                return false;
            }
        }
        true
    }

    /// Opens the file, loading and caching the header on first open.
    ///
    /// Counts against the process-wide open-file semaphore until `close`.
    pub async fn open(&self) -> Result<(), StoreFileError> {
        let mut inner = self.inner.lock().await;
        self.ensure_open(&mut inner).await
    }

    /// Releases the file handle and its semaphore permit.
    ///
    /// The header cache and Bloom filter are kept; the decoded-stream cache
    /// is dropped with the handle.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        if inner.open.take().is_some() {
            trace!(path = %self.path.display(), "Closed indexed store file.");
        }
        inner.stream_cache.clear();
        self.is_open.store(false, Ordering::Release);
    }

    /// Returns every stream in this file whose variable matches `query`.
    ///
    /// Exact-name queries are gated by the Bloom filter first. A failure to
    /// read one stream skips that stream but leaves the file usable.
    pub async fn get_streams(
        &self,
        query: &Variable,
    ) -> Result<Vec<proto::ValueStream>, StoreFileError> {
        let mut inner = self.inner.lock().await;
        self.ensure_open(&mut inner).await?;

        let Inner {
            header,
            open,
            stream_cache,
        } = &mut *inner;
        let header = header.as_ref().expect("header is loaded after ensure_open");
        let handle = open.as_mut().expect("file is open after ensure_open");

        let mut results = Vec::new();
        if !query.name().ends_with('*')
            && !header.bloom.contains(&query.name().to_string())
        {
            return Ok(results);
        }

        for (key, &offset) in &header.offsets {
            let Ok(stored) = Variable::parse(key) else {
                continue;
            };
            if !stored.matches(query) {
                continue;
            }
            if let Some(cached) = stream_cache.get(key) {
                results.push(cached.clone());
                self.last_use.store(Instant::now());
                continue;
            }
            match handle.reader.read_at::<proto::ValueStream>(offset).await {
                Ok(Some(stream)) => {
                    stream_cache.insert(key.clone(), stream.clone());
                    results.push(stream);
                    self.last_use.store(Instant::now());
                }
                Ok(None) => {
                    warn!(
                        path = %self.path.display(),
                        variable = %key, offset, "Stream record missing at indexed offset."
                    );
                }
                Err(error) => {
                    warn!(
                        path = %self.path.display(),
                        variable = %key, offset, %error, "Failed to read stream at indexed offset."
                    );
                }
            }
        }
        Ok(results)
    }

    async fn ensure_open(&self, inner: &mut Inner) -> Result<(), StoreFileError> {
        if inner.open.is_some() {
            return Ok(());
        }

        let permit = Arc::clone(&self.fd_semaphore)
            .acquire_owned()
            .await
            .expect("open-file semaphore is never closed");
        let mut reader = RecordReader::open(&self.path)
            .await
            .context(OpenSnafu { path: self.path.clone() })?;

        if inner.header.is_none() {
            let header: Option<proto::StoreFileHeader> = reader
                .read_next()
                .await
                .context(OpenSnafu { path: self.path.clone() })?;
            let Some(header) = header else {
                return Err(StoreFileError::MissingHeader {
                    path: self.path.clone(),
                });
            };

            let mut offsets = BTreeMap::new();
            let mut bloom =
                BloomFilter::with_size(std::cmp::max(1024, header.index.len()));
            for entry in &header.index {
                let variable = Variable::from_proto(&entry.variable);
                bloom.insert(&variable.name().to_string());
                offsets.insert(variable.to_canonical(), entry.offset);
            }
            debug!(
                path = %self.path.display(),
                variables = offsets.len(),
                start_timestamp = header.start_timestamp,
                "Loaded indexed store file header."
            );
            self.min_timestamp
                .store(header.start_timestamp, Ordering::Release);
            inner.header = Some(HeaderCache { offsets, bloom });
        }

        inner.open = Some(OpenHandle {
            reader,
            _permit: permit,
        });
        self.is_open.store(true, Ordering::Release);
        self.last_use.store(Instant::now());
        Ok(())
    }
}

/// Extracts the `<digits>` from a `datastore.<digits>.bin` filename.
pub fn parse_datastore_timestamp(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    let digits = name.strip_prefix("datastore.")?.strip_suffix(".bin")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}
