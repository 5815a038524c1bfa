//! The store manager: write path, recovery, background maintenance, and
//! query fan-out.
//!
//! Incoming value streams land in two places: an in-memory map keyed by
//! canonical variable (the hot tail) and the append-only record log. A
//! background task rotates the record log when it grows past its size limit
//! and indexes rotated logs into `datastore.<max_ts_ms>.bin` files; a
//! maintenance tick closes idle file handles and merges small indexed files
//! up to a configured target size. Queries fan out over the RAM map and
//! every indexed file whose timestamp window overlaps the request.

use std::collections::btree_map::Entry as BTreeEntry;
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{SecondsFormat, Utc};
use futures::Stream;
use parking_lot::{Mutex, RwLock};
use snafu::{ResultExt, Snafu};
use tokio::fs;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, MissedTickBehavior};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use super::indexed_file::{parse_datastore_timestamp, IndexedStoreFile, OPEN_FILE_LIMIT};
use crate::proto;
use crate::protofile::{ReadError, RecordReader, RecordWriter, WriteError};
use crate::variable::Variable;

/// Capacity of the channel feeding the record-log writer task.
const RECORD_LOG_CHANNEL_CAPACITY: usize = 1000;

/// Capacity of the per-query fan-out channel.
const QUERY_CHANNEL_CAPACITY: usize = 1000;

/// How long an indexed file handle may sit unused before the fd-LRU closes
/// it.
const IDLE_FILE_TIMEOUT: Duration = Duration::from_secs(30);

const RECORD_LOG_ROTATE_INTERVAL: Duration = Duration::from_secs(60);
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(5);

/// Error that occurred during calls to [`StoreManager`].
#[derive(Debug, Snafu)]
pub enum StoreError {
    #[snafu(display("datastore I/O error on {}: {}", path.display(), source))]
    Io { path: PathBuf, source: io::Error },

    #[snafu(display("record file read error: {}", source))]
    Read { source: ReadError },

    #[snafu(display("record file write error: {}", source))]
    Write { source: WriteError },

    /// The record-log writer has stopped accepting streams.
    #[snafu(display("store is shutting down"))]
    ShuttingDown,
}

/// Store manager configuration.
#[derive(Clone, Debug)]
pub struct StoreOptions {
    /// Directory holding the record log and indexed store files.
    pub datastore_path: PathBuf,
    /// Rotate the record log once it reaches this many megabytes.
    pub recordlog_max_size_mb: u64,
    /// How many recently-used indexed files the fd-LRU keeps open at idle.
    pub idle_files_open: usize,
    /// Merge small indexed files up to this many bytes. Merging is disabled
    /// when unset.
    pub target_indexed_file_size: Option<u64>,
}

impl StoreOptions {
    pub fn new(datastore_path: impl Into<PathBuf>) -> StoreOptions {
        StoreOptions {
            datastore_path: datastore_path.into(),
            recordlog_max_size_mb: 50,
            idle_files_open: 20,
            target_indexed_file_size: None,
        }
    }
}

pub struct StoreManager {
    options: StoreOptions,
    /// Hot tail: streams that are record-logged but not yet indexed.
    streams: RwLock<HashMap<String, proto::ValueStream>>,
    store_files: Mutex<Vec<Arc<IndexedStoreFile>>>,
    record_log_tx: mpsc::Sender<proto::ValueStream>,
    fd_semaphore: Arc<Semaphore>,
    /// Serializes the indexer and merger; `store_files` registration changes
    /// happen while this is held.
    maintenance: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl StoreManager {
    /// Opens the datastore: scans and warms existing indexed files, replays
    /// the record log into the RAM map, and launches the record-log writer
    /// and maintenance tasks.
    pub async fn open(options: StoreOptions) -> Result<Arc<StoreManager>, StoreError> {
        fs::create_dir_all(&options.datastore_path)
            .await
            .context(IoSnafu { path: options.datastore_path.clone() })?;

        let (record_log_tx, record_log_rx) = mpsc::channel(RECORD_LOG_CHANNEL_CAPACITY);
        let manager = Arc::new(StoreManager {
            streams: RwLock::new(HashMap::new()),
            store_files: Mutex::new(Vec::new()),
            record_log_tx,
            fd_semaphore: Arc::new(Semaphore::new(OPEN_FILE_LIMIT)),
            maintenance: tokio::sync::Mutex::new(()),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            options,
        });

        // Read the header of every indexed file up front, then close them
        // again to free the file handles.
        let started = Instant::now();
        let mut dir = fs::read_dir(&manager.options.datastore_path)
            .await
            .context(IoSnafu { path: manager.options.datastore_path.clone() })?;
        let mut warmups = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .context(IoSnafu { path: manager.options.datastore_path.clone() })?
        {
            let path = entry.path();
            if parse_datastore_timestamp(&path).is_none() {
                continue;
            }
            let file = Arc::new(IndexedStoreFile::new(path, Arc::clone(&manager.fd_semaphore)));
            manager.store_files.lock().push(Arc::clone(&file));
            warmups.push(manager.spawn_warm(file));
        }
        let warmed = warmups.len();
        for warmup in warmups {
            let _ = warmup.await;
        }
        info!(
            files = warmed,
            elapsed = ?started.elapsed(),
            "Finished reading datastore file headers."
        );

        // Replay the current record log into the RAM map.
        let recordlog = manager.record_log_path();
        if fs::metadata(&recordlog).await.is_ok() {
            let started = Instant::now();
            match read_stream_records(&recordlog, |stream| manager.add_no_record(stream)).await {
                Ok(streams) => info!(
                    streams,
                    elapsed = ?started.elapsed(),
                    "Recovered streams from the record log."
                ),
                Err(error) => warn!(%error, "Error replaying the record log."),
            }
        }

        let writer = tokio::spawn(Arc::clone(&manager).run_record_log_writer(record_log_rx));
        let maintenance = tokio::spawn(Arc::clone(&manager).run_maintenance());
        manager.tasks.lock().extend([writer, maintenance]);
        Ok(manager)
    }

    /// Stops the background tasks, draining any unwritten record-log
    /// entries first.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
    }

    fn record_log_path(&self) -> PathBuf {
        self.options.datastore_path.join("recordlog")
    }

    /// Accepts one stream: appended to the RAM map and queued for the
    /// record-log writer. Blocks only when the writer's channel is full.
    pub async fn add_value_stream(&self, stream: proto::ValueStream) -> Result<(), StoreError> {
        self.add_no_record(stream.clone());
        self.record_log_tx
            .send(stream)
            .await
            .map_err(|_| StoreError::ShuttingDown)
    }

    /// Appends to the RAM map without touching the record log. Used for
    /// replay, where the data is already durable.
    fn add_no_record(&self, stream: proto::ValueStream) {
        let Some(variable) = stream.variable.as_ref() else {
            warn!("Dropping value stream without a variable.");
            return;
        };
        let key = Variable::from_proto(variable).to_canonical();
        let mut streams = self.streams.write();
        match streams.entry(key) {
            Entry::Occupied(mut entry) => entry.get_mut().value.extend(stream.value),
            Entry::Vacant(entry) => {
                entry.insert(stream);
            }
        }
    }

    /// Emits every stream matching `query` with data inside the requested
    /// range, from both the RAM map and all overlapping indexed files.
    ///
    /// Producers run concurrently into a bounded channel; the sequence
    /// completes when all of them have. Dropping the returned stream stops
    /// the producers.
    pub fn get_value_streams(
        self: &Arc<Self>,
        query: &Variable,
        min_timestamp: Option<u64>,
        max_timestamp: Option<u64>,
    ) -> impl Stream<Item = proto::ValueStream> {
        let (tx, rx) = mpsc::channel(QUERY_CHANNEL_CAPACITY);

        // The RAM map is the fast path: clone matches out under the read
        // lock, send them without it.
        {
            let this = Arc::clone(self);
            let query = query.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let matched: Vec<proto::ValueStream> = {
                    let streams = this.streams.read();
                    streams
                        .iter()
                        .filter(|(key, stream)| {
                            Variable::parse(key)
                                .map(|stored| stored.matches(&query))
                                .unwrap_or(false)
                                && stream_overlaps_range(stream, min_timestamp, max_timestamp)
                        })
                        .map(|(_, stream)| stream.clone())
                        .collect()
                };
                for stream in matched {
                    if tx.send(stream).await.is_err() {
                        return;
                    }
                }
            });
        }

        let files: Vec<_> = self.store_files.lock().clone();
        for file in files {
            if !file.overlaps(min_timestamp, max_timestamp) {
                continue;
            }
            let query = query.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                match file.get_streams(&query).await {
                    Ok(streams) => {
                        for stream in streams {
                            if !stream_overlaps_range(&stream, min_timestamp, max_timestamp) {
                                continue;
                            }
                            if tx.send(stream).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(error) => warn!(
                        path = %file.path().display(),
                        %error, "Skipping indexed store file in query."
                    ),
                }
            });
        }

        ReceiverStream::new(rx)
    }

    fn spawn_warm(self: &Arc<Self>, file: Arc<IndexedStoreFile>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            // Open to load the header and Bloom filter, then close right
            // away to release the file handle.
            if let Err(error) = file.open().await {
                warn!(
                    path = %file.path().display(),
                    %error, "Excluding unreadable indexed store file."
                );
                this.store_files.lock().retain(|f| !Arc::ptr_eq(f, &file));
                return;
            }
            file.close().await;
        })
    }

    async fn run_record_log_writer(self: Arc<Self>, mut rx: mpsc::Receiver<proto::ValueStream>) {
        let path = self.record_log_path();
        let mut writer = match RecordWriter::create(&path).await {
            Ok(writer) => Some(writer),
            Err(error) => {
                error!(%error, "Can't open the record log; retrying on the next tick.");
                None
            }
        };
        // The first tick fires a full interval after startup, like a plain
        // ticker.
        let mut tick = time::interval_at(
            time::Instant::now() + RECORD_LOG_ROTATE_INTERVAL,
            RECORD_LOG_ROTATE_INTERVAL,
        );
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                received = rx.recv() => {
                    let Some(stream) = received else { break };
                    append_record(&path, &mut writer, &stream).await;
                }
                _ = tick.tick() => {
                    self.maybe_rotate(&path, &mut writer).await;
                    self.index_rotated_logs().await;
                }
            }
        }

        // Drain whatever was queued before shutdown so it is recoverable on
        // restart.
        while let Ok(stream) = rx.try_recv() {
            append_record(&path, &mut writer, &stream).await;
        }
        if let Some(writer) = writer.as_mut() {
            if let Err(error) = writer.sync_all().await {
                error!(%error, "Failed to sync the record log on shutdown.");
            }
        }
        debug!("Record log writer stopped.");
    }

    async fn maybe_rotate(&self, path: &Path, writer: &mut Option<RecordWriter>) {
        if writer.is_none() {
            *writer = match RecordWriter::create(path).await {
                Ok(reopened) => Some(reopened),
                Err(error) => {
                    error!(%error, "Can't reopen the record log.");
                    return;
                }
            };
        }
        let size = writer.as_ref().map(RecordWriter::position).unwrap_or(0);
        let max_size = self.options.recordlog_max_size_mb * 1024 * 1024;
        if size < max_size {
            return;
        }

        info!(
            size_mb = size / 1024 / 1024,
            max_mb = self.options.recordlog_max_size_mb,
            "Record log exceeded its size limit, rotating."
        );
        let rotated = self.options.datastore_path.join(format!(
            "recordlog.{}",
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
        ));
        match fs::rename(path, &rotated).await {
            Ok(()) => {
                *writer = None;
                // The rotated data is re-read from disk by the indexer, so
                // the hot tail can go.
                self.streams.write().clear();
                match RecordWriter::create(path).await {
                    Ok(fresh) => *writer = Some(fresh),
                    Err(error) => error!(%error, "Can't open a fresh record log after rotation."),
                }
            }
            Err(error) => error!(
                from = %path.display(),
                to = %rotated.display(),
                %error, "Failed to rotate the record log."
            ),
        }
    }

    /// Indexes every rotated record log sitting in the datastore directory.
    ///
    /// Launched in parallel; the maintenance mutex inside `index_recordlog`
    /// serializes the actual work.
    pub(crate) async fn index_rotated_logs(self: &Arc<Self>) {
        let mut dir = match fs::read_dir(&self.options.datastore_path).await {
            Ok(dir) => dir,
            Err(error) => {
                error!(%error, "Can't scan the datastore directory for rotated record logs.");
                return;
            }
        };
        let mut tasks = JoinSet::new();
        loop {
            match dir.next_entry().await {
                Ok(Some(entry)) => {
                    let path = entry.path();
                    let is_rotated_log = path
                        .file_name()
                        .and_then(|name| name.to_str())
                        .map(|name| name.starts_with("recordlog.") && name.len() > "recordlog.".len())
                        .unwrap_or(false);
                    if is_rotated_log {
                        let this = Arc::clone(self);
                        tasks.spawn(async move {
                            let result = this.index_recordlog(&path).await;
                            (path, result)
                        });
                    }
                }
                Ok(None) => break,
                Err(error) => {
                    error!(%error, "Error listing the datastore directory.");
                    break;
                }
            }
        }
        while let Some(joined) = tasks.join_next().await {
            if let Ok((path, Err(error))) = joined {
                error!(path = %path.display(), %error, "Failed to index rotated record log.");
            }
        }
    }

    /// Reads one rotated record log, run-length-encodes its streams, writes
    /// an indexed store file, and removes the source log.
    pub(crate) async fn index_recordlog(self: &Arc<Self>, path: &Path) -> Result<(), StoreError> {
        let _guard = self.maintenance.lock().await;
        info!(path = %path.display(), "Indexing record log.");

        let mut accumulator = StreamAccumulator::default();
        read_stream_records(path, |stream| accumulator.add(stream)).await?;
        info!(
            path = %path.display(),
            streams = accumulator.streams.len(),
            min_timestamp = accumulator.min_timestamp,
            max_timestamp = accumulator.max_timestamp,
            input_values = accumulator.input_values,
            output_values = accumulator.output_values,
            "Read record log."
        );

        if !accumulator.streams.is_empty() {
            self.write_indexed_file(&accumulator).await?;
        }
        fs::remove_file(path)
            .await
            .context(IoSnafu { path: path.to_path_buf() })?;
        Ok(())
    }

    /// Writes one indexed store file from accumulated streams and registers
    /// it.
    ///
    /// The header is written first at its final size — `offset` is a
    /// fixed-width field, so filling in real offsets later cannot change the
    /// header's length — then each stream, then the header again with the
    /// offsets recorded.
    async fn write_indexed_file(
        self: &Arc<Self>,
        accumulator: &StreamAccumulator,
    ) -> Result<PathBuf, StoreError> {
        let filename = self.options.datastore_path.join(format!(
            "datastore.{}.bin",
            accumulator.max_timestamp
        ));
        let tmp_filename = self.options.datastore_path.join(format!(
            "datastore.{}.bin.new",
            accumulator.max_timestamp
        ));
        debug!(path = %tmp_filename.display(), "Writing indexed store file.");

        // A stale temp file from an interrupted run would otherwise be
        // appended to.
        if let Err(error) = fs::remove_file(&tmp_filename).await {
            if error.kind() != io::ErrorKind::NotFound {
                return Err(StoreError::Io {
                    path: tmp_filename,
                    source: error,
                });
            }
        }

        // The on-disk header format records the minimum timestamp in
        // `end_timestamp`; readers take the true maximum from the filename.
        let mut header = proto::StoreFileHeader {
            start_timestamp: accumulator.min_timestamp,
            end_timestamp: accumulator.min_timestamp,
            variable: Vec::new(),
            index: accumulator
                .streams
                .values()
                .map(|stream| proto::StoreFileHeaderIndex {
                    variable: stream.variable.clone().unwrap_or_default(),
                    offset: 0,
                })
                .collect(),
        };

        let mut writer = RecordWriter::create(&tmp_filename)
            .await
            .context(WriteSnafu)?;
        writer.write(&header).await.context(WriteSnafu)?;
        for (entry, stream) in header.index.iter_mut().zip(accumulator.streams.values()) {
            entry.offset = writer.position();
            writer.write(stream).await.context(WriteSnafu)?;
        }
        writer.write_at(0, &header).await.context(WriteSnafu)?;
        writer.sync_all().await.context(WriteSnafu)?;
        drop(writer);

        debug!(path = %filename.display(), "Renaming indexed store file into place.");
        fs::rename(&tmp_filename, &filename)
            .await
            .context(IoSnafu { path: filename.clone() })?;

        self.register_store_file(&filename);
        Ok(filename)
    }

    /// Registers a freshly-written indexed file, replacing any prior handle
    /// for the same path, and warms its header in the background.
    fn register_store_file(self: &Arc<Self>, path: &Path) {
        let file = Arc::new(IndexedStoreFile::new(
            path.to_path_buf(),
            Arc::clone(&self.fd_semaphore),
        ));
        {
            let mut files = self.store_files.lock();
            files.retain(|existing| existing.path() != path);
            files.push(Arc::clone(&file));
        }
        let _ = self.spawn_warm(file);
    }

    /// Merges runs of small indexed files into files of roughly the target
    /// size. No-op when no target is configured for this server.
    pub(crate) async fn merge_indexed_files(self: &Arc<Self>) -> Result<(), StoreError> {
        let Some(target) = self.options.target_indexed_file_size else {
            return Ok(());
        };
        let _guard = self.maintenance.lock().await;

        let mut files: Vec<(PathBuf, u64)> = Vec::new();
        let mut dir = fs::read_dir(&self.options.datastore_path)
            .await
            .context(IoSnafu { path: self.options.datastore_path.clone() })?;
        while let Some(entry) = dir
            .next_entry()
            .await
            .context(IoSnafu { path: self.options.datastore_path.clone() })?
        {
            let path = entry.path();
            if parse_datastore_timestamp(&path).is_none() {
                continue;
            }
            let size = entry
                .metadata()
                .await
                .context(IoSnafu { path: path.clone() })?
                .len();
            files.push((path, size));
        }
        files.sort_by(|a, b| a.0.cmp(&b.0));

        let mut batch: Vec<PathBuf> = Vec::new();
        let mut batch_size = 0u64;
        for (path, size) in files {
            if !batch.is_empty() && batch_size + size > target {
                self.merge_batch(&batch).await?;
                batch.clear();
                batch_size = 0;
            }
            batch_size += size;
            batch.push(path);
        }
        self.merge_batch(&batch).await
    }

    /// Re-reads a batch of indexed files through the record-log pipeline and
    /// replaces them with one combined file. Single-file batches are left
    /// alone.
    async fn merge_batch(self: &Arc<Self>, batch: &[PathBuf]) -> Result<(), StoreError> {
        if batch.len() < 2 {
            return Ok(());
        }
        info!(files = batch.len(), "Merging indexed store files.");

        let mut accumulator = StreamAccumulator::default();
        for path in batch {
            read_stream_records(path, |stream| accumulator.add(stream)).await?;
        }
        if accumulator.streams.is_empty() {
            return Ok(());
        }

        // A rename failure aborts before any source is deleted.
        let destination = self.write_indexed_file(&accumulator).await?;

        for path in batch {
            if *path == destination {
                continue;
            }
            fs::remove_file(path)
                .await
                .context(IoSnafu { path: path.clone() })?;
            self.store_files
                .lock()
                .retain(|existing| existing.path() != *path);
        }
        info!(
            destination = %destination.display(),
            merged = batch.len(),
            "Merged indexed store files."
        );
        Ok(())
    }

    /// The fd-LRU: closes open indexed files past the configured
    /// most-recently-used count once they have idled out, or sooner when
    /// the open-file count nears the cap.
    pub(crate) async fn close_idle_files(&self) {
        let mut files: Vec<_> = self.store_files.lock().clone();
        files.sort_by_key(|file| std::cmp::Reverse(file.last_use()));

        let mut kept_open = 0usize;
        let mut open_files = OPEN_FILE_LIMIT - self.fd_semaphore.available_permits();
        for file in files {
            if !file.is_open() {
                continue;
            }
            if kept_open >= self.options.idle_files_open {
                let near_cap = open_files * 10 >= OPEN_FILE_LIMIT * 8;
                if file.last_use().elapsed() > IDLE_FILE_TIMEOUT || near_cap {
                    file.close().await;
                    open_files = open_files.saturating_sub(1);
                    continue;
                }
            }
            kept_open += 1;
        }
    }

    async fn run_maintenance(self: Arc<Self>) {
        let mut tick = time::interval_at(
            time::Instant::now() + MAINTENANCE_INTERVAL,
            MAINTENANCE_INTERVAL,
        );
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tick.tick() => {
                    self.close_idle_files().await;
                    if let Err(error) = self.merge_indexed_files().await {
                        error!(%error, "Merging indexed store files failed.");
                    }
                }
            }
        }
        debug!("Maintenance task stopped.");
    }

    /// Number of indexed files currently registered.
    pub fn indexed_file_count(&self) -> usize {
        self.store_files.lock().len()
    }

    /// Number of indexed files currently holding an open handle.
    pub fn open_file_count(&self) -> usize {
        OPEN_FILE_LIMIT - self.fd_semaphore.available_permits()
    }
}

async fn append_record(path: &Path, writer: &mut Option<RecordWriter>, stream: &proto::ValueStream) {
    if writer.is_none() {
        *writer = match RecordWriter::create(path).await {
            Ok(reopened) => Some(reopened),
            Err(error) => {
                error!(%error, "Can't reopen the record log; dropping a stream.");
                return;
            }
        };
    }
    if let Some(open) = writer.as_mut() {
        if let Err(error) = open.write(stream).await {
            error!(%error, "Record log write failed; closing until the next tick.");
            *writer = None;
        }
    }
}

/// Whether any value of `stream` falls inside the inclusive range. RLE
/// values count if their `[timestamp, end_timestamp]` span touches it.
fn stream_overlaps_range(
    stream: &proto::ValueStream,
    min_timestamp: Option<u64>,
    max_timestamp: Option<u64>,
) -> bool {
    stream.value.iter().any(|value| {
        min_timestamp.map_or(true, |min| value.last_timestamp() >= min)
            && max_timestamp.map_or(true, |max| value.timestamp <= max)
    })
}

/// Merges streams by canonical variable, applying run-length encoding and
/// tracking the overall timestamp bounds.
#[derive(Default)]
pub(crate) struct StreamAccumulator {
    pub(crate) streams: BTreeMap<String, proto::ValueStream>,
    pub(crate) min_timestamp: u64,
    pub(crate) max_timestamp: u64,
    input_values: u64,
    output_values: u64,
}

impl StreamAccumulator {
    pub(crate) fn add(&mut self, stream: proto::ValueStream) {
        let Some(variable) = stream.variable.as_ref() else {
            warn!("Dropping record-log stream without a variable.");
            return;
        };
        let key = Variable::from_proto(variable).to_canonical();
        let merged = match self.streams.entry(key) {
            BTreeEntry::Occupied(entry) => entry.into_mut(),
            BTreeEntry::Vacant(entry) => {
                entry.insert(proto::ValueStream::new(variable.clone()))
            }
        };

        for value in stream.value {
            self.input_values += 1;
            if self.min_timestamp == 0 || value.timestamp < self.min_timestamp {
                self.min_timestamp = value.timestamp;
            }
            if value.timestamp > self.max_timestamp {
                self.max_timestamp = value.timestamp;
            }
            if let Some(end) = value.end_timestamp {
                if end > self.max_timestamp {
                    self.max_timestamp = end;
                }
            }

            // Run-length encoding: a value repeating its predecessor in the
            // active field extends the predecessor instead of appending.
            if let Some(last) = merged.value.last_mut() {
                let same_string =
                    last.string_value.is_some() && last.string_value == value.string_value;
                let same_double = last.string_value.is_none()
                    && value.string_value.is_none()
                    && last.double_value == value.double_value;
                if same_string || same_double {
                    last.end_timestamp = Some(value.end_timestamp.unwrap_or(value.timestamp));
                    continue;
                }
            }
            merged.value.push(value);
            self.output_values += 1;
        }
    }
}

/// Reads every framed `ValueStream` from a record file, skipping one leading
/// `StoreFileHeader` if the file begins with one. Returns the stream count.
pub(crate) async fn read_stream_records(
    path: &Path,
    mut callback: impl FnMut(proto::ValueStream),
) -> Result<u64, StoreError> {
    let mut reader = RecordReader::open(path).await.context(ReadSnafu)?;

    // Indexed store files lead with a header record; record logs usually do
    // not. A failed header decode just means we rewind and read streams from
    // the top.
    let header: Option<proto::StoreFileHeader> = reader.read_next().await.context(ReadSnafu)?;
    if header.is_none() {
        reader.seek(0).await.context(ReadSnafu)?;
    }

    let mut count = 0u64;
    while let Some(stream) = reader
        .read_next::<proto::ValueStream>()
        .await
        .context(ReadSnafu)?
    {
        callback(stream);
        count += 1;
    }
    Ok(count)
}
