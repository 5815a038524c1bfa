use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::StreamExt;
use tempfile::TempDir;
use tokio::sync::Semaphore;

use super::{IndexedStoreFile, StoreManager, StoreOptions};
use crate::proto;
use crate::protofile::{RecordReader, RecordWriter};
use crate::variable::Variable;

fn make_stream(name: &str, values: &[(u64, f64)]) -> proto::ValueStream {
    let variable = Variable::parse(name).expect("test variable should parse");
    let mut stream = proto::ValueStream::new(variable.to_proto());
    stream.value = values
        .iter()
        .map(|&(t, v)| proto::Value::double(t, v))
        .collect();
    stream
}

async fn write_rotated_log(path: &Path, streams: &[proto::ValueStream]) {
    let mut writer = RecordWriter::create(path).await.expect("create log");
    for stream in streams {
        writer.write(stream).await.expect("write stream");
    }
    writer.sync_all().await.expect("sync log");
}

async fn open_store(dir: &Path) -> Arc<StoreManager> {
    StoreManager::open(StoreOptions::new(dir))
        .await
        .expect("store should open")
}

async fn collect_streams(
    manager: &Arc<StoreManager>,
    query: &str,
    min: Option<u64>,
    max: Option<u64>,
) -> Vec<proto::ValueStream> {
    let variable = Variable::parse(query).expect("query should parse");
    manager
        .get_value_streams(&variable, min, max)
        .collect()
        .await
}

fn datastore_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .expect("read datastore dir")
        .filter_map(|entry| {
            let path = entry.expect("dir entry").path();
            super::indexed_file::parse_datastore_timestamp(&path).map(|_| path)
        })
        .collect();
    files.sort();
    files
}

#[tokio::test]
async fn indexing_collapses_repeated_values() {
    let dir = TempDir::new().unwrap();
    let manager = open_store(dir.path()).await;

    let log = dir.path().join("recordlog.2024-01-01T00:00:00Z");
    write_rotated_log(
        &log,
        &[make_stream("/x", &[(1, 1.0), (2, 1.0), (3, 1.0), (4, 2.0)])],
    )
    .await;
    manager.index_recordlog(&log).await.expect("index log");
    assert!(!log.exists(), "source log should be deleted after indexing");

    let streams = collect_streams(&manager, "/x", None, None).await;
    assert_eq!(streams.len(), 1);
    let values = &streams[0].value;
    assert_eq!(values.len(), 2);
    assert_eq!(values[0].timestamp, 1);
    assert_eq!(values[0].end_timestamp, Some(3));
    assert_eq!(values[0].double_value, Some(1.0));
    assert_eq!(values[1].timestamp, 4);
    assert_eq!(values[1].end_timestamp, None);
    assert_eq!(values[1].double_value, Some(2.0));

    manager.shutdown().await;
}

#[tokio::test]
async fn indexed_file_roundtrips_every_variable() {
    let dir = TempDir::new().unwrap();
    let manager = open_store(dir.path()).await;

    let inputs = vec![
        make_stream("/a{host=one}", &[(10, 1.0), (20, 2.0)]),
        make_stream("/a{host=two}", &[(15, 5.0)]),
        make_stream("/b", &[(12, 9.0), (30, 7.0)]),
    ];
    let log = dir.path().join("recordlog.2024-01-01T00:00:00Z");
    write_rotated_log(&log, &inputs).await;
    manager.index_recordlog(&log).await.expect("index log");

    for input in &inputs {
        let key = Variable::from_proto(input.variable.as_ref().unwrap()).to_canonical();
        let streams = collect_streams(&manager, &key, None, None).await;
        assert_eq!(streams.len(), 1, "one stream for {key}");
        assert_eq!(streams[0].value, input.value, "values roundtrip for {key}");
    }

    manager.shutdown().await;
}

#[tokio::test]
async fn label_patterns_match_across_an_indexed_file() {
    let dir = TempDir::new().unwrap();
    let manager = open_store(dir.path()).await;

    let log = dir.path().join("recordlog.2024-01-01T00:00:00Z");
    write_rotated_log(
        &log,
        &[
            make_stream("/a{host=one}", &[(10, 1.0)]),
            make_stream("/a{host=two}", &[(15, 5.0)]),
            make_stream("/b{host=one}", &[(12, 9.0)]),
        ],
    )
    .await;
    manager.index_recordlog(&log).await.expect("index log");

    assert_eq!(collect_streams(&manager, "/a", None, None).await.len(), 2);
    assert_eq!(
        collect_streams(&manager, "/a{host=one}", None, None).await.len(),
        1
    );
    assert_eq!(collect_streams(&manager, "/*", None, None).await.len(), 3);
    assert_eq!(
        collect_streams(&manager, "/a{host=*}", None, None).await.len(),
        2
    );

    manager.shutdown().await;
}

#[tokio::test]
async fn bloom_filter_short_circuits_absent_names() {
    let dir = TempDir::new().unwrap();
    let manager = open_store(dir.path()).await;

    let log = dir.path().join("recordlog.2024-01-01T00:00:00Z");
    write_rotated_log(&log, &[make_stream("/present", &[(1, 1.0)])]).await;
    manager.index_recordlog(&log).await.expect("index log");
    let files = datastore_files(dir.path());
    assert_eq!(files.len(), 1);
    manager.shutdown().await;

    let file = IndexedStoreFile::new(files[0].clone(), Arc::new(Semaphore::new(4)));
    let absent = Variable::parse("/absolutely/not/here").unwrap();
    let streams = file.get_streams(&absent).await.expect("query file");
    assert!(streams.is_empty());

    let present = Variable::parse("/present").unwrap();
    let streams = file.get_streams(&present).await.expect("query file");
    assert_eq!(streams.len(), 1);
}

#[tokio::test]
async fn query_range_selects_only_overlapping_streams() {
    let dir = TempDir::new().unwrap();
    let manager = open_store(dir.path()).await;

    manager
        .add_value_stream(make_stream("/early", &[(100, 1.0), (200, 1.0)]))
        .await
        .expect("add stream");
    manager
        .add_value_stream(make_stream("/late", &[(5_000, 2.0)]))
        .await
        .expect("add stream");

    let all = collect_streams(&manager, "/*", None, None).await;
    assert_eq!(all.len(), 2);

    // Inclusive endpoints on both sides.
    assert_eq!(collect_streams(&manager, "/*", Some(200), Some(4_999)).await.len(), 1);
    assert_eq!(collect_streams(&manager, "/*", Some(201), Some(4_999)).await.len(), 0);
    assert_eq!(collect_streams(&manager, "/*", Some(201), Some(5_000)).await.len(), 1);
    assert_eq!(collect_streams(&manager, "/*", None, Some(99)).await.len(), 0);

    manager.shutdown().await;
}

#[tokio::test]
async fn record_log_recovers_after_restart() {
    let dir = TempDir::new().unwrap();

    let manager = open_store(dir.path()).await;
    manager
        .add_value_stream(make_stream("/survivor", &[(1, 1.0), (2, 2.0)]))
        .await
        .expect("add stream");
    manager
        .add_value_stream(make_stream("/survivor", &[(3, 3.0)]))
        .await
        .expect("add stream");
    // Shutdown drains the record-log channel; the in-memory map is gone with
    // the manager, leaving the log as the only copy.
    manager.shutdown().await;
    drop(manager);

    let reopened = open_store(dir.path()).await;
    let streams = collect_streams(&reopened, "/survivor", None, None).await;
    assert_eq!(streams.len(), 1);
    let timestamps: Vec<u64> = streams[0].value.iter().map(|v| v.timestamp).collect();
    assert_eq!(timestamps, vec![1, 2, 3]);
    reopened.shutdown().await;
}

#[tokio::test]
async fn header_end_timestamp_records_the_minimum() {
    // The on-disk header format stores the minimum timestamp in both fields;
    // the true maximum lives in the filename. This pins the quirk so an
    // accidental "fix" of the writer shows up here first.
    let dir = TempDir::new().unwrap();
    let manager = open_store(dir.path()).await;

    let log = dir.path().join("recordlog.2024-01-01T00:00:00Z");
    write_rotated_log(&log, &[make_stream("/x", &[(500, 1.0), (900, 2.0)])]).await;
    manager.index_recordlog(&log).await.expect("index log");
    manager.shutdown().await;

    let files = datastore_files(dir.path());
    assert_eq!(files.len(), 1);
    assert!(files[0].ends_with("datastore.900.bin"));

    let mut reader = RecordReader::open(&files[0]).await.expect("open file");
    let header: proto::StoreFileHeader = reader
        .read_next()
        .await
        .expect("read header")
        .expect("header present");
    assert_eq!(header.start_timestamp, 500);
    assert_eq!(header.end_timestamp, 500);
}

#[tokio::test]
async fn queries_span_ram_and_indexed_files() {
    let dir = TempDir::new().unwrap();
    let manager = open_store(dir.path()).await;

    let log = dir.path().join("recordlog.2024-01-01T00:00:00Z");
    write_rotated_log(&log, &[make_stream("/x", &[(1, 1.0)])]).await;
    manager.index_recordlog(&log).await.expect("index log");

    manager
        .add_value_stream(make_stream("/x", &[(100, 2.0)]))
        .await
        .expect("add stream");

    let streams = collect_streams(&manager, "/x", None, None).await;
    assert_eq!(streams.len(), 2, "one stream from disk, one from RAM");
    let mut total_values: Vec<u64> = streams
        .iter()
        .flat_map(|s| s.value.iter().map(|v| v.timestamp))
        .collect();
    total_values.sort_unstable();
    assert_eq!(total_values, vec![1, 100]);

    manager.shutdown().await;
}

#[tokio::test]
async fn merging_combines_small_indexed_files() {
    let dir = TempDir::new().unwrap();
    let manager = StoreManager::open(StoreOptions {
        target_indexed_file_size: Some(10 * 1024 * 1024),
        ..StoreOptions::new(dir.path())
    })
    .await
    .expect("store should open");

    let log_a = dir.path().join("recordlog.2024-01-01T00:00:00Z");
    write_rotated_log(&log_a, &[make_stream("/x", &[(1, 1.0), (2, 2.0)])]).await;
    manager.index_recordlog(&log_a).await.expect("index log");
    let log_b = dir.path().join("recordlog.2024-01-02T00:00:00Z");
    write_rotated_log(&log_b, &[make_stream("/y", &[(10, 5.0)])]).await;
    manager.index_recordlog(&log_b).await.expect("index log");
    assert_eq!(datastore_files(dir.path()).len(), 2);

    manager.merge_indexed_files().await.expect("merge files");

    let files = datastore_files(dir.path());
    assert_eq!(files.len(), 1, "both sources collapse into one file");
    assert!(files[0].ends_with("datastore.10.bin"));
    assert_eq!(manager.indexed_file_count(), 1);

    // Both variables survive the merge.
    assert_eq!(collect_streams(&manager, "/x", None, None).await.len(), 1);
    assert_eq!(collect_streams(&manager, "/y", None, None).await.len(), 1);

    manager.shutdown().await;
}

#[tokio::test]
async fn close_releases_the_file_handle_and_keeps_the_header() {
    let dir = TempDir::new().unwrap();
    let manager = open_store(dir.path()).await;

    let log = dir.path().join("recordlog.2024-01-01T00:00:00Z");
    write_rotated_log(&log, &[make_stream("/x", &[(7, 1.0)])]).await;
    manager.index_recordlog(&log).await.expect("index log");
    manager.shutdown().await;

    let semaphore = Arc::new(Semaphore::new(2));
    let files = datastore_files(dir.path());
    let file = IndexedStoreFile::new(files[0].clone(), Arc::clone(&semaphore));

    file.open().await.expect("open file");
    assert!(file.is_open());
    assert_eq!(semaphore.available_permits(), 1);
    assert_eq!(file.min_timestamp(), 7);
    assert_eq!(file.max_timestamp(), 7);

    file.close().await;
    assert!(!file.is_open());
    assert_eq!(semaphore.available_permits(), 2);

    // Reads after close reopen transparently from the cached header.
    let query = Variable::parse("/x").unwrap();
    let streams = file.get_streams(&query).await.expect("query file");
    assert_eq!(streams.len(), 1);
}

#[tokio::test]
async fn empty_rotated_logs_are_removed_without_writing_a_file() {
    let dir = TempDir::new().unwrap();
    let manager = open_store(dir.path()).await;

    let log = dir.path().join("recordlog.2024-01-01T00:00:00Z");
    write_rotated_log(&log, &[]).await;
    manager.index_recordlog(&log).await.expect("index log");

    assert!(!log.exists());
    assert!(datastore_files(dir.path()).is_empty());
    manager.shutdown().await;
}
