#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs)]

mod common;

use std::ffi::OsStr;
use std::time::Duration;

use accession_fs::fs::{AccessionFs, FsError, InodeAddr, ROOT_INODE};
use accession_fs::remote::FetchError;

use common::{
    CountingFetcher, ScriptedLister, TestFs, accession, build, byte_at, file, options, pool,
};

fn expected(range: std::ops::Range<u64>) -> Vec<u8> {
    range.map(byte_at).collect()
}

fn file_addr(fs: &TestFs, acc: &str, name: &str) -> InodeAddr {
    let dir = fs.lookup(ROOT_INODE, OsStr::new(acc)).unwrap().stat.addr;
    fs.lookup(dir, OsStr::new(name)).unwrap().stat.addr
}

fn with_file(size: &str, fetcher: CountingFetcher) -> (TestFs, u64) {
    let fs = build(
        &[accession("SRR1", vec![file("reads.bam", size)])],
        ScriptedLister::new(10),
        fetcher,
    );
    let addr = file_addr(&fs, "SRR1", "reads.bam");
    let handle = fs.open_file(addr).unwrap();
    (fs, handle)
}

#[tokio::test]
async fn whole_file_reads_fetch_each_chunk_once() {
    let fetcher = CountingFetcher::default();
    let (fs, handle) = with_file("200", fetcher.clone());

    let mut buf = vec![0u8; 300];
    assert_eq!(fs.read_file(handle, 0, &mut buf).await.unwrap(), 200);
    assert_eq!(buf[..200], expected(0..200));
    assert_eq!(fetcher.ranges(), [0..64, 64..128, 128..192, 192..200]);

    let mut again = vec![0u8; 200];
    assert_eq!(fs.read_file(handle, 0, &mut again).await.unwrap(), 200);
    assert_eq!(again, buf[..200]);
    assert_eq!(fetcher.calls(), 4);

    let buffer = fs.file_handle(handle).unwrap().buffer().clone();
    assert!(!buffer.is_dirty());
    assert_eq!(buffer.populated().into_iter().collect::<Vec<_>>(), [0, 64, 128, 192]);
}

#[tokio::test]
async fn reads_spanning_a_chunk_boundary() {
    let fetcher = CountingFetcher::default();
    let (fs, handle) = with_file("200", fetcher.clone());

    let mut buf = [0u8; 10];
    assert_eq!(fs.read_file(handle, 60, &mut buf).await.unwrap(), 10);
    assert_eq!(buf.to_vec(), expected(60..70));
    assert_eq!(fetcher.ranges(), [0..64, 64..128]);
}

#[tokio::test]
async fn reads_at_and_past_end_of_file() {
    let fetcher = CountingFetcher::default();
    let (fs, handle) = with_file("200", fetcher.clone());

    let mut buf = [0u8; 50];
    assert_eq!(fs.read_file(handle, 190, &mut buf).await.unwrap(), 10);
    assert_eq!(buf[..10].to_vec(), expected(190..200));
    assert_eq!(fs.read_file(handle, 200, &mut buf).await.unwrap(), 0);
    assert_eq!(fs.read_file(handle, 5000, &mut buf).await.unwrap(), 0);
    assert_eq!(fetcher.ranges(), [128..192, 192..200]);
}

#[tokio::test]
async fn concurrent_overlapping_reads_share_one_fetch() {
    let fetcher = CountingFetcher::with_delay(Duration::from_millis(50));
    let (fs, handle) = with_file("64", fetcher.clone());

    let mut a = [0u8; 32];
    let mut b = [0u8; 32];
    let (ra, rb) = tokio::join!(
        fs.read_file(handle, 0, &mut a),
        fs.read_file(handle, 16, &mut b),
    );
    assert_eq!(ra.unwrap(), 32);
    assert_eq!(rb.unwrap(), 32);
    assert_eq!(a.to_vec(), expected(0..32));
    assert_eq!(b.to_vec(), expected(16..48));
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn transport_errors_propagate_and_are_not_cached() {
    let fetcher = CountingFetcher::default();
    let (fs, handle) = with_file("100", fetcher.clone());

    fetcher.fail_next(1);
    let mut buf = [0u8; 10];
    let err = fs.read_file(handle, 0, &mut buf).await.unwrap_err();
    assert!(matches!(err, FsError::Transport(FetchError::Connection(_))));
    assert_eq!(err.errno(), libc::EIO);

    assert_eq!(fs.read_file(handle, 0, &mut buf).await.unwrap(), 10);
    assert_eq!(buf.to_vec(), expected(0..10));
    assert_eq!(fetcher.calls(), 2);
}

#[tokio::test]
async fn exhausted_pool_serves_reads_without_retaining() {
    let fetcher = CountingFetcher::default();
    let fs: TestFs = AccessionFs::new(
        &[accession("SRR1", vec![file("reads.bam", "200")])],
        ScriptedLister::new(10),
        fetcher.clone(),
        options(),
        pool(64, 1),
    )
    .unwrap();
    let handle = fs.open_file(file_addr(&fs, "SRR1", "reads.bam")).unwrap();

    let mut buf = vec![0u8; 200];
    assert_eq!(fs.read_file(handle, 0, &mut buf).await.unwrap(), 200);
    assert_eq!(buf, expected(0..200));
    assert_eq!(fs.pool().retained_bytes(), 64);

    let buffer = fs.file_handle(handle).unwrap().buffer().clone();
    assert_eq!(buffer.populated().len(), 1);

    assert_eq!(fs.read_file(handle, 0, &mut buf).await.unwrap(), 200);
    assert_eq!(buf, expected(0..200));
    assert_eq!(fetcher.calls(), 7);
}

#[tokio::test]
async fn preopened_handle_serves_reads() {
    let fetcher = CountingFetcher::default();
    let fs = build(
        &[accession("SRR1", vec![file("reads.bam", "20")])],
        ScriptedLister::new(10),
        fetcher.clone(),
    );
    let addr = file_addr(&fs, "SRR1", "reads.bam");
    let handle = fs.inode(addr).unwrap().lock().preopened.unwrap();

    let mut buf = [0u8; 20];
    assert_eq!(fs.read_file(handle, 0, &mut buf).await.unwrap(), 20);
    assert_eq!(buf.to_vec(), expected(0..20));
}

#[tokio::test]
async fn release_recycles_the_buffer() {
    let fetcher = CountingFetcher::default();
    let (fs, handle) = with_file("200", fetcher);

    let mut buf = [0u8; 100];
    fs.read_file(handle, 0, &mut buf).await.unwrap();
    assert_eq!(fs.pool().retained_bytes(), 128);
    assert!(fs.sync_file(handle).is_ok());

    let idle = fs.pool().idle_count();
    fs.release_file_handle(handle);
    assert_eq!(fs.pool().idle_count(), idle + 1);
    assert_eq!(fs.pool().retained_bytes(), 0);
    assert!(fs.file_handle(handle).is_none());

    // The next open picks the recycled buffer up, empty.
    let addr = file_addr(&fs, "SRR1", "reads.bam");
    let reopened = fs.open_file(addr).unwrap();
    assert_eq!(fs.pool().idle_count(), idle);
    let buffer = fs.file_handle(reopened).unwrap().buffer().clone();
    assert!(buffer.is_dirty());
    assert_eq!(buffer.size(), 200);
}

#[tokio::test]
async fn memory_hint_drops_idle_buffers_only() {
    let (fs, handle) = with_file("200", CountingFetcher::default());
    let addr = file_addr(&fs, "SRR1", "reads.bam");
    let second = fs.open_file(addr).unwrap();
    fs.release_file_handle(second);
    assert_eq!(fs.pool().idle_count(), 1);

    let inodes = fs.table().len();
    fs.release_memory_hint();
    assert_eq!(fs.pool().idle_count(), 0);
    assert_eq!(fs.table().len(), inodes);

    let mut buf = [0u8; 8];
    assert_eq!(fs.read_file(handle, 0, &mut buf).await.unwrap(), 8);
}
