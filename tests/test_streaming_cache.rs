//! End-to-end behavior of the streaming cache over in-memory fetchers

mod support;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rangecache::{ByteRange, CacheConfig, CacheError, CacheEvent, StreamingRangeCache};
use std::sync::Arc;
use std::time::Duration;
use support::{pattern, tracing_init, wait_until, within, TestFetcher};

const KB: u64 = 1024;

fn bounded(cache_size: u64) -> CacheConfig {
    CacheConfig {
        cache_size_bytes: Some(cache_size),
        block_size_bytes: 4 * KB,
        continue_downloading_threshold: 32 * KB,
        max_retries: 3,
        retry_base_delay_ms: 1,
    }
}

fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<CacheEvent>) -> Vec<CacheEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn covered_bytes(cache: &StreamingRangeCache) -> u64 {
    cache.downloaded_ranges().iter().map(ByteRange::len).sum()
}

#[tokio::test]
async fn test_random_reads_bounded_cache() {
    tracing_init();
    let data = pattern(2 * 1024 * 1024);
    let fetcher = Arc::new(TestFetcher::new(data.clone(), 4 * KB as usize));
    let cache_size = 64 * KB;
    let cache = StreamingRangeCache::new(fetcher, bounded(cache_size)).expect("Failed to create cache");

    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..200 {
        let length = rng.gen_range(1..=cache_size);
        let offset = rng.gen_range(0..=data.len() as u64 - length);

        let bytes = within(cache.read(offset, length))
            .await
            .unwrap_or_else(|e| panic!("Read at {} of {} failed: {}", offset, length, e));
        assert_eq!(bytes, data[offset as usize..(offset + length) as usize].to_vec());
    }

    // Eviction may only overshoot by pinned blocks
    assert!(covered_bytes(&cache) <= 3 * cache_size);
}

#[tokio::test]
async fn test_sequential_reads_unbounded_cache() {
    tracing_init();
    let data = pattern(512 * 1024);
    let fetcher = Arc::new(TestFetcher::new(data.clone(), 8 * KB as usize));
    let cache = StreamingRangeCache::new(fetcher, CacheConfig::unbounded())
        .expect("Failed to create cache");

    let mut offset = 0u64;
    while offset < data.len() as u64 {
        let length = (10_000).min(data.len() as u64 - offset);
        let bytes = within(cache.read(offset, length)).await.expect("Read failed");
        assert_eq!(bytes, data[offset as usize..(offset + length) as usize].to_vec());
        offset += length;
    }
}

#[tokio::test]
async fn test_unbounded_cache_downloads_whole_file_eagerly() {
    tracing_init();
    let data = pattern(1024 * 1024);
    let fetcher = Arc::new(TestFetcher::new(data.clone(), 16 * KB as usize));
    let cache = StreamingRangeCache::new(fetcher.clone(), CacheConfig::unbounded())
        .expect("Failed to create cache");

    let whole = ByteRange::new(0, data.len() as u64);
    assert!(
        wait_until(Duration::from_secs(5), || {
            cache.downloaded_ranges() == vec![whole] && cache.active_connection().is_none()
        })
        .await,
        "Whole file was not downloaded: {:?}",
        cache.downloaded_ranges()
    );
    assert_eq!(fetcher.requests(), vec![whole]);

    // Everything is local now
    let mut events = cache.subscribe();
    let bytes = cache.read(300_000, 50_000).await.expect("Read failed");
    assert_eq!(bytes, data[300_000..350_000].to_vec());
    assert_eq!(
        drain(&mut events),
        vec![CacheEvent::ReadResolved {
            range: ByteRange::new(300_000, 350_000)
        }]
    );
    assert_eq!(fetcher.requests().len(), 1);
}

#[tokio::test]
async fn test_bounded_cache_stays_idle_without_reads() {
    let fetcher = Arc::new(TestFetcher::new(pattern(100_000), 1_000));
    let cache = StreamingRangeCache::new(fetcher.clone(), bounded(10_000))
        .expect("Failed to create cache");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(fetcher.requests().is_empty());
    assert_eq!(cache.active_connection(), None);
}

#[tokio::test]
async fn test_cached_read_starts_no_connection() {
    tracing_init();
    let data = pattern(1024 * 1024);
    let fetcher = Arc::new(TestFetcher::new(data.clone(), 4 * KB as usize));
    let cache = StreamingRangeCache::new(fetcher.clone(), bounded(64 * KB))
        .expect("Failed to create cache");

    let bytes = within(cache.read(0, 1_000)).await.expect("Read failed");
    assert_eq!(bytes, data[..1_000].to_vec());

    // Read-ahead stops once it is a cache's worth past the last read
    assert!(wait_until(Duration::from_secs(5), || cache.active_connection().is_none()).await);
    assert_eq!(fetcher.requests(), vec![ByteRange::new(0, data.len() as u64)]);
    assert!(cache
        .downloaded_ranges()
        .iter()
        .any(|r| r.contains(&ByteRange::new(0, 1_000 + 64 * KB))));

    let mut events = cache.subscribe();
    let bytes = cache.read(100, 200).await.expect("Read failed");
    assert_eq!(bytes, data[100..300].to_vec());

    let events = drain(&mut events);
    assert!(!events
        .iter()
        .any(|e| matches!(e, CacheEvent::ConnectionStarted { .. })));
    assert_eq!(fetcher.requests().len(), 1);
}

#[tokio::test]
async fn test_far_read_supersedes_connection() {
    tracing_init();
    let data = pattern(1024 * 1024);
    let fetcher = Arc::new(
        TestFetcher::new(data.clone(), KB as usize).with_chunk_delay(Duration::from_millis(2)),
    );
    let config = CacheConfig {
        continue_downloading_threshold: 32 * KB,
        ..CacheConfig::unbounded()
    };
    let cache = StreamingRangeCache::new(fetcher.clone(), config).expect("Failed to create cache");
    let mut events = cache.subscribe();

    // The eager whole-file connection is far behind this read
    let bytes = within(cache.read(800_000, 1_000)).await.expect("Read failed");
    assert_eq!(bytes, data[800_000..801_000].to_vec());

    let requests = fetcher.requests();
    assert_eq!(requests[0], ByteRange::new(0, data.len() as u64));
    assert_eq!(requests[1].start, 800_000);

    let events = drain(&mut events);
    assert!(events
        .iter()
        .any(|e| matches!(e, CacheEvent::ConnectionSuperseded { .. })));
}

#[tokio::test]
async fn test_near_read_keeps_connection() {
    let data = pattern(256 * 1024);
    let fetcher = Arc::new(
        TestFetcher::new(data.clone(), KB as usize).with_chunk_delay(Duration::from_millis(1)),
    );
    let cache = StreamingRangeCache::new(fetcher.clone(), CacheConfig::unbounded())
        .expect("Failed to create cache");

    // Within the continue threshold of the eager connection
    let bytes = within(cache.read(20_000, 1_000)).await.expect("Read failed");
    assert_eq!(bytes, data[20_000..21_000].to_vec());
    assert_eq!(fetcher.requests(), vec![ByteRange::new(0, data.len() as u64)]);
}

#[tokio::test]
async fn test_invalid_reads_are_rejected() {
    let fetcher = Arc::new(TestFetcher::new(pattern(10_000), 1_000));
    let cache = StreamingRangeCache::new(fetcher.clone(), bounded(4 * KB))
        .expect("Failed to create cache");

    assert!(matches!(
        cache.read(0, 4 * KB + 1).await,
        Err(CacheError::RequestTooLarge { .. })
    ));
    assert!(matches!(
        cache.read(9_999, 2).await,
        Err(CacheError::OutOfBounds { .. })
    ));
    assert!(fetcher.requests().is_empty());
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    tracing_init();
    let data = pattern(100_000);
    let fetcher = Arc::new(TestFetcher::new(data.clone(), 1_000).failing(2, 503));
    let cache = StreamingRangeCache::new(fetcher.clone(), bounded(32 * KB))
        .expect("Failed to create cache");
    let mut events = cache.subscribe();

    let bytes = within(cache.read(50_000, 2_000)).await.expect("Read failed");
    assert_eq!(bytes, data[50_000..52_000].to_vec());

    let requests = fetcher.requests();
    assert!(requests.len() >= 3);
    assert!(requests[..3].iter().all(|r| r.start == 50_000));

    let attempts: Vec<u32> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            CacheEvent::ConnectionFailed { attempt, .. } => Some(attempt),
            _ => None,
        })
        .collect();
    assert_eq!(attempts, vec![1, 2]);
}

#[tokio::test]
async fn test_exhausted_retries_fail_reads() {
    let fetcher = Arc::new(TestFetcher::new(pattern(100_000), 1_000).failing(100, 503));
    let config = CacheConfig {
        max_retries: 2,
        ..bounded(32 * KB)
    };
    let cache = StreamingRangeCache::new(fetcher.clone(), config).expect("Failed to create cache");

    let result = within(cache.read(0, 1_000)).await;
    assert!(matches!(result, Err(CacheError::Fetch { .. })), "{:?}", result);
    assert_eq!(fetcher.requests().len(), 3);
    assert_eq!(cache.pending_reads(), 0);
}

#[tokio::test]
async fn test_permanent_failure_is_not_retried() {
    let fetcher = Arc::new(TestFetcher::new(pattern(100_000), 1_000).failing(1, 403));
    let cache = StreamingRangeCache::new(fetcher.clone(), bounded(32 * KB))
        .expect("Failed to create cache");

    let result = within(cache.read(0, 1_000)).await;
    match result {
        Err(CacheError::Fetch { range, message }) => {
            assert_eq!(range.start, 0);
            assert!(message.contains("403"), "{}", message);
        }
        other => panic!("Expected fetch error, got {:?}", other),
    }
    assert_eq!(fetcher.requests().len(), 1);

    // The next read starts a fresh connection
    let bytes = within(cache.read(0, 1_000)).await.expect("Read failed");
    assert_eq!(bytes.len(), 1_000);
}

#[tokio::test]
async fn test_close_fails_pending_reads() {
    let fetcher = Arc::new(
        TestFetcher::new(pattern(100_000), 100).with_chunk_delay(Duration::from_millis(200)),
    );
    let cache = StreamingRangeCache::new(fetcher, bounded(32 * KB)).expect("Failed to create cache");

    let reader = cache.clone();
    let pending = tokio::spawn(async move { reader.read(10_000, 5_000).await });

    assert!(wait_until(Duration::from_secs(5), || cache.pending_reads() == 1).await);
    cache.close();

    let result = within(pending).await.expect("Read task panicked");
    assert_eq!(result, Err(CacheError::Closed));
    assert_eq!(cache.active_connection(), None);
    assert_eq!(cache.read(0, 10).await, Err(CacheError::Closed));
}

#[tokio::test]
async fn test_concurrent_readers_resolve_in_order() {
    tracing_init();
    let data = pattern(256 * 1024);
    let fetcher = Arc::new(TestFetcher::new(data.clone(), 2 * KB as usize));
    let cache = StreamingRangeCache::new(fetcher, bounded(64 * KB)).expect("Failed to create cache");

    let offsets = [0u64, 100_000, 5_000, 200_000, 150_000];
    let handles: Vec<_> = offsets
        .iter()
        .map(|&offset| {
            let cache = cache.clone();
            tokio::spawn(async move { (offset, cache.read(offset, 8 * KB).await) })
        })
        .collect();

    for handle in handles {
        let (offset, result) = within(handle).await.expect("Read task panicked");
        let bytes = result.expect("Read failed");
        assert_eq!(bytes, data[offset as usize..(offset + 8 * KB) as usize].to_vec());
    }
}
