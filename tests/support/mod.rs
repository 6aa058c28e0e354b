#![allow(dead_code)]

use futures::StreamExt;
use rangecache::fetcher::{ByteStream, FetchError, MemoryRangeFetcher, RangeFetcher};
use rangecache::ByteRange;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Initialize tracing for tests with proper test output handling
pub fn tracing_init() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Deterministic file contents; byte `i` is `i % 251`
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Poll `condition` every few milliseconds until it holds
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Await `future` or panic after a generous timeout
pub async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(10), future)
        .await
        .expect("Timed out")
}

/// In-memory fetcher that can fail, slow down, and record connections
///
/// Each call to `fetch` is recorded. The first `failures` calls return
/// `failure_status` instead of a stream.
pub struct TestFetcher {
    inner: MemoryRangeFetcher,
    failures: AtomicU32,
    failure_status: u16,
    chunk_delay: Option<Duration>,
    requests: Mutex<Vec<ByteRange>>,
}

impl TestFetcher {
    pub fn new(data: Vec<u8>, chunk_size: usize) -> Self {
        Self {
            inner: MemoryRangeFetcher::new(data, chunk_size),
            failures: AtomicU32::new(0),
            failure_status: 503,
            chunk_delay: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Fail the next `count` fetches with HTTP `status`
    pub fn failing(self, count: u32, status: u16) -> Self {
        self.failures.store(count, Ordering::SeqCst);
        Self {
            failure_status: status,
            ..self
        }
    }

    /// Sleep before delivering every chunk
    pub fn with_chunk_delay(self, delay: Duration) -> Self {
        Self {
            chunk_delay: Some(delay),
            ..self
        }
    }

    pub fn requests(&self) -> Vec<ByteRange> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl RangeFetcher for TestFetcher {
    fn size(&self) -> u64 {
        self.inner.size()
    }

    fn source_id(&self) -> &str {
        "test"
    }

    async fn fetch(&self, range: ByteRange) -> Result<ByteStream, FetchError> {
        self.requests.lock().unwrap().push(range);

        let fail = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(FetchError::Http {
                status: self.failure_status,
                message: "Injected failure".into(),
            });
        }

        let stream = self.inner.fetch(range).await?;
        match self.chunk_delay {
            Some(delay) => Ok(stream
                .then(move |chunk| async move {
                    tokio::time::sleep(delay).await;
                    chunk
                })
                .boxed()),
            None => Ok(stream),
        }
    }
}
