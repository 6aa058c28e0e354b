//! Streaming cache over a byte-range transport.
//!
//! [`StreamingRangeCache`] serves random-access reads of a large remote file.
//! It keeps a FIFO of pending reads and at most one connection in flight, and
//! asks [`scheduler::plan`] what to fetch after every change: a read enqueued,
//! a chunk received, a connection finished or failed. Downloaded bytes live in
//! a block store that evicts least recently used blocks when the cache is
//! bounded.

mod block_store;
mod events;

pub use events::{CacheEvent, CacheEventHandle};

use crate::config::CacheConfig;
use crate::fetcher::{FetchError, RangeFetcher};
use crate::range::ByteRange;
use crate::scheduler::{self, CacheBudget, SchedulerError, SchedulerState, READ_AHEAD_BUFFER_SIZE};
use block_store::BlockStore;
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc as tokio_mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const MAX_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Errors delivered to readers of a [`StreamingRangeCache`]
///
/// `Clone` so a single failure can be handed to every waiting reader.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("Read of {length} bytes at offset {offset} is outside file of {file_size} bytes")]
    OutOfBounds {
        offset: u64,
        length: u64,
        file_size: u64,
    },
    #[error("Read of {length} bytes exceeds max request size of {max_request_size} bytes")]
    RequestTooLarge { length: u64, max_request_size: u64 },
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
    #[error("Fetch failed for {range}: {message}")]
    Fetch { range: ByteRange, message: String },
    #[error("Cache closed")]
    Closed,
    #[error("Runtime error: {0}")]
    Runtime(String),
    #[error("Configuration error: {0}")]
    Config(String),
}

/// A pending consumer read
struct ReadRequest {
    range: ByteRange,
    tx: oneshot::Sender<Result<Vec<u8>, CacheError>>,
}

/// The download in flight
struct Connection {
    id: u64,
    /// Bytes not yet delivered
    remaining: ByteRange,
    task: JoinHandle<()>,
}

struct CacheState {
    store: BlockStore,
    read_requests: VecDeque<ReadRequest>,
    connection: Option<Connection>,
    last_resolved_end: Option<u64>,
    next_connection_id: u64,
    /// Consecutive failed connections without any bytes received
    failures: u32,
    closed: bool,
}

impl CacheState {
    fn is_current(&self, id: u64) -> bool {
        self.connection.as_ref().is_some_and(|c| c.id == id)
    }

    /// Drop reads whose caller stopped waiting
    fn discard_cancelled_reads(&mut self) {
        self.read_requests.retain(|request| !request.tx.is_closed());
    }

    fn fail_reads(&mut self, err: &CacheError) {
        for request in self.read_requests.drain(..) {
            let _ = request.tx.send(Err(err.clone()));
        }
    }
}

struct Inner {
    fetcher: Arc<dyn RangeFetcher>,
    config: CacheConfig,
    budget: CacheBudget,
    events: CacheEventHandle,
    runtime: tokio::runtime::Handle,
    state: Mutex<CacheState>,
}

/// Random-access reads over a file fetched with byte-range connections
///
/// Cheap to clone; all clones share one cache. Dropping the last clone stops
/// the connection in flight.
#[derive(Clone)]
pub struct StreamingRangeCache {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for StreamingRangeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingRangeCache")
            .field("source", &self.inner.fetcher.source_id())
            .field("budget", &self.inner.budget)
            .finish()
    }
}

impl StreamingRangeCache {
    /// Create a cache over `fetcher`
    ///
    /// Must be called from within a tokio runtime. An unbounded cache starts
    /// downloading the whole file immediately.
    pub fn new(fetcher: Arc<dyn RangeFetcher>, config: CacheConfig) -> Result<Self, CacheError> {
        config
            .validate()
            .map_err(|e| CacheError::Config(e.to_string()))?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| CacheError::Runtime(e.to_string()))?;

        let file_size = fetcher.size();
        let budget = config.budget(file_size);
        info!(
            "StreamingRangeCache: {} ({} bytes, {})",
            fetcher.source_id(),
            file_size,
            if budget.is_unbounded() {
                "unbounded".to_string()
            } else {
                format!("{} byte budget", budget.max_request_size)
            }
        );

        let store = BlockStore::new(file_size, config.block_size_bytes, config.cache_size_bytes);
        let inner = Arc::new(Inner {
            fetcher,
            config,
            budget,
            events: CacheEventHandle::new(),
            runtime,
            state: Mutex::new(CacheState {
                store,
                read_requests: VecDeque::new(),
                connection: None,
                last_resolved_end: None,
                next_connection_id: 1,
                failures: 0,
                closed: false,
            }),
        });

        {
            let mut state = inner.lock_state();
            inner.schedule(&mut state);
        }

        Ok(Self { inner })
    }

    /// Read `length` bytes at `offset`, waiting for them to be downloaded
    pub async fn read(&self, offset: u64, length: u64) -> Result<Vec<u8>, CacheError> {
        let budget = self.inner.budget;
        let end = offset
            .checked_add(length)
            .filter(|end| *end <= budget.file_size)
            .ok_or(CacheError::OutOfBounds {
                offset,
                length,
                file_size: budget.file_size,
            })?;
        if length == 0 {
            return Ok(Vec::new());
        }
        if length > budget.max_request_size {
            return Err(CacheError::RequestTooLarge {
                length,
                max_request_size: budget.max_request_size,
            });
        }

        let range = ByteRange::new(offset, end);
        let rx = {
            let mut state = self.inner.lock_state();
            if state.closed {
                return Err(CacheError::Closed);
            }

            if let Some(data) = state.store.read(range) {
                state.last_resolved_end = Some(range.end);
                self.inner.events.emit(CacheEvent::ReadResolved { range });
                self.inner.schedule(&mut state);
                return Ok(data);
            }

            let (tx, rx) = oneshot::channel();
            state.read_requests.push_back(ReadRequest { range, tx });
            self.inner.schedule(&mut state);
            rx
        };

        rx.await.map_err(|_| CacheError::Closed)?
    }

    /// Stop fetching and fail every pending read with [`CacheError::Closed`]
    pub fn close(&self) {
        let mut state = self.inner.lock_state();
        state.closed = true;
        if let Some(connection) = state.connection.take() {
            connection.task.abort();
        }
        state.fail_reads(&CacheError::Closed);
        info!("StreamingRangeCache: closed {}", self.inner.fetcher.source_id());
    }

    pub fn file_size(&self) -> u64 {
        self.inner.budget.file_size
    }

    pub fn source_id(&self) -> &str {
        self.inner.fetcher.source_id()
    }

    pub fn budget(&self) -> CacheBudget {
        self.inner.budget
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Ranges currently held in the cache
    pub fn downloaded_ranges(&self) -> Vec<ByteRange> {
        self.inner.lock_state().store.downloaded().to_vec()
    }

    /// Remaining range of the connection in flight
    pub fn active_connection(&self) -> Option<ByteRange> {
        self.inner
            .lock_state()
            .connection
            .as_ref()
            .map(|c| c.remaining)
    }

    pub fn pending_reads(&self) -> usize {
        self.inner.lock_state().read_requests.len()
    }

    /// Subscribe to cache events; dropping the receiver unsubscribes
    pub fn subscribe(&self) -> tokio_mpsc::UnboundedReceiver<CacheEvent> {
        self.inner.events.subscribe_all()
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, CacheState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Ask the scheduler what to fetch and act on the answer
    fn schedule(self: &Arc<Self>, state: &mut CacheState) {
        if state.closed {
            return;
        }
        state.discard_cancelled_reads();

        let next_read_request = state.read_requests.front().map(|r| r.range);
        if next_read_request.is_none() && state.connection.is_none() && self.prefetch_satisfied(state)
        {
            return;
        }

        let snapshot = SchedulerState {
            active_connection: state.connection.as_ref().map(|c| c.remaining),
            next_read_request,
            downloaded: state.store.downloaded(),
            last_resolved_end: state.last_resolved_end,
            budget: self.budget,
        };

        match scheduler::plan(&snapshot) {
            Ok(None) => {}
            Ok(Some(range)) => self.start_connection(state, range),
            Err(err) => {
                error!(
                    "StreamingRangeCache: scheduler rejected state of {}: {}",
                    self.fetcher.source_id(),
                    err
                );
                state.fail_reads(&CacheError::Scheduler(err));
            }
        }
    }

    /// Replace any connection in flight with one fetching `range`
    fn start_connection(self: &Arc<Self>, state: &mut CacheState, range: ByteRange) {
        if let Some(previous) = state.connection.take() {
            previous.task.abort();
            debug!(
                "StreamingRangeCache: superseding connection {} (remaining {}) with {}",
                previous.id, previous.remaining, range
            );
            self.events.emit(CacheEvent::ConnectionSuperseded {
                remaining: previous.remaining,
            });
        }

        let id = state.next_connection_id;
        state.next_connection_id += 1;
        debug!("StreamingRangeCache: connection {} fetching {}", id, range);

        let task = self
            .runtime
            .spawn(run_connection(Arc::downgrade(self), id, range));
        state.connection = Some(Connection {
            id,
            remaining: range,
            task,
        });
        self.events.emit(CacheEvent::ConnectionStarted { range });
    }

    /// Store a chunk of connection `id` that starts at `position`
    ///
    /// Returns the next expected position, or `None` when the connection
    /// should stop reading.
    fn receive_chunk(
        self: &Arc<Self>,
        id: u64,
        position: u64,
        end: u64,
        chunk: &[u8],
    ) -> Option<u64> {
        let mut state = self.lock_state();
        if !state.is_current(id) {
            return None;
        }
        if chunk.is_empty() {
            return Some(position);
        }

        // Servers may send more than asked for
        let take = (chunk.len() as u64).min(end - position);
        let received = ByteRange::new(position, position + take);

        let pins = self.eviction_pins(&mut state);
        let evicted = state
            .store
            .write(position, &chunk[..take as usize], &pins);
        state.failures = 0;

        self.events.emit(CacheEvent::ChunkReceived { range: received });
        if !evicted.is_empty() {
            debug!("StreamingRangeCache: evicted {} blocks", evicted.len());
            self.events
                .emit(CacheEvent::RangesEvicted { ranges: evicted });
        }

        self.resolve_reads(&mut state);

        if received.end >= end {
            return None;
        }
        if let Some(connection) = state.connection.as_mut() {
            connection.remaining.start = received.end;
        }

        if state.read_requests.is_empty() {
            if let Some(horizon) = self.prefetch_horizon(state.last_resolved_end) {
                if received.end >= horizon {
                    debug!(
                        "StreamingRangeCache: read-ahead reached {}, stopping connection {}",
                        horizon, id
                    );
                    return None;
                }
            }
        }

        self.schedule(&mut state);
        Some(received.end)
    }

    /// Ranges eviction must keep: the head read and the prefetch window
    fn eviction_pins(&self, state: &mut CacheState) -> Vec<ByteRange> {
        state.discard_cancelled_reads();
        state
            .read_requests
            .front()
            .map(|r| r.range)
            .into_iter()
            .chain(self.prefetch_window(state.last_resolved_end))
            .collect()
    }

    /// Resolve every queued read that is now fully downloaded, in FIFO order
    fn resolve_reads(&self, state: &mut CacheState) {
        let mut index = 0;
        while index < state.read_requests.len() {
            let (range, cancelled) = {
                let request = &state.read_requests[index];
                (request.range, request.tx.is_closed())
            };
            if cancelled {
                state.read_requests.remove(index);
                continue;
            }

            match state.store.read(range) {
                Some(data) => {
                    if let Some(request) = state.read_requests.remove(index) {
                        let _ = request.tx.send(Ok(data));
                    }
                    state.last_resolved_end = Some(range.end);
                    self.events.emit(CacheEvent::ReadResolved { range });
                }
                None => index += 1,
            }
        }
    }

    /// Clear connection `id` after its stream ended
    ///
    /// Returns the delay before retrying when the connection failed and
    /// another attempt is allowed.
    fn finish_connection(
        self: &Arc<Self>,
        id: u64,
        range: ByteRange,
        outcome: Result<(), FetchError>,
    ) -> Option<Duration> {
        let mut state = self.lock_state();
        if !state.is_current(id) {
            return None;
        }
        let remaining = state
            .connection
            .take()
            .map(|c| c.remaining)
            .unwrap_or(range);

        match outcome {
            Ok(()) => {
                debug!("StreamingRangeCache: connection {} finished", id);
                self.events.emit(CacheEvent::ConnectionFinished { range });
                self.schedule(&mut state);
                None
            }
            Err(err) => {
                state.failures += 1;
                let attempt = state.failures;
                warn!(
                    "StreamingRangeCache: connection {} for {} failed (attempt {}): {}",
                    id, remaining, attempt, err
                );
                self.events.emit(CacheEvent::ConnectionFailed {
                    range: remaining,
                    message: err.to_string(),
                    attempt,
                });

                if !err.is_transient() || attempt > self.config.max_retries {
                    error!(
                        "StreamingRangeCache: giving up on {} after {} attempts: {}",
                        remaining, attempt, err
                    );
                    state.failures = 0;
                    state.fail_reads(&CacheError::Fetch {
                        range: remaining,
                        message: err.to_string(),
                    });
                    return None;
                }

                Some(self.retry_delay(attempt))
            }
        }
    }

    fn retry(self: &Arc<Self>) {
        let mut state = self.lock_state();
        // A new read may already have restarted fetching
        if state.connection.is_some() {
            return;
        }
        self.schedule(&mut state);
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.config.retry_base_delay_ms.saturating_mul(factor))
            .min(MAX_RETRY_DELAY)
    }

    /// Furthest offset idle read-ahead may reach; `None` when unbounded
    fn prefetch_horizon(&self, anchor: Option<u64>) -> Option<u64> {
        if self.budget.is_unbounded() {
            return None;
        }
        let window = READ_AHEAD_BUFFER_SIZE.min(self.budget.max_request_size);
        anchor.map(|anchor| anchor.saturating_add(window).min(self.budget.file_size))
    }

    fn prefetch_window(&self, anchor: Option<u64>) -> Option<ByteRange> {
        let start = anchor?;
        let end = self.prefetch_horizon(anchor)?;
        (start < end).then(|| ByteRange::new(start, end))
    }

    /// Whether a bounded cache already holds everything up to its horizon
    fn prefetch_satisfied(&self, state: &CacheState) -> bool {
        match (state.last_resolved_end, self.prefetch_horizon(state.last_resolved_end)) {
            (Some(anchor), Some(horizon)) => {
                state.store.downloaded().next_gap_start(anchor) >= horizon
            }
            _ => false,
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self
            .state
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(connection) = state.connection.take() {
            connection.task.abort();
        }
    }
}

/// Task body of one connection
async fn run_connection(inner: Weak<Inner>, id: u64, range: ByteRange) {
    let outcome = stream_connection(&inner, id, range).await;

    let retry_after = match inner.upgrade() {
        Some(inner) => inner.finish_connection(id, range, outcome),
        None => return,
    };

    if let Some(delay) = retry_after {
        tokio::time::sleep(delay).await;
        if let Some(inner) = inner.upgrade() {
            inner.retry();
        }
    }
}

async fn stream_connection(inner: &Weak<Inner>, id: u64, range: ByteRange) -> Result<(), FetchError> {
    let fetcher = match inner.upgrade() {
        Some(inner) => Arc::clone(&inner.fetcher),
        None => return Ok(()),
    };
    let mut stream = fetcher.fetch(range).await?;

    let mut position = range.start;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        let Some(inner) = inner.upgrade() else {
            return Ok(());
        };
        match inner.receive_chunk(id, position, range.end, &chunk) {
            Some(next) => position = next,
            None => return Ok(()),
        }
    }

    if position < range.end {
        return Err(FetchError::UnexpectedEnd {
            expected: range.len(),
            actual: position - range.start,
        });
    }
    Ok(())
}
