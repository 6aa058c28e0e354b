//! Connection scheduling for range-request streaming
//!
//! [`plan`] decides whether the cache should open a new range connection and
//! which bytes it should cover. It is a pure function of a [`SchedulerState`]
//! snapshot: no I/O, no locking, identical inputs give identical outputs.
//! The orchestrator owns all mutable state and calls it after every change.

use crate::range::{ByteRange, RangeSet};
use thiserror::Error;

/// Read-ahead window for a single connection (50 MiB)
pub const READ_AHEAD_BUFFER_SIZE: u64 = 50 * 1024 * 1024;

/// Fixed limits for one cache instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheBudget {
    /// Largest range a single read request may ask for
    pub max_request_size: u64,
    pub file_size: u64,
    /// How far (in bytes) a read target may be ahead of the active
    /// connection before the connection is redirected
    pub continue_downloading_threshold: u64,
}

impl CacheBudget {
    /// The cache can hold the whole file
    pub fn is_unbounded(&self) -> bool {
        self.max_request_size >= self.file_size
    }
}

/// Snapshot of the cache state handed to [`plan`]
#[derive(Debug, Clone, Copy)]
pub struct SchedulerState<'a> {
    /// Remaining range of the connection in flight
    pub active_connection: Option<ByteRange>,
    /// Head of the read-request queue
    pub next_read_request: Option<ByteRange>,
    pub downloaded: &'a RangeSet,
    /// End offset of the most recently resolved read
    pub last_resolved_end: Option<u64>,
    pub budget: CacheBudget,
}

/// Caller bugs detected while planning
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("Read request of {length} bytes exceeds max request size of {max_request_size} bytes")]
    RequestTooLarge { length: u64, max_request_size: u64 },
    #[error("Read request {range} is already downloaded and should have been resolved")]
    InvariantViolation { range: ByteRange },
}

/// Decide the range the next connection should fetch
///
/// Returns `Ok(None)` when no new connection should be started: either the
/// running one is close enough to the pending read, or there is nothing
/// worth fetching.
pub fn plan(state: &SchedulerState<'_>) -> Result<Option<ByteRange>, SchedulerError> {
    let budget = &state.budget;

    match state.next_read_request {
        Some(request) => {
            if request.len() > budget.max_request_size {
                return Err(SchedulerError::RequestTooLarge {
                    length: request.len(),
                    max_request_size: budget.max_request_size,
                });
            }
            if state.downloaded.is_fully_covered(request) {
                return Err(SchedulerError::InvariantViolation { range: request });
            }

            // Also true when the connection is already past the request start
            if let Some(active) = state.active_connection {
                if request.start <= active.start.saturating_add(budget.continue_downloading_threshold)
                {
                    return Ok(None);
                }
            }

            Ok(plan_from_anchor(request.start, state.downloaded, budget))
        }
        None => {
            if state.active_connection.is_some() {
                return Ok(None);
            }

            let anchor = match state.last_resolved_end {
                Some(end) => end,
                None if budget.is_unbounded() => 0,
                None => return Ok(None),
            };

            Ok(plan_from_anchor(anchor, state.downloaded, budget))
        }
    }
}

fn plan_from_anchor(anchor: u64, downloaded: &RangeSet, budget: &CacheBudget) -> Option<ByteRange> {
    let start = downloaded.next_gap_start(anchor);
    if start >= budget.file_size {
        return None;
    }

    let cap = if budget.is_unbounded() {
        budget.file_size
    } else {
        start
            .saturating_add(READ_AHEAD_BUFFER_SIZE)
            .min(budget.file_size)
    };
    let stop = downloaded
        .next_covered_range_start(start)
        .unwrap_or(budget.file_size);

    Some(ByteRange::new(start, cap.min(stop)))
}
