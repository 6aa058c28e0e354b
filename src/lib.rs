// Library exports for the CLI and integration tests

pub mod cache;
pub mod config;
pub mod fetcher;
pub mod range;
pub mod reader;
pub mod scheduler;

pub use cache::{CacheError, CacheEvent, StreamingRangeCache};
pub use config::{CacheConfig, HttpConfig};
pub use fetcher::{FetchError, RangeFetcher};
pub use range::{ByteRange, RangeSet};
pub use reader::CachedFileReader;
pub use scheduler::{plan, CacheBudget, SchedulerError, SchedulerState, READ_AHEAD_BUFFER_SIZE};
