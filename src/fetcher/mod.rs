//! Byte-range transports feeding the streaming cache.
//!
//! A [`RangeFetcher`] opens one connection for a [`ByteRange`] and yields its
//! bytes as a stream of chunks in file order. The cache decides which ranges to
//! fetch; fetchers only move bytes.

mod file;
mod http;
mod memory;

pub use file::FileRangeFetcher;
pub use http::HttpRangeFetcher;
pub use memory::MemoryRangeFetcher;

use crate::range::ByteRange;
use futures::stream::BoxStream;
use thiserror::Error;

/// Chunks of a single range connection, in order
pub type ByteStream = BoxStream<'static, Result<Vec<u8>, FetchError>>;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("HTTP error: {status} - {message}")]
    Http { status: u16, message: String },
    #[error("Resource not found: {url}")]
    NotFound { url: String },
    #[error("Server does not support range requests")]
    RangeNotSupported,
    #[error("Server did not report a content length")]
    MissingContentLength,
    #[error("Unexpected status {status} for range {range}")]
    UnexpectedStatus { status: u16, range: ByteRange },
    #[error("Server answered range {range} with Content-Range {served:?}")]
    ContentRangeMismatch { range: ByteRange, served: String },
    #[error("Unexpected end of data: expected {expected} bytes, got {actual}")]
    UnexpectedEnd { expected: u64, actual: u64 },
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FetchError {
    /// Whether retrying the same range may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Network(_) | FetchError::Io(_) | FetchError::UnexpectedEnd { .. } => true,
            FetchError::Http { status, .. } => *status >= 500 || *status == 429,
            FetchError::NotFound { .. }
            | FetchError::RangeNotSupported
            | FetchError::MissingContentLength
            | FetchError::UnexpectedStatus { .. }
            | FetchError::ContentRangeMismatch { .. } => false,
        }
    }
}

/// Transport that can fetch arbitrary byte ranges of one file
#[async_trait::async_trait]
pub trait RangeFetcher: Send + Sync {
    /// Total size of the file in bytes
    fn size(&self) -> u64;

    /// Identifier for logs, e.g. the URL or path
    fn source_id(&self) -> &str;

    /// Open a connection delivering exactly the bytes of `range`
    async fn fetch(&self, range: ByteRange) -> Result<ByteStream, FetchError>;
}
