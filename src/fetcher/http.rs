use super::{ByteStream, FetchError, RangeFetcher};
use crate::config::HttpConfig;
use crate::range::ByteRange;
use futures::stream::{self, StreamExt, TryStreamExt};
use reqwest::header::{ACCEPT_RANGES, AUTHORIZATION, CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::{Client, RequestBuilder, StatusCode};
use std::time::Duration;
use tracing::{debug, info};

/// Fetches byte ranges of a remote file with HTTP `Range` requests
pub struct HttpRangeFetcher {
    url: String,
    client: Client,
    config: HttpConfig,
    size: u64,
}

impl HttpRangeFetcher {
    /// Connect to `url`, checking range support and reading the file size
    pub async fn connect(url: impl Into<String>, config: HttpConfig) -> Result<Self, FetchError> {
        let url = url.into();

        let user_agent = config
            .user_agent
            .clone()
            .unwrap_or_else(|| concat!("rangecache/", env!("CARGO_PKG_VERSION")).to_string());
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .user_agent(user_agent)
            .build()?;

        let mut fetcher = Self {
            url,
            client,
            config,
            size: 0,
        };
        fetcher.size = fetcher.probe().await?;

        info!("HttpRangeFetcher: {} is {} bytes", fetcher.url, fetcher.size);
        Ok(fetcher)
    }

    /// HEAD the resource and return its content length
    async fn probe(&self) -> Result<u64, FetchError> {
        let response = self.authorize(self.client.head(&self.url)).send().await?;
        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound {
                url: self.url.clone(),
            });
        }
        if !status.is_success() {
            return Err(FetchError::Http {
                status: status.as_u16(),
                message: status.canonical_reason().unwrap_or("Unknown error").into(),
            });
        }

        if let Some(accept_ranges) = response.headers().get(ACCEPT_RANGES) {
            if accept_ranges.to_str().map_or(true, |v| v.trim() == "none") {
                return Err(FetchError::RangeNotSupported);
            }
        }

        response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or(FetchError::MissingContentLength)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.bearer_token {
            Some(token) => request.header(AUTHORIZATION, format!("Bearer {}", token)),
            None => request,
        }
    }
}

/// `Range` header value for a half-open range
fn range_header(range: ByteRange) -> String {
    format!("bytes={}-{}", range.start, range.end - 1)
}

#[async_trait::async_trait]
impl RangeFetcher for HttpRangeFetcher {
    fn size(&self) -> u64 {
        self.size
    }

    fn source_id(&self) -> &str {
        &self.url
    }

    async fn fetch(&self, range: ByteRange) -> Result<ByteStream, FetchError> {
        debug!("HttpRangeFetcher: GET {} {}", self.url, range);

        let request = self
            .client
            .get(&self.url)
            .header(RANGE, range_header(range));
        let response = self.authorize(request).send().await?;
        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound {
                url: self.url.clone(),
            });
        }

        let whole_file = range.start == 0 && range.end == self.size;
        let skip = match status {
            StatusCode::PARTIAL_CONTENT => {
                let served = response
                    .headers()
                    .get(CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok());
                leading_bytes(range, served)?
            }
            // Servers may ignore Range and send everything; only usable for the whole file
            StatusCode::OK if whole_file => 0,
            status if status.is_success() => {
                return Err(FetchError::UnexpectedStatus {
                    status: status.as_u16(),
                    range,
                });
            }
            status => {
                return Err(FetchError::Http {
                    status: status.as_u16(),
                    message: status.canonical_reason().unwrap_or("Unknown error").into(),
                });
            }
        };
        if skip > 0 {
            debug!("HttpRangeFetcher: server started {} bytes early for {}", skip, range);
        }

        let chunks = response
            .bytes_stream()
            .map_ok(|bytes| bytes.to_vec())
            .map_err(FetchError::from)
            .boxed();

        Ok(slice_stream(chunks, skip, range.len()))
    }
}

/// `(first, last)` of a `Content-Range: bytes first-last/total` value
fn parse_content_range(value: &str) -> Option<(u64, u64)> {
    let (span, _total) = value.trim().strip_prefix("bytes ")?.split_once('/')?;
    let (first, last) = span.split_once('-')?;
    let first = first.trim().parse().ok()?;
    let last = last.trim().parse().ok()?;
    (first <= last).then_some((first, last))
}

/// Bytes to drop from the front of a 206 body so it starts at `range.start`
///
/// The served span must begin at or before `range.start` and reach it.
fn leading_bytes(range: ByteRange, served: Option<&str>) -> Result<u64, FetchError> {
    let mismatch = || FetchError::ContentRangeMismatch {
        range,
        served: served.unwrap_or("").to_string(),
    };

    let (first, last) = served.and_then(parse_content_range).ok_or_else(mismatch)?;
    if first > range.start || last < range.start {
        return Err(mismatch());
    }
    Ok(range.start - first)
}

struct Slice {
    chunks: ByteStream,
    skip: u64,
    remaining: u64,
}

/// Drop `skip` leading bytes of `chunks` and end after `len` bytes
fn slice_stream(chunks: ByteStream, skip: u64, len: u64) -> ByteStream {
    let state = Slice {
        chunks,
        skip,
        remaining: len,
    };
    stream::try_unfold(state, next_slice).boxed()
}

async fn next_slice(mut state: Slice) -> Result<Option<(Vec<u8>, Slice)>, FetchError> {
    while state.remaining > 0 {
        let Some(chunk) = state.chunks.try_next().await? else {
            break;
        };

        let start = state.skip.min(chunk.len() as u64);
        state.skip -= start;
        let end = (chunk.len() as u64).min(start + state.remaining);
        if start == end {
            continue;
        }

        let piece = chunk[start as usize..end as usize].to_vec();
        state.remaining -= piece.len() as u64;
        return Ok(Some((piece, state)));
    }
    Ok(None)
}
