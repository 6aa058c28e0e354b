use super::{ByteStream, FetchError, RangeFetcher};
use crate::range::ByteRange;
use futures::stream::{self, StreamExt};
use std::sync::Arc;

/// Serves an in-memory buffer, delivering each range in `chunk_size` pieces
#[derive(Clone)]
pub struct MemoryRangeFetcher {
    data: Arc<Vec<u8>>,
    chunk_size: usize,
    source_id: String,
}

impl MemoryRangeFetcher {
    pub fn new(data: Vec<u8>, chunk_size: usize) -> Self {
        Self {
            source_id: format!("memory:{}", data.len()),
            data: Arc::new(data),
            chunk_size: chunk_size.max(1),
        }
    }
}

#[async_trait::async_trait]
impl RangeFetcher for MemoryRangeFetcher {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch(&self, range: ByteRange) -> Result<ByteStream, FetchError> {
        if range.end > self.size() {
            return Err(FetchError::UnexpectedStatus { status: 416, range });
        }

        let data = Arc::clone(&self.data);
        let chunk_size = self.chunk_size as u64;
        let offsets = (range.start..range.end).step_by(self.chunk_size);
        let chunks = offsets.map(move |offset| {
            let end = (offset + chunk_size).min(range.end);
            Ok(data[offset as usize..end as usize].to_vec())
        });

        Ok(stream::iter(chunks).boxed())
    }
}
