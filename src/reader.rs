use crate::cache::StreamingRangeCache;
use std::io::{Read, Result as IoResult, Seek, SeekFrom};
use tracing::debug;

/// Blocking `Read + Seek` view of a [`StreamingRangeCache`]
///
/// For consumers such as decoders that expect a file handle. Each `read`
/// becomes one cache read, clamped to the cache's max request size and the
/// end of the file. Must be used from a multi-threaded tokio runtime or a
/// plain thread holding a runtime handle.
pub struct CachedFileReader {
    cache: StreamingRangeCache,
    runtime_handle: tokio::runtime::Handle,
    position: u64,
}

impl CachedFileReader {
    pub fn new(cache: StreamingRangeCache, runtime_handle: tokio::runtime::Handle) -> Self {
        Self {
            cache,
            runtime_handle,
            position: 0,
        }
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn cache(&self) -> &StreamingRangeCache {
        &self.cache
    }

    fn block_on_read(&self, offset: u64, length: u64) -> IoResult<Vec<u8>> {
        let read = self.cache.read(offset, length);
        // block_in_place panics outside a multi-threaded runtime worker
        let result = match tokio::runtime::Handle::try_current() {
            Ok(_) => tokio::task::block_in_place(|| self.runtime_handle.block_on(read)),
            Err(_) => self.runtime_handle.block_on(read),
        };
        result.map_err(std::io::Error::other)
    }
}

impl Read for CachedFileReader {
    fn read(&mut self, buf: &mut [u8]) -> IoResult<usize> {
        let file_size = self.cache.file_size();
        if buf.is_empty() || self.position >= file_size {
            return Ok(0);
        }

        let length = (buf.len() as u64)
            .min(file_size - self.position)
            .min(self.cache.budget().max_request_size);

        let data = self.block_on_read(self.position, length)?;
        buf[..data.len()].copy_from_slice(&data);
        self.position += data.len() as u64;

        Ok(data.len())
    }
}

impl Seek for CachedFileReader {
    fn seek(&mut self, pos: SeekFrom) -> IoResult<u64> {
        let file_size = self.cache.file_size();

        let new_pos = match pos {
            SeekFrom::Start(pos) => Some(pos),
            SeekFrom::End(offset) => file_size.checked_add_signed(offset),
            SeekFrom::Current(offset) => self.position.checked_add_signed(offset),
        };

        let Some(new_pos) = new_pos else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "Seek before start of file",
            ));
        };
        if new_pos > file_size {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "Seek beyond end of file",
            ));
        }

        debug!("CachedFileReader: seek {} -> {}", self.position, new_pos);
        self.position = new_pos;
        Ok(new_pos)
    }
}
