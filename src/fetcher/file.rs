use super::{ByteStream, FetchError, RangeFetcher};
use crate::range::ByteRange;
use futures::stream::{self, StreamExt};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

const READ_CHUNK_SIZE: u64 = 64 * 1024;

/// Fetches ranges of a local file
pub struct FileRangeFetcher {
    path: PathBuf,
    source_id: String,
    size: u64,
}

impl FileRangeFetcher {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, FetchError> {
        let path = path.as_ref().to_path_buf();
        let size = tokio::fs::metadata(&path).await?.len();
        debug!("Opened {} ({} bytes)", path.display(), size);

        Ok(Self {
            source_id: path.display().to_string(),
            path,
            size,
        })
    }
}

#[async_trait::async_trait]
impl RangeFetcher for FileRangeFetcher {
    fn size(&self) -> u64 {
        self.size
    }

    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch(&self, range: ByteRange) -> Result<ByteStream, FetchError> {
        let mut file = File::open(&self.path).await?;
        file.seek(SeekFrom::Start(range.start)).await?;

        let chunks = stream::try_unfold((file, range.start), move |(mut file, position)| async move {
            if position >= range.end {
                return Ok(None);
            }

            let want = READ_CHUNK_SIZE.min(range.end - position) as usize;
            let mut buf = vec![0u8; want];
            let read = file.read(&mut buf).await?;
            if read == 0 {
                return Err(FetchError::UnexpectedEnd {
                    expected: range.len(),
                    actual: position - range.start,
                });
            }
            buf.truncate(read);

            Ok::<_, FetchError>(Some((buf, (file, position + read as u64))))
        });

        Ok(chunks.boxed())
    }
}
