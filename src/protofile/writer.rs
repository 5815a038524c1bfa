use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};

use prost::Message;
use snafu::{ResultExt, Snafu};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use super::{CRC16, FRAME_OVERHEAD, RECORD_MAGIC};

/// Error that occurred during calls to [`RecordWriter`].
#[derive(Debug, Snafu)]
pub enum WriteError {
    /// A general I/O error occurred.
    #[snafu(display("write I/O error on {}: {}", path.display(), source))]
    Io { path: PathBuf, source: io::Error },
}

/// Appending writer for a framed record file.
///
/// Each record is framed in one buffer and issued as a single write. The
/// writer tracks its own position so `position()` is cheap; `write_at`
/// repositions, which is how indexed-file headers get rewritten in place
/// once body offsets are known.
pub struct RecordWriter {
    path: PathBuf,
    file: File,
    position: u64,
}

impl RecordWriter {
    /// Opens `path` for writing, creating it if needed, positioned at the
    /// end of any existing content.
    pub async fn create(path: impl AsRef<Path>) -> Result<RecordWriter, WriteError> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .await
            .context(IoSnafu { path: path.clone() })?;
        let position = file
            .seek(SeekFrom::End(0))
            .await
            .context(IoSnafu { path: path.clone() })?;
        Ok(RecordWriter {
            path,
            file,
            position,
        })
    }

    /// Current write position, which for an appending writer is also the
    /// file size.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Appends one framed record.
    pub async fn write<M: Message>(&mut self, message: &M) -> Result<(), WriteError> {
        let payload = message.encode_to_vec();
        let mut frame = Vec::with_capacity(payload.len() + FRAME_OVERHEAD as usize);
        frame.extend_from_slice(&RECORD_MAGIC.to_le_bytes());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&payload);
        frame.extend_from_slice(&CRC16.checksum(&payload).to_le_bytes());

        self.file
            .write_all(&frame)
            .await
            .context(IoSnafu { path: self.path.clone() })?;
        self.position += frame.len() as u64;
        Ok(())
    }

    /// Seeks to `pos` and writes one framed record there.
    pub async fn write_at<M: Message>(&mut self, pos: u64, message: &M) -> Result<(), WriteError> {
        self.file
            .seek(SeekFrom::Start(pos))
            .await
            .context(IoSnafu { path: self.path.clone() })?;
        self.position = pos;
        self.write(message).await
    }

    /// Synchronizes data and metadata to disk.
    pub async fn sync_all(&mut self) -> Result<(), WriteError> {
        self.file
            .sync_all()
            .await
            .context(IoSnafu { path: self.path.clone() })
    }
}
