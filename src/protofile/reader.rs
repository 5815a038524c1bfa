use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};

use prost::Message;
use snafu::{ResultExt, Snafu};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, BufReader};

use super::{CRC16, MAX_BAD_FRAMES, RECORD_MAGIC};

/// Error that occurred during calls to [`RecordReader`].
#[derive(Debug, Snafu)]
pub enum ReadError {
    /// A general I/O error occurred.
    ///
    /// Logical problems with the data itself — bad magic, oversized lengths,
    /// checksum mismatches, undecodable payloads — are not errors: the reader
    /// scans past or degrades to end-of-file for those, per the recovery
    /// rules of the record log.
    #[snafu(display("read I/O error on {}: {}", path.display(), source))]
    Io { path: PathBuf, source: io::Error },
}

/// Sequential reader over a framed record file.
///
/// `read_next` returns `Ok(None)` at end-of-file. Frames with a bad magic
/// word or an impossible length are scanned past, up to [`MAX_BAD_FRAMES`]
/// in a row; a CRC mismatch is counted and logged but the payload is still
/// delivered. A payload that fails to decode ends the file for this reader.
pub struct RecordReader {
    path: PathBuf,
    reader: BufReader<File>,
    file_size: u64,
    crc_failures: u64,
}

impl RecordReader {
    pub async fn open(path: impl AsRef<Path>) -> Result<RecordReader, ReadError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).await.context(IoSnafu { path: path.clone() })?;
        let file_size = file
            .metadata()
            .await
            .context(IoSnafu { path: path.clone() })?
            .len();
        Ok(RecordReader {
            path,
            reader: BufReader::with_capacity(256 * 1024, file),
            file_size,
            crc_failures: 0,
        })
    }

    /// Size of the file at open time, in bytes.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Number of records delivered with a mismatched checksum so far.
    pub fn crc_failures(&self) -> u64 {
        self.crc_failures
    }

    /// Reads the next record, scanning past corrupted frames.
    pub async fn read_next<M: Message + Default>(&mut self) -> Result<Option<M>, ReadError> {
        let mut bad_frames = 0u32;
        loop {
            if bad_frames > MAX_BAD_FRAMES {
                warn!(
                    path = %self.path.display(),
                    bad_frames, "Giving up scanning for a valid record frame."
                );
                return Ok(None);
            }

            let mut frame_header = [0u8; 6];
            match self.reader.read_exact(&mut frame_header).await {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
                Err(source) => {
                    return Err(ReadError::Io {
                        path: self.path.clone(),
                        source,
                    })
                }
            }

            let magic = u16::from_le_bytes([frame_header[0], frame_header[1]]);
            let length = u32::from_le_bytes([
                frame_header[2],
                frame_header[3],
                frame_header[4],
                frame_header[5],
            ]);

            if magic != RECORD_MAGIC {
                trace!(
                    path = %self.path.display(),
                    magic, "Frame delimiter does not match the record magic."
                );
                bad_frames += 1;
                continue;
            }
            if u64::from(length) >= self.file_size {
                debug!(
                    path = %self.path.display(),
                    length,
                    file_size = self.file_size,
                    "Frame length exceeds the file size; treating as corruption."
                );
                bad_frames += 1;
                continue;
            }

            let mut payload = vec![0u8; length as usize];
            match self.reader.read_exact(&mut payload).await {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    debug!(
                        path = %self.path.display(),
                        length, "Truncated record payload at end of file."
                    );
                    return Ok(None);
                }
                Err(source) => {
                    return Err(ReadError::Io {
                        path: self.path.clone(),
                        source,
                    })
                }
            }

            let mut crc_buf = [0u8; 2];
            match self.reader.read_exact(&mut crc_buf).await {
                Ok(_) => {
                    let stored = u16::from_le_bytes(crc_buf);
                    let calculated = CRC16.checksum(&payload);
                    if stored != calculated {
                        self.crc_failures += 1;
                        warn!(
                            path = %self.path.display(),
                            stored, calculated, "Record checksum mismatch; delivering payload anyway."
                        );
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
                Err(source) => {
                    return Err(ReadError::Io {
                        path: self.path.clone(),
                        source,
                    })
                }
            }

            match M::decode(payload.as_slice()) {
                Ok(message) => return Ok(Some(message)),
                Err(error) => {
                    warn!(
                        path = %self.path.display(),
                        %error, "Failed to decode record payload; ending reads on this file."
                    );
                    return Ok(None);
                }
            }
        }
    }

    /// Seeks to `pos` and reads one record from there.
    pub async fn read_at<M: Message + Default>(
        &mut self,
        pos: u64,
    ) -> Result<Option<M>, ReadError> {
        self.seek(pos).await?;
        self.read_next().await
    }

    /// Repositions the reader.
    pub async fn seek(&mut self, pos: u64) -> Result<(), ReadError> {
        self.reader
            .seek(SeekFrom::Start(pos))
            .await
            .context(IoSnafu { path: self.path.clone() })?;
        Ok(())
    }
}
