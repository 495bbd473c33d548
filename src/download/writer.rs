//! Part-file management: streaming writes, pause/resume offsets, atomic
//! promotion to the final path.
//!
//! A transfer writes into `<final>.part` and the final path appears only
//! once the complete content exists. Promotion is an atomic rename; when the
//! rename keeps failing (antivirus or indexer holding the file), a
//! copy-through-temp fallback preserves the visibility guarantee. The
//! acknowledged offset only ever advances by whole chunks, so a resume
//! record can never point inside a partially-written chunk.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufWriter};
use tracing::{debug, info, instrument, warn};

use super::error::TransferError;

/// Rename attempts before falling back to copy-then-delete.
const RENAME_ATTEMPTS: u32 = 4;

/// Base backoff between rename attempts.
const RENAME_BACKOFF: Duration = Duration::from_millis(50);

/// Suffix of in-progress files.
pub const PART_SUFFIX: &str = ".part";

/// Where a paused transfer can pick up again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeRecord {
    /// Chart cell id the record belongs to.
    pub chart_id: String,
    /// Fully acknowledged offset to resume from.
    pub bytes_downloaded: u64,
    /// Path of the part file holding those bytes.
    pub part_path: PathBuf,
}

/// Normalizes a byte count against an optional total into [0, 1].
///
/// Unknown totals report 0.0 until completion; completion is always exactly
/// 1.0, which the orchestrator sets explicitly.
#[must_use]
pub fn normalized_progress(bytes_downloaded: u64, total_bytes: Option<u64>) -> f64 {
    match total_bytes {
        Some(total) if total > 0 => (bytes_downloaded as f64 / total as f64).clamp(0.0, 1.0),
        _ => 0.0,
    }
}

/// Derives the part-file path for a final artifact path.
#[must_use]
pub fn part_path_for(final_path: &Path) -> PathBuf {
    let mut name = final_path.as_os_str().to_os_string();
    name.push(PART_SUFFIX);
    PathBuf::from(name)
}

/// Writer for one chart's part file.
#[derive(Debug)]
pub struct PartFileWriter {
    chart_id: String,
    part_path: PathBuf,
    final_path: PathBuf,
    writer: BufWriter<File>,
    bytes_written: u64,
    hasher: Option<Sha256>,
}

impl PartFileWriter {
    /// Opens or creates the part file for `final_path`.
    ///
    /// With a resume record the file is truncated to the recorded offset
    /// (never extended: a record pointing past the real length falls back to
    /// the bytes actually present) and writing continues from there. Without
    /// one, any stale part content is discarded.
    ///
    /// `verify` enables SHA-256 accumulation; on resume the surviving prefix
    /// is re-read through the hasher so the final digest covers the whole
    /// artifact.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Io`] for any filesystem failure.
    #[instrument(skip(resume), fields(chart_id = %chart_id))]
    pub async fn begin(
        chart_id: &str,
        final_path: &Path,
        resume: Option<&ResumeRecord>,
        verify: bool,
    ) -> Result<Self, TransferError> {
        let part_path = part_path_for(final_path);

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&part_path)
            .await
            .map_err(|e| TransferError::io(part_path.clone(), e))?;

        let existing_len = file
            .metadata()
            .await
            .map_err(|e| TransferError::io(part_path.clone(), e))?
            .len();

        let offset = match resume {
            Some(record) => {
                let offset = record.bytes_downloaded.min(existing_len);
                if offset < record.bytes_downloaded {
                    warn!(
                        recorded = record.bytes_downloaded,
                        on_disk = existing_len,
                        "resume record ahead of part file, resuming from on-disk length"
                    );
                }
                offset
            }
            None => 0,
        };

        file.set_len(offset)
            .await
            .map_err(|e| TransferError::io(part_path.clone(), e))?;

        let mut hasher = verify.then(Sha256::new);
        if offset > 0 {
            if let Some(hasher) = hasher.as_mut() {
                hash_prefix(&mut file, &part_path, offset, hasher).await?;
            }
        }

        file.seek(std::io::SeekFrom::Start(offset))
            .await
            .map_err(|e| TransferError::io(part_path.clone(), e))?;

        debug!(offset, part = %part_path.display(), "part file opened");

        Ok(Self {
            chart_id: chart_id.to_string(),
            part_path,
            final_path: final_path.to_path_buf(),
            writer: BufWriter::new(file),
            bytes_written: offset,
            hasher,
        })
    }

    /// Offset writing starts from; nonzero when resuming.
    #[must_use]
    pub fn resume_offset(&self) -> u64 {
        self.bytes_written
    }

    /// Fully acknowledged bytes on disk (buffered bytes count once the chunk
    /// write returns).
    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Part file path.
    #[must_use]
    pub fn part_path(&self) -> &Path {
        &self.part_path
    }

    /// Appends one chunk. The acknowledged offset advances only after the
    /// whole chunk is written.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Io`] if the write fails; the offset is not
    /// advanced in that case.
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), TransferError> {
        self.writer
            .write_all(chunk)
            .await
            .map_err(|e| TransferError::io(self.part_path.clone(), e))?;
        if let Some(hasher) = self.hasher.as_mut() {
            hasher.update(chunk);
        }
        self.bytes_written += chunk.len() as u64;
        Ok(())
    }

    /// Discards everything written so far and starts over from byte zero.
    /// Used when the server ignores a range request and restarts the body.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Io`] for any filesystem failure.
    pub async fn restart(&mut self) -> Result<(), TransferError> {
        self.writer
            .flush()
            .await
            .map_err(|e| TransferError::io(self.part_path.clone(), e))?;
        let file = self.writer.get_mut();
        file.set_len(0)
            .await
            .map_err(|e| TransferError::io(self.part_path.clone(), e))?;
        file.seek(std::io::SeekFrom::Start(0))
            .await
            .map_err(|e| TransferError::io(self.part_path.clone(), e))?;
        self.bytes_written = 0;
        if self.hasher.is_some() {
            self.hasher = Some(Sha256::new());
        }
        warn!(chart_id = %self.chart_id, "server ignored range request, restarting from zero");
        Ok(())
    }

    /// Flushes buffered bytes and returns the resume record for a pause.
    /// The record always points at a whole-chunk boundary.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Io`] if the flush fails.
    #[instrument(skip(self), fields(chart_id = %self.chart_id))]
    pub async fn pause(mut self) -> Result<ResumeRecord, TransferError> {
        self.writer
            .flush()
            .await
            .map_err(|e| TransferError::io(self.part_path.clone(), e))?;
        info!(offset = self.bytes_written, "paused at acknowledged offset");
        Ok(ResumeRecord {
            chart_id: self.chart_id,
            bytes_downloaded: self.bytes_written,
            part_path: self.part_path,
        })
    }

    /// Deletes the part file. Used on cancel.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Io`] if the removal fails for a reason other
    /// than the file already being gone.
    pub async fn discard(self) -> Result<(), TransferError> {
        let part_path = self.part_path.clone();
        drop(self);
        match tokio::fs::remove_file(&part_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TransferError::io(part_path, e)),
        }
    }

    /// Verifies the optional digest and promotes the part file to the final
    /// path.
    ///
    /// The rename is retried with short backoff; if it never succeeds the
    /// content is copied to a temp file beside the final path and that temp
    /// is renamed into place, so the final path never holds partial content.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Checksum`] on digest disagreement (the part
    /// file is removed so the retry starts clean) or [`TransferError::Io`]
    /// if promotion fails entirely.
    #[instrument(skip(self, expected_sha256), fields(chart_id = %self.chart_id))]
    pub async fn finalize(mut self, expected_sha256: Option<&str>) -> Result<PathBuf, TransferError> {
        self.writer
            .flush()
            .await
            .map_err(|e| TransferError::io(self.part_path.clone(), e))?;

        if let (Some(hasher), Some(expected)) = (self.hasher.take(), expected_sha256) {
            let actual = hex::encode(hasher.finalize());
            if !actual.eq_ignore_ascii_case(expected) {
                let _ = tokio::fs::remove_file(&self.part_path).await;
                return Err(TransferError::checksum(
                    self.part_path.clone(),
                    expected,
                    actual,
                ));
            }
        }

        // Close the handle before renaming; some platforms refuse to rename
        // an open file.
        let part_path = self.part_path.clone();
        let final_path = self.final_path.clone();
        drop(self);

        promote(&part_path, &final_path).await?;
        info!(path = %final_path.display(), "chart artifact promoted");
        Ok(final_path)
    }
}

/// Reads the first `len` bytes of `file` through `hasher`.
async fn hash_prefix(
    file: &mut File,
    path: &Path,
    len: u64,
    hasher: &mut Sha256,
) -> Result<(), TransferError> {
    file.seek(std::io::SeekFrom::Start(0))
        .await
        .map_err(|e| TransferError::io(path.to_path_buf(), e))?;
    let mut remaining = len;
    let mut buffer = vec![0u8; 64 * 1024];
    while remaining > 0 {
        let want = buffer.len().min(usize::try_from(remaining).unwrap_or(buffer.len()));
        let read = file
            .read(&mut buffer[..want])
            .await
            .map_err(|e| TransferError::io(path.to_path_buf(), e))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        remaining -= read as u64;
    }
    Ok(())
}

/// Renames `part` to `final_path`, retrying briefly, with a
/// copy-through-temp fallback that keeps the final path atomic.
async fn promote(part: &Path, final_path: &Path) -> Result<(), TransferError> {
    let mut last_error = None;
    for attempt in 1..=RENAME_ATTEMPTS {
        match tokio::fs::rename(part, final_path).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                debug!(
                    attempt,
                    error = %e,
                    part = %part.display(),
                    "rename failed, backing off"
                );
                last_error = Some(e);
                tokio::time::sleep(RENAME_BACKOFF * attempt).await;
            }
        }
    }

    warn!(
        part = %part.display(),
        error = ?last_error,
        "rename kept failing, falling back to copy promotion"
    );

    // Copy into a temp file in the same directory, then rename the temp into
    // place: the final path still only ever appears fully populated.
    let mut swap_name = final_path.as_os_str().to_os_string();
    swap_name.push(".promote");
    let swap_path = PathBuf::from(swap_name);

    tokio::fs::copy(part, &swap_path)
        .await
        .map_err(|e| TransferError::io(swap_path.clone(), e))?;
    tokio::fs::rename(&swap_path, final_path)
        .await
        .map_err(|e| TransferError::io(final_path.to_path_buf(), e))?;
    if let Err(e) = tokio::fs::remove_file(part).await {
        // The artifact is in place; a stale part file is only cosmetic.
        warn!(part = %part.display(), error = %e, "failed to remove part file after copy promotion");
    }
    Ok(())
}
