//! Writing incoming payloads into the message directory.
//!
//! Bytes go to a hidden temporary file created with `create_new`; only
//! [`IncomingMessage::commit`] renames it to its final `.eml` name. A reader
//! scanning the directory therefore never sees a partially written message.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use tracing::{debug, warn};

use crate::error::{PapercutError, Result};

/// Suffix of in-flight files. Never matches a message extension.
pub const TEMP_SUFFIX: &str = "tmp";

/// Attempts at finding a free name before giving up.
const MAX_NAME_ATTEMPTS: u32 = 16;

/// Per-process sequence that keeps same-millisecond deliveries apart.
static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// A message being received. Dropping it without committing discards the bytes.
pub struct IncomingMessage {
    tmp_path: PathBuf,
    final_path: PathBuf,
    writer: Option<BufWriter<File>>,
    written: u64,
}

impl IncomingMessage {
    /// Reserve a unique name in `dir` and open its temporary file.
    pub fn create(dir: &Path, extension: &str) -> Result<Self> {
        for _ in 0..MAX_NAME_ATTEMPTS {
            let stem = unique_stem();
            let final_path = dir.join(format!("{stem}.{extension}"));
            let tmp_path = dir.join(format!(".{stem}.{TEMP_SUFFIX}"));
            if final_path.exists() {
                continue;
            }

            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&tmp_path)
            {
                Ok(file) => {
                    debug!(path = %tmp_path.display(), "Spooling incoming message");
                    return Ok(Self {
                        tmp_path,
                        final_path,
                        writer: Some(BufWriter::new(file)),
                        written: 0,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(PapercutError::io(&tmp_path, e)),
            }
        }

        Err(PapercutError::io(
            dir,
            std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "could not find a free message file name",
            ),
        ))
    }

    /// Append payload bytes.
    pub fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let writer = self.writer.as_mut().ok_or_else(|| {
            PapercutError::io(
                &self.tmp_path,
                std::io::Error::new(std::io::ErrorKind::Other, "message already closed"),
            )
        })?;
        writer
            .write_all(data)
            .map_err(|e| PapercutError::io(&self.tmp_path, e))?;
        self.written += data.len() as u64;
        Ok(())
    }

    /// Bytes written so far.
    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Path the message will have once committed.
    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    /// Flush to disk and move the file to its final name.
    pub fn commit(mut self) -> Result<PathBuf> {
        let writer = self.writer.take().ok_or_else(|| {
            PapercutError::io(
                &self.tmp_path,
                std::io::Error::new(std::io::ErrorKind::Other, "message already closed"),
            )
        })?;
        let file = writer
            .into_inner()
            .map_err(|e| PapercutError::io(&self.tmp_path, e.into_error()))?;
        file.sync_all()
            .map_err(|e| PapercutError::io(&self.tmp_path, e))?;
        drop(file);

        if self.final_path.exists() {
            return Err(PapercutError::io(
                &self.final_path,
                std::io::Error::new(std::io::ErrorKind::AlreadyExists, "message file exists"),
            ));
        }
        std::fs::rename(&self.tmp_path, &self.final_path)
            .map_err(|e| PapercutError::io(&self.final_path, e))?;

        // Rename succeeded, nothing left for Drop to clean up.
        self.tmp_path = PathBuf::new();
        Ok(self.final_path.clone())
    }
}

impl Drop for IncomingMessage {
    fn drop(&mut self) {
        if self.tmp_path.as_os_str().is_empty() {
            return;
        }
        self.writer.take();
        if let Err(e) = std::fs::remove_file(&self.tmp_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.tmp_path.display(), error = %e, "Could not discard partial message");
            }
        }
    }
}

/// `20240104T100000123-4711-000042`: timestamp, process id, sequence.
fn unique_stem() -> String {
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!(
        "{}-{}-{:06}",
        Utc::now().format("%Y%m%dT%H%M%S%3f"),
        std::process::id(),
        seq
    )
}
