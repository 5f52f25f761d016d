//! A captured message file tracked by the message store.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};

use crate::error::{PapercutError, Result};

/// One persisted message.
///
/// The path is the identity: two entries are equal when they point at the
/// same file. There is no `Ord`; lists are kept in [`MessageEntry::arrival_order`].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MessageEntry {
    path: PathBuf,
    modified: DateTime<Utc>,
    size: u64,
}

impl MessageEntry {
    /// Build an entry from the file's current metadata.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let meta = std::fs::metadata(path).map_err(|e| PapercutError::io(path, e))?;
        if !meta.is_file() {
            return Err(PapercutError::io(
                path,
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a regular file"),
            ));
        }
        let modified = meta
            .modified()
            .ok()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|| DateTime::<Utc>::from(SystemTime::UNIX_EPOCH));

        Ok(Self {
            path: path.to_path_buf(),
            modified,
            size: meta.len(),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last-modified timestamp (the sort key).
    pub fn modified(&self) -> DateTime<Utc> {
        self.modified
    }

    /// Size of the backing file in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// File name for display, falling back to the full path.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }

    /// Display order: modification time, then path so that files written
    /// within the same clock tick still have a stable order.
    pub fn arrival_order(&self, other: &Self) -> Ordering {
        self.modified
            .cmp(&other.modified)
            .then_with(|| self.path.cmp(&other.path))
    }

    /// Re-read timestamp and size from disk. The path never changes.
    pub(crate) fn refresh(&mut self) -> Result<()> {
        let fresh = Self::from_path(&self.path)?;
        self.modified = fresh.modified;
        self.size = fresh.size;
        Ok(())
    }
}

impl PartialEq for MessageEntry {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
    }
}

impl Eq for MessageEntry {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_path_reads_size() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("a.eml");
        std::fs::write(&path, b"Subject: x\r\n\r\nbody\r\n").unwrap();

        let entry = MessageEntry::from_path(&path).unwrap();
        assert_eq!(entry.size(), 21);
        assert_eq!(entry.file_name(), "a.eml");
    }

    #[test]
    fn test_from_path_missing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let err = MessageEntry::from_path(tmp.path().join("missing.eml")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_equality_is_by_path() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("a.eml");
        std::fs::write(&path, b"x").unwrap();

        let first = MessageEntry::from_path(&path).unwrap();
        std::fs::write(&path, b"longer").unwrap();
        let second = MessageEntry::from_path(&path).unwrap();
        assert_eq!(first, second);
        assert_ne!(first.size(), second.size());
    }

    #[test]
    fn test_arrival_order_by_time_then_path() {
        let tmp = tempfile::tempdir().unwrap();
        let write = |name: &str, secs: u64| {
            let path = tmp.path().join(name);
            std::fs::write(&path, b"x").unwrap();
            let file = std::fs::File::options().write(true).open(&path).unwrap();
            file.set_modified(SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(secs))
                .unwrap();
            MessageEntry::from_path(&path).unwrap()
        };
        let late = write("a.eml", 2_000);
        let early = write("b.eml", 1_000);
        let tie = write("c.eml", 1_000);

        assert_eq!(early.arrival_order(&late), Ordering::Less);
        assert_eq!(early.arrival_order(&tie), Ordering::Less);

        // Same file seen before and after a touch: equal, and ordered by time.
        let touched = write("b.eml", 3_000);
        assert_eq!(early, touched);
        assert_eq!(early.arrival_order(&touched), Ordering::Less);
    }
}
