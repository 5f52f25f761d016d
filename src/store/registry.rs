//! Directory-backed registry of captured messages.
//!
//! The registry is mutated by the SMTP listener (`register`) and by the user
//! (`remove`) from different threads. Both go through one mutex. Readers get
//! an immutable snapshot that is swapped in after every mutation, so `list`
//! never waits on file I/O done under the registry lock.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use tracing::{debug, info, warn};

use crate::error::{PapercutError, Result};
use crate::model::MessageEntry;
use crate::store::spool::IncomingMessage;

/// Change notification for presentation collaborators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Added(MessageEntry),
    Removed(MessageEntry),
}

/// Ordered, immutable view of the registry.
pub type Snapshot = Arc<Vec<MessageEntry>>;

#[derive(Default)]
struct Registry {
    /// Kept sorted ascending by timestamp, then path.
    entries: Vec<MessageEntry>,
    paths: HashSet<PathBuf>,
}

impl Registry {
    fn insert(&mut self, entry: MessageEntry) {
        let pos = self.entries.partition_point(|e| e.arrival_order(&entry).is_lt());
        self.paths.insert(entry.path().to_path_buf());
        self.entries.insert(pos, entry);
    }

    fn take(&mut self, path: &Path) -> Option<MessageEntry> {
        if !self.paths.remove(path) {
            return None;
        }
        let pos = self.entries.iter().position(|e| e.path() == path)?;
        Some(self.entries.remove(pos))
    }
}

/// The authoritative list of captured messages.
pub struct MessageStore {
    dir: PathBuf,
    extension: String,
    registry: Mutex<Registry>,
    snapshot: RwLock<Snapshot>,
    subscribers: Mutex<Vec<Sender<StoreEvent>>>,
}

impl MessageStore {
    /// Open (creating if needed) a message directory and load its files.
    pub fn open(dir: impl AsRef<Path>, extension: &str) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|e| PapercutError::io(&dir, e))?;

        let existing = scan_existing(&dir, extension)?;
        info!(
            dir = %dir.display(),
            count = existing.len(),
            "Loaded existing messages"
        );

        let mut registry = Registry::default();
        for entry in existing {
            registry.insert(entry);
        }
        let snapshot = Arc::new(registry.entries.clone());

        Ok(Self {
            dir,
            extension: extension.to_string(),
            registry: Mutex::new(registry),
            snapshot: RwLock::new(snapshot),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    /// Directory holding the message files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Extension of message files (without the dot).
    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Start writing a new message into this store's directory.
    pub fn spool(&self) -> Result<IncomingMessage> {
        IncomingMessage::create(&self.dir, &self.extension)
    }

    /// Receive `Added`/`Removed` events for every later mutation.
    pub fn subscribe(&self) -> Receiver<StoreEvent> {
        let (tx, rx) = mpsc::channel();
        lock(&self.subscribers).push(tx);
        rx
    }

    /// Register a fully written file.
    pub fn register(&self, path: impl AsRef<Path>) -> Result<MessageEntry> {
        let path = path.as_ref();
        let mut registry = lock(&self.registry);
        if registry.paths.contains(path) {
            return Err(PapercutError::DuplicateEntry(path.to_path_buf()));
        }

        let entry = MessageEntry::from_path(path)?;
        registry.insert(entry.clone());
        self.publish(&registry);
        self.notify(StoreEvent::Added(entry.clone()));

        debug!(path = %path.display(), size = entry.size(), "Registered message");
        Ok(entry)
    }

    /// Ordered snapshot, ascending by timestamp.
    pub fn list(&self) -> Snapshot {
        match self.snapshot.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Number of registered messages.
    pub fn len(&self) -> usize {
        self.list().len()
    }

    /// `true` when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up a registered entry by path.
    pub fn get(&self, path: impl AsRef<Path>) -> Option<MessageEntry> {
        let path = path.as_ref();
        self.list().iter().find(|e| e.path() == path).cloned()
    }

    /// Delete the backing file and drop the entry.
    ///
    /// A file that is already gone is not an error; the entry is still removed.
    pub fn remove(&self, entry: &MessageEntry) -> Result<()> {
        let mut registry = lock(&self.registry);
        self.remove_locked(&mut registry, entry)?;
        self.publish(&registry);
        Ok(())
    }

    /// Remove several entries under one lock acquisition.
    ///
    /// Stops at the first filesystem failure; entries handled before it stay removed.
    pub fn remove_many(&self, entries: &[MessageEntry]) -> Result<usize> {
        let mut registry = lock(&self.registry);
        let mut removed = 0;
        let mut outcome = Ok(());
        for entry in entries {
            if let Err(e) = self.remove_locked(&mut registry, entry) {
                outcome = Err(e);
                break;
            }
            removed += 1;
        }
        self.publish(&registry);
        outcome.map(|_| removed)
    }

    /// Re-read timestamp and size of a registered file, keeping the order consistent.
    pub fn refresh(&self, path: impl AsRef<Path>) -> Result<MessageEntry> {
        let path = path.as_ref();
        let mut registry = lock(&self.registry);
        let mut entry = registry.take(path).ok_or_else(|| {
            PapercutError::io(
                path,
                std::io::Error::new(std::io::ErrorKind::NotFound, "message not registered"),
            )
        })?;

        let outcome = entry.refresh();
        registry.insert(entry.clone());
        self.publish(&registry);
        outcome.map(|_| entry)
    }

    fn remove_locked(&self, registry: &mut Registry, entry: &MessageEntry) -> Result<()> {
        let path = entry.path();
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "Message file already gone");
            }
            Err(e) => return Err(PapercutError::io(path, e)),
        }

        if let Some(removed) = registry.take(path) {
            info!(path = %path.display(), "Removed message");
            self.notify(StoreEvent::Removed(removed));
        }
        Ok(())
    }

    fn publish(&self, registry: &Registry) {
        let fresh = Arc::new(registry.entries.clone());
        match self.snapshot.write() {
            Ok(mut guard) => *guard = fresh,
            Err(poisoned) => *poisoned.into_inner() = fresh,
        }
    }

    fn notify(&self, event: StoreEvent) {
        lock(&self.subscribers).retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// Enumerate message files already present in `dir`. Nothing is decoded.
///
/// Hidden in-flight files and other extensions are skipped. The result is
/// sorted ascending by timestamp.
pub fn scan_existing(dir: &Path, extension: &str) -> Result<Vec<MessageEntry>> {
    let read_dir = match std::fs::read_dir(dir) {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(PapercutError::io(dir, e)),
    };

    let mut entries = Vec::new();
    for item in read_dir {
        let item = item.map_err(|e| PapercutError::io(dir, e))?;
        let path = item.path();

        let hidden = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with('.'));
        let matches = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(extension));
        if hidden || !matches {
            continue;
        }

        match MessageEntry::from_path(&path) {
            Ok(entry) => entries.push(entry),
            Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable message file"),
        }
    }

    entries.sort_by(MessageEntry::arrival_order);
    Ok(entries)
}

/// Lock a mutex, recovering the data if a panicking thread poisoned it.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_scan_skips_temp_and_foreign_files() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "a.eml", "x");
        write(tmp.path(), ".b.tmp", "x");
        write(tmp.path(), ".c.eml", "x");
        write(tmp.path(), "notes.txt", "x");
        std::fs::create_dir(tmp.path().join("sub.eml")).unwrap();

        let entries = scan_existing(tmp.path(), "eml").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].file_name(), "a.eml");
    }

    #[test]
    fn test_scan_missing_dir_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let entries = scan_existing(&tmp.path().join("nope"), "eml").unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn test_register_twice_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MessageStore::open(tmp.path(), "eml").unwrap();
        let path = write(tmp.path(), "a.eml", "x");

        store.register(&path).unwrap();
        let err = store.register(&path).unwrap_err();
        assert!(matches!(err, PapercutError::DuplicateEntry(_)));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_register_missing_file_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MessageStore::open(tmp.path(), "eml").unwrap();
        let err = store.register(tmp.path().join("ghost.eml")).unwrap_err();
        assert!(err.is_not_found());
        assert!(store.is_empty());
    }

    #[test]
    fn test_events_follow_mutations() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MessageStore::open(tmp.path(), "eml").unwrap();
        let events = store.subscribe();

        let path = write(tmp.path(), "a.eml", "x");
        let entry = store.register(&path).unwrap();
        store.remove(&entry).unwrap();
        // Second removal is a no-op and must not emit another event.
        store.remove(&entry).unwrap();

        let received: Vec<StoreEvent> = events.try_iter().collect();
        assert_eq!(
            received,
            vec![StoreEvent::Added(entry.clone()), StoreEvent::Removed(entry)]
        );
    }

    #[test]
    fn test_snapshot_is_not_affected_by_later_mutation() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MessageStore::open(tmp.path(), "eml").unwrap();
        let before = store.list();
        store.register(write(tmp.path(), "a.eml", "x")).unwrap();
        assert!(before.is_empty());
        assert_eq!(store.list().len(), 1);
    }

    #[test]
    fn test_refresh_updates_size() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MessageStore::open(tmp.path(), "eml").unwrap();
        let path = write(tmp.path(), "a.eml", "x");
        store.register(&path).unwrap();

        std::fs::write(&path, "much longer").unwrap();
        let refreshed = store.refresh(&path).unwrap();
        assert_eq!(refreshed.size(), 11);
        assert_eq!(store.get(&path).unwrap().size(), 11);
    }

    #[test]
    fn test_spool_then_register() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MessageStore::open(tmp.path(), "eml").unwrap();
        let mut incoming = store.spool().unwrap();
        incoming.write_all(b"Subject: spooled\r\n\r\n").unwrap();
        assert!(store.is_empty(), "unfinished messages are invisible");

        let path = incoming.commit().unwrap();
        let entry = store.register(&path).unwrap();
        assert_eq!(store.list().as_slice(), &[entry]);
    }
}
