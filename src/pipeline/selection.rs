//! Decode-and-publish for the currently selected message.
//!
//! Every [`SelectionPipeline::select`] gets a generation number. Reading and
//! decoding run on a worker thread; the result travels back over a channel and
//! is handed out by [`PublishQueue`] on the consumer's thread only if its
//! generation is still the latest one issued. Superseded workers are cancelled
//! through their [`CancelToken`], but a slow one that finishes anyway is
//! simply discarded, so the last-started selection always wins.

use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{PapercutError, Result};
use crate::model::{MessageEntry, StructuredMessage};
use crate::parser::mime;
use crate::pipeline::CancelToken;

/// Where a selection task currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Reading,
    Decoding,
    /// Result sent, waiting for the consumer to take it.
    Publishing,
    Done,
    Cancelled,
    Failed,
}

/// A decoded message ready for display.
#[derive(Debug, Clone)]
pub struct Preview {
    pub entry: MessageEntry,
    /// Raw file text, lines joined with `\n`.
    pub raw: String,
    pub message: StructuredMessage,
}

/// What the consumer should display.
#[derive(Debug)]
pub enum Publish {
    Message(Box<Preview>),
    /// Reading or decoding failed; show an empty preview.
    Failed {
        entry: MessageEntry,
        error: PapercutError,
    },
    /// The selection was cleared; show an empty preview.
    Cleared,
}

struct Outcome {
    generation: u64,
    stage: Arc<Mutex<Stage>>,
    publish: Publish,
}

struct Task {
    generation: u64,
    cancel: CancelToken,
    stage: Arc<Mutex<Stage>>,
}

/// Producer side: owned by whoever reacts to selection changes.
pub struct SelectionPipeline {
    latest: Arc<AtomicU64>,
    current: Mutex<Option<Task>>,
    tx: Sender<Outcome>,
    read_chunk_size: usize,
}

/// Consumer side: polled on the thread that owns the display.
pub struct PublishQueue {
    latest: Arc<AtomicU64>,
    rx: Receiver<Outcome>,
}

impl SelectionPipeline {
    /// Create a pipeline and the queue its results are published through.
    pub fn new(read_chunk_size: usize) -> (Self, PublishQueue) {
        let (tx, rx) = mpsc::channel();
        let latest = Arc::new(AtomicU64::new(0));
        let pipeline = Self {
            latest: Arc::clone(&latest),
            current: Mutex::new(None),
            tx,
            read_chunk_size: read_chunk_size.max(1),
        };
        (pipeline, PublishQueue { latest, rx })
    }

    /// Start loading `entry`, superseding any in-flight selection.
    ///
    /// Returns immediately with the new generation number.
    pub fn select(&self, entry: MessageEntry) -> u64 {
        let mut current = self.lock_current();
        let generation = self.supersede(&mut current);

        let cancel = CancelToken::new();
        let stage = Arc::new(Mutex::new(Stage::Reading));
        *current = Some(Task {
            generation,
            cancel: cancel.clone(),
            stage: Arc::clone(&stage),
        });
        drop(current);

        let tx = self.tx.clone();
        let chunk_size = self.read_chunk_size;
        let worker_stage = Arc::clone(&stage);
        let worker_entry = entry.clone();
        let spawned = thread::Builder::new()
            .name(format!("papercut-preview-{generation}"))
            .spawn(move || {
                run_task(generation, worker_entry, chunk_size, cancel, worker_stage, tx)
            });

        if let Err(e) = spawned {
            warn!(error = %e, "Failed to spawn preview worker");
            set_stage(&stage, Stage::Failed);
            let _ = self.tx.send(Outcome {
                generation,
                stage,
                publish: Publish::Failed {
                    error: PapercutError::io(entry.path(), e),
                    entry,
                },
            });
        }
        generation
    }

    /// Supersede any in-flight selection and publish [`Publish::Cleared`].
    pub fn clear(&self) -> u64 {
        let mut current = self.lock_current();
        let generation = self.supersede(&mut current);
        let stage = Arc::new(Mutex::new(Stage::Publishing));
        *current = Some(Task {
            generation,
            cancel: CancelToken::new(),
            stage: Arc::clone(&stage),
        });
        drop(current);

        let _ = self.tx.send(Outcome {
            generation,
            stage,
            publish: Publish::Cleared,
        });
        generation
    }

    /// Cancel in-flight work without publishing anything.
    pub fn cancel(&self) {
        let mut current = self.lock_current();
        self.supersede(&mut current);
    }

    /// Stage of the most recent selection, if any.
    pub fn current_stage(&self) -> Option<Stage> {
        self.lock_current()
            .as_ref()
            .map(|task| *lock_stage(&task.stage))
    }

    /// The most recently issued generation (0 before the first selection).
    pub fn generation(&self) -> u64 {
        self.latest.load(Ordering::Acquire)
    }

    /// Bump the generation and cancel the previous task. Called with the
    /// `current` lock held so generations and tasks stay in step.
    fn supersede(&self, current: &mut Option<Task>) -> u64 {
        let generation = self.latest.fetch_add(1, Ordering::AcqRel) + 1;
        if let Some(previous) = current.take() {
            previous.cancel.cancel();
            debug!(
                superseded = previous.generation,
                generation, "Selection superseded"
            );
        }
        generation
    }

    fn lock_current(&self) -> MutexGuard<'_, Option<Task>> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for SelectionPipeline {
    fn drop(&mut self) {
        if let Some(task) = self.lock_current().take() {
            task.cancel.cancel();
        }
    }
}

impl PublishQueue {
    /// Take the next result for the latest selection without blocking.
    ///
    /// Results from superseded selections are discarded along the way.
    pub fn try_recv(&self) -> Option<Publish> {
        while let Ok(outcome) = self.rx.try_recv() {
            if let Some(publish) = self.accept(outcome) {
                return Some(publish);
            }
        }
        None
    }

    /// Like [`PublishQueue::try_recv`], waiting up to `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Publish> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(remaining) {
                Ok(outcome) => {
                    if let Some(publish) = self.accept(outcome) {
                        return Some(publish);
                    }
                }
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    fn accept(&self, outcome: Outcome) -> Option<Publish> {
        let latest = self.latest.load(Ordering::Acquire);
        if outcome.generation != latest {
            debug!(
                generation = outcome.generation,
                latest, "Discarding superseded preview"
            );
            set_stage(&outcome.stage, Stage::Cancelled);
            return None;
        }
        let done = match outcome.publish {
            Publish::Failed { .. } => Stage::Failed,
            _ => Stage::Done,
        };
        set_stage(&outcome.stage, done);
        Some(outcome.publish)
    }
}

/// Worker body: Read, Decode, then hand the result to the consumer.
fn run_task(
    generation: u64,
    entry: MessageEntry,
    chunk_size: usize,
    cancel: CancelToken,
    stage: Arc<Mutex<Stage>>,
    tx: Sender<Outcome>,
) {
    let result = read_entry(entry.path(), chunk_size, &cancel).and_then(|raw| {
        set_stage(&stage, Stage::Decoding);
        let message = mime::decode(&raw, &cancel)?;
        cancel.check()?;
        Ok((raw, message))
    });

    let publish = match result {
        Ok((raw, message)) => {
            set_stage(&stage, Stage::Publishing);
            Publish::Message(Box::new(Preview {
                entry,
                raw: raw_text(&raw),
                message,
            }))
        }
        Err(e) if e.is_cancelled() => {
            debug!(generation, path = %entry.path().display(), "Preview cancelled");
            set_stage(&stage, Stage::Cancelled);
            return;
        }
        Err(e) => {
            warn!(generation, path = %entry.path().display(), error = %e, "Preview failed");
            set_stage(&stage, Stage::Failed);
            Publish::Failed { entry, error: e }
        }
    };

    // The consumer may have gone away; nothing left to do then.
    let _ = tx.send(Outcome {
        generation,
        stage,
        publish,
    });
}

/// Read a whole file in chunks, checking for cancellation between them.
pub fn read_entry(path: &Path, chunk_size: usize, cancel: &CancelToken) -> Result<Vec<u8>> {
    cancel.check()?;
    let mut file = File::open(path).map_err(|e| PapercutError::io(path, e))?;
    let expected = file.metadata().map(|m| m.len() as usize).unwrap_or(0);
    let mut raw = Vec::with_capacity(expected);
    let mut chunk = vec![0u8; chunk_size.max(1)];

    loop {
        cancel.check()?;
        match file.read(&mut chunk) {
            Ok(0) => return Ok(raw),
            Ok(n) => raw.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(PapercutError::io(path, e)),
        }
    }
}

/// The raw view: file text with line terminators normalised to `\n`.
fn raw_text(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).lines().collect::<Vec<_>>().join("\n")
}

/// Index to select after removing the item at `index`, given how many items
/// remain: the same position if it still exists, else the last item, else none.
pub fn selection_after_removal(index: usize, remaining: usize) -> Option<usize> {
    match remaining {
        0 => None,
        n if index < n => Some(index),
        n => Some(n - 1),
    }
}

/// Where the selection lands after deleting the item at `removed`.
///
/// Only deleting the selected item moves it (see [`selection_after_removal`]);
/// deleting an item above it shifts the index down by one.
pub fn selection_after_delete(
    selected: Option<usize>,
    removed: usize,
    remaining: usize,
) -> Option<usize> {
    match selected {
        Some(current) if current == removed => selection_after_removal(removed, remaining),
        Some(current) if current > removed => Some(current - 1),
        other => other,
    }
}

fn lock_stage(stage: &Mutex<Stage>) -> MutexGuard<'_, Stage> {
    stage.lock().unwrap_or_else(|e| e.into_inner())
}

fn set_stage(stage: &Mutex<Stage>, next: Stage) {
    *lock_stage(stage) = next;
}
