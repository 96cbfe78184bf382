// THEORY:
// Mark edits arrive in bursts: an operator clicks, drags, re-clicks. Writing the
// sidecar on every event would thrash the store, so the `MarkWriter` coalesces.
// Each submission replaces any pending edit for the same frame and restarts a
// debounce timer; only when the timer of the latest submission expires is the
// pending set persisted. The last edit before the window closes wins.
//
// Flushes are serialized: a flush takes the pending set and persists it while
// holding the writer's persist lock, so batches reach the store in the order
// they were taken and an older batch can never land on top of a newer one.
// A debounced flush that fails puts its frames back and re-arms the timer, up
// to `retries` times.
//
// A write that would not change anything (the pending frame is equal to what is
// already stored) is skipped. `flush` persists immediately, for shutdown or
// before switching videos.

use crate::core_modules::marks::{FrameMark, FrameMarks};
use crate::core_modules::state_store::{PerVideoStateStore, StatePatch};
use crate::error::{PrepError, Result};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct MarkWriterConfig {
    pub debounce: Duration,
    /// Times a failed debounced save is re-armed before the edits are left
    /// pending for the next submit or flush.
    pub retries: u32,
}

impl Default for MarkWriterConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(250),
            retries: 5,
        }
    }
}

#[derive(Default)]
struct Pending {
    frames: FrameMarks,
    generation: u64,
}

struct Inner {
    store: Arc<PerVideoStateStore>,
    video: PathBuf,
    config: MarkWriterConfig,
    pending: Mutex<Pending>,
    persisting: tokio::sync::Mutex<()>,
}

/// Debounced, coalescing writer of one video's frame marks.
#[derive(Clone)]
pub struct MarkWriter {
    inner: Arc<Inner>,
}

impl MarkWriter {
    pub fn new(store: Arc<PerVideoStateStore>, video: &Path, config: MarkWriterConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                video: video.to_path_buf(),
                config,
                pending: Mutex::new(Pending::default()),
                persisting: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn video(&self) -> &Path {
        &self.inner.video
    }

    pub fn pending_len(&self) -> usize {
        self.inner.pending.lock().frames.len()
    }

    /// Queues `frame` under `key` and (re)starts the debounce timer. Must be
    /// called from within a tokio runtime.
    pub fn submit(&self, key: String, frame: FrameMark) {
        let generation = {
            let mut pending = self.inner.pending.lock();
            pending.frames.insert(key, frame);
            pending.generation += 1;
            pending.generation
        };
        Inner::arm(self.inner.clone(), generation, self.inner.config.retries);
    }

    /// Persists everything pending now. Returns the number of frames written.
    pub async fn flush(&self) -> Result<usize> {
        Inner::flush(&self.inner).await
    }
}

impl Inner {
    /// Flushes after the debounce unless a newer submission re-armed the timer.
    fn arm(inner: Arc<Inner>, generation: u64, retries_left: u32) {
        tokio::spawn(async move {
            tokio::time::sleep(inner.config.debounce).await;
            if inner.pending.lock().generation != generation {
                return;
            }
            let Err(e) = Inner::flush(&inner).await else {
                return;
            };
            if retries_left == 0 {
                tracing::warn!(video = %inner.video.display(), error = %e, "Debounced mark save failed, giving up until the next edit");
                return;
            }
            tracing::warn!(video = %inner.video.display(), error = %e, retries_left, "Debounced mark save failed, retrying");
            let generation = {
                let mut pending = inner.pending.lock();
                pending.generation += 1;
                pending.generation
            };
            Inner::arm(inner, generation, retries_left - 1);
        });
    }

    async fn flush(inner: &Arc<Inner>) -> Result<usize> {
        let _persisting = inner.persisting.lock().await;
        let frames = std::mem::take(&mut inner.pending.lock().frames);
        if frames.is_empty() {
            return Ok(0);
        }
        let worker = inner.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            let result = worker.persist(&frames);
            (frames, result)
        })
        .await
        .map_err(|e| PrepError::Worker(e.to_string()))?;

        match outcome {
            (_, Ok(written)) => Ok(written),
            (frames, Err(e)) => {
                // Put the edits back unless a newer edit for the frame arrived meanwhile.
                let mut pending = inner.pending.lock();
                for (key, frame) in frames {
                    pending.frames.entry(key).or_insert(frame);
                }
                Err(e)
            }
        }
    }
    fn persist(&self, frames: &FrameMarks) -> Result<usize> {
        let stored = self.store.load(&self.video)?;
        let changed: FrameMarks = frames
            .iter()
            .filter(|(key, frame)| stored.frames.get(*key) != Some(*frame))
            .map(|(key, frame)| (key.clone(), frame.clone()))
            .collect();
        let skipped = frames.len() - changed.len();
        if skipped > 0 {
            tracing::debug!(video = %self.video.display(), skipped, "Skipping unchanged frame marks");
        }
        if changed.is_empty() {
            return Ok(0);
        }
        let written = changed.len();
        self.store.save(
            &self.video,
            StatePatch {
                frames: Some(changed),
                ..StatePatch::default()
            },
        )?;
        Ok(written)
    }
}
