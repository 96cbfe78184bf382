// THEORY:
// Background estimation and segmentation are CPU-bound and blocking. The
// `JobPool` moves them off the async executor onto tokio's blocking threads,
// bounded by a semaphore sized to the machine's cores so a batch cannot
// oversubscribe the CPU.
//
// It also guards per-video exclusivity for estimations: a video can hold at
// most one claim at a time. A second claim for the same video is rejected with
// `Busy` rather than queued, so two estimations never race to write the same
// background. The claim is released when its guard is dropped, whether the
// job succeeded, failed or was cancelled.

use crate::error::{PrepError, Result};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;

pub struct JobPool {
    in_flight: Arc<Mutex<HashSet<PathBuf>>>,
    permits: Arc<Semaphore>,
    workers: usize,
}

impl Default for JobPool {
    fn default() -> Self {
        Self::new(num_cpus::get())
    }
}

impl JobPool {
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            permits: Arc::new(Semaphore::new(workers)),
            workers,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn is_busy(&self, video: &Path) -> bool {
        self.in_flight.lock().contains(video)
    }

    /// Claims exclusive estimation rights for `video`.
    pub fn claim(&self, video: &Path) -> Result<VideoClaim> {
        let mut in_flight = self.in_flight.lock();
        if !in_flight.insert(video.to_path_buf()) {
            tracing::info!(video = %video.display(), "Rejecting concurrent background estimation");
            return Err(PrepError::Busy(video.to_path_buf()));
        }
        Ok(VideoClaim {
            in_flight: self.in_flight.clone(),
            video: video.to_path_buf(),
        })
    }

    /// Runs `job` on a blocking thread once a worker permit is free.
    pub async fn run_blocking<T, F>(&self, job: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| PrepError::Worker(e.to_string()))?;
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job()
        })
        .await
        .map_err(|e| PrepError::Worker(e.to_string()))?
    }
}

/// Exclusive claim on one video, released on drop.
#[derive(Debug)]
pub struct VideoClaim {
    in_flight: Arc<Mutex<HashSet<PathBuf>>>,
    video: PathBuf,
}

impl VideoClaim {
    pub fn video(&self) -> &Path {
        &self.video
    }
}

impl Drop for VideoClaim {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.video);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn second_claim_is_busy_until_the_first_drops() {
        let pool = JobPool::new(2);
        let video = Path::new("a.mp4");
        let claim = pool.claim(video).unwrap();
        assert!(pool.is_busy(video));
        assert_matches!(pool.claim(video), Err(PrepError::Busy(_)));
        assert!(pool.claim(Path::new("b.mp4")).is_ok());
        drop(claim);
        assert!(!pool.is_busy(video));
        assert!(pool.claim(video).is_ok());
    }

    #[tokio::test]
    async fn blocking_jobs_return_their_result() {
        let pool = JobPool::new(1);
        assert_eq!(pool.run_blocking(|| Ok(21 * 2)).await.unwrap(), 42);
        let err = pool
            .run_blocking(|| -> Result<()> { Err(PrepError::Cancelled) })
            .await
            .unwrap_err();
        assert_matches!(err, PrepError::Cancelled);
    }

    #[tokio::test]
    async fn concurrency_is_bounded_by_workers() {
        let pool = Arc::new(JobPool::new(2));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let jobs = (0..6).map(|_| {
            let pool = pool.clone();
            let running = running.clone();
            let peak = peak.clone();
            async move {
                pool.run_blocking(move || {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(std::time::Duration::from_millis(20));
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
            }
        });
        for result in futures::future::join_all(jobs).await {
            result.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn zero_workers_still_runs_one() {
        assert_eq!(JobPool::new(0).workers(), 1);
        assert!(JobPool::default().workers() >= 1);
    }
}
