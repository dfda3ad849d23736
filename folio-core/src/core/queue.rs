use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

pub const DEFAULT_JOB_LIMIT: usize = 10;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Job queue {label} is closed")]
    Closed { label: String },

    #[error("Job in queue {label} failed to run: {source}")]
    Join {
        label: String,
        #[source]
        source: tokio::task::JoinError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueProgress {
    pub label: String,
    pub completed: usize,
    pub total: usize,
}

impl QueueProgress {
    /// Completion as a whole percentage; an empty batch counts as done.
    pub fn percent(&self) -> u32 {
        if self.total == 0 {
            return 100;
        }
        ((self.completed as f64 / self.total as f64) * 100.0).round() as u32
    }
}

pub type ProgressCallback = Arc<dyn Fn(QueueProgress) + Send + Sync>;
pub type CompleteCallback = Box<dyn FnOnce() + Send>;

/// Runs a known number of async jobs with at most `limit` in flight.
///
/// `push` waits for a free slot, so jobs are admitted in submission order.
/// Results come back from `join` in that same order regardless of when each
/// job finished.
pub struct JobQueue<T> {
    label: String,
    limit: usize,
    total: usize,
    semaphore: Arc<Semaphore>,
    completed: Arc<AtomicUsize>,
    on_progress: Option<ProgressCallback>,
    on_complete: Arc<Mutex<Option<CompleteCallback>>>,
    handles: Vec<JoinHandle<T>>,
}

impl<T: Send + 'static> JobQueue<T> {
    pub fn new(label: impl Into<String>, limit: usize, total: usize) -> Self {
        let limit = limit.max(1);
        Self {
            label: label.into(),
            limit,
            total,
            semaphore: Arc::new(Semaphore::new(limit)),
            completed: Arc::new(AtomicUsize::new(0)),
            on_progress: None,
            on_complete: Arc::new(Mutex::new(None)),
            handles: Vec::with_capacity(total),
        }
    }

    pub fn on_progress(mut self, callback: ProgressCallback) -> Self {
        self.on_progress = Some(callback);
        self
    }

    pub fn on_complete(self, callback: impl FnOnce() + Send + 'static) -> Self {
        if let Ok(mut slot) = self.on_complete.lock() {
            *slot = Some(Box::new(callback));
        }
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Jobs currently holding a slot.
    pub fn active(&self) -> usize {
        self.limit - self.semaphore.available_permits()
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub async fn push<F>(&mut self, job: F) -> Result<(), QueueError>
    where
        F: Future<Output = T> + Send + 'static,
    {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| QueueError::Closed {
                label: self.label.clone(),
            })?;

        let finish = JobFinish {
            label: self.label.clone(),
            total: self.total,
            completed: self.completed.clone(),
            on_progress: self.on_progress.clone(),
            on_complete: self.on_complete.clone(),
        };

        let handle = tokio::spawn(async move {
            // Dropped on return or while unwinding, so a panicking job still
            // frees its slot and counts toward completion.
            let _permit = permit;
            let _finish = finish;
            job.await
        });

        self.handles.push(handle);
        Ok(())
    }

    /// Waits for every pushed job and returns one result per job in push
    /// order. A job that panicked or was cancelled yields `QueueError::Join`
    /// without affecting the others.
    pub async fn join(self) -> Vec<Result<T, QueueError>> {
        if self.total == 0 {
            fire_complete(&self.on_complete);
        }

        let mut results = Vec::with_capacity(self.handles.len());
        for handle in self.handles {
            let output = handle.await.map_err(|source| {
                log::warn!("Job in queue {} failed: {}", self.label, source);
                QueueError::Join {
                    label: self.label.clone(),
                    source,
                }
            });
            results.push(output);
        }

        log::debug!("Queue {} finished {} jobs", self.label, results.len());
        results
    }
}

/// Progress bookkeeping for one job, run when the job's task lets go of it.
struct JobFinish {
    label: String,
    total: usize,
    completed: Arc<AtomicUsize>,
    on_progress: Option<ProgressCallback>,
    on_complete: Arc<Mutex<Option<CompleteCallback>>>,
}

impl Drop for JobFinish {
    fn drop(&mut self) {
        let done = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(callback) = &self.on_progress {
            let progress = QueueProgress {
                label: self.label.clone(),
                completed: done,
                total: self.total,
            };
            if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                callback(progress);
            })) {
                log::warn!("Progress callback panicked: {:?}", e);
            }
        }
        if done == self.total {
            if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                fire_complete(&self.on_complete);
            })) {
                log::warn!("Completion callback panicked: {:?}", e);
            }
        }
    }
}

fn fire_complete(slot: &Mutex<Option<CompleteCallback>>) {
    let callback = match slot.lock() {
        Ok(mut guard) => guard.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    };
    if let Some(callback) = callback {
        callback();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_results_keep_push_order() {
        let mut queue = JobQueue::new("order", 3, 5);
        for i in 0..5u64 {
            queue
                .push(async move {
                    // Later jobs finish first.
                    tokio::time::sleep(Duration::from_millis(50 - i * 10)).await;
                    i
                })
                .await
                .unwrap();
        }
        let results: Vec<u64> = queue.join().await.into_iter().map(Result::unwrap).collect();
        assert_eq!(results, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_limit_bounds_concurrency() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut queue = JobQueue::new("bounded", 2, 6);

        for _ in 0..6 {
            let running = running.clone();
            let peak = peak.clone();
            queue
                .push(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                })
                .await
                .unwrap();
            assert!(queue.active() <= 2);
        }

        assert!(queue.join().await.iter().all(Result::is_ok));
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_progress_and_completion() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let finished = Arc::new(AtomicUsize::new(0));

        let seen_cb = seen.clone();
        let finished_cb = finished.clone();
        let mut queue = JobQueue::new("ingest", 10, 4)
            .on_progress(Arc::new(move |progress: QueueProgress| {
                seen_cb.lock().unwrap().push(progress.percent());
            }))
            .on_complete(move || {
                finished_cb.fetch_add(1, Ordering::SeqCst);
            });

        for i in 0..4 {
            queue.push(async move { i }).await.unwrap();
        }
        assert!(queue.join().await.iter().all(Result::is_ok));

        let mut percents = seen.lock().unwrap().clone();
        percents.sort_unstable();
        assert_eq!(percents, vec![25, 50, 75, 100]);
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_queue_completes() {
        let finished = Arc::new(AtomicUsize::new(0));
        let finished_cb = finished.clone();
        let queue: JobQueue<()> = JobQueue::new("empty", 10, 0).on_complete(move || {
            finished_cb.fetch_add(1, Ordering::SeqCst);
        });

        assert!(queue.join().await.is_empty());
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panicking_job_keeps_other_results() {
        let seen = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));

        let seen_cb = seen.clone();
        let finished_cb = finished.clone();
        let mut queue = JobQueue::new("decode", 2, 3)
            .on_progress(Arc::new(move |_: QueueProgress| {
                seen_cb.fetch_add(1, Ordering::SeqCst);
            }))
            .on_complete(move || {
                finished_cb.fetch_add(1, Ordering::SeqCst);
            });

        for i in 0..3u32 {
            queue
                .push(async move {
                    if i == 1 {
                        panic!("corrupt scanline");
                    }
                    i
                })
                .await
                .unwrap();
        }

        let results = queue.join().await;
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_ref().ok(), Some(&0));
        assert!(matches!(results[1], Err(QueueError::Join { .. })));
        assert_eq!(results[2].as_ref().ok(), Some(&2));
        assert_eq!(seen.load(Ordering::SeqCst), 3);
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_percent_rounds() {
        let progress = QueueProgress {
            label: "x".into(),
            completed: 1,
            total: 3,
        };
        assert_eq!(progress.percent(), 33);
    }
}
