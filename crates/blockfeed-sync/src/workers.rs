//! Bounded worker pool for auxiliary I/O triggered by processors.
//!
//! Jobs are fire-and-forget relative to the sync loop: submission never
//! blocks, and a full queue drops the job with a warning.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

type Job = BoxFuture<'static, ()>;

/// Cloneable submission side of a [`WorkerPool`].
#[derive(Clone)]
pub struct WorkerHandle {
    name: Arc<str>,
    sender: mpsc::Sender<Job>,
    dropped: Arc<AtomicU64>,
}

impl WorkerHandle {
    /// Queue `job`; returns `false` if the queue is full or the pool is gone.
    pub fn try_submit<F>(&self, job: F) -> bool
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        match self.sender.try_send(job.boxed()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(pool = %self.name, dropped, "worker queue full, job dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!(pool = %self.name, "worker pool closed, job dropped");
                false
            }
        }
    }

    /// Jobs dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// N tokio workers draining one bounded queue.
pub struct WorkerPool {
    handle: WorkerHandle,
    stop: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `workers` tasks on the current runtime.
    pub fn spawn(name: &str, workers: usize, queue: usize) -> Self {
        let (sender, receiver) = mpsc::channel::<Job>(queue.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        let (stop, _) = watch::channel(false);

        let workers = (0..workers.max(1))
            .map(|id| {
                let receiver = Arc::clone(&receiver);
                let mut stop = stop.subscribe();
                let name = name.to_string();
                tokio::spawn(async move {
                    loop {
                        let job = tokio::select! {
                            _ = stop.changed() => break,
                            job = async { receiver.lock().await.recv().await } => match job {
                                Some(job) => job,
                                None => break,
                            },
                        };
                        job.await;
                    }
                    tracing::debug!(pool = %name, worker = id, "worker stopped");
                })
            })
            .collect();

        Self {
            handle: WorkerHandle {
                name: Arc::from(name),
                sender,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            stop,
            workers,
        }
    }

    pub fn handle(&self) -> WorkerHandle {
        self.handle.clone()
    }

    /// Stop accepting work, let running jobs finish, and wait for the workers.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        for worker in self.workers {
            if let Err(e) = worker.await {
                tracing::warn!(error = %e, "worker task panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn jobs_run_on_workers() {
        let pool = WorkerPool::spawn("test", 2, 8);
        let handle = pool.handle();
        let (tx, mut rx) = mpsc::channel(8);
        for i in 0..4 {
            let tx = tx.clone();
            assert!(handle.try_submit(async move {
                tx.send(i).await.unwrap();
            }));
        }
        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap());
        }
        seen.sort();
        assert_eq!(seen, vec![0, 1, 2, 3]);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn full_queue_drops() {
        let pool = WorkerPool::spawn("slow", 1, 1);
        let handle = pool.handle();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();

        // Occupy the only worker until released.
        assert!(handle.try_submit(async move {
            let _ = started_tx.send(());
            let _ = release_rx.await;
        }));
        started_rx.await.unwrap();

        assert!(handle.try_submit(async {}));
        assert!(!handle.try_submit(async {}));
        assert_eq!(handle.dropped(), 1);

        let _ = release_tx.send(());
        pool.shutdown().await;
    }
}
