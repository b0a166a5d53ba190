//! Serialized task queues.
//!
//! The sync context promises that no two local mutations, and no two sync
//! operations, ever interleave their store batches. Rather than fine-grained
//! locking inside the engine, every public operation runs through a
//! [`TaskQueue`]: a fair queue that executes one submitted task at a time in
//! submission order. Suspension points inside a task (store or network I/O)
//! do not release the queue; only task completion does.

use std::future::Future;
use tokio::sync::Mutex;

/// A fair, serialized task queue.
///
/// Tasks submitted with [`TaskQueue::run`] execute one at a time, in
/// submission order (the underlying `tokio` mutex is fair).
#[derive(Debug, Default)]
pub struct TaskQueue {
    lock: Mutex<()>,
}

impl TaskQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs a task to completion once every previously submitted task has
    /// finished, and returns its output.
    pub async fn run<F, T>(&self, task: F) -> T
    where
        F: Future<Output = T>,
    {
        let _guard = self.lock.lock().await;
        task.await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn tasks_do_not_interleave() {
        let queue = Arc::new(TaskQueue::new());
        let active = Arc::new(AtomicU32::new(0));
        let max_active = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let queue = Arc::clone(&queue);
            let active = Arc::clone(&active);
            let max_active = Arc::clone(&max_active);
            handles.push(tokio::spawn(async move {
                queue
                    .run(async {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        max_active.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await;
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn returns_task_output() {
        let queue = TaskQueue::new();
        let out = queue.run(async { 21 * 2 }).await;
        assert_eq!(out, 42);
    }

    #[tokio::test]
    async fn runs_in_submission_order() {
        let queue = Arc::new(TaskQueue::new());
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        // Hold the queue while the numbered tasks enqueue behind it.
        let queue2 = Arc::clone(&queue);
        let gate = tokio::spawn(async move {
            queue2
                .run(async {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                })
                .await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut handles = Vec::new();
        for i in 0..4 {
            let queue = Arc::clone(&queue);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                queue.run(async { order.lock().push(i) }).await;
            }));
            // Give each task time to reach the queue before the next.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        gate.await.unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    }
}
