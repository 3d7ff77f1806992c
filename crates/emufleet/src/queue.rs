use std::collections::VecDeque;

use tokio::sync::{Mutex, Notify};

/// Shared multiset of pending application paths. Each `pull` hands a job to
/// exactly one consumer; every pull must be balanced by exactly one `ack`,
/// crash paths included, or `join` never resolves.
#[derive(Default)]
pub struct JobQueue {
    pending: Mutex<VecDeque<String>>,
    available: Notify,
    outstanding: Mutex<usize>,
    drained: Notify,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, job: String) {
        {
            let mut outstanding = self.outstanding.lock().await;
            *outstanding += 1;
        }
        self.pending.lock().await.push_back(job);
        self.available.notify_one();
    }

    /// Blocks until a job is available.
    pub async fn pull(&self) -> String {
        loop {
            let notified = self.available.notified();
            if let Some(job) = self.pending.lock().await.pop_front() {
                // Wake the next consumer in case several pushes coalesced
                // into the single stored permit.
                self.available.notify_one();
                return job;
            }
            notified.await;
        }
    }

    /// Marks one pulled job as fully handled, whatever its outcome.
    pub async fn ack(&self) {
        let mut outstanding = self.outstanding.lock().await;
        *outstanding = outstanding.saturating_sub(1);
        if *outstanding == 0 {
            self.drained.notify_waiters();
        }
    }

    /// Resolves once every pushed job has been acknowledged.
    pub async fn join(&self) {
        loop {
            let notified = self.drained.notified();
            if *self.outstanding.lock().await == 0 {
                return;
            }
            notified.await;
        }
    }

    /// True once no unpulled jobs remain. Acknowledgements may still be
    /// outstanding; crashed workers use this to decide whether respawning is
    /// worth it.
    pub async fn is_empty(&self) -> bool {
        self.pending.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, time::Duration};

    #[tokio::test]
    async fn pull_returns_pushed_jobs() {
        let queue = JobQueue::new();
        queue.push("a.apk".into()).await;
        queue.push("b.apk".into()).await;
        assert_eq!(queue.pull().await, "a.apk");
        assert_eq!(queue.pull().await, "b.apk");
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn pull_blocks_until_a_job_arrives() {
        let queue = Arc::new(JobQueue::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pull().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!consumer.is_finished());
        queue.push("late.apk".into()).await;
        assert_eq!(consumer.await.unwrap(), "late.apk");
    }

    #[tokio::test]
    async fn join_waits_for_every_ack() {
        let queue = Arc::new(JobQueue::new());
        queue.push("a.apk".into()).await;
        queue.push("b.apk".into()).await;
        queue.pull().await;
        queue.pull().await;

        let join = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.join().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!join.is_finished());

        queue.ack().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!join.is_finished());

        queue.ack().await;
        join.await.unwrap();
    }

    #[tokio::test]
    async fn join_on_an_empty_queue_returns_immediately() {
        let queue = JobQueue::new();
        queue.join().await;
    }

    #[tokio::test]
    async fn concurrent_consumers_each_see_a_job_once() {
        let queue = Arc::new(JobQueue::new());
        for i in 0..32 {
            queue.push(format!("app-{i}.apk")).await;
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let queue = Arc::clone(&queue);
            handles.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                loop {
                    tokio::select! {
                        job = queue.pull() => {
                            seen.push(job);
                            queue.ack().await;
                        }
                        _ = tokio::time::sleep(Duration::from_millis(200)) => break,
                    }
                }
                seen
            }));
        }

        let mut all: Vec<String> = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        queue.join().await;
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 32);
    }
}
