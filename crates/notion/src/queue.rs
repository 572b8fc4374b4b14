//! Process-wide serializer for remote calls.
//!
//! Exactly one task runs at a time; the next one starts no sooner than
//! `interval` after the previous one finished.  Waiters are served in arrival
//! order because the underlying `tokio::sync::Mutex` is fair.

use std::future::Future;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{Instant, sleep_until};

#[derive(Debug)]
pub struct RequestQueue {
    interval: Duration,
    /// Completion time of the last task, `None` before the first one.
    last_done: Mutex<Option<Instant>>,
}

impl RequestQueue {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_done: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run `task` once every task enqueued before it has completed and the
    /// pacing delay has elapsed.
    pub async fn run<F, T>(&self, task: F) -> T
    where
        F: Future<Output = T>,
    {
        let mut last_done = self.last_done.lock().await;
        if let Some(done) = *last_done {
            sleep_until(done + self.interval).await;
        }
        let output = task.await;
        *last_done = Some(Instant::now());
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;
    use std::sync::Arc;
    use std::sync::Mutex as StdMutex;

    #[tokio::test(start_paused = true)]
    async fn tasks_run_fifo_and_serially() {
        let queue = RequestQueue::new(Duration::from_millis(334));
        let spans = Arc::new(StdMutex::new(Vec::new()));

        let tasks = (0..5).map(|idx| {
            let spans = spans.clone();
            let queue = &queue;
            async move {
                queue
                    .run(async move {
                        let start = Instant::now();
                        tokio::time::sleep(Duration::from_millis(10 * (5 - idx))).await;
                        spans.lock().unwrap().push((idx, start, Instant::now()));
                        idx
                    })
                    .await
            }
        });
        let results = join_all(tasks).await;
        assert_eq!(results, vec![0, 1, 2, 3, 4]);

        let spans = spans.lock().unwrap();
        let order = spans.iter().map(|(idx, _, _)| *idx).collect::<Vec<_>>();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
        for pair in spans.windows(2) {
            let (_, _, prev_end) = pair[0];
            let (_, next_start, _) = pair[1];
            assert!(next_start >= prev_end + Duration::from_millis(334));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn first_task_starts_immediately() {
        let queue = RequestQueue::new(Duration::from_secs(5));
        let before = Instant::now();
        queue.run(async {}).await;
        assert!(Instant::now() - before < Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_time_counts_toward_pacing() {
        let queue = RequestQueue::new(Duration::from_millis(334));
        queue.run(async {}).await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        let before = Instant::now();
        queue.run(async {}).await;
        assert_eq!(Instant::now(), before);
    }
}
