//! Cancellable scheduled work.
//!
//! Every timer the client runs (retry waits aside) is a [`ScheduledTask`], so
//! teardown can cancel all pending work deterministically.

use std::{future::Future, time::Duration};

use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Handle to spawned background work. Dropping the handle cancels the work.
#[derive(Debug)]
pub struct ScheduledTask {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl ScheduledTask {
    /// Run `work` once after `delay`, unless cancelled before the delay elapses.
    ///
    /// Once the delay has elapsed the work runs to completion.
    pub fn after<F>(delay: Duration, work: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let stop = CancellationToken::new();
        let stop_child = stop.child_token();
        let task = tokio::spawn(async move {
            tokio::select! {
                _ = stop_child.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            work.await;
        });
        Self { stop, task }
    }

    /// Call `tick` every `period`, starting one period from now, until it
    /// returns `false` or the task is cancelled.
    pub fn every<F>(period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let stop = CancellationToken::new();
        let stop_child = stop.child_token();
        let task = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop_child.cancelled() => break,
                    _ = interval.tick() => {
                        if !tick() {
                            break;
                        }
                    }
                }
            }
        });
        Self { stop, task }
    }

    /// Spawn long-running work that observes the supplied token itself.
    pub fn spawn<F, Fut>(work: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let stop = CancellationToken::new();
        let task = tokio::spawn(work(stop.child_token()));
        Self { stop, task }
    }

    pub fn cancel(&self) {
        self.stop.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn runs_after_delay() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        let _task = ScheduledTask::after(Duration::from_secs(5), async move {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(4_999)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_handle_cancels_pending_work() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        let task = ScheduledTask::after(Duration::from_secs(1), async move {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });
        drop(task);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn repeats_until_cancelled() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let ticks_clone = ticks.clone();
        let task = ScheduledTask::every(Duration::from_secs(30), move || {
            ticks_clone.fetch_add(1, Ordering::SeqCst);
            true
        });

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(62)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        task.cancel();
        assert!(task.is_cancelled());
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn repeating_task_stops_when_tick_declines() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let ticks_clone = ticks.clone();
        let task = ScheduledTask::every(Duration::from_secs(1), move || {
            ticks_clone.fetch_add(1, Ordering::SeqCst) < 1
        });

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 2);
        assert!(task.is_finished());
    }
}
