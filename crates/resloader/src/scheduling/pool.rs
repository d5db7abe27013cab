use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, FutureExt};
use tokio::runtime::Handle;

use crate::metric;
use crate::utils::defer;

/// The immediate outcome of [`FetchPool::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// A worker slot was free; the task is running.
    Accepted,
    /// All slots are busy; the task waits in the overflow ring.
    Queued,
    /// The task was displaced immediately (zero-capacity ring) and will
    /// never run.
    Rejected,
}

#[derive(Default)]
struct PoolState {
    /// Number of occupied worker slots.
    running: usize,
    /// Tasks waiting for a slot, oldest in front.
    waiting: VecDeque<BoxFuture<'static, ()>>,
}

struct PoolInner {
    max_workers: usize,
    max_waiting: usize,
    runtime: Handle,
    state: Mutex<PoolState>,
}

/// Bounded admission control for fetch tasks.
///
/// At most `max_workers` tasks run concurrently. Excess tasks wait in a ring
/// of capacity `max_waiting`; when the ring is full, the *oldest* waiting
/// task is displaced and never executes. Freed slots drain the ring in FIFO
/// order. Submission never blocks and the state mutex never covers task
/// execution or drops.
///
/// Displaced tasks are simply dropped. Anything waiting on them observes a
/// closed channel, which the load pipeline treats as a silent abandonment
/// rather than a failure.
#[derive(Clone)]
pub struct FetchPool {
    inner: Arc<PoolInner>,
}

impl FetchPool {
    pub fn new(max_workers: usize, max_waiting: usize, runtime: Handle) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                // A pool without any worker slot could never run anything.
                max_workers: max_workers.max(1),
                max_waiting,
                runtime,
                state: Mutex::new(PoolState::default()),
            }),
        }
    }

    /// Submits a fetch task, returning immediately with the admission
    /// outcome.
    pub fn submit(&self, task: impl Future<Output = ()> + Send + 'static) -> SubmitOutcome {
        let task = task.boxed();

        let mut state = self.inner.state.lock().unwrap();

        if state.running < self.inner.max_workers {
            state.running += 1;
            let counts = (state.running, state.waiting.len());
            drop(state);

            self.emit_gauges(counts);
            self.spawn_on_slot(task);
            return SubmitOutcome::Accepted;
        }

        state.waiting.push_back(task);
        let displaced = if state.waiting.len() > self.inner.max_waiting {
            state.waiting.pop_front()
        } else {
            None
        };
        let counts = (state.running, state.waiting.len());
        drop(state);

        self.emit_gauges(counts);

        match displaced {
            None => SubmitOutcome::Queued,
            Some(dropped) => {
                // Dropping the task outside the lock; it tears down channels
                // and dedup state of its own.
                metric!(counter("fetch_pool.displaced") += 1);
                tracing::debug!("Displacing the oldest waiting fetch task");
                drop(dropped);

                // With a zero-capacity ring the displaced task is the one
                // just submitted.
                if self.inner.max_waiting == 0 {
                    SubmitOutcome::Rejected
                } else {
                    SubmitOutcome::Queued
                }
            }
        }
    }

    /// Number of occupied worker slots.
    pub fn running(&self) -> usize {
        self.inner.state.lock().unwrap().running
    }

    /// Number of tasks in the overflow ring.
    pub fn waiting(&self) -> usize {
        self.inner.state.lock().unwrap().waiting.len()
    }

    fn spawn_on_slot(&self, task: BoxFuture<'static, ()>) {
        let pool = self.clone();
        self.inner.runtime.spawn(async move {
            // Runs on every exit path, including cancellation at shutdown.
            let _slot = defer(move || pool.task_finished());
            task.await;
        });
    }

    /// Hands the freed slot to the oldest waiting task, or releases it.
    fn task_finished(&self) {
        let mut state = self.inner.state.lock().unwrap();
        let next = state.waiting.pop_front();
        if next.is_none() {
            state.running = state.running.saturating_sub(1);
        }
        let counts = (state.running, state.waiting.len());
        drop(state);

        self.emit_gauges(counts);
        if let Some(task) = next {
            self.spawn_on_slot(task);
        }
    }

    fn emit_gauges(&self, (running, waiting): (usize, usize)) {
        metric!(gauge("fetch_pool.running") = running as u64);
        metric!(gauge("fetch_pool.waiting") = waiting as u64);
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::oneshot;

    use super::*;

    /// A task that reports when it starts and holds its slot until released.
    fn gated_task(
        started: oneshot::Sender<()>,
        release: oneshot::Receiver<()>,
    ) -> impl Future<Output = ()> + Send + 'static {
        async move {
            started.send(()).ok();
            release.await.ok();
        }
    }

    #[tokio::test]
    async fn single_worker_queues_and_drains_fifo() {
        let pool = FetchPool::new(1, 30, Handle::current());

        let (started1, started1_rx) = oneshot::channel();
        let (release1, release1_rx) = oneshot::channel();
        let (started2, started2_rx) = oneshot::channel();
        let (release2, release2_rx) = oneshot::channel();
        drop(release2);

        assert_eq!(
            pool.submit(gated_task(started1, release1_rx)),
            SubmitOutcome::Accepted
        );
        assert_eq!(
            pool.submit(gated_task(started2, release2_rx)),
            SubmitOutcome::Queued
        );

        started1_rx.await.unwrap();
        assert_eq!(pool.running(), 1);
        assert_eq!(pool.waiting(), 1);

        // Releasing the first task hands its slot to the queued one.
        release1.send(()).ok();
        started2_rx.await.unwrap();
        assert_eq!(pool.waiting(), 0);
    }

    #[tokio::test]
    async fn overflow_displaces_the_oldest_waiting_task() {
        let pool = FetchPool::new(1, 2, Handle::current());

        let (started1, started1_rx) = oneshot::channel();
        let (release1, release1_rx) = oneshot::channel();
        assert_eq!(
            pool.submit(gated_task(started1, release1_rx)),
            SubmitOutcome::Accepted
        );
        started1_rx.await.unwrap();

        // Channels report whether a queued task was dropped unexecuted.
        let mut queued = Vec::new();
        for _ in 0..2 {
            let (started, started_rx) = oneshot::channel();
            let (release, release_rx) = oneshot::channel();
            drop(release);
            assert_eq!(
                pool.submit(gated_task(started, release_rx)),
                SubmitOutcome::Queued
            );
            queued.push(started_rx);
        }
        assert_eq!(pool.waiting(), 2);

        // The ring is full; this displaces the oldest held task.
        let (started4, started4_rx) = oneshot::channel();
        let (release4, release4_rx) = oneshot::channel();
        drop(release4);
        assert_eq!(
            pool.submit(gated_task(started4, release4_rx)),
            SubmitOutcome::Queued
        );
        assert_eq!(pool.waiting(), 2);

        let oldest = queued.remove(0);
        assert!(oldest.await.is_err(), "displaced task must never start");

        // Draining the slot runs the survivors in order.
        release1.send(()).ok();
        queued.remove(0).await.unwrap();
        started4_rx.await.unwrap();
    }

    #[tokio::test]
    async fn zero_capacity_ring_rejects_excess_tasks() {
        let pool = FetchPool::new(1, 0, Handle::current());

        let (started1, started1_rx) = oneshot::channel();
        let (release1, release1_rx) = oneshot::channel();
        assert_eq!(
            pool.submit(gated_task(started1, release1_rx)),
            SubmitOutcome::Accepted
        );
        started1_rx.await.unwrap();

        let (started2, started2_rx) = oneshot::channel();
        let (release2, release2_rx) = oneshot::channel();
        drop(release2);
        assert_eq!(
            pool.submit(gated_task(started2, release2_rx)),
            SubmitOutcome::Rejected
        );
        assert!(started2_rx.await.is_err(), "rejected task must never start");

        release1.send(()).ok();
    }

    #[tokio::test]
    async fn ring_occupancy_never_exceeds_capacity() {
        let pool = FetchPool::new(1, 3, Handle::current());

        let (started1, started1_rx) = oneshot::channel();
        let (release1, release1_rx) = oneshot::channel();
        pool.submit(gated_task(started1, release1_rx));
        started1_rx.await.unwrap();

        for _ in 0..10 {
            let (started, started_rx) = oneshot::channel();
            let (release, release_rx) = oneshot::channel();
            drop(release);
            drop(started_rx);
            pool.submit(gated_task(started, release_rx));
            assert!(pool.waiting() <= 3);
        }
        assert_eq!(pool.waiting(), 3);

        release1.send(()).ok();
    }

    #[tokio::test]
    async fn parallel_slots_run_concurrently() {
        let pool = FetchPool::new(2, 0, Handle::current());

        let (started1, started1_rx) = oneshot::channel();
        let (release1, release1_rx) = oneshot::channel();
        let (started2, started2_rx) = oneshot::channel();
        let (release2, release2_rx) = oneshot::channel();

        assert_eq!(
            pool.submit(gated_task(started1, release1_rx)),
            SubmitOutcome::Accepted
        );
        assert_eq!(
            pool.submit(gated_task(started2, release2_rx)),
            SubmitOutcome::Accepted
        );

        // Both hold a slot at the same time.
        started1_rx.await.unwrap();
        started2_rx.await.unwrap();
        assert_eq!(pool.running(), 2);

        release1.send(()).ok();
        release2.send(()).ok();
    }
}
