//! Single-worker timer queue.
//!
//! Every timer gets its own task for the delay, but job bodies run one at a
//! time behind a shared worker lock. Shutdown cancels pending timers and
//! waits (bounded) for bodies already running.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};

pub type Job = Pin<Box<dyn Future<Output = ()> + Send>>;
pub type JobFactory = Arc<dyn Fn() -> Job + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("scheduler is shut down")]
    ShutDown,
    #[error("scheduled tasks still running after {0:?}")]
    ShutdownTimeout(Duration),
}

pub struct Scheduler {
    worker: Arc<tokio::sync::Mutex<()>>,
    tasks: Mutex<JoinSet<()>>,
    cancel: watch::Sender<bool>,
}

/// Handle to a fixed-rate job. Cancelling (or dropping) stops it between
/// ticks; a tick already running completes.
pub struct PeriodicHandle {
    period: Duration,
    cancel: watch::Sender<bool>,
}

impl PeriodicHandle {
    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            worker: Arc::new(tokio::sync::Mutex::new(())),
            tasks: Mutex::new(JoinSet::new()),
            cancel,
        }
    }

    pub fn is_shut_down(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Run `job` on the worker after `delay`.
    pub fn schedule(&self, delay: Duration, job: Job) -> Result<(), SchedulerError> {
        let worker = self.worker.clone();
        let mut cancelled = self.cancel.subscribe();
        self.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancelled.wait_for(|c| *c) => return,
            }
            let _worker = worker.lock().await;
            job.await;
        })
    }

    /// Run a fresh job from `factory` every `period`, first after one period.
    pub fn schedule_periodic(
        &self,
        period: Duration,
        factory: JobFactory,
    ) -> Result<PeriodicHandle, SchedulerError> {
        let worker = self.worker.clone();
        let mut shutdown = self.cancel.subscribe();
        let (cancel, mut cancelled) = watch::channel(false);
        self.spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown.wait_for(|c| *c) => return,
                    changed = cancelled.changed() => {
                        if changed.is_err() || *cancelled.borrow() {
                            return;
                        }
                        continue;
                    }
                }
                let _worker = worker.lock().await;
                factory().await;
            }
        })?;
        Ok(PeriodicHandle { period, cancel })
    }

    fn spawn(&self, task: impl Future<Output = ()> + Send + 'static) -> Result<(), SchedulerError> {
        if self.is_shut_down() {
            return Err(SchedulerError::ShutDown);
        }
        let mut tasks = self.tasks.lock().map_err(|_| SchedulerError::ShutDown)?;
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task);
        Ok(())
    }

    /// Cancel pending timers and wait up to `wait` for running jobs.
    pub async fn shutdown(&self, wait: Duration) -> Result<(), SchedulerError> {
        let _ = self.cancel.send(true);
        let mut tasks = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => return Ok(()),
        };
        let drained = tokio::time::timeout(wait, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        match drained {
            Ok(()) => Ok(()),
            Err(_) => {
                tasks.abort_all();
                Err(SchedulerError::ShutdownTimeout(wait))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_job(counter: &Arc<AtomicUsize>) -> Job {
        let counter = counter.clone();
        Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_job_runs_after_delay() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler
            .schedule(Duration::from_secs(5), counting_job(&counter))
            .unwrap();
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn job_bodies_do_not_overlap() {
        let scheduler = Scheduler::new();
        let running = Arc::new(AtomicUsize::new(0));
        let overlap = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let running = running.clone();
            let overlap = overlap.clone();
            scheduler
                .schedule(
                    Duration::ZERO,
                    Box::pin(async move {
                        if running.fetch_add(1, Ordering::SeqCst) > 0 {
                            overlap.fetch_add(1, Ordering::SeqCst);
                        }
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                    }),
                )
                .unwrap();
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(overlap.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_job_stops_when_cancelled() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let factory_counter = counter.clone();
        let handle = scheduler
            .schedule_periodic(
                Duration::from_secs(10),
                Arc::new(move || counting_job(&factory_counter)),
            )
            .unwrap();
        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        handle.cancel();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_pending_timers() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler
            .schedule(Duration::from_secs(60), counting_job(&counter))
            .unwrap();
        scheduler.shutdown(Duration::from_secs(10)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(matches!(
            scheduler.schedule(Duration::ZERO, counting_job(&counter)),
            Err(SchedulerError::ShutDown)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_times_out_on_stuck_job() {
        let scheduler = Scheduler::new();
        scheduler
            .schedule(
                Duration::ZERO,
                Box::pin(async {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                }),
            )
            .unwrap();
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(matches!(
            scheduler.shutdown(Duration::from_secs(10)).await,
            Err(SchedulerError::ShutdownTimeout(_))
        ));
    }
}
