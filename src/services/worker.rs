//! Fixed-interval background loops.
//!
//! A [`PeriodicWorker`] owns one [`Sweep`] and runs it on a timer. Cycles never
//! overlap: the timer loop and manual triggers share one cycle lock, and the
//! next wait only starts once the previous sweep has returned. A panic inside
//! a sweep is caught and logged so the loop keeps going.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// One pass over a worker's eligible records.
#[async_trait]
pub trait Sweep: Send + Sync + 'static {
    type Report: Clone + Serialize + Send + Sync + 'static;

    fn name(&self) -> &'static str;

    async fn run_cycle(&self) -> Self::Report;
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus<R> {
    pub name: String,
    pub running: bool,
    pub interval_secs: u64,
    pub cycles: u64,
    pub panics: u64,
    pub last_started_at: Option<DateTime<Utc>>,
    pub last_finished_at: Option<DateTime<Utc>>,
    pub last_report: Option<R>,
}

struct CycleState<R> {
    cycles: u64,
    panics: u64,
    last_started_at: Option<DateTime<Utc>>,
    last_finished_at: Option<DateTime<Utc>>,
    last_report: Option<R>,
}

impl<R> Default for CycleState<R> {
    fn default() -> Self {
        Self {
            cycles: 0,
            panics: 0,
            last_started_at: None,
            last_finished_at: None,
            last_report: None,
        }
    }
}

struct Inner<S: Sweep> {
    sweep: Arc<S>,
    interval: Duration,
    cycle_lock: Mutex<()>,
    trigger: Notify,
    state: RwLock<CycleState<S::Report>>,
}

impl<S: Sweep> Inner<S> {
    async fn run_guarded(&self) -> Option<S::Report> {
        let _cycle = self.cycle_lock.lock().await;
        let name = self.sweep.name();
        self.state.write().await.last_started_at = Some(Utc::now());

        let outcome = AssertUnwindSafe(self.sweep.run_cycle()).catch_unwind().await;

        let mut state = self.state.write().await;
        state.cycles += 1;
        state.last_finished_at = Some(Utc::now());
        match outcome {
            Ok(report) => {
                state.last_report = Some(report.clone());
                Some(report)
            }
            Err(panic_info) => {
                state.panics += 1;
                let panic_msg = if let Some(s) = panic_info.downcast_ref::<&str>() {
                    (*s).to_string()
                } else if let Some(s) = panic_info.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Unknown panic".to_string()
                };
                error!(worker = name, panic = %panic_msg, "Worker cycle panicked");
                None
            }
        }
    }

    async fn run_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let name = self.sweep.name();
        info!(worker = name, interval_secs = self.interval.as_secs(), "Worker started");

        loop {
            if shutdown.is_cancelled() {
                break;
            }
            self.run_guarded().await;

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
                _ = self.trigger.notified() => {
                    debug!(worker = name, "Worker triggered manually");
                }
            }
        }

        info!(worker = name, "Worker stopped");
    }
}

struct RunningTask {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct PeriodicWorker<S: Sweep> {
    inner: Arc<Inner<S>>,
    task: Mutex<Option<RunningTask>>,
}

impl<S: Sweep> PeriodicWorker<S> {
    pub fn new(sweep: Arc<S>, interval: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                sweep,
                interval,
                cycle_lock: Mutex::new(()),
                trigger: Notify::new(),
                state: RwLock::new(CycleState::default()),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &'static str {
        self.inner.sweep.name()
    }

    pub fn sweep(&self) -> &Arc<S> {
        &self.inner.sweep
    }

    /// Spawns the loop. Returns `false` if it is already running.
    pub async fn start(&self) -> bool {
        let mut task = self.task.lock().await;
        if let Some(running) = task.as_ref() {
            if !running.handle.is_finished() {
                warn!(worker = self.name(), "Worker already running");
                return false;
            }
        }

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(self.inner.clone().run_loop(shutdown.clone()));
        *task = Some(RunningTask { shutdown, handle });
        true
    }

    /// Lets the in-flight cycle finish, then waits up to `timeout` for the
    /// loop to exit. Returns `false` when the loop had to be aborted.
    pub async fn stop(&self, timeout: Duration) -> bool {
        let Some(RunningTask { shutdown, mut handle }) = self.task.lock().await.take() else {
            return true;
        };
        shutdown.cancel();

        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!(worker = self.name(), "Worker task failed: {}", e);
                false
            }
            Err(_) => {
                error!(
                    worker = self.name(),
                    timeout_secs = timeout.as_secs_f64(),
                    "Worker did not stop in time, forcing shutdown"
                );
                handle.abort();
                false
            }
        }
    }

    /// Wakes the loop early. Triggers that land mid-cycle, or while the loop
    /// is stopped, collapse into one held wake-up that starts an extra cycle
    /// as soon as the loop next waits.
    pub fn trigger(&self) {
        self.inner.trigger.notify_one();
    }

    /// Runs one cycle on the caller's task, waiting for any in-flight cycle
    /// first. `None` if the sweep panicked.
    pub async fn run_now(&self) -> Option<S::Report> {
        self.inner.run_guarded().await
    }

    pub async fn is_running(&self) -> bool {
        self.task
            .lock()
            .await
            .as_ref()
            .map(|t| !t.handle.is_finished())
            .unwrap_or(false)
    }

    pub async fn status(&self) -> WorkerStatus<S::Report> {
        let running = self.is_running().await;
        let state = self.inner.state.read().await;
        WorkerStatus {
            name: self.name().to_string(),
            running,
            interval_secs: self.inner.interval.as_secs(),
            cycles: state.cycles,
            panics: state.panics,
            last_started_at: state.last_started_at,
            last_finished_at: state.last_finished_at,
            last_report: state.last_report.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    struct Counting {
        runs: AtomicU64,
        active: AtomicUsize,
        overlapped: AtomicUsize,
        delay: Duration,
    }

    impl Counting {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                runs: AtomicU64::new(0),
                active: AtomicUsize::new(0),
                overlapped: AtomicUsize::new(0),
                delay,
            })
        }
    }

    #[async_trait]
    impl Sweep for Counting {
        type Report = u64;

        fn name(&self) -> &'static str {
            "counting"
        }

        async fn run_cycle(&self) -> u64 {
            if self.active.fetch_add(1, Ordering::SeqCst) > 0 {
                self.overlapped.fetch_add(1, Ordering::SeqCst);
            }
            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.runs.fetch_add(1, Ordering::SeqCst) + 1
        }
    }

    struct Exploding;

    #[async_trait]
    impl Sweep for Exploding {
        type Report = ();

        fn name(&self) -> &'static str {
            "exploding"
        }

        async fn run_cycle(&self) -> Self::Report {
            panic!("bad record");
        }
    }

    #[tokio::test]
    async fn starts_once_and_stops_gracefully() {
        let sweep = Counting::new(Duration::from_millis(5));
        let worker = PeriodicWorker::new(sweep.clone(), Duration::from_millis(20));

        assert!(worker.start().await);
        assert!(!worker.start().await);
        tokio::time::sleep(Duration::from_millis(70)).await;
        assert!(worker.is_running().await);

        assert!(worker.stop(Duration::from_secs(1)).await);
        assert!(!worker.is_running().await);

        let runs = sweep.runs.load(Ordering::SeqCst);
        assert!(runs >= 2, "expected several cycles, got {}", runs);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sweep.runs.load(Ordering::SeqCst), runs);
    }

    #[tokio::test]
    async fn manual_runs_never_overlap_the_loop() {
        let sweep = Counting::new(Duration::from_millis(15));
        let worker = Arc::new(PeriodicWorker::new(sweep.clone(), Duration::from_millis(1)));
        worker.start().await;

        let manual = {
            let worker = worker.clone();
            tokio::spawn(async move {
                for _ in 0..3 {
                    worker.run_now().await;
                }
            })
        };
        manual.await.unwrap();
        worker.stop(Duration::from_secs(1)).await;

        assert_eq!(sweep.overlapped.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn panicking_cycle_is_contained() {
        let worker = PeriodicWorker::new(Arc::new(Exploding), Duration::from_secs(60));
        assert!(worker.run_now().await.is_none());
        assert!(worker.run_now().await.is_none());

        let status = worker.status().await;
        assert_eq!(status.cycles, 2);
        assert_eq!(status.panics, 2);
        assert!(!status.running);
    }

    #[tokio::test]
    async fn slow_cycle_forces_shutdown() {
        let sweep = Counting::new(Duration::from_secs(5));
        let worker = PeriodicWorker::new(sweep, Duration::from_secs(60));
        worker.start().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!worker.stop(Duration::from_millis(50)).await);
        assert!(!worker.is_running().await);
    }

    #[tokio::test]
    async fn triggers_during_a_cycle_collapse_into_one_more() {
        let sweep = Counting::new(Duration::from_millis(40));
        let worker = PeriodicWorker::new(sweep.clone(), Duration::from_secs(60));
        worker.start().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        for _ in 0..3 {
            worker.trigger();
        }
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(sweep.runs.load(Ordering::SeqCst), 2);

        worker.trigger();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sweep.runs.load(Ordering::SeqCst), 3);

        assert!(worker.stop(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn status_reports_last_cycle() {
        let worker = PeriodicWorker::new(Counting::new(Duration::ZERO), Duration::from_secs(60));
        assert_eq!(worker.run_now().await, Some(1));
        let status = worker.status().await;
        assert_eq!(status.last_report, Some(1));
        assert_eq!(status.interval_secs, 60);
        assert!(status.last_finished_at.is_some());
    }
}
