//! Managed worker pools.
//!
//! A [`ManagedExecutor`] owns a dedicated multi-threaded tokio runtime. It is
//! registered with the [`LifecycleRegistry`] when built, so the registry's
//! `stop` drains and tears it down.
//!
//! # Shutdown
//! 1. Refuse new submissions and cancel delayed and periodic work.
//! 2. Let work already submitted run for up to the grace period.
//! 3. Shut the runtime down, dropping every task at its next yield point.
//! 4. Anything still running shortly after that (a task that never yields, a
//!    blocking closure) makes the stop fail.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::runtime::{Handle, Runtime};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::managed::Managed;
use super::registry::{LifecycleError, LifecycleRegistry};

/// Default time `stop` waits for submitted work.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Extra time given to tasks after the runtime has been shut down.
const FORCED_TERMINATION_WAIT: Duration = Duration::from_millis(250);

/// Errors produced by executors and their builder.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("{name}: max_threads ({max}) must be at least core_threads ({core}) and core_threads at least 1")]
    InvalidSizing { name: String, core: usize, max: usize },

    #[error("{name}: failed to build runtime")]
    Runtime {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{name} is shut down")]
    Shutdown { name: String },

    #[error("{name} rejected a task: {capacity} tasks already queued")]
    Rejected { name: String, capacity: usize },

    #[error(transparent)]
    Registration(#[from] LifecycleError),
}

/// How many submitted tasks may be outstanding at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePolicy {
    Unbounded,
    /// Submissions beyond this many outstanding tasks are rejected.
    Bounded(usize),
}

/// Builds a [`ManagedExecutor`] and registers it with the registry that
/// created the builder.
#[must_use = "an executor is only created and registered by `build`"]
pub struct ExecutorBuilder<'a> {
    registry: &'a mut LifecycleRegistry,
    name_format: String,
    core_threads: usize,
    max_threads: usize,
    keep_alive: Duration,
    queue: QueuePolicy,
    shutdown_grace: Duration,
}

impl<'a> ExecutorBuilder<'a> {
    pub(super) fn new(registry: &'a mut LifecycleRegistry, name_format: String) -> Self {
        Self {
            registry,
            name_format,
            core_threads: 1,
            max_threads: 1,
            keep_alive: Duration::from_secs(60),
            queue: QueuePolicy::Unbounded,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    pub(super) fn scheduled(self) -> Self {
        self.max_threads(1).queue(QueuePolicy::Unbounded)
    }

    /// Worker threads driving async tasks.
    pub fn core_threads(mut self, threads: usize) -> Self {
        self.core_threads = threads;
        self
    }

    /// Upper bound on threads running blocking closures. Worker threads are
    /// not counted, so the pool may hold up to `core_threads + max_threads`
    /// threads.
    pub fn max_threads(mut self, threads: usize) -> Self {
        self.max_threads = threads;
        self
    }

    /// How long an idle blocking thread lingers before exiting.
    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn queue(mut self, queue: QueuePolicy) -> Self {
        self.queue = queue;
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Build the pool and register it.
    ///
    /// # Errors
    ///
    /// Invalid sizing, runtime construction failure, or registration failure.
    pub fn build(self) -> Result<Arc<ManagedExecutor>, ExecutorError> {
        if self.core_threads == 0 || self.max_threads < self.core_threads {
            return Err(ExecutorError::InvalidSizing {
                name: self.name_format,
                core: self.core_threads,
                max: self.max_threads,
            });
        }

        let sequence = Arc::new(AtomicUsize::new(1));
        let format = self.name_format.clone();
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(self.core_threads)
            .max_blocking_threads(self.max_threads)
            .thread_keep_alive(self.keep_alive)
            .thread_name_fn(move || thread_name(&format, sequence.fetch_add(1, Ordering::Relaxed)))
            .enable_all()
            .build()
            .map_err(|source| ExecutorError::Runtime {
                name: self.name_format.clone(),
                source,
            })?;

        let executor = Arc::new(ManagedExecutor {
            name: self.name_format,
            handle: runtime.handle().clone(),
            runtime: Mutex::new(Some(runtime)),
            tracker: TaskTracker::new(),
            queue: match self.queue {
                QueuePolicy::Unbounded => None,
                QueuePolicy::Bounded(capacity) => Some((Arc::new(Semaphore::new(capacity)), capacity)),
            },
            cancel: CancellationToken::new(),
            grace: self.shutdown_grace,
        });
        debug!(
            executor = %executor.name,
            core_threads = self.core_threads,
            max_threads = self.max_threads,
            queue = ?self.queue,
            "built executor"
        );
        self.registry.register(executor.clone())?;
        Ok(executor)
    }
}

/// Substitute the thread sequence number for `%d`, or append it.
fn thread_name(format: &str, n: usize) -> String {
    if format.contains("%d") {
        format.replacen("%d", &n.to_string(), 1)
    } else {
        format!("{format}-{n}")
    }
}

/// A thread pool whose shutdown is driven by the lifecycle registry.
pub struct ManagedExecutor {
    name: String,
    handle: Handle,
    runtime: Mutex<Option<Runtime>>,
    tracker: TaskTracker,
    queue: Option<(Arc<Semaphore>, usize)>,
    cancel: CancellationToken,
    grace: Duration,
}

impl std::fmt::Debug for ManagedExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedExecutor")
            .field("name", &self.name)
            .field("tasks", &self.tracker.len())
            .field("shut_down", &self.tracker.is_closed())
            .finish()
    }
}

impl ManagedExecutor {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Handle to the pool's runtime, for code that must run inside it.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Cancelled when the executor begins shutting down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Number of submitted tasks that have not completed.
    pub fn active_tasks(&self) -> usize {
        self.tracker.len()
    }

    /// Run `task` on the pool.
    ///
    /// # Errors
    ///
    /// [`ExecutorError::Shutdown`] once stopping has begun,
    /// [`ExecutorError::Rejected`] when a bounded queue is full.
    pub fn spawn<F>(&self, task: F) -> Result<JoinHandle<F::Output>, ExecutorError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let permit = self.admit()?;
        Ok(self.tracker.spawn_on(
            async move {
                let _permit = permit;
                task.await
            },
            &self.handle,
        ))
    }

    /// Run a blocking closure on the pool's blocking threads.
    ///
    /// # Errors
    ///
    /// Same as [`ManagedExecutor::spawn`].
    pub fn spawn_blocking<F, T>(&self, task: F) -> Result<JoinHandle<T>, ExecutorError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = self.admit()?;
        Ok(self.tracker.spawn_blocking_on(
            move || {
                let _permit = permit;
                task()
            },
            &self.handle,
        ))
    }

    /// Run `task` after `delay`. Resolves to `None` if the executor shuts
    /// down first.
    ///
    /// Delayed work that has not started when `stop` begins is cancelled
    /// right away rather than waited for during the grace period.
    ///
    /// # Errors
    ///
    /// Same as [`ManagedExecutor::spawn`].
    pub fn schedule<F>(
        &self,
        delay: Duration,
        task: F,
    ) -> Result<JoinHandle<Option<F::Output>>, ExecutorError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let cancel = self.cancel.clone();
        self.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => None,
                _ = tokio::time::sleep(delay) => Some(task.await),
            }
        })
    }

    /// Run `make_task()` every `period`, starting immediately, until the
    /// executor shuts down. A run that overruns delays the next one.
    ///
    /// `stop` cancels the schedule before the grace wait; a run already in
    /// progress is dropped with it.
    ///
    /// # Errors
    ///
    /// Same as [`ManagedExecutor::spawn`].
    pub fn schedule_at_fixed_rate<M, F>(
        &self,
        period: Duration,
        mut make_task: M,
    ) -> Result<JoinHandle<()>, ExecutorError>
    where
        M: FnMut() -> F + Send + 'static,
        F: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        self.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => make_task().await,
                }
            }
        })
    }

    /// Run a framework-owned task on the pool without taking a queue slot.
    ///
    /// Accept loops and connection drivers live for as long as their
    /// listener or connection, so they are tracked for shutdown but never
    /// count against [`QueuePolicy::Bounded`].
    pub(crate) fn spawn_unmetered<F>(&self, task: F) -> Result<JoinHandle<F::Output>, ExecutorError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if self.tracker.is_closed() {
            return Err(ExecutorError::Shutdown {
                name: self.name.clone(),
            });
        }
        Ok(self.tracker.spawn_on(task, &self.handle))
    }

    /// Take a queue slot, held until the returned permit is dropped.
    pub(crate) fn admit(&self) -> Result<Option<OwnedSemaphorePermit>, ExecutorError> {
        if self.tracker.is_closed() {
            return Err(ExecutorError::Shutdown {
                name: self.name.clone(),
            });
        }
        match &self.queue {
            None => Ok(None),
            Some((semaphore, capacity)) => Arc::clone(semaphore)
                .try_acquire_owned()
                .map(Some)
                .map_err(|_| ExecutorError::Rejected {
                    name: self.name.clone(),
                    capacity: *capacity,
                }),
        }
    }
}

#[async_trait]
impl Managed for ManagedExecutor {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn start(&self) -> anyhow::Result<()> {
        if self.runtime.lock().is_none() {
            bail!("{} has been shut down and cannot be restarted", self.name);
        }
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        let Some(runtime) = self.runtime.lock().take() else {
            return Ok(());
        };
        self.tracker.close();
        self.cancel.cancel();

        let drained = tokio::time::timeout(self.grace, self.tracker.wait())
            .await
            .is_ok();
        runtime.shutdown_background();
        if drained {
            info!(executor = %self.name, "executor stopped");
            return Ok(());
        }

        warn!(
            executor = %self.name,
            grace_ms = self.grace.as_millis() as u64,
            remaining = self.tracker.len(),
            "tasks did not finish within the grace period; forcing termination"
        );
        if tokio::time::timeout(FORCED_TERMINATION_WAIT, self.tracker.wait())
            .await
            .is_err()
        {
            bail!(
                "{} still has {} task(s) running after forced termination",
                self.name,
                self.tracker.len()
            );
        }
        Ok(())
    }
}

impl Drop for ManagedExecutor {
    fn drop(&mut self) {
        // Dropping a runtime blocks, which panics inside async code.
        if let Some(runtime) = self.runtime.get_mut().take() {
            runtime.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::state::LifecycleState;
    use std::sync::atomic::AtomicBool;
    use std::time::Instant;

    #[test]
    fn thread_names_follow_the_format() {
        assert_eq!(thread_name("worker-%d", 3), "worker-3");
        assert_eq!(thread_name("worker", 3), "worker-3");
    }

    #[tokio::test]
    async fn workers_are_named_from_the_template() {
        let mut registry = LifecycleRegistry::new();
        let executor = registry
            .executor_service("named-%d")
            .core_threads(2)
            .max_threads(4)
            .build()
            .unwrap();
        let name = executor
            .spawn(async { std::thread::current().name().map(str::to_owned) })
            .unwrap()
            .await
            .unwrap()
            .unwrap();
        assert!(name.starts_with("named-"), "{name}");
        executor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn registers_itself_and_stops_within_grace() {
        let mut registry = LifecycleRegistry::new();
        let executor = registry
            .executor_service("quick-%d")
            .core_threads(1)
            .max_threads(2)
            .shutdown_grace(Duration::from_secs(2))
            .build()
            .unwrap();
        assert_eq!(registry.managed_names(), ["quick-%d"]);

        registry.start().await.unwrap();
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        executor
            .spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                flag.store(true, Ordering::SeqCst);
            })
            .unwrap();

        let started = Instant::now();
        registry.stop().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(
            registry.resource_states(),
            vec![("quick-%d".to_owned(), LifecycleState::Stopped)]
        );
        assert!(matches!(
            executor.spawn(async {}),
            Err(ExecutorError::Shutdown { .. })
        ));
    }

    #[tokio::test]
    async fn stop_fails_when_a_task_outlives_forced_termination() {
        let mut registry = LifecycleRegistry::new();
        let executor = registry
            .executor_service("stuck-%d")
            .core_threads(1)
            .max_threads(2)
            .shutdown_grace(Duration::from_millis(100))
            .build()
            .unwrap();
        executor
            .spawn_blocking(|| std::thread::sleep(Duration::from_secs(3)))
            .unwrap();

        let err = executor.stop().await.unwrap_err();
        assert!(err.to_string().contains("still has 1 task(s) running"), "{err}");
    }

    #[tokio::test]
    async fn bounded_queue_rejects_overflow() {
        let mut registry = LifecycleRegistry::new();
        let executor = registry
            .executor_service("bounded")
            .queue(QueuePolicy::Bounded(1))
            .build()
            .unwrap();
        let gate = CancellationToken::new();
        let wait = gate.clone();
        executor
            .spawn(async move { wait.cancelled().await })
            .unwrap();
        assert!(matches!(
            executor.spawn(async {}),
            Err(ExecutorError::Rejected { capacity: 1, .. })
        ));
        gate.cancel();
        executor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn unmetered_tasks_leave_the_queue_free() {
        let mut registry = LifecycleRegistry::new();
        let executor = registry
            .executor_service("metered")
            .queue(QueuePolicy::Bounded(1))
            .build()
            .unwrap();
        let gate = CancellationToken::new();
        let wait = gate.clone();
        executor
            .spawn_unmetered(async move { wait.cancelled().await })
            .unwrap();
        assert_eq!(executor.active_tasks(), 1);

        let permit = executor.admit().unwrap();
        assert!(permit.is_some());
        assert!(matches!(
            executor.admit(),
            Err(ExecutorError::Rejected { capacity: 1, .. })
        ));
        drop(permit);
        assert!(executor.admit().unwrap().is_some());

        gate.cancel();
        executor.stop().await.unwrap();
        assert!(matches!(
            executor.spawn_unmetered(async {}),
            Err(ExecutorError::Shutdown { .. })
        ));
    }

    #[tokio::test]
    async fn delayed_and_periodic_work_stop_with_the_executor() {
        let mut registry = LifecycleRegistry::new();
        let executor = registry.scheduled_executor_service("timer").build().unwrap();
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        executor
            .schedule_at_fixed_rate(Duration::from_millis(10), move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            })
            .unwrap();
        let delayed = executor
            .schedule(Duration::from_secs(60), async { 1 })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        let started = Instant::now();
        executor.stop().await.unwrap();
        // Pending schedules are cancelled, not waited for.
        assert!(started.elapsed() < DEFAULT_SHUTDOWN_GRACE);
        assert!(ticks.load(Ordering::SeqCst) >= 1);
        assert_eq!(delayed.await.unwrap(), None);
    }

    #[tokio::test]
    async fn blocking_threads_do_not_count_against_workers() {
        let mut registry = LifecycleRegistry::new();
        let executor = registry
            .executor_service("split-%d")
            .core_threads(1)
            .max_threads(1)
            .build()
            .unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        let blocked = executor
            .spawn_blocking(move || rx.recv_timeout(Duration::from_secs(2)).is_ok())
            .unwrap();
        executor
            .spawn(async move { tx.send(()).unwrap() })
            .unwrap()
            .await
            .unwrap();
        assert!(blocked.await.unwrap());
        executor.stop().await.unwrap();
    }

    #[test]
    fn rejects_invalid_sizing() {
        let mut registry = LifecycleRegistry::new();
        let err = registry
            .executor_service("bad")
            .core_threads(4)
            .max_threads(2)
            .build()
            .unwrap_err();
        assert!(matches!(err, ExecutorError::InvalidSizing { core: 4, max: 2, .. }));
        assert!(registry.managed_names().is_empty());
    }
}
