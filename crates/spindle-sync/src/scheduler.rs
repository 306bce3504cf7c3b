//! Cron and ad hoc task execution.
//!
//! Cron tasks are dispatched by `tokio-cron-scheduler`; each firing spawns the
//! task and returns, so a slow run never delays the next tick. Ad hoc tasks go
//! through a bounded queue drained by a fixed pool of workers. Every execution
//! runs in its own tokio task, so an error or panic is contained, logged and
//! published as a [`TaskOutcome`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

const OUTCOME_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Cron,
    AdHoc,
}

/// Per-execution state handed to [`Task::run`].
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub run_id: Uuid,
    pub trigger: Trigger,
    pub cancellation: CancellationToken,
}

impl TaskContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

#[async_trait]
pub trait Task: Send + Sync {
    fn name(&self) -> &str;

    /// Cron expression for recurring tasks.
    fn schedule(&self) -> Option<String> {
        None
    }

    async fn run(&self, ctx: &TaskContext) -> anyhow::Result<()>;
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("task {0} has no cron schedule")]
    NoSchedule(String),
    #[error("invalid cron expression `{cron}` for task {task}: {source}")]
    InvalidCron {
        task: String,
        cron: String,
        #[source]
        source: JobSchedulerError,
    },
    #[error("cron scheduler: {0}")]
    Scheduler(#[from] JobSchedulerError),
    #[error("ad hoc queue is full")]
    QueueFull,
    #[error("task manager is not running")]
    NotRunning,
    #[error("task manager was already started")]
    AlreadyStarted,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskOutcome {
    pub task: String,
    pub trigger: Trigger,
    pub run_id: Uuid,
    pub elapsed: Duration,
    pub error: Option<String>,
}

impl TaskOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub workers: usize,
    pub queue_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 64,
        }
    }
}

/// Cloneable handle for queueing ad hoc tasks.
#[derive(Clone)]
pub struct TaskSubmitter {
    queue: mpsc::Sender<Arc<dyn Task>>,
    cancellation: CancellationToken,
}

impl TaskSubmitter {
    /// Never waits: a full queue is reported as [`SchedulerError::QueueFull`].
    pub fn submit(&self, task: Arc<dyn Task>) -> Result<(), SchedulerError> {
        if self.cancellation.is_cancelled() {
            return Err(SchedulerError::NotRunning);
        }
        self.queue.try_send(task).map_err(|err| match err {
            TrySendError::Full(_) => SchedulerError::QueueFull,
            TrySendError::Closed(_) => SchedulerError::NotRunning,
        })
    }
}

pub struct TaskManager {
    config: SchedulerConfig,
    cancellation: CancellationToken,
    cron_jobs: Vec<(String, Job)>,
    queue_tx: mpsc::Sender<Arc<dyn Task>>,
    queue_rx: Option<mpsc::Receiver<Arc<dyn Task>>>,
    outcomes: broadcast::Sender<TaskOutcome>,
    tracker: TaskTracker,
    scheduler: Option<JobScheduler>,
    workers: Vec<JoinHandle<()>>,
}

impl TaskManager {
    /// Cancelling `parent` has the same effect on dispatch as [`Self::stop`].
    pub fn new(config: SchedulerConfig, parent: &CancellationToken) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (outcomes, _) = broadcast::channel(OUTCOME_CHANNEL_CAPACITY);
        Self {
            config,
            cancellation: parent.child_token(),
            cron_jobs: Vec::new(),
            queue_tx,
            queue_rx: Some(queue_rx),
            outcomes,
            tracker: TaskTracker::new(),
            scheduler: None,
            workers: Vec::new(),
        }
    }

    pub fn submitter(&self) -> TaskSubmitter {
        TaskSubmitter {
            queue: self.queue_tx.clone(),
            cancellation: self.cancellation.clone(),
        }
    }

    pub fn submit(&self, task: Arc<dyn Task>) -> Result<(), SchedulerError> {
        self.submitter().submit(task)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskOutcome> {
        self.outcomes.subscribe()
    }

    pub fn cron_task_names(&self) -> Vec<&str> {
        self.cron_jobs.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// The cron expression is parsed here, so a bad one fails registration
    /// rather than `start`. Five-field expressions fire at second zero.
    pub fn register_cron_task(&mut self, task: Arc<dyn Task>) -> Result<(), SchedulerError> {
        let name = task.name().to_string();
        let cron = task
            .schedule()
            .map(|expr| with_seconds_field(&expr))
            .ok_or_else(|| SchedulerError::NoSchedule(name.clone()))?;

        let cancellation = self.cancellation.clone();
        let outcomes = self.outcomes.clone();
        let tracker = self.tracker.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let task = Arc::clone(&task);
            let cancellation = cancellation.clone();
            let outcomes = outcomes.clone();
            let tracker = tracker.clone();
            Box::pin(async move {
                if cancellation.is_cancelled() {
                    return;
                }
                tracker.spawn(execute(task, Trigger::Cron, cancellation, outcomes));
            })
        })
        .map_err(|source| SchedulerError::InvalidCron {
            task: name.clone(),
            cron: cron.clone(),
            source,
        })?;

        info!(task = %name, %cron, "registered cron task");
        self.cron_jobs.push((name, job));
        Ok(())
    }

    pub async fn start(&mut self) -> Result<(), SchedulerError> {
        if self.cancellation.is_cancelled() {
            return Err(SchedulerError::NotRunning);
        }
        let queue_rx = self.queue_rx.take().ok_or(SchedulerError::AlreadyStarted)?;
        self.spawn_workers(queue_rx);

        if !self.cron_jobs.is_empty() {
            let scheduler = JobScheduler::new().await?;
            for (_, job) in self.cron_jobs.drain(..) {
                scheduler.add(job).await?;
            }
            scheduler.start().await?;

            let mut watched = scheduler.clone();
            let cancellation = self.cancellation.clone();
            tokio::spawn(async move {
                cancellation.cancelled().await;
                if let Err(err) = watched.shutdown().await {
                    debug!(error = %err, "cron scheduler shutdown after cancellation");
                }
            });
            self.scheduler = Some(scheduler);
        }

        info!(workers = self.workers.len(), "task manager started");
        Ok(())
    }

    fn spawn_workers(&mut self, queue_rx: mpsc::Receiver<Arc<dyn Task>>) {
        let queue_rx = Arc::new(Mutex::new(queue_rx));
        for worker in 0..self.config.workers.max(1) {
            let queue_rx = Arc::clone(&queue_rx);
            let cancellation = self.cancellation.clone();
            let outcomes = self.outcomes.clone();
            self.workers.push(tokio::spawn(async move {
                loop {
                    let next = {
                        let mut rx = queue_rx.lock().await;
                        tokio::select! {
                            biased;
                            _ = cancellation.cancelled() => None,
                            task = rx.recv() => task,
                        }
                    };
                    let Some(task) = next else {
                        break;
                    };
                    execute(task, Trigger::AdHoc, cancellation.clone(), outcomes.clone()).await;
                }
                debug!(worker, "ad hoc worker exiting");
            }));
        }
    }

    /// Stops cron dispatch and closes the ad hoc queue. Queued tasks that no
    /// worker has picked up are dropped; running ones are awaited.
    pub async fn stop(&mut self) {
        self.cancellation.cancel();

        // The cancellation watcher may already have shut the scheduler down.
        if let Some(mut scheduler) = self.scheduler.take() {
            if let Err(err) = scheduler.shutdown().await {
                debug!(error = %err, "cron scheduler shutdown");
            }
        }

        for handle in self.workers.drain(..) {
            if let Err(err) = handle.await {
                warn!(error = %err, "ad hoc worker ended abnormally");
            }
        }

        self.tracker.close();
        self.tracker.wait().await;
        info!("task manager stopped");
    }
}

/// `tokio-cron-scheduler` wants a leading seconds field; classic five-field
/// crontab expressions get `0` prepended.
fn with_seconds_field(expr: &str) -> String {
    let expr = expr.trim();
    if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

async fn execute(
    task: Arc<dyn Task>,
    trigger: Trigger,
    cancellation: CancellationToken,
    outcomes: broadcast::Sender<TaskOutcome>,
) {
    let run_id = Uuid::new_v4();
    let name = task.name().to_string();
    let span = info_span!("task", task = %name, %run_id, ?trigger);
    let ctx = TaskContext {
        run_id,
        trigger,
        cancellation,
    };

    let started = Instant::now();
    let handle = tokio::spawn(async move { task.run(&ctx).await }.instrument(span.clone()));
    let result = handle.await;
    let elapsed = started.elapsed();

    let error = match result {
        Ok(Ok(())) => {
            info!(parent: &span, elapsed_ms = elapsed.as_millis() as u64, "task finished");
            None
        }
        Ok(Err(err)) => {
            let message = format!("{err:#}");
            error!(parent: &span, error = %message, "task failed");
            Some(message)
        }
        Err(join_err) if join_err.is_panic() => {
            error!(parent: &span, "task panicked");
            Some("task panicked".to_string())
        }
        Err(join_err) => {
            warn!(parent: &span, error = %join_err, "task aborted");
            Some(join_err.to_string())
        }
    };

    // No subscribers is fine.
    let _ = outcomes.send(TaskOutcome {
        task: name,
        trigger,
        run_id,
        elapsed,
        error,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Scripted {
        name: &'static str,
        behaviour: Behaviour,
        runs: Arc<AtomicUsize>,
    }

    #[derive(Clone, Copy)]
    enum Behaviour {
        Succeed,
        Fail,
        Panic,
    }

    impl Scripted {
        fn new(name: &'static str, behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                name,
                behaviour,
                runs: Arc::new(AtomicUsize::new(0)),
            })
        }
    }

    #[async_trait]
    impl Task for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        async fn run(&self, _ctx: &TaskContext) -> anyhow::Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            match self.behaviour {
                Behaviour::Succeed => Ok(()),
                Behaviour::Fail => anyhow::bail!("{} failed on purpose", self.name),
                Behaviour::Panic => panic!("{} panicked on purpose", self.name),
            }
        }
    }

    struct Recurring(&'static str);

    #[async_trait]
    impl Task for Recurring {
        fn name(&self) -> &str {
            "recurring"
        }

        fn schedule(&self) -> Option<String> {
            Some(self.0.to_string())
        }

        async fn run(&self, _ctx: &TaskContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    async fn collect(rx: &mut broadcast::Receiver<TaskOutcome>, n: usize) -> Vec<TaskOutcome> {
        let mut seen = Vec::with_capacity(n);
        while seen.len() < n {
            let outcome = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("outcome within timeout")
                .expect("channel open");
            seen.push(outcome);
        }
        seen
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failing_tasks_do_not_block_others() {
        let mut manager = TaskManager::new(SchedulerConfig::default(), &CancellationToken::new());
        let mut outcomes = manager.subscribe();
        manager.start().await.unwrap();

        let ok = Scripted::new("ok", Behaviour::Succeed);
        manager.submit(Scripted::new("bad-1", Behaviour::Fail)).unwrap();
        manager.submit(Scripted::new("bad-2", Behaviour::Fail)).unwrap();
        manager.submit(ok.clone()).unwrap();

        let seen = collect(&mut outcomes, 3).await;
        let ok_outcome = seen.iter().find(|o| o.task == "ok").unwrap();
        assert!(ok_outcome.succeeded());
        assert_eq!(ok_outcome.trigger, Trigger::AdHoc);
        assert_eq!(seen.iter().filter(|o| !o.succeeded()).count(), 2);
        assert!(seen
            .iter()
            .any(|o| o.error.as_deref() == Some("bad-1 failed on purpose")));
        assert_eq!(ok.runs.load(Ordering::SeqCst), 1);

        manager.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn panicking_task_is_contained() {
        let mut manager = TaskManager::new(
            SchedulerConfig {
                workers: 1,
                queue_capacity: 4,
            },
            &CancellationToken::new(),
        );
        let mut outcomes = manager.subscribe();
        manager.start().await.unwrap();

        manager.submit(Scripted::new("boom", Behaviour::Panic)).unwrap();
        manager.submit(Scripted::new("after", Behaviour::Succeed)).unwrap();

        let seen = collect(&mut outcomes, 2).await;
        assert_eq!(seen[0].error.as_deref(), Some("task panicked"));
        assert!(seen[1].succeeded());
        manager.stop().await;
    }

    #[tokio::test]
    async fn full_queue_is_reported() {
        let manager = TaskManager::new(
            SchedulerConfig {
                workers: 1,
                queue_capacity: 1,
            },
            &CancellationToken::new(),
        );
        let submitter = manager.submitter();
        submitter.submit(Scripted::new("first", Behaviour::Succeed)).unwrap();
        assert!(matches!(
            submitter.submit(Scripted::new("second", Behaviour::Succeed)),
            Err(SchedulerError::QueueFull)
        ));
    }

    #[tokio::test]
    async fn submissions_after_stop_are_refused() {
        let mut manager = TaskManager::new(SchedulerConfig::default(), &CancellationToken::new());
        manager.start().await.unwrap();
        let submitter = manager.submitter();
        manager.stop().await;
        assert!(matches!(
            submitter.submit(Scripted::new("late", Behaviour::Succeed)),
            Err(SchedulerError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn parent_cancellation_stops_submission() {
        let parent = CancellationToken::new();
        let mut manager = TaskManager::new(SchedulerConfig::default(), &parent);
        manager.start().await.unwrap();
        parent.cancel();
        assert!(matches!(
            manager.submit(Scripted::new("late", Behaviour::Succeed)),
            Err(SchedulerError::NotRunning)
        ));
        manager.stop().await;
    }

    #[tokio::test]
    async fn starting_twice_is_an_error() {
        let mut manager = TaskManager::new(SchedulerConfig::default(), &CancellationToken::new());
        manager.start().await.unwrap();
        assert!(matches!(
            manager.start().await,
            Err(SchedulerError::AlreadyStarted)
        ));
        manager.stop().await;
    }

    #[tokio::test]
    async fn cron_registration_validates_schedule() {
        let mut manager = TaskManager::new(SchedulerConfig::default(), &CancellationToken::new());
        assert!(matches!(
            manager.register_cron_task(Scripted::new("adhoc-only", Behaviour::Succeed)),
            Err(SchedulerError::NoSchedule(name)) if name == "adhoc-only"
        ));
        assert!(matches!(
            manager.register_cron_task(Arc::new(Recurring("every now and then"))),
            Err(SchedulerError::InvalidCron { .. })
        ));
        manager
            .register_cron_task(Arc::new(Recurring("0 * * * * *")))
            .unwrap();
        assert_eq!(manager.cron_task_names(), vec!["recurring"]);
    }

    #[test]
    fn five_field_expressions_gain_a_seconds_field() {
        assert_eq!(with_seconds_field("* * * * *"), "0 * * * * *");
        assert_eq!(with_seconds_field(" */5 * * * * "), "0 */5 * * * *");
        assert_eq!(with_seconds_field("30 0 3 * * *"), "30 0 3 * * *");
    }

    #[tokio::test]
    async fn five_field_crontab_expressions_register() {
        let mut manager = TaskManager::new(SchedulerConfig::default(), &CancellationToken::new());
        manager
            .register_cron_task(Arc::new(Recurring("* * * * *")))
            .unwrap();
        manager
            .register_cron_task(Arc::new(Recurring("*/5 * * * *")))
            .unwrap();
        assert_eq!(manager.cron_task_names(), vec!["recurring", "recurring"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn five_field_default_schedule_starts() {
        let mut manager = TaskManager::new(SchedulerConfig::default(), &CancellationToken::new());
        manager
            .register_cron_task(Arc::new(Recurring("* * * * *")))
            .unwrap();
        manager.start().await.unwrap();
        manager.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cron_manager_starts_and_stops() {
        let mut manager = TaskManager::new(SchedulerConfig::default(), &CancellationToken::new());
        manager
            .register_cron_task(Arc::new(Recurring("0 0 3 * * *")))
            .unwrap();
        manager.start().await.unwrap();
        manager.stop().await;
    }
}
