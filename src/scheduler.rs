//! Cron-triggered tasks, each guarded by a named lock. A trigger that finds
//! its lock held is skipped, never queued.

use crate::error::{Error, Result};
use crate::metrics::MetricsCollector;
use crate::orchestrator::{CrawlOrchestrator, RunOptions};
use crate::registry::CrawlerSchedule;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_cron_scheduler::{Job, JobScheduler};

type TaskAction = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

#[derive(Clone)]
pub struct ScheduledTask {
    pub name: String,
    pub cron: String,
    action: TaskAction,
}

impl ScheduledTask {
    pub fn new<F, Fut>(name: impl Into<String>, cron: impl Into<String>, action: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            cron: cron.into(),
            action: Arc::new(move || Box::pin(action())),
        }
    }
}

/// Named non-blocking locks, one per task name.
#[derive(Clone, Default)]
pub struct TaskLocks {
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl TaskLocks {
    pub async fn try_acquire(&self, name: &str) -> Option<OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.entry(name.to_string()).or_default().clone()
        };
        lock.try_lock_owned().ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    Completed,
    Failed,
    /// The previous invocation still held the lock.
    Skipped,
}

async fn fire(task: ScheduledTask, locks: TaskLocks, metrics: MetricsCollector) -> TriggerOutcome {
    let Some(_guard) = locks.try_acquire(&task.name).await else {
        log::info!("Skipping {}: previous run still in progress", task.name);
        metrics.increment_tasks_skipped();
        return TriggerOutcome::Skipped;
    };

    log::debug!("Running scheduled task {}", task.name);
    match (task.action)().await {
        Ok(()) => TriggerOutcome::Completed,
        Err(e) => {
            log::error!("Scheduled task {} failed: {}", task.name, e);
            TriggerOutcome::Failed
        }
    }
}

fn scheduler_error(e: impl std::fmt::Display) -> Error {
    Error::Scheduler(e.to_string())
}

pub struct Scheduler {
    tasks: Vec<ScheduledTask>,
    locks: TaskLocks,
    metrics: MetricsCollector,
}

impl Scheduler {
    pub fn new(metrics: MetricsCollector) -> Self {
        Self {
            tasks: Vec::new(),
            locks: TaskLocks::default(),
            metrics,
        }
    }

    /// One task per schedule with an active crawler, locked as `crawler_<schedule>`.
    pub async fn for_crawlers(
        orchestrator: Arc<CrawlOrchestrator>,
        metrics: MetricsCollector,
    ) -> Result<Self> {
        let mut scheduler = Self::new(metrics);

        for schedule in CrawlerSchedule::ALL {
            let crawlers = orchestrator.registry().by_schedule(schedule).await;
            if !crawlers.iter().any(|c| c.active) {
                continue;
            }

            let orchestrator = orchestrator.clone();
            scheduler.add_task(ScheduledTask::new(
                format!("crawler_{}", schedule),
                schedule.cron(),
                move || {
                    let orchestrator = orchestrator.clone();
                    async move {
                        let batch = orchestrator
                            .run_by_schedule(schedule, RunOptions::default())
                            .await?;
                        log::info!(
                            "Schedule {}: {} crawlers ran, {} failed",
                            schedule,
                            batch.reports.len(),
                            batch.failed.len()
                        );
                        Ok(())
                    }
                },
            ))?;
        }

        Ok(scheduler)
    }

    pub fn add_task(&mut self, task: ScheduledTask) -> Result<()> {
        if self.tasks.iter().any(|t| t.name == task.name) {
            return Err(Error::Scheduler(format!("task {} is already scheduled", task.name)));
        }
        self.tasks.push(task);
        Ok(())
    }

    pub fn task_names(&self) -> Vec<&str> {
        self.tasks.iter().map(|t| t.name.as_str()).collect()
    }

    /// Runs a task now, under the same lock its cron trigger uses.
    pub async fn trigger(&self, name: &str) -> Result<TriggerOutcome> {
        let task = self
            .tasks
            .iter()
            .find(|t| t.name == name)
            .cloned()
            .ok_or_else(|| Error::Scheduler(format!("no task named {}", name)))?;

        Ok(fire(task, self.locks.clone(), self.metrics.clone()).await)
    }

    /// Registers every task with a cron scheduler and starts it.
    pub async fn start(&self) -> Result<JobScheduler> {
        let sched = JobScheduler::new().await.map_err(scheduler_error)?;

        for task in &self.tasks {
            let name = task.name.clone();
            let cron = task.cron.clone();
            let task = task.clone();
            let locks = self.locks.clone();
            let metrics = self.metrics.clone();

            let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
                let task = task.clone();
                let locks = locks.clone();
                let metrics = metrics.clone();
                Box::pin(async move {
                    fire(task, locks, metrics).await;
                })
            })
            .map_err(|e| Error::Scheduler(format!("invalid schedule {}: {}", cron, e)))?;

            sched.add(job).await.map_err(scheduler_error)?;
            log::info!("Scheduled {} at {}", name, cron);
        }

        sched.start().await.map_err(scheduler_error)?;
        Ok(sched)
    }
}
