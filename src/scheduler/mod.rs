//! Durable job scheduler.
//!
//! A [`Scheduler`] owns every scheduled [`Job`] together with its live
//! timer handle.  Timers run on `tokio-cron-scheduler`: delayed jobs are
//! one-shots, recurring jobs are repeated jobs, and cron jobs re-arm a
//! one-shot for the next matching instant after each fire.  Timer
//! callbacks only forward the job id to a single firing loop, which
//! updates the record, persists the full set through the [`JobStore`]
//! and emits a [`JobDue`] for the coordinator.
//!
//! The scheduler never talks to transports itself.

pub mod schedule;
pub mod store;

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_cron_scheduler::{Job as TimerJob, JobScheduler};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::comm::{ChatTarget, ConversationKey};
use crate::events::{CoordinatorEvent, EventBus};

pub use schedule::CronExpr;
pub use store::JobStore;

/// Smallest delay handed to the timer wheel.
const MIN_TIMER_DELAY: Duration = Duration::from_millis(10);

// ---------------------------------------------------------------------------
// Job model
// ---------------------------------------------------------------------------

/// Schedule parameters.  Serialised inline in the job record with a
/// `kind` tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobSchedule {
    Delayed { execute_at: DateTime<Utc> },
    Recurring { interval_secs: u64 },
    Cron { expression: String },
}

impl JobSchedule {
    pub fn kind(&self) -> &'static str {
        match self {
            JobSchedule::Delayed { .. } => "delayed",
            JobSchedule::Recurring { .. } => "recurring",
            JobSchedule::Cron { .. } => "cron",
        }
    }
}

/// A persisted scheduled job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    #[serde(flatten)]
    pub schedule: JobSchedule,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_key: Option<ConversationKey>,
    pub target: ChatTarget,
    pub message: String,
    pub description: String,
    #[serde(default)]
    pub invoke_backend: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub run_count: u64,
}

/// Everything a scheduling call needs besides the schedule itself.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub conversation_key: Option<ConversationKey>,
    pub target: ChatTarget,
    pub message: String,
    /// Overrides the generated description.
    pub description: Option<String>,
    pub invoke_backend: bool,
}

/// Listing entry returned by [`Scheduler::list`].
#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub id: String,
    #[serde(flatten)]
    pub schedule: JobSchedule,
    pub description: String,
    pub target: ChatTarget,
    pub invoke_backend: bool,
    pub created_at: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub run_count: u64,
}

/// Emitted when a job fires.
#[derive(Debug, Clone)]
pub struct JobDue {
    pub job_id: String,
    pub target: ChatTarget,
    pub message: String,
    pub conversation_key: Option<ConversationKey>,
    pub invoke_backend: bool,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("delay must be a positive whole number of seconds")]
    InvalidDelay,
    #[error("interval must be a positive whole number of seconds")]
    InvalidInterval,
    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidExpression { expression: String, reason: String },
    #[error("message must not be empty")]
    EmptyMessage,
    #[error("failed to arm timer: {0}")]
    Timer(String),
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

struct Entry {
    job: Job,
    timer: Option<Uuid>,
    armed_at: DateTime<Utc>,
}

struct Inner {
    jobs: Mutex<HashMap<String, Entry>>,
    store: JobStore,
    timers: JobScheduler,
    fire_tx: mpsc::UnboundedSender<String>,
    due_tx: mpsc::UnboundedSender<JobDue>,
    events: EventBus,
    timezone: Option<Tz>,
}

/// Cloneable handle to one scheduler instance.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Create and start a scheduler.  Returns the receiver on which
    /// [`JobDue`]s are delivered.  Call [`Scheduler::load`] afterwards
    /// to restore persisted jobs.
    pub async fn new(
        store: JobStore,
        events: EventBus,
        timezone: Option<Tz>,
    ) -> anyhow::Result<(Self, mpsc::UnboundedReceiver<JobDue>)> {
        let timers = JobScheduler::new()
            .await
            .context("failed to create timer scheduler")?;
        timers
            .start()
            .await
            .context("failed to start timer scheduler")?;

        let (fire_tx, fire_rx) = mpsc::unbounded_channel();
        let (due_tx, due_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            jobs: Mutex::new(HashMap::new()),
            store,
            timers,
            fire_tx,
            due_tx,
            events,
            timezone,
        });
        tokio::spawn(firing_loop(Arc::downgrade(&inner), fire_rx));

        Ok((Self { inner }, due_rx))
    }

    pub fn store(&self) -> &JobStore {
        &self.inner.store
    }

    /// Restore persisted jobs and re-arm their timers.  Delayed jobs
    /// whose time has passed fire immediately.  Returns the number of
    /// jobs now scheduled.
    pub async fn load(&self) -> usize {
        let stored = self.inner.store.load().await;
        let now = Utc::now();
        let mut overdue = Vec::new();
        let mut dropped = 0usize;

        let mut jobs = self.inner.jobs.lock().await;
        for job in stored {
            if jobs.contains_key(&job.id) {
                continue;
            }
            let id = job.id.clone();
            match &job.schedule {
                JobSchedule::Delayed { execute_at } if *execute_at <= now => {
                    debug!(job = %id, "delayed job is overdue, firing now");
                    overdue.push(id.clone());
                    jobs.insert(id, Entry { job, timer: None, armed_at: now });
                }
                _ => match self.inner.arm(&job).await {
                    Ok(uuid) => {
                        jobs.insert(id, Entry { job, timer: Some(uuid), armed_at: now });
                    }
                    Err(e) => {
                        warn!(job = %id, error = %e, "dropping job that could not be re-armed");
                        dropped += 1;
                    }
                },
            }
        }
        if dropped > 0 {
            self.inner.persist(&jobs).await;
        }
        let count = jobs.len();
        drop(jobs);

        for id in overdue {
            let _ = self.inner.fire_tx.send(id);
        }
        info!(count, dropped, "scheduled jobs restored");
        count
    }

    /// Fire once, `delay_secs` from now.
    pub async fn schedule_delayed(&self, req: JobRequest, delay_secs: u64) -> Result<String, ScheduleError> {
        let execute_at = i64::try_from(delay_secs)
            .ok()
            .filter(|s| *s > 0)
            .and_then(chrono::Duration::try_seconds)
            .and_then(|d| Utc::now().checked_add_signed(d))
            .ok_or(ScheduleError::InvalidDelay)?;
        let description = format!("Send in {delay_secs}s");
        self.insert(req, JobSchedule::Delayed { execute_at }, description).await
    }

    /// Fire every `interval_secs` until cancelled.
    pub async fn schedule_recurring(&self, req: JobRequest, interval_secs: u64) -> Result<String, ScheduleError> {
        if interval_secs == 0 || i64::try_from(interval_secs).is_err() {
            return Err(ScheduleError::InvalidInterval);
        }
        let description = format!("Every {interval_secs}s");
        self.insert(req, JobSchedule::Recurring { interval_secs }, description).await
    }

    /// Fire at every instant matching a 5-field cron expression.
    pub async fn schedule_cron(&self, req: JobRequest, expression: &str) -> Result<String, ScheduleError> {
        let invalid = |reason: String| ScheduleError::InvalidExpression {
            expression: expression.to_string(),
            reason,
        };
        let expr = CronExpr::parse(expression).map_err(invalid)?;
        if expr.next_after(Utc::now(), self.inner.timezone).is_none() {
            return Err(invalid("expression never fires".to_string()));
        }
        let description = format!("Cron: {}", expr.as_str());
        let schedule = JobSchedule::Cron {
            expression: expr.as_str().to_string(),
        };
        self.insert(req, schedule, description).await
    }

    /// All jobs, oldest first.
    pub async fn list(&self) -> Vec<JobSummary> {
        let now = Utc::now();
        let jobs = self.inner.jobs.lock().await;
        let mut out: Vec<JobSummary> = jobs
            .values()
            .map(|entry| JobSummary {
                id: entry.job.id.clone(),
                schedule: entry.job.schedule.clone(),
                description: entry.job.description.clone(),
                target: entry.job.target.clone(),
                invoke_backend: entry.job.invoke_backend,
                created_at: entry.job.created_at,
                last_run: entry.job.last_run,
                next_run: self.inner.next_run(entry, now),
                run_count: entry.job.run_count,
            })
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        out
    }

    /// Cancel a job and forget it.  Returns `false` for unknown ids.
    pub async fn cancel(&self, job_id: &str) -> bool {
        let removed = {
            let mut jobs = self.inner.jobs.lock().await;
            let removed = jobs.remove(job_id);
            if removed.is_some() {
                self.inner.persist(&jobs).await;
            }
            removed
        };

        let Some(entry) = removed else {
            return false;
        };
        if let Some(uuid) = entry.timer {
            self.inner.disarm(uuid).await;
        }
        self.inner.events.publish(CoordinatorEvent::JobCancelled {
            job_id: job_id.to_string(),
        });
        true
    }

    /// Stop the timer wheel.  Jobs stay persisted.
    pub async fn shutdown(&self) {
        let mut timers = self.inner.timers.clone();
        if let Err(e) = timers.shutdown().await {
            warn!(error = %e, "timer scheduler shutdown failed");
        }
    }

    async fn insert(
        &self,
        req: JobRequest,
        schedule: JobSchedule,
        default_description: String,
    ) -> Result<String, ScheduleError> {
        if req.message.trim().is_empty() {
            return Err(ScheduleError::EmptyMessage);
        }
        let now = Utc::now();
        let job = Job {
            id: crate::utils::short_id("job"),
            schedule,
            conversation_key: req.conversation_key,
            target: req.target,
            message: req.message,
            description: req.description.unwrap_or(default_description),
            invoke_backend: req.invoke_backend,
            created_at: now,
            last_run: None,
            run_count: 0,
        };
        let id = job.id.clone();
        let kind = job.schedule.kind().to_string();
        let description = job.description.clone();

        let mut jobs = self.inner.jobs.lock().await;
        let uuid = self
            .inner
            .arm(&job)
            .await
            .map_err(|e| ScheduleError::Timer(format!("{e:#}")))?;
        jobs.insert(id.clone(), Entry { job, timer: Some(uuid), armed_at: now });
        self.inner.persist(&jobs).await;
        drop(jobs);

        self.inner.events.publish(CoordinatorEvent::JobScheduled {
            job_id: id.clone(),
            kind,
            description,
        });
        Ok(id)
    }
}

impl Inner {
    /// Create the live timer for `job`.
    async fn arm(&self, job: &Job) -> anyhow::Result<Uuid> {
        let tx = self.fire_tx.clone();
        let id = job.id.clone();
        let callback = move |_uuid: Uuid, _lock: JobScheduler| {
            let tx = tx.clone();
            let id = id.clone();
            Box::pin(async move {
                let _ = tx.send(id);
            }) as std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>
        };

        let timer = match &job.schedule {
            JobSchedule::Delayed { execute_at } => {
                TimerJob::new_one_shot_async(delay_until(*execute_at), callback)
            }
            JobSchedule::Recurring { interval_secs } => {
                anyhow::ensure!(*interval_secs > 0, "interval must be positive");
                TimerJob::new_repeated_async(Duration::from_secs(*interval_secs), callback)
            }
            JobSchedule::Cron { expression } => {
                let expr = CronExpr::parse(expression).map_err(|e| anyhow::anyhow!(e))?;
                let next = expr
                    .next_after(Utc::now(), self.timezone)
                    .ok_or_else(|| anyhow::anyhow!("cron expression never fires"))?;
                TimerJob::new_one_shot_async(delay_until(next), callback)
            }
        }
        .context("failed to build timer")?;

        self.timers.add(timer).await.context("failed to add timer")
    }

    async fn disarm(&self, uuid: Uuid) {
        if let Err(e) = self.timers.remove(&uuid).await {
            debug!(timer = %uuid, error = %e, "timer already gone");
        }
    }

    /// Rewrite the job store.  Failures degrade durability only.
    async fn persist(&self, jobs: &HashMap<String, Entry>) {
        let mut snapshot: Vec<Job> = jobs.values().map(|e| e.job.clone()).collect();
        snapshot.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        if let Err(e) = self.store.save(&snapshot).await {
            warn!(path = %self.store.path().display(), error = %e, "failed to persist jobs; continuing in memory");
        }
    }

    fn next_run(&self, entry: &Entry, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match &entry.job.schedule {
            JobSchedule::Delayed { execute_at } => Some(*execute_at),
            JobSchedule::Recurring { interval_secs } => {
                let interval = i64::try_from(*interval_secs).ok().filter(|s| *s > 0)?;
                let elapsed = (now - entry.armed_at).num_seconds().max(0);
                let ticks = elapsed / interval + 1;
                entry
                    .armed_at
                    .checked_add_signed(chrono::Duration::try_seconds(ticks.checked_mul(interval)?)?)
            }
            JobSchedule::Cron { expression } => CronExpr::parse(expression)
                .ok()
                .and_then(|e| e.next_after(now, self.timezone)),
        }
    }

    /// Handle one timer expiry.
    async fn fire(&self, job_id: &str) {
        let mut jobs = self.jobs.lock().await;
        let Some(entry) = jobs.get_mut(job_id) else {
            debug!(job = %job_id, "timer fired for a job that no longer exists");
            return;
        };

        entry.job.last_run = Some(Utc::now());
        entry.job.run_count += 1;
        let job = entry.job.clone();

        let mut inert = false;
        match &job.schedule {
            JobSchedule::Delayed { .. } => {
                jobs.remove(job_id);
            }
            JobSchedule::Recurring { .. } => {}
            JobSchedule::Cron { .. } => {
                if let Some(old) = entry.timer.take() {
                    self.disarm(old).await;
                }
                match self.arm(&job).await {
                    Ok(uuid) => {
                        entry.timer = Some(uuid);
                        entry.armed_at = Utc::now();
                    }
                    Err(e) => {
                        warn!(job = %job_id, error = %e, "cron job could not be re-armed and is now inert; removing it");
                        jobs.remove(job_id);
                        inert = true;
                    }
                }
            }
        }
        self.persist(&jobs).await;
        drop(jobs);

        if inert {
            self.events.publish(CoordinatorEvent::JobCancelled {
                job_id: job.id.clone(),
            });
        }

        self.events.publish(CoordinatorEvent::JobFired {
            job_id: job.id.clone(),
            run_count: job.run_count,
            invoke_backend: job.invoke_backend,
        });

        let due = JobDue {
            job_id: job.id,
            target: job.target,
            message: job.message,
            conversation_key: job.conversation_key,
            invoke_backend: job.invoke_backend,
        };
        if self.due_tx.send(due).is_err() {
            debug!(job = %job_id, "no consumer for job-due events");
        }
    }
}

async fn firing_loop(inner: Weak<Inner>, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(job_id) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.fire(&job_id).await;
    }
    debug!("scheduler firing loop stopped");
}

fn delay_until(at: DateTime<Utc>) -> Duration {
    (at - Utc::now()).to_std().unwrap_or(Duration::ZERO).max(MIN_TIMER_DELAY)
}
