//! Durable cron jobs with misfire recovery.
//!
//! Each active job owns a tokio timer task that sleeps until the next
//! occurrence (timezone-aware) and then fires.  Firing records
//! `last_fired_at` in the database before publishing the
//! [`ScheduledEvent`], so a restart can tell which occurrence was
//! already handled.  [`JobScheduler::start`] reloads active jobs,
//! replays at most one missed occurrence per job within the grace
//! window, and re-registers the timers.

pub mod cron;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{Event, EventBus, EventMeta, ScheduledEvent};
use crate::storage::Database;

/// How far behind `now` a missed occurrence may be and still fire.
const MISFIRE_GRACE_HOURS: i64 = 3;
/// Upper bound on occurrences walked when looking for a misfire.
const MISFIRE_WALK_LIMIT: usize = 1000;

/// A persisted cron job.  `cron_expression` is the raw 5-field crontab
/// string as entered (Sunday=0), converted only at parse time.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduledJob {
    pub job_id: String,
    pub job_name: String,
    pub cron_expression: String,
    pub prompt: String,
    pub target_channel_ids: Vec<String>,
    pub working_directory: PathBuf,
    pub skill_name: Option<String>,
    pub created_by: String,
    pub last_fired_at: Option<DateTime<Utc>>,
}

/// Parameters for [`JobScheduler::add_job`].
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_name: String,
    pub cron_expression: String,
    pub prompt: String,
    pub target_channel_ids: Vec<String>,
    pub working_directory: PathBuf,
    pub skill_name: Option<String>,
    pub created_by: String,
}

/// Owns the per-job timer tasks.
pub struct JobScheduler {
    db: Arc<Database>,
    bus: Arc<EventBus>,
    tz: Tz,
    timers: Mutex<HashMap<String, JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl JobScheduler {
    pub fn new(db: Arc<Database>, bus: Arc<EventBus>, tz: Tz, cancel: CancellationToken) -> Self {
        Self {
            db,
            bus,
            tz,
            timers: Mutex::new(HashMap::new()),
            cancel,
        }
    }

    /// Reload active jobs from the database, replay misfires, and
    /// register the timers.  Returns the number of jobs registered.
    pub async fn start(&self) -> anyhow::Result<usize> {
        let jobs = self.db.active_jobs()?;
        let mut registered = 0;

        for job in jobs {
            let schedule = match cron::parse_crontab(&job.cron_expression) {
                Ok(s) => s,
                Err(e) => {
                    // A row that no longer parses is left inert rather
                    // than taking down startup.
                    warn!(job_id = %job.job_id, job_name = %job.job_name, error = %e,
                          "persisted job has unparseable schedule; not registering");
                    continue;
                }
            };

            let now = Utc::now().with_timezone(&self.tz);
            let last = job.last_fired_at.map(|t| t.with_timezone(&self.tz));
            if let Some(missed) = cron::detect_misfire(
                &schedule,
                last,
                &now,
                Duration::hours(MISFIRE_GRACE_HOURS),
                MISFIRE_WALK_LIMIT,
            ) {
                info!(job_id = %job.job_id, job_name = %job.job_name,
                      missed_at = %missed, "replaying missed occurrence");
                fire_job(&self.db, &self.bus, &job).await;
            }

            self.register_timer(job, schedule).await;
            registered += 1;
        }

        info!(jobs = registered, "scheduler started");
        Ok(registered)
    }

    /// Validate, persist and register a new job.  An invalid cron
    /// expression is rejected here and nothing is stored.
    pub async fn add_job(&self, new: NewJob) -> anyhow::Result<ScheduledJob> {
        let schedule = cron::parse_crontab(&new.cron_expression)?;

        let job = ScheduledJob {
            job_id: uuid::Uuid::new_v4().to_string(),
            job_name: new.job_name,
            cron_expression: new.cron_expression,
            prompt: new.prompt,
            target_channel_ids: new.target_channel_ids,
            working_directory: new.working_directory,
            skill_name: new.skill_name,
            created_by: new.created_by,
            last_fired_at: None,
        };
        self.db.upsert_job(&job)?;
        info!(job_id = %job.job_id, job_name = %job.job_name,
              schedule = %job.cron_expression, "job added");

        self.register_timer(job.clone(), schedule).await;
        Ok(job)
    }

    /// Soft-delete a job and stop its timer.  Returns false when no
    /// active job had that id.
    pub async fn remove_job(&self, job_id: &str) -> anyhow::Result<bool> {
        let removed = self.db.deactivate_job(job_id)?;
        if let Some(handle) = self.timers.lock().await.remove(job_id) {
            handle.abort();
        }
        if removed {
            info!(job_id, "job removed");
        }
        Ok(removed)
    }

    /// Active jobs, oldest first.
    pub fn list_jobs(&self) -> anyhow::Result<Vec<ScheduledJob>> {
        self.db.active_jobs()
    }

    async fn register_timer(&self, job: ScheduledJob, schedule: cron::Schedule) {
        let db = self.db.clone();
        let bus = self.bus.clone();
        let tz = self.tz;
        let cancel = self.cancel.clone();
        let job_id = job.job_id.clone();

        let handle = tokio::spawn(async move {
            loop {
                let now = Utc::now().with_timezone(&tz);
                let Some(next) = schedule.after(&now).next() else {
                    debug!(job_id = %job.job_id, "schedule exhausted; timer exiting");
                    break;
                };
                let wait = (next - now).to_std().unwrap_or_default();
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
                fire_job(&db, &bus, &job).await;
            }
        });

        // Replacing an entry (re-added job id) aborts the old timer.
        if let Some(old) = self.timers.lock().await.insert(job_id, handle) {
            old.abort();
        }
    }
}

/// Record the fire durably, then publish.  If the write fails the
/// occurrence is dropped and will be picked up as a misfire later.
pub async fn fire_job(db: &Database, bus: &EventBus, job: &ScheduledJob) {
    if let Err(e) = db.set_last_fired(&job.job_id, Utc::now()) {
        warn!(job_id = %job.job_id, error = %e,
              "failed to record fire time; skipping this occurrence");
        return;
    }

    info!(job_id = %job.job_id, job_name = %job.job_name, "job fired");
    bus.publish(Event::Scheduled(ScheduledEvent {
        meta: EventMeta::new("scheduler"),
        job_id: job.job_id.clone(),
        job_name: job.job_name.clone(),
        prompt: job.prompt.clone(),
        working_directory: job.working_directory.clone(),
        target_channel_ids: job.target_channel_ids.clone(),
        skill_name: job.skill_name.clone(),
    }))
    .await;
}
