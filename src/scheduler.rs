//! Daily firing of forecast runs at fixed local times.
//!
//! Jobs are plain data, `(horizon, local time-of-day)`, evaluated in the
//! facility timezone. The firing arithmetic ([`Scheduler::next_fire`],
//! [`Scheduler::due`]) is pure so it can be tested without a clock; only
//! [`Scheduler::spawn`] sleeps. Runs are started through [`RunTrigger`], the
//! same entry point the HTTP trigger uses.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Days, Duration, LocalResult, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use tokio::task::JoinHandle;

use crate::{
    clock::Clock,
    config::PipelineConfig,
    models::HorizonKind,
    pipeline::{ForecastService, RunResult},
};

// ---

/// Something that can run the forecast pipeline for a horizon.
#[async_trait]
pub trait RunTrigger: Send + Sync {
    async fn trigger(&self, horizon: HorizonKind) -> RunResult;
}

#[async_trait]
impl RunTrigger for ForecastService {
    async fn trigger(&self, horizon: HorizonKind) -> RunResult {
        self.run_forecast(horizon).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledJob {
    pub horizon: HorizonKind,
    /// Local wall-clock time in the scheduler's timezone.
    pub at: NaiveTime,
}

#[derive(Debug, Clone)]
pub struct Scheduler {
    tz: Tz,
    jobs: Vec<ScheduledJob>,
}

impl Scheduler {
    // ---
    pub fn new(tz: Tz, jobs: Vec<ScheduledJob>) -> Self {
        Scheduler { tz, jobs }
    }

    /// One job per horizon at its configured time.
    pub fn from_config(config: &PipelineConfig) -> Self {
        // ---
        let jobs = HorizonKind::ALL
            .iter()
            .map(|&horizon| ScheduledJob {
                horizon,
                at: config.horizon(horizon).schedule,
            })
            .collect();
        Self::new(config.timezone, jobs)
    }

    pub fn jobs(&self) -> &[ScheduledJob] {
        &self.jobs
    }

    /// First firing of `job` strictly after `after`.
    ///
    /// A local time skipped by a DST switch fires one hour later on the
    /// wall clock; a repeated local time fires on its first occurrence.
    pub fn next_fire(&self, job: &ScheduledJob, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        // ---
        let local_date = after.with_timezone(&self.tz).date_naive();
        (0..=2)
            .filter_map(|offset| local_date.checked_add_days(Days::new(offset)))
            .filter_map(|date| resolve_local(self.tz, date.and_time(job.at)))
            .find(|fire| *fire > after)
    }

    /// Next firing of a job loop that last fired at `last_fire`.
    ///
    /// Counts from whichever of `last_fire` and `now` is later, so a wall
    /// clock lagging the sleep timer cannot fire the same instant twice.
    pub fn following_fire(
        &self,
        job: &ScheduledJob,
        last_fire: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let after = last_fire.map_or(now, |last| last.max(now));
        self.next_fire(job, after)
    }

    /// Jobs with a firing in `(last, now]`.
    pub fn due(&self, last: DateTime<Utc>, now: DateTime<Utc>) -> Vec<ScheduledJob> {
        // ---
        self.jobs
            .iter()
            .filter(|job| self.next_fire(job, last).is_some_and(|t| t <= now))
            .copied()
            .collect()
    }

    /// Fire every job due in `(last, now]` through `trigger`, one after the
    /// other. Failed runs are logged and returned like successful ones.
    pub async fn tick<T>(&self, trigger: &T, last: DateTime<Utc>, now: DateTime<Utc>) -> Vec<RunResult>
    where
        T: RunTrigger + ?Sized,
    {
        // ---
        let mut results = Vec::new();
        for job in self.due(last, now) {
            let result = trigger.trigger(job.horizon).await;
            log_result(&result);
            results.push(result);
        }
        results
    }

    /// Start one background task per job. Each task sleeps until the job's
    /// next firing, runs it, and repeats; a failed run never ends the loop.
    pub fn spawn<T>(self, trigger: Arc<T>, clock: Arc<dyn Clock>) -> Vec<JoinHandle<()>>
    where
        T: RunTrigger + ?Sized + 'static,
    {
        // ---
        tracing::info!(jobs = self.jobs.len(), tz = %self.tz, "Starting forecast scheduler");

        let scheduler = Arc::new(self);
        scheduler
            .jobs
            .iter()
            .copied()
            .map(|job| {
                let scheduler = scheduler.clone();
                let trigger = trigger.clone();
                let clock = clock.clone();
                tokio::spawn(async move {
                    run_job_loop(&scheduler, job, trigger.as_ref(), clock.as_ref()).await;
                })
            })
            .collect()
    }
}

/// Resolve a local wall-clock time to UTC, DST-safe.
fn resolve_local(tz: Tz, local: NaiveDateTime) -> Option<DateTime<Utc>> {
    // ---
    let resolved = match tz.from_local_datetime(&local) {
        LocalResult::Single(t) => Some(t),
        LocalResult::Ambiguous(first, _) => Some(first),
        LocalResult::None => tz.from_local_datetime(&(local + Duration::hours(1))).earliest(),
    };
    resolved.map(|t| t.with_timezone(&Utc))
}

async fn run_job_loop<T>(scheduler: &Scheduler, job: ScheduledJob, trigger: &T, clock: &dyn Clock)
where
    T: RunTrigger + ?Sized,
{
    // ---
    tracing::debug!(horizon = %job.horizon, at = %job.at, "Starting schedule loop");

    let mut last_fire = None;
    loop {
        let now = clock.now();
        let Some(fire_at) = scheduler.following_fire(&job, last_fire, now) else {
            tracing::error!(horizon = %job.horizon, "No next firing time, stopping schedule loop");
            return;
        };
        tracing::debug!(horizon = %job.horizon, %fire_at, "Next scheduled run");

        let wait = (fire_at - now).to_std().unwrap_or_default();
        tokio::time::sleep(wait).await;

        let result = trigger.trigger(job.horizon).await;
        log_result(&result);
        last_fire = Some(fire_at);
    }
}

fn log_result(result: &RunResult) {
    // ---
    if result.is_done() {
        tracing::info!(
            horizon = %result.horizon,
            run_id = %result.run_id,
            records = result.records.len(),
            "Scheduled run finished"
        );
    } else {
        tracing::warn!(
            horizon = %result.horizon,
            run_id = %result.run_id,
            stage = ?result.stage,
            error = result.error.as_deref().unwrap_or("unknown"),
            "Scheduled run failed, will retry at next firing"
        );
    }
}
