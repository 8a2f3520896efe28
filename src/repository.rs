//! Narrow persistence capability traits.
//!
//! Each entity family gets its own store trait; services compose them via
//! trait bounds. Every mutation is a targeted conditional update scoped to
//! one entity id plus an expected-prior-status guard, never a blanket
//! read-modify-write.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::RepoResult;
use crate::models::{
    CancelledReason, CronTrigger, JobRun, JobRunStatus, ScheduledTrigger, StepRun, StepRunStatus,
    Ticker, Worker,
};

/// Fields to set on a step run. `None` leaves the column untouched.
#[derive(Debug, Clone, Default)]
pub struct UpdateStepRunOpts {
    pub status: Option<StepRunStatus>,
    pub worker_id: Option<Uuid>,
    pub ticker_id: Option<Uuid>,
    pub input: Option<Map<String, Value>>,
    pub output: Option<Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancelled_reason: Option<CancelledReason>,
    pub error: Option<String>,
    pub requeue_after: Option<DateTime<Utc>>,
}

/// Fields to set on a job run.
#[derive(Debug, Clone, Default)]
pub struct UpdateJobRunOpts {
    pub status: Option<JobRunStatus>,
    pub ticker_id: Option<Uuid>,
}

/// Filter for step-run listings.
#[derive(Debug, Clone, Default)]
pub struct StepRunFilter {
    pub job_run_id: Option<Uuid>,
    pub statuses: Option<Vec<StepRunStatus>>,
}

#[async_trait]
pub trait StepRunStore: Send + Sync {
    async fn get_step_run(&self, tenant_id: Uuid, id: Uuid) -> RepoResult<StepRun>;

    /// Conditionally update one step run. When `expected` is non-empty the
    /// write only lands if the current status is in the set; otherwise the
    /// call fails with [`crate::error::RepoError::StatusGuard`].
    async fn update_step_run(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        expected: &[StepRunStatus],
        opts: UpdateStepRunOpts,
    ) -> RepoResult<StepRun>;

    async fn list_step_runs(
        &self,
        tenant_id: Uuid,
        filter: &StepRunFilter,
    ) -> RepoResult<Vec<StepRun>>;

    /// Cross-tenant listing, used by control-plane sweeps.
    async fn list_all_step_runs(&self, filter: &StepRunFilter) -> RepoResult<Vec<StepRun>>;

    /// Step runs sitting in `PendingAssignment` with no worker whose
    /// requeue-after timestamp has elapsed, across all tenants; the requeue
    /// sweep is a control-plane operation.
    async fn list_requeueable_step_runs(&self, cutoff: DateTime<Utc>)
        -> RepoResult<Vec<StepRun>>;
}

#[async_trait]
pub trait JobRunStore: Send + Sync {
    async fn get_job_run(&self, tenant_id: Uuid, id: Uuid) -> RepoResult<JobRun>;

    async fn update_job_run(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        expected: &[JobRunStatus],
        opts: UpdateJobRunOpts,
    ) -> RepoResult<JobRun>;

    /// Cross-tenant listing of job runs in `status`.
    async fn list_all_job_runs(&self, status: JobRunStatus) -> RepoResult<Vec<JobRun>>;

    /// Merge one step's output into the job run's lookup data under
    /// `steps.<readable_id>`, atomically with respect to concurrent merges of
    /// sibling outputs.
    async fn merge_lookup_data(
        &self,
        tenant_id: Uuid,
        job_run_id: Uuid,
        readable_id: &str,
        output: Value,
    ) -> RepoResult<JobRun>;
}

#[async_trait]
pub trait WorkerStore: Send + Sync {
    async fn get_worker(&self, tenant_id: Uuid, id: Uuid) -> RepoResult<Worker>;

    /// Workers advertising `action_id`, with current assigned-run counts.
    async fn list_workers(&self, tenant_id: Uuid, action_id: &str) -> RepoResult<Vec<Worker>>;

    /// Record a step-run assignment against a worker.
    async fn add_step_run(
        &self,
        tenant_id: Uuid,
        worker_id: Uuid,
        step_run_id: Uuid,
    ) -> RepoResult<()>;
}

#[async_trait]
pub trait TickerStore: Send + Sync {
    /// Register (or refresh) a ticker record.
    async fn upsert_ticker(&self, ticker: Ticker) -> RepoResult<()>;

    async fn get_ticker(&self, id: Uuid) -> RepoResult<Ticker>;

    /// Refresh this ticker's heartbeat timestamp.
    async fn heartbeat(&self, id: Uuid, at: DateTime<Utc>) -> RepoResult<Ticker>;

    /// Tickers with a heartbeat strictly after `active_after`, in stable
    /// order. The boundary instant counts as stale, matching
    /// [`crate::models::Ticker::is_valid`].
    async fn list_valid_tickers(&self, active_after: DateTime<Utc>) -> RepoResult<Vec<Ticker>>;

    /// Tickers whose heartbeat is at or before `stale_before`. Together with
    /// [`Self::list_valid_tickers`] this partitions the tickers: every ticker
    /// is exactly one of valid or stale for a given cutoff.
    async fn list_stale_tickers(&self, stale_before: DateTime<Utc>) -> RepoResult<Vec<Ticker>>;

    /// Remove a ticker's durable record. Called only after its owned timers
    /// and triggers have been reassigned.
    async fn delete_ticker(&self, id: Uuid) -> RepoResult<()>;

    /// Transfer timer ownership of a step run to `ticker_id`.
    async fn add_step_run(&self, ticker_id: Uuid, step_run_id: Uuid) -> RepoResult<()>;

    /// Transfer timer ownership of a job run to `ticker_id`.
    async fn add_job_run(&self, ticker_id: Uuid, job_run_id: Uuid) -> RepoResult<()>;

    async fn add_cron(&self, ticker_id: Uuid, cron: &CronTrigger) -> RepoResult<()>;

    async fn add_scheduled_workflow(
        &self,
        ticker_id: Uuid,
        trigger: &ScheduledTrigger,
    ) -> RepoResult<()>;

    /// Cron subscriptions currently owned by `ticker_id`.
    async fn list_crons(&self, ticker_id: Uuid) -> RepoResult<Vec<CronTrigger>>;

    /// Scheduled-workflow triggers currently owned by `ticker_id`.
    async fn list_scheduled_workflows(&self, ticker_id: Uuid)
        -> RepoResult<Vec<ScheduledTrigger>>;
}
