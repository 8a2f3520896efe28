//! In-memory repository implementing every store trait.
//!
//! Used by tests and single-process embeddings; mirrors the conditional
//! update and ownership semantics a relational backend must provide.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{RepoError, RepoResult};
use crate::models::{
    CronTrigger, JobRun, JobRunStatus, ScheduledTrigger, StepRun, StepRunStatus, Ticker, Worker,
};
use crate::repository::{
    JobRunStore, StepRunFilter, StepRunStore, TickerStore, UpdateJobRunOpts, UpdateStepRunOpts,
    WorkerStore,
};

#[derive(Default)]
struct Inner {
    step_runs: HashMap<Uuid, StepRun>,
    job_runs: HashMap<Uuid, JobRun>,
    workers: HashMap<Uuid, Worker>,
    tickers: HashMap<Uuid, Ticker>,
    worker_step_runs: HashMap<Uuid, HashSet<Uuid>>,
    ticker_step_runs: HashMap<Uuid, HashSet<Uuid>>,
    ticker_job_runs: HashMap<Uuid, HashSet<Uuid>>,
    ticker_crons: HashMap<Uuid, Vec<CronTrigger>>,
    ticker_scheduled: HashMap<Uuid, Vec<ScheduledTrigger>>,
}

/// Single-process repository over one mutex; every operation is a targeted
/// read or conditional write under the lock, so concurrent handlers observe
/// serializable per-entity updates.
#[derive(Clone, Default)]
pub struct MemoryRepository {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_job_run(&self, job_run: JobRun) {
        let mut inner = self.inner.lock().expect("repository state poisoned");
        inner.job_runs.insert(job_run.id, job_run);
    }

    pub fn insert_step_run(&self, step_run: StepRun) {
        let mut inner = self.inner.lock().expect("repository state poisoned");
        inner.step_runs.insert(step_run.id, step_run);
    }

    pub fn insert_worker(&self, worker: Worker) {
        let mut inner = self.inner.lock().expect("repository state poisoned");
        inner.workers.insert(worker.id, worker);
    }

    pub fn remove_worker(&self, worker_id: Uuid) {
        let mut inner = self.inner.lock().expect("repository state poisoned");
        inner.workers.remove(&worker_id);
        inner.worker_step_runs.remove(&worker_id);
    }
}

fn apply_step_run_opts(run: &mut StepRun, opts: UpdateStepRunOpts) {
    if let Some(status) = opts.status {
        run.status = status;
    }
    if let Some(worker_id) = opts.worker_id {
        run.worker_id = Some(worker_id);
    }
    if let Some(ticker_id) = opts.ticker_id {
        run.ticker_id = Some(ticker_id);
    }
    if let Some(input) = opts.input {
        run.input = Some(input);
    }
    if let Some(output) = opts.output {
        run.output = Some(output);
    }
    if let Some(started_at) = opts.started_at {
        run.started_at = Some(started_at);
    }
    if let Some(finished_at) = opts.finished_at {
        run.finished_at = Some(finished_at);
    }
    if let Some(cancelled_at) = opts.cancelled_at {
        run.cancelled_at = Some(cancelled_at);
    }
    if let Some(reason) = opts.cancelled_reason {
        run.cancelled_reason = Some(reason);
    }
    if let Some(error) = opts.error {
        run.error = Some(error);
    }
    if let Some(requeue_after) = opts.requeue_after {
        run.requeue_after = Some(requeue_after);
    }
}

fn matches_filter(run: &StepRun, filter: &StepRunFilter) -> bool {
    if let Some(job_run_id) = filter.job_run_id {
        if run.job_run_id != job_run_id {
            return false;
        }
    }
    if let Some(statuses) = &filter.statuses {
        if !statuses.contains(&run.status) {
            return false;
        }
    }
    true
}

#[async_trait]
impl StepRunStore for MemoryRepository {
    async fn get_step_run(&self, tenant_id: Uuid, id: Uuid) -> RepoResult<StepRun> {
        let inner = self.inner.lock().expect("repository state poisoned");
        inner
            .step_runs
            .get(&id)
            .filter(|run| run.tenant_id == tenant_id)
            .cloned()
            .ok_or(RepoError::NotFound {
                entity: "step run",
                id,
            })
    }

    async fn update_step_run(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        expected: &[StepRunStatus],
        opts: UpdateStepRunOpts,
    ) -> RepoResult<StepRun> {
        let mut inner = self.inner.lock().expect("repository state poisoned");
        let run = inner
            .step_runs
            .get_mut(&id)
            .filter(|run| run.tenant_id == tenant_id)
            .ok_or(RepoError::NotFound {
                entity: "step run",
                id,
            })?;
        if !expected.is_empty() && !expected.contains(&run.status) {
            return Err(RepoError::StatusGuard {
                entity: "step run",
                id,
                found: run.status.to_string(),
            });
        }
        apply_step_run_opts(run, opts);
        Ok(run.clone())
    }

    async fn list_step_runs(
        &self,
        tenant_id: Uuid,
        filter: &StepRunFilter,
    ) -> RepoResult<Vec<StepRun>> {
        let inner = self.inner.lock().expect("repository state poisoned");
        let mut runs: Vec<StepRun> = inner
            .step_runs
            .values()
            .filter(|run| run.tenant_id == tenant_id && matches_filter(run, filter))
            .cloned()
            .collect();
        runs.sort_by_key(|run| run.id);
        Ok(runs)
    }

    async fn list_all_step_runs(&self, filter: &StepRunFilter) -> RepoResult<Vec<StepRun>> {
        let inner = self.inner.lock().expect("repository state poisoned");
        let mut runs: Vec<StepRun> = inner
            .step_runs
            .values()
            .filter(|run| matches_filter(run, filter))
            .cloned()
            .collect();
        runs.sort_by_key(|run| run.id);
        Ok(runs)
    }

    async fn list_requeueable_step_runs(
        &self,
        cutoff: DateTime<Utc>,
    ) -> RepoResult<Vec<StepRun>> {
        let inner = self.inner.lock().expect("repository state poisoned");
        let mut runs: Vec<StepRun> = inner
            .step_runs
            .values()
            .filter(|run| {
                run.status == StepRunStatus::PendingAssignment
                    && run.worker_id.is_none()
                    && run.requeue_after.is_some_and(|after| after <= cutoff)
            })
            .cloned()
            .collect();
        runs.sort_by_key(|run| run.id);
        Ok(runs)
    }
}

#[async_trait]
impl JobRunStore for MemoryRepository {
    async fn get_job_run(&self, tenant_id: Uuid, id: Uuid) -> RepoResult<JobRun> {
        let inner = self.inner.lock().expect("repository state poisoned");
        inner
            .job_runs
            .get(&id)
            .filter(|run| run.tenant_id == tenant_id)
            .cloned()
            .ok_or(RepoError::NotFound {
                entity: "job run",
                id,
            })
    }

    async fn update_job_run(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        expected: &[JobRunStatus],
        opts: UpdateJobRunOpts,
    ) -> RepoResult<JobRun> {
        let mut inner = self.inner.lock().expect("repository state poisoned");
        let run = inner
            .job_runs
            .get_mut(&id)
            .filter(|run| run.tenant_id == tenant_id)
            .ok_or(RepoError::NotFound {
                entity: "job run",
                id,
            })?;
        if !expected.is_empty() && !expected.contains(&run.status) {
            return Err(RepoError::StatusGuard {
                entity: "job run",
                id,
                found: run.status.to_string(),
            });
        }
        if let Some(status) = opts.status {
            run.status = status;
        }
        if let Some(ticker_id) = opts.ticker_id {
            run.ticker_id = Some(ticker_id);
        }
        Ok(run.clone())
    }

    async fn list_all_job_runs(&self, status: JobRunStatus) -> RepoResult<Vec<JobRun>> {
        let inner = self.inner.lock().expect("repository state poisoned");
        let mut runs: Vec<JobRun> = inner
            .job_runs
            .values()
            .filter(|run| run.status == status)
            .cloned()
            .collect();
        runs.sort_by_key(|run| run.id);
        Ok(runs)
    }

    async fn merge_lookup_data(
        &self,
        tenant_id: Uuid,
        job_run_id: Uuid,
        readable_id: &str,
        output: Value,
    ) -> RepoResult<JobRun> {
        let mut inner = self.inner.lock().expect("repository state poisoned");
        let run = inner
            .job_runs
            .get_mut(&job_run_id)
            .filter(|run| run.tenant_id == tenant_id)
            .ok_or(RepoError::NotFound {
                entity: "job run",
                id: job_run_id,
            })?;
        let steps = run
            .lookup_data
            .entry("steps".to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        let Value::Object(steps) = steps else {
            return Err(RepoError::Message(format!(
                "job run {job_run_id} lookup data has non-map steps entry"
            )));
        };
        steps.insert(readable_id.to_string(), output);
        Ok(run.clone())
    }
}

#[async_trait]
impl WorkerStore for MemoryRepository {
    async fn get_worker(&self, tenant_id: Uuid, id: Uuid) -> RepoResult<Worker> {
        let inner = self.inner.lock().expect("repository state poisoned");
        let worker = inner
            .workers
            .get(&id)
            .filter(|worker| worker.tenant_id == tenant_id)
            .ok_or(RepoError::NotFound {
                entity: "worker",
                id,
            })?;
        Ok(with_assigned_count(&inner, worker))
    }

    async fn list_workers(&self, tenant_id: Uuid, action_id: &str) -> RepoResult<Vec<Worker>> {
        let inner = self.inner.lock().expect("repository state poisoned");
        let mut workers: Vec<Worker> = inner
            .workers
            .values()
            .filter(|worker| {
                worker.tenant_id == tenant_id && worker.actions.contains(action_id)
            })
            .map(|worker| with_assigned_count(&inner, worker))
            .collect();
        workers.sort_by_key(|worker| worker.id);
        Ok(workers)
    }

    async fn add_step_run(
        &self,
        tenant_id: Uuid,
        worker_id: Uuid,
        step_run_id: Uuid,
    ) -> RepoResult<()> {
        let mut inner = self.inner.lock().expect("repository state poisoned");
        if !inner
            .workers
            .get(&worker_id)
            .is_some_and(|worker| worker.tenant_id == tenant_id)
        {
            return Err(RepoError::NotFound {
                entity: "worker",
                id: worker_id,
            });
        }
        inner
            .worker_step_runs
            .entry(worker_id)
            .or_default()
            .insert(step_run_id);
        Ok(())
    }
}

/// Assigned count is the number of this worker's step runs still in a
/// non-terminal status.
fn with_assigned_count(inner: &Inner, worker: &Worker) -> Worker {
    let assigned_count = inner
        .worker_step_runs
        .get(&worker.id)
        .map(|runs| {
            runs.iter()
                .filter(|id| {
                    inner
                        .step_runs
                        .get(id)
                        .is_some_and(|run| !run.status.is_terminal())
                })
                .count()
        })
        .unwrap_or(0);
    Worker {
        assigned_count,
        ..worker.clone()
    }
}

#[async_trait]
impl TickerStore for MemoryRepository {
    async fn upsert_ticker(&self, ticker: Ticker) -> RepoResult<()> {
        let mut inner = self.inner.lock().expect("repository state poisoned");
        inner.tickers.insert(ticker.id, ticker);
        Ok(())
    }

    async fn get_ticker(&self, id: Uuid) -> RepoResult<Ticker> {
        let inner = self.inner.lock().expect("repository state poisoned");
        inner.tickers.get(&id).cloned().ok_or(RepoError::NotFound {
            entity: "ticker",
            id,
        })
    }

    async fn heartbeat(&self, id: Uuid, at: DateTime<Utc>) -> RepoResult<Ticker> {
        let mut inner = self.inner.lock().expect("repository state poisoned");
        let ticker = inner.tickers.get_mut(&id).ok_or(RepoError::NotFound {
            entity: "ticker",
            id,
        })?;
        ticker.last_heartbeat_at = at;
        Ok(ticker.clone())
    }

    async fn list_valid_tickers(&self, active_after: DateTime<Utc>) -> RepoResult<Vec<Ticker>> {
        let inner = self.inner.lock().expect("repository state poisoned");
        let mut tickers: Vec<Ticker> = inner
            .tickers
            .values()
            .filter(|ticker| ticker.last_heartbeat_at > active_after)
            .cloned()
            .collect();
        tickers.sort_by_key(|ticker| ticker.id);
        Ok(tickers)
    }

    async fn list_stale_tickers(&self, stale_before: DateTime<Utc>) -> RepoResult<Vec<Ticker>> {
        let inner = self.inner.lock().expect("repository state poisoned");
        let mut tickers: Vec<Ticker> = inner
            .tickers
            .values()
            .filter(|ticker| ticker.last_heartbeat_at <= stale_before)
            .cloned()
            .collect();
        tickers.sort_by_key(|ticker| ticker.id);
        Ok(tickers)
    }

    async fn delete_ticker(&self, id: Uuid) -> RepoResult<()> {
        let mut inner = self.inner.lock().expect("repository state poisoned");
        inner.tickers.remove(&id);
        inner.ticker_step_runs.remove(&id);
        inner.ticker_job_runs.remove(&id);
        inner.ticker_crons.remove(&id);
        inner.ticker_scheduled.remove(&id);
        Ok(())
    }

    async fn add_step_run(&self, ticker_id: Uuid, step_run_id: Uuid) -> RepoResult<()> {
        let mut inner = self.inner.lock().expect("repository state poisoned");
        // Timer ownership is exclusive to one ticker at a time.
        for owned in inner.ticker_step_runs.values_mut() {
            owned.remove(&step_run_id);
        }
        inner
            .ticker_step_runs
            .entry(ticker_id)
            .or_default()
            .insert(step_run_id);
        Ok(())
    }

    async fn add_job_run(&self, ticker_id: Uuid, job_run_id: Uuid) -> RepoResult<()> {
        let mut inner = self.inner.lock().expect("repository state poisoned");
        for owned in inner.ticker_job_runs.values_mut() {
            owned.remove(&job_run_id);
        }
        inner
            .ticker_job_runs
            .entry(ticker_id)
            .or_default()
            .insert(job_run_id);
        Ok(())
    }

    async fn add_cron(&self, ticker_id: Uuid, cron: &CronTrigger) -> RepoResult<()> {
        let mut inner = self.inner.lock().expect("repository state poisoned");
        for owned in inner.ticker_crons.values_mut() {
            owned.retain(|existing| existing != cron);
        }
        inner
            .ticker_crons
            .entry(ticker_id)
            .or_default()
            .push(cron.clone());
        Ok(())
    }

    async fn add_scheduled_workflow(
        &self,
        ticker_id: Uuid,
        trigger: &ScheduledTrigger,
    ) -> RepoResult<()> {
        let mut inner = self.inner.lock().expect("repository state poisoned");
        for owned in inner.ticker_scheduled.values_mut() {
            owned.retain(|existing| existing.id != trigger.id);
        }
        inner
            .ticker_scheduled
            .entry(ticker_id)
            .or_default()
            .push(trigger.clone());
        Ok(())
    }

    async fn list_crons(&self, ticker_id: Uuid) -> RepoResult<Vec<CronTrigger>> {
        let inner = self.inner.lock().expect("repository state poisoned");
        Ok(inner.ticker_crons.get(&ticker_id).cloned().unwrap_or_default())
    }

    async fn list_scheduled_workflows(
        &self,
        ticker_id: Uuid,
    ) -> RepoResult<Vec<ScheduledTrigger>> {
        let inner = self.inner.lock().expect("repository state poisoned");
        Ok(inner
            .ticker_scheduled
            .get(&ticker_id)
            .cloned()
            .unwrap_or_default())
    }
}
