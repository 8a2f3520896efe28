//! Step/job scheduling engine.
//!
//! The engine consumes the job-processing topic and drives every step run
//! through its lifecycle: fan-out on job queue, input render, worker
//! assignment, timer arming via tickers, completion propagation, and
//! timeout/cancellation convergence. Handlers are spawned one per inbound
//! task and coordinate only through status-guarded conditional updates at
//! the repository, never in-process locks.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::assignment::select_worker;
use crate::config::EngineConfig;
use crate::error::{AggregateError, EngineError, RepoError, RepoResult};
use crate::models::{CancelledReason, JobRunStatus, StepRun, StepRunStatus, Ticker};
use crate::queue::{QueueTopic, TaskQueue};
use crate::render::render_template_fields;
use crate::repository::{
    JobRunStore, StepRunFilter, StepRunStore, TickerStore, UpdateJobRunOpts, UpdateStepRunOpts,
    WorkerStore,
};
use crate::task::{Task, TaskKind};

/// Clamp a std duration into a chrono delta for deadline arithmetic.
pub(crate) fn to_chrono(duration: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

/// The scheduling engine. Cheap to clone; one clone per spawned handler.
#[derive(Clone)]
pub struct JobEngine<R, Q> {
    repo: R,
    queue: Q,
    config: EngineConfig,
}

impl<R, Q> JobEngine<R, Q>
where
    R: StepRunStore + JobRunStore + WorkerStore + TickerStore + Clone + Send + Sync + 'static,
    Q: TaskQueue + Clone + Send + Sync + 'static,
{
    pub fn new(repo: R, queue: Q, config: EngineConfig) -> Self {
        Self {
            repo,
            queue,
            config,
        }
    }

    /// Consume the job-processing topic until shutdown, spawning one handler
    /// task per inbound message.
    pub async fn run(
        self,
        shutdown: tokio_util::sync::WaitForCancellationFutureOwned,
    ) -> Result<(), EngineError> {
        let mut rx = self.queue.subscribe(&QueueTopic::JobProcessing).await?;
        info!("scheduling engine started");

        let mut shutdown = std::pin::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("scheduling engine shutting down");
                    break;
                }
                task = rx.recv() => {
                    let Some(task) = task else {
                        warn!("job-processing subscription closed");
                        break;
                    };
                    let engine = self.clone();
                    tokio::spawn(async move {
                        if let Err(err) = engine.handle_task(task).await {
                            metrics::counter!("cairn_engine_task_errors_total").increment(1);
                            error!(error = %err, "task handler failed");
                        }
                    });
                }
            }
        }
        Ok(())
    }

    /// Decode and dispatch one task.
    ///
    /// Decode failures are producer bugs: logged and dropped, never returned
    /// to the transport for redelivery. Repository failures propagate so the
    /// transport's retry policy can redeliver; handlers are idempotent via
    /// status guards.
    pub async fn handle_task(&self, task: Task) -> Result<(), EngineError> {
        let kind = match task.decode() {
            Ok(kind) => kind,
            Err(err) => {
                metrics::counter!("cairn_engine_decode_errors_total").increment(1);
                warn!(task_id = %task.id, error = %err, "dropping undecodable task");
                return Ok(());
            }
        };

        // The sweep tasks are control-plane scoped; everything else is
        // tenant-scoped and a missing tenant is a decode-class failure.
        match kind {
            TaskKind::TickerRemoved { ticker_id } => {
                return self.handle_ticker_removed(ticker_id).await;
            }
            TaskKind::StepRunRequeueTicker {} => {
                return self.handle_step_run_requeue().await;
            }
            _ => {}
        }
        let tenant_id = match task.tenant_id() {
            Ok(tenant_id) => tenant_id,
            Err(err) => {
                metrics::counter!("cairn_engine_decode_errors_total").increment(1);
                warn!(task_id = %task.id, error = %err, "dropping task without tenant");
                return Ok(());
            }
        };

        match kind {
            TaskKind::JobRunQueued { job_run_id } => {
                self.handle_job_run_queued(tenant_id, job_run_id).await
            }
            TaskKind::StepRunQueued { step_run_id } => {
                self.handle_step_run_queued(tenant_id, step_run_id).await
            }
            TaskKind::StepRunStarted {
                step_run_id,
                started_at,
            } => {
                self.handle_step_run_started(tenant_id, step_run_id, started_at)
                    .await
            }
            TaskKind::StepRunFinished {
                step_run_id,
                finished_at,
                step_output_data,
            } => {
                self.handle_step_run_finished(tenant_id, step_run_id, finished_at, step_output_data)
                    .await
            }
            TaskKind::StepRunFailed {
                step_run_id,
                failed_at,
                error,
            } => {
                self.handle_step_run_failed(tenant_id, step_run_id, failed_at, error)
                    .await
            }
            TaskKind::StepRunTimedOut { step_run_id } => {
                self.handle_step_run_timed_out(tenant_id, step_run_id).await
            }
            TaskKind::JobRunTimedOut { job_run_id } => {
                self.handle_job_run_timed_out(tenant_id, job_run_id).await
            }
            TaskKind::TickerRemoved { .. } | TaskKind::StepRunRequeueTicker {} => Ok(()),
            unexpected => {
                warn!(task_id = unexpected.name(), "task is not a scheduling-engine message");
                Ok(())
            }
        }
    }

    /// Fan a freshly-queued job run out to its runnable steps and arm the
    /// job-level timeout.
    async fn handle_job_run_queued(
        &self,
        tenant_id: Uuid,
        job_run_id: Uuid,
    ) -> Result<(), EngineError> {
        let job_run = self.repo.get_job_run(tenant_id, job_run_id).await?;
        if job_run.status != JobRunStatus::Pending {
            debug!(job_run_id = %job_run_id, status = %job_run.status, "job run already queued");
            return Ok(());
        }

        let ticker = self.choose_ticker().await?;
        let Some(job_run) = noop_on_guard(
            self.repo
                .update_job_run(
                    tenant_id,
                    job_run_id,
                    &[JobRunStatus::Pending],
                    UpdateJobRunOpts {
                        status: Some(JobRunStatus::Running),
                        ticker_id: Some(ticker.id),
                    },
                )
                .await,
            "start job run",
        )?
        else {
            return Ok(());
        };
        TickerStore::add_job_run(&self.repo, ticker.id, job_run_id).await?;

        let timeout = job_run.timeout.unwrap_or(self.config.default_timeout);
        self.publish(
            &QueueTopic::Ticker(ticker.id),
            tenant_id,
            &TaskKind::ScheduleJobRunTimeout {
                job_run_id,
                timeout_at: Utc::now() + to_chrono(timeout),
            },
        )
        .await?;

        // A step is runnable when it has no predecessor; successors are
        // queued by their predecessor's completion.
        let step_runs = self
            .repo
            .list_step_runs(
                tenant_id,
                &StepRunFilter {
                    job_run_id: Some(job_run_id),
                    statuses: Some(vec![StepRunStatus::Pending]),
                },
            )
            .await?;
        let mut queued = 0usize;
        for run in step_runs.iter().filter(|run| run.step.prev_step_id.is_none()) {
            self.publish(
                &QueueTopic::JobProcessing,
                tenant_id,
                &TaskKind::StepRunQueued {
                    step_run_id: run.id,
                },
            )
            .await?;
            queued += 1;
        }

        info!(
            job_run_id = %job_run_id,
            ticker_id = %ticker.id,
            runnable_steps = queued,
            "queued job run"
        );
        Ok(())
    }

    /// Render the step's input and try to place it on a worker.
    async fn handle_step_run_queued(
        &self,
        tenant_id: Uuid,
        step_run_id: Uuid,
    ) -> Result<(), EngineError> {
        let run = self.repo.get_step_run(tenant_id, step_run_id).await?;
        if !matches!(
            run.status,
            StepRunStatus::Pending | StepRunStatus::PendingAssignment
        ) {
            debug!(step_run_id = %step_run_id, status = %run.status, "step run not queueable");
            return Ok(());
        }

        let job_run = self.repo.get_job_run(tenant_id, run.job_run_id).await?;
        let input = render_template_fields(&job_run.lookup_data, &run.step.inputs)?;
        let Some(run) = noop_on_guard(
            self.repo
                .update_step_run(
                    tenant_id,
                    step_run_id,
                    &[StepRunStatus::Pending, StepRunStatus::PendingAssignment],
                    UpdateStepRunOpts {
                        status: Some(StepRunStatus::PendingAssignment),
                        input: Some(input),
                        requeue_after: Some(Utc::now() + to_chrono(self.config.requeue_after)),
                        ..Default::default()
                    },
                )
                .await,
            "render step input",
        )?
        else {
            return Ok(());
        };

        let workers = self.repo.list_workers(tenant_id, &run.step.action_id).await?;
        let Some(worker) = select_worker(&workers, &run.step.action_id) else {
            // Expected steady state, not an error: the requeue sweep retries.
            metrics::counter!("cairn_assignment_unfulfilled_total").increment(1);
            info!(
                step_run_id = %step_run_id,
                action_id = %run.step.action_id,
                "no eligible worker; awaiting requeue sweep"
            );
            return Ok(());
        };

        let ticker = self.choose_ticker().await?;
        let Some(run) = noop_on_guard(
            self.repo
                .update_step_run(
                    tenant_id,
                    step_run_id,
                    &[StepRunStatus::PendingAssignment],
                    UpdateStepRunOpts {
                        status: Some(StepRunStatus::Assigned),
                        worker_id: Some(worker.id),
                        ticker_id: Some(ticker.id),
                        ..Default::default()
                    },
                )
                .await,
            "assign step run",
        )?
        else {
            return Ok(());
        };
        WorkerStore::add_step_run(&self.repo, tenant_id, worker.id, step_run_id).await?;
        TickerStore::add_step_run(&self.repo, ticker.id, step_run_id).await?;

        let timeout = run.step.timeout.unwrap_or(self.config.default_timeout);
        self.publish(
            &QueueTopic::Ticker(ticker.id),
            tenant_id,
            &TaskKind::ScheduleStepRunTimeout {
                step_run_id,
                timeout_at: Utc::now() + to_chrono(timeout),
            },
        )
        .await?;
        self.publish(
            &QueueTopic::from_dispatcher_id(worker.dispatcher_id),
            tenant_id,
            &TaskKind::StepRunAssigned {
                step_run_id,
                worker_id: worker.id,
            },
        )
        .await?;

        metrics::counter!("cairn_step_runs_assigned_total").increment(1);
        info!(
            step_run_id = %step_run_id,
            worker_id = %worker.id,
            ticker_id = %ticker.id,
            "assigned step run"
        );
        Ok(())
    }

    async fn handle_step_run_started(
        &self,
        tenant_id: Uuid,
        step_run_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let run = self.repo.get_step_run(tenant_id, step_run_id).await?;
        if run.status != StepRunStatus::Assigned {
            debug!(step_run_id = %step_run_id, status = %run.status, "dropping stale start ack");
            return Ok(());
        }
        noop_on_guard(
            self.repo
                .update_step_run(
                    tenant_id,
                    step_run_id,
                    &[StepRunStatus::Assigned],
                    UpdateStepRunOpts {
                        status: Some(StepRunStatus::Running),
                        started_at: Some(started_at),
                        ..Default::default()
                    },
                )
                .await,
            "start step run",
        )?;
        Ok(())
    }

    /// Record success, propagate output into lookup data, cancel the timer,
    /// and queue the successor (or finish the job).
    async fn handle_step_run_finished(
        &self,
        tenant_id: Uuid,
        step_run_id: Uuid,
        finished_at: DateTime<Utc>,
        output: Value,
    ) -> Result<(), EngineError> {
        let run = self.repo.get_step_run(tenant_id, step_run_id).await?;
        if run.status.is_terminal() {
            debug!(step_run_id = %step_run_id, status = %run.status, "dropping duplicate completion");
            return Ok(());
        }

        let Some(run) = noop_on_guard(
            self.repo
                .update_step_run(
                    tenant_id,
                    step_run_id,
                    &[StepRunStatus::Assigned, StepRunStatus::Running],
                    UpdateStepRunOpts {
                        status: Some(StepRunStatus::Succeeded),
                        finished_at: Some(finished_at),
                        output: Some(output.clone()),
                        ..Default::default()
                    },
                )
                .await,
            "finish step run",
        )?
        else {
            return Ok(());
        };

        self.repo
            .merge_lookup_data(tenant_id, run.job_run_id, &run.step.readable_id, output)
            .await?;
        self.cancel_step_timer(tenant_id, &run).await?;

        if let Some(next_step_id) = run.step.next_step_id {
            let siblings = self
                .repo
                .list_step_runs(
                    tenant_id,
                    &StepRunFilter {
                        job_run_id: Some(run.job_run_id),
                        statuses: None,
                    },
                )
                .await?;
            let Some(next) = siblings.iter().find(|s| s.step.id == next_step_id) else {
                metrics::counter!("cairn_invariant_violations_total").increment(1);
                return Err(EngineError::InvariantViolation(format!(
                    "step run {step_run_id} successor step {next_step_id} has no step run"
                )));
            };
            self.publish(
                &QueueTopic::JobProcessing,
                tenant_id,
                &TaskKind::StepRunQueued {
                    step_run_id: next.id,
                },
            )
            .await?;
        } else {
            self.finish_job_run_if_complete(tenant_id, run.job_run_id)
                .await?;
        }

        info!(step_run_id = %step_run_id, "step run succeeded");
        Ok(())
    }

    /// Move the job run to `SUCCEEDED` once every step run has succeeded.
    async fn finish_job_run_if_complete(
        &self,
        tenant_id: Uuid,
        job_run_id: Uuid,
    ) -> Result<(), EngineError> {
        let runs = self
            .repo
            .list_step_runs(
                tenant_id,
                &StepRunFilter {
                    job_run_id: Some(job_run_id),
                    statuses: None,
                },
            )
            .await?;
        if !runs
            .iter()
            .all(|run| run.status == StepRunStatus::Succeeded)
        {
            return Ok(());
        }
        if let Some(job_run) = noop_on_guard(
            self.repo
                .update_job_run(
                    tenant_id,
                    job_run_id,
                    &[JobRunStatus::Running],
                    UpdateJobRunOpts {
                        status: Some(JobRunStatus::Succeeded),
                        ticker_id: None,
                    },
                )
                .await,
            "finish job run",
        )? {
            self.cancel_job_timer(tenant_id, job_run_id, job_run.ticker_id)
                .await?;
            info!(job_run_id = %job_run_id, "job run succeeded");
        }
        Ok(())
    }

    async fn handle_step_run_failed(
        &self,
        tenant_id: Uuid,
        step_run_id: Uuid,
        failed_at: DateTime<Utc>,
        error: String,
    ) -> Result<(), EngineError> {
        let run = self.repo.get_step_run(tenant_id, step_run_id).await?;
        if run.status.is_terminal() {
            debug!(step_run_id = %step_run_id, status = %run.status, "dropping duplicate failure");
            return Ok(());
        }

        let Some(run) = noop_on_guard(
            self.repo
                .update_step_run(
                    tenant_id,
                    step_run_id,
                    &[StepRunStatus::Assigned, StepRunStatus::Running],
                    UpdateStepRunOpts {
                        status: Some(StepRunStatus::Failed),
                        finished_at: Some(failed_at),
                        error: Some(error.clone()),
                        ..Default::default()
                    },
                )
                .await,
            "fail step run",
        )?
        else {
            return Ok(());
        };
        self.cancel_step_timer(tenant_id, &run).await?;

        // The job fails with it. Pending siblings are left untouched: they
        // only ever become runnable through their predecessor's completion.
        if let Some(job_run) = noop_on_guard(
            self.repo
                .update_job_run(
                    tenant_id,
                    run.job_run_id,
                    &[JobRunStatus::Running],
                    UpdateJobRunOpts {
                        status: Some(JobRunStatus::Failed),
                        ticker_id: None,
                    },
                )
                .await,
            "fail job run",
        )? {
            self.cancel_job_timer(tenant_id, run.job_run_id, job_run.ticker_id)
                .await?;
        }

        metrics::counter!("cairn_step_runs_failed_total").increment(1);
        info!(step_run_id = %step_run_id, error = %error, "step run failed");
        Ok(())
    }

    async fn handle_step_run_timed_out(
        &self,
        tenant_id: Uuid,
        step_run_id: Uuid,
    ) -> Result<(), EngineError> {
        let run = self.repo.get_step_run(tenant_id, step_run_id).await?;
        if run.status.is_terminal() {
            debug!(step_run_id = %step_run_id, status = %run.status, "timeout for terminal step run");
            return Ok(());
        }

        let Some(run) = noop_on_guard(
            self.repo
                .update_step_run(
                    tenant_id,
                    step_run_id,
                    &[StepRunStatus::Assigned, StepRunStatus::Running],
                    UpdateStepRunOpts {
                        status: Some(StepRunStatus::Cancelled),
                        cancelled_at: Some(Utc::now()),
                        cancelled_reason: Some(CancelledReason::TimedOut),
                        ..Default::default()
                    },
                )
                .await,
            "cancel timed-out step run",
        )?
        else {
            return Ok(());
        };
        self.notify_worker_cancelled(tenant_id, &run, CancelledReason::TimedOut)
            .await?;

        if let Some(job_run) = noop_on_guard(
            self.repo
                .update_job_run(
                    tenant_id,
                    run.job_run_id,
                    &[JobRunStatus::Running],
                    UpdateJobRunOpts {
                        status: Some(JobRunStatus::Cancelled),
                        ticker_id: None,
                    },
                )
                .await,
            "cancel job run after step timeout",
        )? {
            self.cancel_job_timer(tenant_id, run.job_run_id, job_run.ticker_id)
                .await?;
        }

        metrics::counter!("cairn_step_run_timeouts_total").increment(1);
        info!(step_run_id = %step_run_id, "step run timed out");
        Ok(())
    }

    /// Job-level timeout expects at most one running step: more than one is
    /// a scheduling-engine bug and is surfaced, not silently resolved.
    async fn handle_job_run_timed_out(
        &self,
        tenant_id: Uuid,
        job_run_id: Uuid,
    ) -> Result<(), EngineError> {
        let running = self
            .repo
            .list_step_runs(
                tenant_id,
                &StepRunFilter {
                    job_run_id: Some(job_run_id),
                    statuses: Some(vec![StepRunStatus::Running]),
                },
            )
            .await?;
        if running.len() > 1 {
            metrics::counter!("cairn_invariant_violations_total").increment(1);
            return Err(EngineError::InvariantViolation(format!(
                "job run {job_run_id} timed out with {} running step runs",
                running.len()
            )));
        }

        if let Some(target) = running.first() {
            if let Some(run) = noop_on_guard(
                self.repo
                    .update_step_run(
                        tenant_id,
                        target.id,
                        &[StepRunStatus::Running],
                        UpdateStepRunOpts {
                            status: Some(StepRunStatus::Cancelled),
                            cancelled_at: Some(Utc::now()),
                            cancelled_reason: Some(CancelledReason::JobRunTimedOut),
                            ..Default::default()
                        },
                    )
                    .await,
                "cancel step run for job timeout",
            )? {
                self.notify_worker_cancelled(tenant_id, &run, CancelledReason::JobRunTimedOut)
                    .await?;
                self.cancel_step_timer(tenant_id, &run).await?;
            }
        }

        noop_on_guard(
            self.repo
                .update_job_run(
                    tenant_id,
                    job_run_id,
                    &[JobRunStatus::Running],
                    UpdateJobRunOpts {
                        status: Some(JobRunStatus::Cancelled),
                        ticker_id: None,
                    },
                )
                .await,
            "cancel timed-out job run",
        )?;

        metrics::counter!("cairn_job_run_timeouts_total").increment(1);
        info!(job_run_id = %job_run_id, "job run timed out");
        Ok(())
    }

    /// Sweep step runs stuck in `PendingAssignment` across all tenants and
    /// replay their queue task. One bad row must not block requeueing of the
    /// rest.
    async fn handle_step_run_requeue(&self) -> Result<(), EngineError> {
        let now = Utc::now();
        let rows = self.repo.list_requeueable_step_runs(now).await?;
        if rows.is_empty() {
            return Ok(());
        }
        debug!(count = rows.len(), "requeueing unassigned step runs");

        let mut errors = Vec::new();
        for row in rows {
            if let Err(err) = self.requeue_step_run(&row, now).await {
                error!(step_run_id = %row.id, error = %err, "failed to requeue step run");
                errors.push(err);
            }
        }
        AggregateError::new(errors).into_result()
    }

    async fn requeue_step_run(
        &self,
        run: &StepRun,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        noop_on_guard(
            self.repo
                .update_step_run(
                    run.tenant_id,
                    run.id,
                    &[StepRunStatus::PendingAssignment],
                    UpdateStepRunOpts {
                        requeue_after: Some(now + to_chrono(self.config.requeue_after)),
                        ..Default::default()
                    },
                )
                .await,
            "bump requeue timestamp",
        )?;
        self.publish(
            &QueueTopic::JobProcessing,
            run.tenant_id,
            &TaskKind::StepRunQueued {
                step_run_id: run.id,
            },
        )
        .await
    }

    /// Rebalance timers orphaned by a removed ticker across the currently
    /// valid tickers, round-robin, re-arming each with its full duration.
    ///
    /// Safe to run concurrently with normal scheduling: re-owning is an
    /// idempotent set-owner write behind the entity status guard.
    async fn handle_ticker_removed(&self, removed_ticker_id: Uuid) -> Result<(), EngineError> {
        let valid = self.valid_tickers().await?;
        let valid_ids: HashSet<Uuid> = valid.iter().map(|ticker| ticker.id).collect();
        let orphaned = |ticker_id: Option<Uuid>| {
            ticker_id.map_or(true, |owner| !valid_ids.contains(&owner))
        };

        let step_runs: Vec<StepRun> = self
            .repo
            .list_all_step_runs(&StepRunFilter {
                job_run_id: None,
                statuses: Some(vec![StepRunStatus::Assigned, StepRunStatus::Running]),
            })
            .await?
            .into_iter()
            .filter(|run| orphaned(run.ticker_id))
            .collect();
        let job_runs: Vec<_> = self
            .repo
            .list_all_job_runs(JobRunStatus::Running)
            .await?
            .into_iter()
            .filter(|run| orphaned(run.ticker_id))
            .collect();

        let mut errors = Vec::new();
        let mut index = 0usize;
        for run in &step_runs {
            let ticker = &valid[index % valid.len()];
            index += 1;
            if let Err(err) = self.reown_step_run(run, ticker).await {
                error!(step_run_id = %run.id, error = %err, "failed to re-own step run timer");
                errors.push(err);
            }
        }
        for run in &job_runs {
            let ticker = &valid[index % valid.len()];
            index += 1;
            if let Err(err) = self
                .reown_job_run(run.tenant_id, run.id, run.timeout, ticker)
                .await
            {
                error!(job_run_id = %run.id, error = %err, "failed to re-own job run timer");
                errors.push(err);
            }
        }

        info!(
            removed_ticker_id = %removed_ticker_id,
            step_runs = step_runs.len(),
            job_runs = job_runs.len(),
            "rebalanced timers after ticker removal"
        );
        AggregateError::new(errors).into_result()
    }

    async fn reown_step_run(&self, run: &StepRun, ticker: &Ticker) -> Result<(), EngineError> {
        TickerStore::add_step_run(&self.repo, ticker.id, run.id).await?;
        noop_on_guard(
            self.repo
                .update_step_run(
                    run.tenant_id,
                    run.id,
                    &[StepRunStatus::Assigned, StepRunStatus::Running],
                    UpdateStepRunOpts {
                        ticker_id: Some(ticker.id),
                        ..Default::default()
                    },
                )
                .await,
            "set step run timer owner",
        )?;
        // Full duration, not remaining time: the original deadline died with
        // the old ticker.
        let timeout = run.step.timeout.unwrap_or(self.config.default_timeout);
        self.publish(
            &QueueTopic::Ticker(ticker.id),
            run.tenant_id,
            &TaskKind::ScheduleStepRunTimeout {
                step_run_id: run.id,
                timeout_at: Utc::now() + to_chrono(timeout),
            },
        )
        .await
    }

    async fn reown_job_run(
        &self,
        tenant_id: Uuid,
        job_run_id: Uuid,
        timeout: Option<std::time::Duration>,
        ticker: &Ticker,
    ) -> Result<(), EngineError> {
        TickerStore::add_job_run(&self.repo, ticker.id, job_run_id).await?;
        noop_on_guard(
            self.repo
                .update_job_run(
                    tenant_id,
                    job_run_id,
                    &[JobRunStatus::Running],
                    UpdateJobRunOpts {
                        status: None,
                        ticker_id: Some(ticker.id),
                    },
                )
                .await,
            "set job run timer owner",
        )?;
        let timeout = timeout.unwrap_or(self.config.default_timeout);
        self.publish(
            &QueueTopic::Ticker(ticker.id),
            tenant_id,
            &TaskKind::ScheduleJobRunTimeout {
                job_run_id,
                timeout_at: Utc::now() + to_chrono(timeout),
            },
        )
        .await
    }

    async fn cancel_step_timer(&self, tenant_id: Uuid, run: &StepRun) -> Result<(), EngineError> {
        if let Some(ticker_id) = run.ticker_id {
            self.publish(
                &QueueTopic::Ticker(ticker_id),
                tenant_id,
                &TaskKind::CancelStepRunTimeout {
                    step_run_id: run.id,
                },
            )
            .await?;
        }
        Ok(())
    }

    async fn cancel_job_timer(
        &self,
        tenant_id: Uuid,
        job_run_id: Uuid,
        ticker_id: Option<Uuid>,
    ) -> Result<(), EngineError> {
        if let Some(ticker_id) = ticker_id {
            self.publish(
                &QueueTopic::Ticker(ticker_id),
                tenant_id,
                &TaskKind::CancelJobRunTimeout { job_run_id },
            )
            .await?;
        }
        Ok(())
    }

    async fn notify_worker_cancelled(
        &self,
        tenant_id: Uuid,
        run: &StepRun,
        reason: CancelledReason,
    ) -> Result<(), EngineError> {
        let Some(worker_id) = run.worker_id else {
            return Ok(());
        };
        let worker = self.repo.get_worker(tenant_id, worker_id).await?;
        self.publish(
            &QueueTopic::from_dispatcher_id(worker.dispatcher_id),
            tenant_id,
            &TaskKind::StepRunCancelled {
                step_run_id: run.id,
                reason: reason.to_string(),
            },
        )
        .await
    }

    /// First valid ticker in stable order; loud failure when none exist.
    async fn choose_ticker(&self) -> Result<Ticker, EngineError> {
        self.valid_tickers()
            .await?
            .into_iter()
            .next()
            .ok_or(EngineError::NoValidTickers)
    }

    async fn valid_tickers(&self) -> Result<Vec<Ticker>, EngineError> {
        let active_after = Utc::now() - to_chrono(self.config.ticker_staleness);
        let tickers = self.repo.list_valid_tickers(active_after).await?;
        if tickers.is_empty() {
            return Err(EngineError::NoValidTickers);
        }
        Ok(tickers)
    }

    async fn publish(
        &self,
        topic: &QueueTopic,
        tenant_id: Uuid,
        kind: &TaskKind,
    ) -> Result<(), EngineError> {
        let task = Task::new(topic, tenant_id, kind)?;
        self.queue.publish(topic, task).await?;
        Ok(())
    }
}

/// Collapse a lost status-guard race into a logged no-op. Any other
/// repository failure propagates.
fn noop_on_guard<T>(result: RepoResult<T>, what: &str) -> Result<Option<T>, EngineError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(RepoError::StatusGuard { entity, id, found }) => {
            debug!(entity, id = %id, found = %found, "lost status race during {what}; dropping");
            Ok(None)
        }
        Err(err) => Err(err.into()),
    }
}
