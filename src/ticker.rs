//! Ticker service: durable timers and liveness.
//!
//! Each ticker heartbeats a shared record, arms/cancels timeout timers it
//! has been handed ownership of, and sweeps for peers whose heartbeat went
//! stale. A stale peer's trigger subscriptions are reassigned here and its
//! in-flight timers are rebalanced by the engine via a `ticker-removed`
//! task; the durable record is deleted only after reassignment succeeds, so
//! a crash mid-failover re-runs it instead of losing timers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::TickerConfig;
use crate::engine::to_chrono;
use crate::error::{AggregateError, EngineError};
use crate::models::Ticker;
use crate::queue::{QueueTopic, TaskQueue};
use crate::repository::TickerStore;
use crate::task::{Task, TaskKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum TimerKey {
    StepRun(Uuid),
    JobRun(Uuid),
}

/// An armed timer. The generation distinguishes a timer from any timer that
/// later replaced it under the same key, so a fired timer's self-cleanup
/// cannot evict its replacement.
struct TimerEntry {
    generation: u64,
    handle: JoinHandle<()>,
}

type TimerTable = Mutex<HashMap<TimerKey, TimerEntry>>;

/// One ticker node. Cheap to clone; clones share the armed-timer table.
#[derive(Clone)]
pub struct TickerService<R, Q> {
    id: Uuid,
    repo: R,
    queue: Q,
    config: TickerConfig,
    timers: Arc<TimerTable>,
    next_generation: Arc<AtomicU64>,
}

impl<R, Q> TickerService<R, Q>
where
    R: TickerStore + Clone + Send + Sync + 'static,
    Q: TaskQueue + Clone + Send + Sync + 'static,
{
    pub fn new(repo: R, queue: Q, config: TickerConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            repo,
            queue,
            config,
            timers: Arc::new(Mutex::new(HashMap::new())),
            next_generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Register, then loop over heartbeat ticks, stale-peer sweeps, and this
    /// ticker's own topic until shutdown.
    pub async fn run(
        self,
        shutdown: tokio_util::sync::WaitForCancellationFutureOwned,
    ) -> Result<(), EngineError> {
        self.repo
            .upsert_ticker(Ticker {
                id: self.id,
                last_heartbeat_at: Utc::now(),
            })
            .await?;
        let mut rx = self
            .queue
            .subscribe(&QueueTopic::from_ticker_id(self.id))
            .await?;
        info!(ticker_id = %self.id, "ticker started");

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut requeue = tokio::time::interval(self.config.requeue_interval);
        requeue.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut shutdown = std::pin::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(ticker_id = %self.id, "ticker shutting down");
                    break;
                }
                _ = heartbeat.tick() => {
                    if let Err(err) = self.repo.heartbeat(self.id, Utc::now()).await {
                        error!(ticker_id = %self.id, error = %err, "heartbeat failed");
                    }
                }
                _ = sweep.tick() => {
                    if let Err(err) = self.sweep_stale_tickers().await {
                        error!(ticker_id = %self.id, error = %err, "stale-ticker sweep failed");
                    }
                }
                _ = requeue.tick() => {
                    if let Err(err) = self.publish_requeue_sweep().await {
                        error!(ticker_id = %self.id, error = %err, "failed to publish requeue sweep");
                    }
                }
                task = rx.recv() => {
                    let Some(task) = task else {
                        warn!(ticker_id = %self.id, "ticker subscription closed");
                        break;
                    };
                    if let Err(err) = self.handle_task(task).await {
                        metrics::counter!("cairn_ticker_task_errors_total").increment(1);
                        error!(ticker_id = %self.id, error = %err, "ticker task failed");
                    }
                }
            }
        }
        self.abort_all_timers();
        Ok(())
    }

    /// Arm, cancel, or register per the task kind. Arming replaces any timer
    /// already held for the same entity.
    pub async fn handle_task(&self, task: Task) -> Result<(), EngineError> {
        let kind = match task.decode() {
            Ok(kind) => kind,
            Err(err) => {
                metrics::counter!("cairn_ticker_decode_errors_total").increment(1);
                warn!(task_id = %task.id, error = %err, "dropping undecodable task");
                return Ok(());
            }
        };

        match kind {
            TaskKind::ScheduleStepRunTimeout {
                step_run_id,
                timeout_at,
            } => {
                let tenant_id = match task.tenant_id() {
                    Ok(tenant_id) => tenant_id,
                    Err(err) => {
                        warn!(task_id = %task.id, error = %err, "dropping timer task without tenant");
                        return Ok(());
                    }
                };
                self.arm_timer(
                    TimerKey::StepRun(step_run_id),
                    timeout_at,
                    tenant_id,
                    TaskKind::StepRunTimedOut { step_run_id },
                );
                Ok(())
            }
            TaskKind::ScheduleJobRunTimeout {
                job_run_id,
                timeout_at,
            } => {
                let tenant_id = match task.tenant_id() {
                    Ok(tenant_id) => tenant_id,
                    Err(err) => {
                        warn!(task_id = %task.id, error = %err, "dropping timer task without tenant");
                        return Ok(());
                    }
                };
                self.arm_timer(
                    TimerKey::JobRun(job_run_id),
                    timeout_at,
                    tenant_id,
                    TaskKind::JobRunTimedOut { job_run_id },
                );
                Ok(())
            }
            TaskKind::CancelStepRunTimeout { step_run_id } => {
                self.cancel_timer(TimerKey::StepRun(step_run_id));
                Ok(())
            }
            TaskKind::CancelJobRunTimeout { job_run_id } => {
                self.cancel_timer(TimerKey::JobRun(job_run_id));
                Ok(())
            }
            // Trigger subscriptions are registered durably by the sender;
            // cron evaluation and one-shot firing live with the trigger
            // subsystem, not here.
            TaskKind::ScheduleCron {
                workflow_version_id,
                ..
            } => {
                debug!(ticker_id = %self.id, workflow_version_id = %workflow_version_id, "adopted cron subscription");
                Ok(())
            }
            TaskKind::ScheduleWorkflow { trigger_id, .. } => {
                debug!(ticker_id = %self.id, trigger_id = %trigger_id, "adopted scheduled workflow");
                Ok(())
            }
            unexpected => {
                warn!(task_id = unexpected.name(), "task is not a ticker message");
                Ok(())
            }
        }
    }

    /// Ask the engine to replay step runs stuck waiting for a worker. The
    /// sweep is tenant-agnostic, so this is a system task.
    async fn publish_requeue_sweep(&self) -> Result<(), EngineError> {
        let task = Task::system(
            &QueueTopic::JobProcessing,
            &TaskKind::StepRunRequeueTicker {},
        )?;
        self.queue.publish(&QueueTopic::JobProcessing, task).await?;
        Ok(())
    }

    /// Spawn a sleeper that publishes `fire` to the job-processing topic at
    /// `timeout_at`. The timer unregisters itself once it fires.
    fn arm_timer(
        &self,
        key: TimerKey,
        timeout_at: chrono::DateTime<Utc>,
        tenant_id: Uuid,
        fire: TaskKind,
    ) {
        let delay = (timeout_at - Utc::now())
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let queue = self.queue.clone();
        let timers = Arc::clone(&self.timers);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let task = match Task::new(&QueueTopic::JobProcessing, tenant_id, &fire) {
                Ok(task) => task,
                Err(err) => {
                    error!(error = %err, "failed to encode timeout task");
                    return;
                }
            };
            if let Err(err) = queue.publish(&QueueTopic::JobProcessing, task).await {
                error!(error = %err, "failed to publish timeout task");
            }
            metrics::counter!("cairn_timers_fired_total").increment(1);
            unregister_fired(&timers, key, generation);
        });
        if let Some(previous) = self
            .timers
            .lock()
            .expect("timer table poisoned")
            .insert(key, TimerEntry { generation, handle })
        {
            previous.handle.abort();
        }
    }

    fn cancel_timer(&self, key: TimerKey) {
        if let Some(entry) = self
            .timers
            .lock()
            .expect("timer table poisoned")
            .remove(&key)
        {
            entry.handle.abort();
            metrics::counter!("cairn_timers_cancelled_total").increment(1);
        }
    }

    fn abort_all_timers(&self) {
        let mut timers = self.timers.lock().expect("timer table poisoned");
        for (_, entry) in timers.drain() {
            entry.handle.abort();
        }
    }

    /// Detect peers whose heartbeat left the staleness window and fail them
    /// over. One stuck peer must not block failover of the rest.
    pub async fn sweep_stale_tickers(&self) -> Result<(), EngineError> {
        let stale_before = Utc::now() - to_chrono(self.config.staleness_window);
        let stale = self.repo.list_stale_tickers(stale_before).await?;

        let mut errors = Vec::new();
        for ticker in stale {
            if ticker.id == self.id {
                continue;
            }
            if let Err(err) = self.remove_stale_ticker(&ticker).await {
                error!(stale_ticker_id = %ticker.id, error = %err, "ticker failover failed");
                errors.push(err);
            }
        }
        AggregateError::new(errors).into_result()
    }

    async fn remove_stale_ticker(&self, stale: &Ticker) -> Result<(), EngineError> {
        let active_after = Utc::now() - to_chrono(self.config.staleness_window);
        let valid = self.repo.list_valid_tickers(active_after).await?;
        if valid.is_empty() {
            return Err(EngineError::NoValidTickers);
        }

        info!(stale_ticker_id = %stale.id, "removing stale ticker");
        let mut index = 0usize;

        // Cron subscriptions always move; the new owner is told regardless of
        // phase so the next occurrence fires from there.
        for cron in self.repo.list_crons(stale.id).await? {
            let target = &valid[index % valid.len()];
            index += 1;
            self.repo.add_cron(target.id, &cron).await?;
            let task = Task::new(
                &QueueTopic::from_ticker_id(target.id),
                cron.tenant_id,
                &TaskKind::ScheduleCron {
                    workflow_version_id: cron.workflow_version_id,
                    cron: cron.cron.clone(),
                },
            )?;
            self.queue
                .publish(&QueueTopic::from_ticker_id(target.id), task)
                .await?;
        }

        // One-shot triggers only need re-arming while still in the future;
        // an elapsed trigger already fired (or is firing) elsewhere.
        let now = Utc::now();
        for trigger in self.repo.list_scheduled_workflows(stale.id).await? {
            let target = &valid[index % valid.len()];
            index += 1;
            self.repo.add_scheduled_workflow(target.id, &trigger).await?;
            if trigger.trigger_at > now {
                let task = Task::new(
                    &QueueTopic::from_ticker_id(target.id),
                    trigger.tenant_id,
                    &TaskKind::ScheduleWorkflow {
                        trigger_id: trigger.id,
                        trigger_at: trigger.trigger_at,
                    },
                )?;
                self.queue
                    .publish(&QueueTopic::from_ticker_id(target.id), task)
                    .await?;
            }
        }

        // The engine rebalances the stale ticker's in-flight timeout timers.
        let task = Task::system(
            &QueueTopic::JobProcessing,
            &TaskKind::TickerRemoved {
                ticker_id: stale.id,
            },
        )?;
        self.queue.publish(&QueueTopic::JobProcessing, task).await?;

        // Delete last: a failure above leaves the record for the next sweep.
        self.repo.delete_ticker(stale.id).await?;
        metrics::counter!("cairn_tickers_removed_total").increment(1);
        Ok(())
    }
}

/// Drop a fired timer's table entry, but only while the entry is still that
/// timer's own. A replacement armed under the same key between the fire and
/// this cleanup carries a newer generation and must survive so it stays
/// cancellable.
fn unregister_fired(timers: &TimerTable, key: TimerKey, generation: u64) {
    let mut timers = timers.lock().expect("timer table poisoned");
    if timers
        .get(&key)
        .is_some_and(|entry| entry.generation == generation)
    {
        timers.remove(&key);
    }
}
