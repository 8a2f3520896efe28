//! End-to-end lifecycle tests over the in-memory repository and transport.
//!
//! These drive the engine the way production does: by publishing tasks to
//! the job-processing topic and pumping the subscription, with worker and
//! ticker behavior simulated at their queue boundaries.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use serde_json::{json, Map};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use cairn::{
    EngineConfig, JobEngine, JobRun, JobRunStatus, JobRunStore, MemoryQueue, MemoryRepository,
    QueueTopic, Step, StepRun, StepRunStatus, StepRunStore, Task, TaskKind, Ticker, TickerConfig,
    TaskQueue, TickerService, TickerStore, Worker,
};

type Engine = JobEngine<MemoryRepository, MemoryQueue>;

struct Harness {
    repo: MemoryRepository,
    queue: MemoryQueue,
    engine: Engine,
    tenant_id: Uuid,
}

impl Harness {
    fn new() -> Self {
        let _ = tracing_subscriber::fmt::try_init();
        let repo = MemoryRepository::new();
        let queue = MemoryQueue::new();
        let engine = JobEngine::new(repo.clone(), queue.clone(), EngineConfig::default());
        Self {
            repo,
            queue,
            engine,
            tenant_id: Uuid::new_v4(),
        }
    }

    async fn seed_ticker(&self) -> Result<Ticker> {
        let ticker = Ticker {
            id: Uuid::new_v4(),
            last_heartbeat_at: Utc::now(),
        };
        self.repo.upsert_ticker(ticker.clone()).await?;
        Ok(ticker)
    }

    fn seed_worker(&self, actions: &[&str]) -> Worker {
        let worker = Worker {
            id: Uuid::new_v4(),
            tenant_id: self.tenant_id,
            dispatcher_id: Uuid::new_v4(),
            actions: actions.iter().map(|a| a.to_string()).collect::<HashSet<_>>(),
            assigned_count: 0,
        };
        self.repo.insert_worker(worker.clone());
        worker
    }

    /// A two-step job: `first` feeds `second` through lookup data.
    fn seed_two_step_job(&self) -> (JobRun, StepRun, StepRun) {
        let job_run = JobRun::new(self.tenant_id);
        let first_id = Uuid::new_v4();
        let second_id = Uuid::new_v4();
        let first = Step {
            id: first_id,
            readable_id: "first".into(),
            action_id: "svc:first".into(),
            inputs: Map::new(),
            timeout: None,
            prev_step_id: None,
            next_step_id: Some(second_id),
        };
        let mut inputs = Map::new();
        inputs.insert("count".into(), json!("{{ .steps.first.n }}"));
        inputs.insert("label".into(), json!("run {{ .steps.first.n }}"));
        let second = Step {
            id: second_id,
            readable_id: "second".into(),
            action_id: "svc:second".into(),
            inputs,
            timeout: None,
            prev_step_id: Some(first_id),
            next_step_id: None,
        };
        let run_a = StepRun::new(self.tenant_id, job_run.id, first);
        let run_b = StepRun::new(self.tenant_id, job_run.id, second);
        self.repo.insert_job_run(job_run.clone());
        self.repo.insert_step_run(run_a.clone());
        self.repo.insert_step_run(run_b.clone());
        (job_run, run_a, run_b)
    }

    async fn publish(&self, kind: &TaskKind) -> Result<()> {
        let task = Task::new(&QueueTopic::JobProcessing, self.tenant_id, kind)?;
        self.queue.publish(&QueueTopic::JobProcessing, task).await?;
        Ok(())
    }

    /// Handle everything queued on the job-processing topic, including tasks
    /// published by the handlers themselves, until the topic is quiet.
    async fn pump(&self, rx: &mut UnboundedReceiver<Task>) -> Result<()> {
        while let Ok(task) = rx.try_recv() {
            self.engine.handle_task(task).await?;
        }
        Ok(())
    }
}

async fn drain_kinds(rx: &mut UnboundedReceiver<Task>) -> Result<Vec<TaskKind>> {
    let mut kinds = Vec::new();
    while let Ok(task) = rx.try_recv() {
        kinds.push(task.decode()?);
    }
    Ok(kinds)
}

#[tokio::test]
async fn two_step_job_runs_to_completion() -> Result<()> {
    let h = Harness::new();
    let ticker = h.seed_ticker().await?;
    let worker = h.seed_worker(&["svc:first", "svc:second"]);
    let (job_run, run_a, run_b) = h.seed_two_step_job();

    let mut jobs_rx = h.queue.subscribe(&QueueTopic::JobProcessing).await?;
    let mut dispatcher_rx = h
        .queue
        .subscribe(&QueueTopic::from_dispatcher_id(worker.dispatcher_id))
        .await?;
    let mut ticker_rx = h.queue.subscribe(&QueueTopic::from_ticker_id(ticker.id)).await?;

    h.publish(&TaskKind::JobRunQueued {
        job_run_id: job_run.id,
    })
    .await?;
    h.pump(&mut jobs_rx).await?;

    // First step assigned; the dispatcher was told.
    let stored_a = h.repo.get_step_run(h.tenant_id, run_a.id).await?;
    assert_eq!(stored_a.status, StepRunStatus::Assigned);
    assert_eq!(
        drain_kinds(&mut dispatcher_rx).await?,
        vec![TaskKind::StepRunAssigned {
            step_run_id: run_a.id,
            worker_id: worker.id
        }]
    );

    // Worker acks and completes the first step.
    h.publish(&TaskKind::StepRunStarted {
        step_run_id: run_a.id,
        started_at: Utc::now(),
    })
    .await?;
    h.pump(&mut jobs_rx).await?;
    h.publish(&TaskKind::StepRunFinished {
        step_run_id: run_a.id,
        finished_at: Utc::now(),
        step_output_data: json!({"n": 41}),
    })
    .await?;
    h.pump(&mut jobs_rx).await?;

    // The successor was queued, rendered from the first step's output, and
    // assigned to the same worker.
    let stored_b = h.repo.get_step_run(h.tenant_id, run_b.id).await?;
    assert_eq!(stored_b.status, StepRunStatus::Assigned);
    let input = stored_b.input.expect("rendered input");
    assert_eq!(input["count"], json!(41));
    assert_eq!(input["label"], json!("run 41"));

    h.publish(&TaskKind::StepRunStarted {
        step_run_id: run_b.id,
        started_at: Utc::now(),
    })
    .await?;
    h.publish(&TaskKind::StepRunFinished {
        step_run_id: run_b.id,
        finished_at: Utc::now(),
        step_output_data: json!({"stored": true}),
    })
    .await?;
    h.pump(&mut jobs_rx).await?;

    let stored_job = h.repo.get_job_run(h.tenant_id, job_run.id).await?;
    assert_eq!(stored_job.status, JobRunStatus::Succeeded);
    assert_eq!(stored_job.lookup_data["steps"]["first"], json!({"n": 41}));
    assert_eq!(
        stored_job.lookup_data["steps"]["second"],
        json!({"stored": true})
    );

    // The ticker saw the full arm/cancel sequence, ending with every timer
    // cancelled.
    let timer_traffic = drain_kinds(&mut ticker_rx).await?;
    assert!(
        matches!(
            timer_traffic.as_slice(),
            [
                TaskKind::ScheduleJobRunTimeout { .. },
                TaskKind::ScheduleStepRunTimeout { step_run_id: armed_a, .. },
                TaskKind::CancelStepRunTimeout { step_run_id: cancelled_a },
                TaskKind::ScheduleStepRunTimeout { step_run_id: armed_b, .. },
                TaskKind::CancelStepRunTimeout { step_run_id: cancelled_b },
                TaskKind::CancelJobRunTimeout { .. },
            ] if *armed_a == run_a.id
                && *cancelled_a == run_a.id
                && *armed_b == run_b.id
                && *cancelled_b == run_b.id
        ),
        "unexpected timer traffic: {timer_traffic:?}"
    );

    Ok(())
}

#[tokio::test]
async fn redelivered_queue_task_is_idempotent() -> Result<()> {
    let h = Harness::new();
    h.seed_ticker().await?;
    let worker = h.seed_worker(&["svc:first"]);
    let (_, run_a, _) = h.seed_two_step_job();

    let mut jobs_rx = h.queue.subscribe(&QueueTopic::JobProcessing).await?;
    let mut dispatcher_rx = h
        .queue
        .subscribe(&QueueTopic::from_dispatcher_id(worker.dispatcher_id))
        .await?;

    // At-least-once transport: the same task arrives twice.
    for _ in 0..2 {
        h.publish(&TaskKind::StepRunQueued {
            step_run_id: run_a.id,
        })
        .await?;
    }
    h.pump(&mut jobs_rx).await?;

    let stored = h.repo.get_step_run(h.tenant_id, run_a.id).await?;
    assert_eq!(stored.status, StepRunStatus::Assigned);
    assert_eq!(
        drain_kinds(&mut dispatcher_rx).await?,
        vec![TaskKind::StepRunAssigned {
            step_run_id: run_a.id,
            worker_id: worker.id
        }]
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn step_timeout_fires_through_a_live_ticker() -> Result<()> {
    let h = Harness::new();
    let worker = h.seed_worker(&["svc:first", "svc:second"]);
    let ticker = TickerService::new(h.repo.clone(), h.queue.clone(), TickerConfig::default());
    h.repo
        .upsert_ticker(Ticker {
            id: ticker.id(),
            last_heartbeat_at: Utc::now(),
        })
        .await?;

    let (job_run, mut run_a, _) = h.seed_two_step_job();
    run_a.step.timeout = Some(Duration::from_secs(10));
    h.repo.insert_step_run(run_a.clone());

    let mut jobs_rx = h.queue.subscribe(&QueueTopic::JobProcessing).await?;
    let mut ticker_rx = h.queue.subscribe(&QueueTopic::from_ticker_id(ticker.id())).await?;
    let mut dispatcher_rx = h
        .queue
        .subscribe(&QueueTopic::from_dispatcher_id(worker.dispatcher_id))
        .await?;

    h.publish(&TaskKind::JobRunQueued {
        job_run_id: job_run.id,
    })
    .await?;
    h.pump(&mut jobs_rx).await?;
    // Hand the armed timers to the ticker.
    while let Ok(task) = ticker_rx.try_recv() {
        ticker.handle_task(task).await?;
    }
    drain_kinds(&mut dispatcher_rx).await?;

    // The worker never acks; the 10s step timer fires while the 300s job
    // timer keeps sleeping.
    tokio::time::sleep(Duration::from_secs(11)).await;
    tokio::task::yield_now().await;
    h.pump(&mut jobs_rx).await?;

    let stored = h.repo.get_step_run(h.tenant_id, run_a.id).await?;
    assert_eq!(stored.status, StepRunStatus::Cancelled);
    let stored_job = h.repo.get_job_run(h.tenant_id, job_run.id).await?;
    assert_eq!(stored_job.status, JobRunStatus::Cancelled);
    assert!(matches!(
        drain_kinds(&mut dispatcher_rx).await?.as_slice(),
        [TaskKind::StepRunCancelled { step_run_id, reason }]
            if *step_run_id == run_a.id && reason == "TIMED_OUT"
    ));

    // Cancelling the job also disarmed the job timer: nothing more fires.
    while let Ok(task) = ticker_rx.try_recv() {
        ticker.handle_task(task).await?;
    }
    tokio::time::sleep(Duration::from_secs(300)).await;
    tokio::task::yield_now().await;
    assert!(drain_kinds(&mut jobs_rx).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn stale_ticker_failover_reowns_inflight_timers() -> Result<()> {
    let h = Harness::new();
    let survivor = TickerService::new(h.repo.clone(), h.queue.clone(), TickerConfig::default());
    h.repo
        .upsert_ticker(Ticker {
            id: survivor.id(),
            last_heartbeat_at: Utc::now(),
        })
        .await?;
    let stale = Ticker {
        id: Uuid::new_v4(),
        last_heartbeat_at: Utc::now() - chrono::Duration::seconds(60),
    };
    h.repo.upsert_ticker(stale.clone()).await?;

    // In-flight work whose timers the dead ticker owned.
    let (job_run, run_a, _) = h.seed_two_step_job();
    h.repo
        .update_job_run(
            h.tenant_id,
            job_run.id,
            &[],
            cairn::UpdateJobRunOpts {
                status: Some(JobRunStatus::Running),
                ticker_id: Some(stale.id),
            },
        )
        .await?;
    h.repo
        .update_step_run(
            h.tenant_id,
            run_a.id,
            &[],
            cairn::UpdateStepRunOpts {
                status: Some(StepRunStatus::Running),
                ticker_id: Some(stale.id),
                ..Default::default()
            },
        )
        .await?;

    let mut jobs_rx = h.queue.subscribe(&QueueTopic::JobProcessing).await?;
    let mut survivor_rx = h
        .queue
        .subscribe(&QueueTopic::from_ticker_id(survivor.id()))
        .await?;

    survivor.sweep_stale_tickers().await?;
    h.pump(&mut jobs_rx).await?;

    assert!(h.repo.get_ticker(stale.id).await.is_err());
    let stored = h.repo.get_step_run(h.tenant_id, run_a.id).await?;
    assert_eq!(stored.ticker_id, Some(survivor.id()));
    let stored_job = h.repo.get_job_run(h.tenant_id, job_run.id).await?;
    assert_eq!(stored_job.ticker_id, Some(survivor.id()));

    // Both timers were re-armed on the survivor with full durations.
    let rearmed = drain_kinds(&mut survivor_rx).await?;
    assert!(matches!(
        rearmed.as_slice(),
        [
            TaskKind::ScheduleStepRunTimeout { step_run_id, .. },
            TaskKind::ScheduleJobRunTimeout { job_run_id, .. },
        ] if *step_run_id == run_a.id && *job_run_id == job_run.id
    ));
    Ok(())
}

#[tokio::test]
async fn unassigned_step_requeues_until_a_worker_appears() -> Result<()> {
    let h = Harness::new();
    h.seed_ticker().await?;
    let (_, run_a, _) = h.seed_two_step_job();
    let mut jobs_rx = h.queue.subscribe(&QueueTopic::JobProcessing).await?;

    h.publish(&TaskKind::StepRunQueued {
        step_run_id: run_a.id,
    })
    .await?;
    h.pump(&mut jobs_rx).await?;
    let stored = h.repo.get_step_run(h.tenant_id, run_a.id).await?;
    assert_eq!(stored.status, StepRunStatus::PendingAssignment);

    // A worker registers; the periodic requeue sweep picks the step back up
    // once its requeue window has elapsed.
    let worker = h.seed_worker(&["svc:first"]);
    h.repo
        .update_step_run(
            h.tenant_id,
            run_a.id,
            &[],
            cairn::UpdateStepRunOpts {
                requeue_after: Some(Utc::now() - chrono::Duration::seconds(1)),
                ..Default::default()
            },
        )
        .await?;
    let sweep = Task::system(&QueueTopic::JobProcessing, &TaskKind::StepRunRequeueTicker {})?;
    h.queue.publish(&QueueTopic::JobProcessing, sweep).await?;
    h.pump(&mut jobs_rx).await?;

    let stored = h.repo.get_step_run(h.tenant_id, run_a.id).await?;
    assert_eq!(stored.status, StepRunStatus::Assigned);
    assert_eq!(stored.worker_id, Some(worker.id));
    Ok(())
}

#[tokio::test]
async fn parallel_siblings_merge_outputs_without_clobbering() -> Result<()> {
    let h = Harness::new();
    h.seed_ticker().await?;
    h.seed_worker(&["svc:left", "svc:right"]);

    let job_run = JobRun::new(h.tenant_id);
    let mut runs = Vec::new();
    for name in ["left", "right"] {
        let step = Step {
            id: Uuid::new_v4(),
            readable_id: name.into(),
            action_id: format!("svc:{name}"),
            inputs: Map::new(),
            timeout: None,
            prev_step_id: None,
            next_step_id: None,
        };
        let run = StepRun::new(h.tenant_id, job_run.id, step);
        h.repo.insert_step_run(run.clone());
        runs.push(run);
    }
    h.repo.insert_job_run(job_run.clone());

    let mut jobs_rx = h.queue.subscribe(&QueueTopic::JobProcessing).await?;
    h.publish(&TaskKind::JobRunQueued {
        job_run_id: job_run.id,
    })
    .await?;
    h.pump(&mut jobs_rx).await?;

    // Both siblings complete; the second merge must not clobber the first.
    h.publish(&TaskKind::StepRunFinished {
        step_run_id: runs[0].id,
        finished_at: Utc::now(),
        step_output_data: json!({"side": "left"}),
    })
    .await?;
    h.pump(&mut jobs_rx).await?;
    let stored_job = h.repo.get_job_run(h.tenant_id, job_run.id).await?;
    assert_eq!(stored_job.status, JobRunStatus::Running);

    h.publish(&TaskKind::StepRunFinished {
        step_run_id: runs[1].id,
        finished_at: Utc::now(),
        step_output_data: json!({"side": "right"}),
    })
    .await?;
    h.pump(&mut jobs_rx).await?;

    let stored_job = h.repo.get_job_run(h.tenant_id, job_run.id).await?;
    assert_eq!(stored_job.status, JobRunStatus::Succeeded);
    assert_eq!(
        stored_job.lookup_data["steps"]["left"],
        json!({"side": "left"})
    );
    assert_eq!(
        stored_job.lookup_data["steps"]["right"],
        json!({"side": "right"})
    );
    Ok(())
}

#[tokio::test]
async fn service_loops_shut_down_on_cancellation() -> Result<()> {
    let h = Harness::new();
    let ticker = TickerService::new(h.repo.clone(), h.queue.clone(), TickerConfig::default());
    let token = CancellationToken::new();

    let engine_handle = tokio::spawn(h.engine.clone().run(token.clone().cancelled_owned()));
    let ticker_handle = tokio::spawn(ticker.run(token.clone().cancelled_owned()));
    tokio::task::yield_now().await;

    token.cancel();
    tokio::time::timeout(Duration::from_secs(1), engine_handle).await???;
    tokio::time::timeout(Duration::from_secs(1), ticker_handle).await???;
    Ok(())
}
