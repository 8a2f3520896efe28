//! Entity types for the scheduling engine: step runs, job runs, workers,
//! tickers, and the recurring-trigger records tickers own.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Status of a single step run. Transitions are monotonic: once a run reaches
/// a terminal status it is immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepRunStatus {
    /// Created, waiting on its predecessor (or on initial queueing).
    Pending,
    /// Input rendered, waiting for an eligible worker.
    PendingAssignment,
    /// A worker has been assigned but has not acknowledged the start yet.
    Assigned,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl StepRunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for StepRunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Pending => "PENDING",
            Self::PendingAssignment => "PENDING_ASSIGNMENT",
            Self::Assigned => "ASSIGNED",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}

/// Why a step run was cancelled. Every terminal non-success state carries a
/// reason; there is no silent failure path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CancelledReason {
    TimedOut,
    JobRunTimedOut,
}

impl std::fmt::Display for CancelledReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::TimedOut => "TIMED_OUT",
            Self::JobRunTimedOut => "JOB_RUN_TIMED_OUT",
        };
        f.write_str(name)
    }
}

/// A step definition: the template a step run is stamped from.
#[derive(Debug, Clone)]
pub struct Step {
    pub id: Uuid,
    /// Human-readable id; step outputs are keyed by this in lookup data.
    pub readable_id: String,
    /// The action a worker must advertise to execute this step.
    pub action_id: String,
    /// Template fields rendered against job-run lookup data.
    pub inputs: Map<String, Value>,
    /// Execution timeout; the engine default applies when unset.
    pub timeout: Option<Duration>,
    pub prev_step_id: Option<Uuid>,
    pub next_step_id: Option<Uuid>,
}

/// One execution attempt of one step within a job run.
///
/// Terminal rows are retained for audit and never deleted.
#[derive(Debug, Clone)]
pub struct StepRun {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub job_run_id: Uuid,
    pub step: Step,
    pub status: StepRunStatus,
    /// At most one worker is assigned at a time.
    pub worker_id: Option<Uuid>,
    /// The ticker owning this run's timeout timer; exclusive while armed.
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

impl StepRun {
    pub fn new(tenant_id: Uuid, job_run_id: Uuid, step: Step) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            job_run_id,
            step,
            status: StepRunStatus::Pending,
            worker_id: None,
            ticker_id: None,
            input: None,
            output: None,
            started_at: None,
            finished_at: None,
            cancelled_at: None,
            cancelled_reason: None,
            error: None,
            requeue_after: None,
        }
    }
}

/// Status of a job run, aggregated from its step runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobRunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobRunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for JobRunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}

/// One instantiation of a job's step graph.
#[derive(Debug, Clone)]
pub struct JobRun {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub status: JobRunStatus,
    /// Accumulated step outputs, keyed under `steps.<readable_id>`, used to
    /// render downstream step inputs.
    pub lookup_data: Map<String, Value>,
    /// Job-level timeout; the engine default applies when unset.
    pub timeout: Option<Duration>,
    /// The ticker owning this run's job-level timeout timer.
    pub ticker_id: Option<Uuid>,
}

impl JobRun {
    pub fn new(tenant_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            status: JobRunStatus::Pending,
            lookup_data: Map::new(),
            timeout: None,
            ticker_id: None,
        }
    }
}

/// A process capable of executing one or more named actions.
#[derive(Debug, Clone)]
pub struct Worker {
    pub id: Uuid,
    pub tenant_id: Uuid,
    /// The dispatcher maintaining this worker's live connection; assignment
    /// messages are published to that dispatcher's topic.
    pub dispatcher_id: Uuid,
    /// Action ids this worker advertises.
    pub actions: HashSet<String>,
    /// Count of non-terminal step runs currently assigned.
    pub assigned_count: usize,
}

/// A control-plane node owning a shard of timeout timers and
/// recurring-trigger subscriptions.
#[derive(Debug, Clone)]
pub struct Ticker {
    pub id: Uuid,
    pub last_heartbeat_at: DateTime<Utc>,
}

impl Ticker {
    /// Assignable only while the heartbeat is within the staleness window.
    pub fn is_valid(&self, now: DateTime<Utc>, staleness: Duration) -> bool {
        match chrono::Duration::from_std(staleness) {
            Ok(window) => now - self.last_heartbeat_at < window,
            Err(_) => false,
        }
    }
}

/// A cron trigger subscription owned by a ticker. Expression parsing is a
/// black box upstream; this record only carries what failover needs.
#[derive(Debug, Clone, PartialEq)]
pub struct CronTrigger {
    pub tenant_id: Uuid,
    pub workflow_version_id: Uuid,
    pub cron: String,
}

/// A one-shot scheduled-workflow trigger owned by a ticker.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledTrigger {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub trigger_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(StepRunStatus::Succeeded.is_terminal());
        assert!(StepRunStatus::Failed.is_terminal());
        assert!(StepRunStatus::Cancelled.is_terminal());
        assert!(!StepRunStatus::Running.is_terminal());
        assert!(!StepRunStatus::PendingAssignment.is_terminal());
        assert!(JobRunStatus::Failed.is_terminal());
        assert!(!JobRunStatus::Running.is_terminal());
    }

    #[test]
    fn ticker_validity_window() {
        let now = Utc::now();
        let fresh = Ticker {
            id: Uuid::new_v4(),
            last_heartbeat_at: now - chrono::Duration::seconds(3),
        };
        let stale = Ticker {
            id: Uuid::new_v4(),
            last_heartbeat_at: now - chrono::Duration::seconds(10),
        };
        let window = Duration::from_secs(6);
        assert!(fresh.is_valid(now, window));
        assert!(!stale.is_valid(now, window));
    }

    #[test]
    fn cancelled_reason_strings() {
        assert_eq!(CancelledReason::TimedOut.to_string(), "TIMED_OUT");
        assert_eq!(
            CancelledReason::JobRunTimedOut.to_string(),
            "JOB_RUN_TIMED_OUT"
        );
    }
}
