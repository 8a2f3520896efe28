//! Queue task envelope and the closed set of task kinds.
//!
//! The wire envelope carries an untyped payload map; handlers decode it into
//! a [`TaskKind`] variant before dispatch, so every handler sees a
//! strongly-typed payload and unknown task ids fall through a single default
//! arm.

use chrono::{DateTime, Utc};
use serde::ser::Error as _;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::DecodeError;
use crate::queue::QueueTopic;

/// Metadata key carrying the tenant id.
const METADATA_TENANT_ID: &str = "tenant_id";

/// A queue message. Immutable once published; the retry fields are advisory
/// for the application layer, not enforced by the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Task kind name, e.g. `step-run-queued`.
    pub id: String,
    /// Destination topic name.
    pub topic: String,
    pub payload: Map<String, Value>,
    pub metadata: Map<String, Value>,
    pub retries: u32,
    pub retry_delay_secs: u32,
}

/// Every control message the engine, tickers, and dispatchers exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "id", content = "payload", rename_all = "kebab-case")]
pub enum TaskKind {
    JobRunQueued {
        job_run_id: Uuid,
    },
    StepRunQueued {
        step_run_id: Uuid,
    },
    StepRunRequeueTicker {},
    StepRunStarted {
        step_run_id: Uuid,
        started_at: DateTime<Utc>,
    },
    StepRunFinished {
        step_run_id: Uuid,
        finished_at: DateTime<Utc>,
        step_output_data: Value,
    },
    StepRunFailed {
        step_run_id: Uuid,
        failed_at: DateTime<Utc>,
        error: String,
    },
    StepRunTimedOut {
        step_run_id: Uuid,
    },
    JobRunTimedOut {
        job_run_id: Uuid,
    },
    TickerRemoved {
        ticker_id: Uuid,
    },
    /// Relayed by a dispatcher to the assigned worker.
    StepRunAssigned {
        step_run_id: Uuid,
        worker_id: Uuid,
    },
    /// Relayed by a dispatcher to cancel work on the assigned worker.
    StepRunCancelled {
        step_run_id: Uuid,
        reason: String,
    },
    ScheduleStepRunTimeout {
        step_run_id: Uuid,
        timeout_at: DateTime<Utc>,
    },
    CancelStepRunTimeout {
        step_run_id: Uuid,
    },
    ScheduleJobRunTimeout {
        job_run_id: Uuid,
        timeout_at: DateTime<Utc>,
    },
    CancelJobRunTimeout {
        job_run_id: Uuid,
    },
    ScheduleCron {
        workflow_version_id: Uuid,
        cron: String,
    },
    ScheduleWorkflow {
        trigger_id: Uuid,
        trigger_at: DateTime<Utc>,
    },
}

impl TaskKind {
    /// The wire id for this kind.
    pub fn name(&self) -> &'static str {
        match self {
            Self::JobRunQueued { .. } => "job-run-queued",
            Self::StepRunQueued { .. } => "step-run-queued",
            Self::StepRunRequeueTicker {} => "step-run-requeue-ticker",
            Self::StepRunStarted { .. } => "step-run-started",
            Self::StepRunFinished { .. } => "step-run-finished",
            Self::StepRunFailed { .. } => "step-run-failed",
            Self::StepRunTimedOut { .. } => "step-run-timed-out",
            Self::JobRunTimedOut { .. } => "job-run-timed-out",
            Self::TickerRemoved { .. } => "ticker-removed",
            Self::StepRunAssigned { .. } => "step-run-assigned",
            Self::StepRunCancelled { .. } => "step-run-cancelled",
            Self::ScheduleStepRunTimeout { .. } => "schedule-step-run-timeout",
            Self::CancelStepRunTimeout { .. } => "cancel-step-run-timeout",
            Self::ScheduleJobRunTimeout { .. } => "schedule-job-run-timeout",
            Self::CancelJobRunTimeout { .. } => "cancel-job-run-timeout",
            Self::ScheduleCron { .. } => "schedule-cron",
            Self::ScheduleWorkflow { .. } => "schedule-workflow",
        }
    }
}

/// All known task ids. Decode rejects anything outside this set.
const KNOWN_TASK_IDS: &[&str] = &[
    "job-run-queued",
    "step-run-queued",
    "step-run-requeue-ticker",
    "step-run-started",
    "step-run-finished",
    "step-run-failed",
    "step-run-timed-out",
    "job-run-timed-out",
    "ticker-removed",
    "step-run-assigned",
    "step-run-cancelled",
    "schedule-step-run-timeout",
    "cancel-step-run-timeout",
    "schedule-job-run-timeout",
    "cancel-job-run-timeout",
    "schedule-cron",
    "schedule-workflow",
];

impl Task {
    /// Build a tenant-scoped task for `topic`.
    pub fn new(
        topic: &QueueTopic,
        tenant_id: Uuid,
        kind: &TaskKind,
    ) -> Result<Self, serde_json::Error> {
        let mut task = Self::encode(topic, kind)?;
        task.metadata.insert(
            METADATA_TENANT_ID.to_string(),
            Value::String(tenant_id.to_string()),
        );
        Ok(task)
    }

    /// Build a control-plane task with no tenant scope (e.g. `ticker-removed`).
    pub fn system(topic: &QueueTopic, kind: &TaskKind) -> Result<Self, serde_json::Error> {
        Self::encode(topic, kind)
    }

    fn encode(topic: &QueueTopic, kind: &TaskKind) -> Result<Self, serde_json::Error> {
        let encoded = serde_json::to_value(kind)?;
        let Value::Object(mut fields) = encoded else {
            return Err(serde_json::Error::custom("task kind must encode to a map"));
        };
        let payload = match fields.remove("payload") {
            Some(Value::Object(payload)) => payload,
            Some(other) => {
                return Err(serde_json::Error::custom(format!(
                    "task payload must be a map, got {other}"
                )))
            }
            None => Map::new(),
        };
        Ok(Self {
            id: kind.name().to_string(),
            topic: topic.name(),
            payload,
            metadata: Map::new(),
            retries: 0,
            retry_delay_secs: 0,
        })
    }

    /// Decode the payload into its typed kind.
    pub fn decode(&self) -> Result<TaskKind, DecodeError> {
        if !KNOWN_TASK_IDS.contains(&self.id.as_str()) {
            return Err(DecodeError::UnknownTaskId(self.id.clone()));
        }
        let mut wrapper = Map::new();
        wrapper.insert("id".to_string(), Value::String(self.id.clone()));
        wrapper.insert("payload".to_string(), Value::Object(self.payload.clone()));
        serde_json::from_value(Value::Object(wrapper)).map_err(|source| DecodeError::Payload {
            task_id: self.id.clone(),
            source,
        })
    }

    /// The tenant this task is scoped to.
    pub fn tenant_id(&self) -> Result<Uuid, DecodeError> {
        let raw = self
            .metadata
            .get(METADATA_TENANT_ID)
            .and_then(Value::as_str)
            .ok_or_else(|| DecodeError::MissingTenant {
                task_id: self.id.clone(),
            })?;
        Uuid::parse_str(raw).map_err(|_| DecodeError::InvalidTenant {
            task_id: self.id.clone(),
        })
    }
}
