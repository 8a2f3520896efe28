//! Error types shared across the scheduling engine and ticker service.

use uuid::Uuid;

/// Errors surfaced by repository implementations.
#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    /// A conditional update found the entity in a status outside the
    /// expected set. Handlers treat this as a lost race, not a failure.
    #[error("{entity} {id} status guard failed: found {found}")]
    StatusGuard {
        entity: &'static str,
        id: Uuid,
        found: String,
    },

    #[error("{0}")]
    Message(String),
}

/// Utility alias for repository results.
pub type RepoResult<T> = Result<T, RepoError>;

/// Errors surfaced by queue transports.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("subscription channel for topic {0} closed")]
    ChannelClosed(String),

    #[error("{0}")]
    Message(String),
}

/// Failure to decode a task payload or metadata into its typed form.
///
/// Decode failures are producer bugs: handlers log and drop the task rather
/// than returning it to the transport for redelivery.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("unknown task id: {0}")]
    UnknownTaskId(String),

    #[error("task {task_id} payload invalid: {source}")]
    Payload {
        task_id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("task {task_id} metadata missing tenant id")]
    MissingTenant { task_id: String },

    #[error("task {task_id} metadata tenant id invalid")]
    InvalidTenant { task_id: String },
}

/// Failure to render a step's input template from job-run lookup data.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("template field {field} has unsupported shape: {detail}")]
    DataShape { field: String, detail: String },

    #[error("template reference {path} not present in lookup data")]
    MissingPath { path: String },

    #[error("malformed template expression in field {field}: {detail}")]
    Malformed { field: String, detail: String },
}

/// Top-level error for engine and ticker handlers.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Repo(#[from] RepoError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    /// The liveness subsystem is down: an un-owned timer can never fire, so
    /// this must be loud rather than silently dropping the timer.
    #[error("no tickers available")]
    NoValidTickers,

    /// A state the scheduling engine should never produce. Indicates an
    /// engine bug, not a user error.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error(transparent)]
    Aggregate(#[from] AggregateError),
}

/// Accumulated per-row failures from a batch operation.
///
/// Multi-row sweeps (requeue, rebalance) keep processing healthy rows and
/// return the aggregate at the end for visibility.
#[derive(Debug)]
pub struct AggregateError {
    errors: Vec<EngineError>,
}

impl AggregateError {
    pub fn new(errors: Vec<EngineError>) -> Self {
        Self { errors }
    }

    pub fn errors(&self) -> &[EngineError] {
        &self.errors
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Ok when no per-row failures were collected.
    pub fn into_result(self) -> Result<(), EngineError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(EngineError::Aggregate(self))
        }
    }
}

impl std::fmt::Display for AggregateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} row(s) failed", self.errors.len())?;
        for err in &self.errors {
            write!(f, "; {err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_aggregate_is_ok() {
        assert!(AggregateError::new(Vec::new()).into_result().is_ok());
    }

    #[test]
    fn aggregate_lists_each_failure() {
        let agg = AggregateError::new(vec![
            EngineError::NoValidTickers,
            EngineError::InvariantViolation("two running steps".into()),
        ]);
        let rendered = agg.to_string();
        assert!(rendered.starts_with("2 row(s) failed"));
        assert!(rendered.contains("no tickers available"));
        assert!(rendered.contains("two running steps"));
    }
}
