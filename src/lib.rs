//! Cairn - distributed step-run scheduling with ticker-backed liveness.

pub mod assignment;
pub mod config;
pub mod engine;
pub mod error;
pub mod memory;
pub mod models;
pub mod queue;
pub mod render;
pub mod repository;
pub mod task;
pub mod ticker;

pub use assignment::select_worker;
pub use config::{EngineConfig, TickerConfig};
pub use engine::JobEngine;
pub use error::{
    AggregateError, DecodeError, EngineError, QueueError, RenderError, RepoError, RepoResult,
};
pub use memory::MemoryRepository;
pub use models::{
    CancelledReason, CronTrigger, JobRun, JobRunStatus, ScheduledTrigger, Step, StepRun,
    StepRunStatus, Ticker, Worker,
};
pub use queue::{MemoryQueue, QueueTopic, TaskQueue};
pub use render::render_template_fields;
pub use repository::{
    JobRunStore, StepRunFilter, StepRunStore, TickerStore, UpdateJobRunOpts, UpdateStepRunOpts,
    WorkerStore,
};
pub use task::{Task, TaskKind};
pub use ticker::TickerService;
