//! Topic-addressed, at-least-once task transport.
//!
//! Three well-known topics carry event, job, and schedule processing; the
//! rest are derived 1:1 from a live dispatcher or ticker id. The in-memory
//! transport buffers undelivered messages per topic so a resubscribing
//! consumer resumes the same logical queue without loss.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::error::QueueError;
use crate::task::Task;

/// A logical destination for tasks.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueueTopic {
    EventProcessing,
    JobProcessing,
    Scheduling,
    /// Per-dispatcher topic; assignment and cancellation messages for that
    /// dispatcher's workers.
    Dispatcher(Uuid),
    /// Per-ticker topic; timer arm/cancel and trigger-subscription messages.
    Ticker(Uuid),
}

impl QueueTopic {
    pub fn from_dispatcher_id(id: Uuid) -> Self {
        Self::Dispatcher(id)
    }

    pub fn from_ticker_id(id: Uuid) -> Self {
        Self::Ticker(id)
    }

    /// The wire name for this topic.
    pub fn name(&self) -> String {
        match self {
            Self::EventProcessing => "event_processing_queue".to_string(),
            Self::JobProcessing => "job_processing_queue".to_string(),
            Self::Scheduling => "scheduling_queue".to_string(),
            Self::Dispatcher(id) => format!("dispatcher_{id}"),
            Self::Ticker(id) => format!("ticker_{id}"),
        }
    }
}

impl std::fmt::Display for QueueTopic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name())
    }
}

/// Abstract task transport.
///
/// Delivery is at-least-once; handlers must be idempotent or rely on
/// entity-status guards. The envelope's retry fields pass through untouched.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn publish(&self, topic: &QueueTopic, task: Task) -> Result<(), QueueError>;

    /// Open (or resume) the subscription for `topic`. Subscriber identity is
    /// stable per topic: resubscribing drains anything buffered while no
    /// consumer was attached.
    async fn subscribe(&self, topic: &QueueTopic) -> Result<mpsc::UnboundedReceiver<Task>, QueueError>;
}

#[derive(Default)]
struct TopicState {
    sender: Option<mpsc::UnboundedSender<Task>>,
    buffer: VecDeque<Task>,
}

/// In-process transport over per-topic unbounded channels.
#[derive(Clone, Default)]
pub struct MemoryQueue {
    topics: Arc<Mutex<HashMap<String, TopicState>>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn publish(&self, topic: &QueueTopic, task: Task) -> Result<(), QueueError> {
        let mut topics = self.topics.lock().expect("queue state poisoned");
        let state = topics.entry(topic.name()).or_default();
        if let Some(sender) = &state.sender {
            match sender.send(task) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(task)) => {
                    // Consumer went away; hold the message for the next
                    // subscriber on this topic.
                    state.sender = None;
                    state.buffer.push_back(task);
                    debug!(topic = %topic, "buffering task for resubscribe");
                    return Ok(());
                }
            }
        }
        state.buffer.push_back(task);
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &QueueTopic,
    ) -> Result<mpsc::UnboundedReceiver<Task>, QueueError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut topics = self.topics.lock().expect("queue state poisoned");
        let state = topics.entry(topic.name()).or_default();
        while let Some(task) = state.buffer.pop_front() {
            if let Err(mpsc::error::SendError(task)) = tx.send(task) {
                state.buffer.push_front(task);
                return Err(QueueError::ChannelClosed(topic.name()));
            }
        }
        state.sender = Some(tx);
        Ok(rx)
    }
}
