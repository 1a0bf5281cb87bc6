//! Orchestration for the enrichment pipeline.
//!
//! The scheduler decides which agent/entity pairs are due, the dispatcher
//! runs them through per-agent queues with retries and provider breakers,
//! and the merger folds each result into the entity's fact record. The
//! [`Orchestrator`] wraps all of it behind the operations the CLI calls.

pub mod change_detector;
pub mod dispatcher;
pub mod entities;
pub mod health;
pub mod merger;
pub mod pipeline;
pub mod queue;
pub mod retry;
pub mod scheduler;

pub use change_detector::ChangeDetector;
pub use dispatcher::{Dispatcher, Settled};
pub use entities::EntityRegistry;
pub use health::{AgentHealth, PipelineHealth};
pub use merger::{FactMerger, MergeOutcome};
pub use pipeline::{Orchestrator, ProgressReporter, RestoreReport, SilentProgress, Submission};
pub use queue::JobQueues;
pub use retry::RetryPolicy;
pub use scheduler::{Scheduler, SchedulerConfig, TickReport};
