//! Integration task runtime.
//!
//! Tasks are durable rows in `integration_tasks`. A single scheduler leases
//! due rows (pending to running, ordered by priority then id) and feeds them
//! through a bounded channel to a fixed pool of workers. Workers pace each
//! task on its `rate_key`, run the type-specific executor under a deadline
//! and record success, a backed-off retry, or a dead letter.

pub mod executor;
pub mod feature;
pub mod payload;
pub mod queue_config;
pub mod rate_limiter;
pub mod runtime;
pub mod scheduler;
pub mod service;
pub mod worker;

pub use executor::{ExecutorRegistry, TaskExecutor, TaskFailure};
pub use feature::{Feature, FeatureGate};
pub use runtime::IntegrationRuntime;
pub use service::{EnqueueBot, EnqueueWebhook, IntegrationService};
pub use worker::{TaskOutcome, retry_backoff};
