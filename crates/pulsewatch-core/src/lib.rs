//! # Pulsewatch
//!
//! Queue-backed uptime checks and alert dispatch.
//!
//! Pulsewatch selects monitors that are due, runs their HTTP health checks
//! through prioritised work queues, records every result and notifies the
//! configured channels when a monitor goes down or recovers.
//!
//! ## Architecture
//!
//! - **Scheduler**: claims due monitors and enqueues check messages by priority
//! - **Queue**: at-least-once queues with visibility timeouts and dead letters (Redis or in-memory)
//! - **Worker**: consumes a queue, runs checks and hands results to alerting
//! - **Alerting**: consecutive-failure thresholds, cooldowns, recovery, email/SMS/webhook delivery
//! - **Storage**: PostgreSQL for monitors, check history and the alert log
//! - **API**: health, queue statistics and a "run now" trigger
//!
//! ## Quick Start
//!
//! ```bash
//! # Apply migrations
//! pulsewatch db migrate
//!
//! # Run scheduler, workers and the API in one process
//! pulsewatch serve
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod alerting;
pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod queue;
pub mod scheduler;
pub mod telemetry;
pub mod worker;

pub use config::Config;
pub use error::{Error, Result};

/// Re-exports for convenience
pub mod prelude {
    pub use crate::alerting::{AlertEvaluator, NotifierRegistry};
    pub use crate::config::Config;
    pub use crate::db::Datastore;
    pub use crate::error::{Error, Result};
    pub use crate::models::*;
    pub use crate::queue::QueueService;
    pub use crate::scheduler::Scheduler;
    pub use crate::worker::WorkerPool;
}
