//! `agentcron-scheduler`: cron scheduling core for recurring agent runs.
//!
//! # Overview
//!
//! Job definitions and their schedule bookkeeping live behind a
//! [`SchedulerStore`]. The [`SchedulingEngine`] reconciles each enabled job
//! against the clock and materializes [`RunRecord`]s; the [`RunLifecycle`]
//! moves runs through their states; the [`AdmissionController`] applies the
//! job's concurrency policy before a run starts. [`Scheduler`] wires them
//! together and drives the tick loop, and the [`Dispatcher`] hands fired runs
//! to an application-provided [`Executor`].
//!
//! # Run states
//!
//! | From               | To                              | Via                    |
//! |--------------------|---------------------------------|------------------------|
//! | `Due`              | `Scheduled`                     | `mark_run_scheduled`   |
//! | `Scheduled`        | `Starting`                      | `mark_run_started`     |
//! | `Starting`         | `Running`                       | executor hand-off      |
//! | `Starting/Running` | `Succeeded` / `Failed`          | `mark_run_completed`   |
//! | `Starting/Running` | `Cancelled`                     | `cancel_run`           |
//!
//! # Missed occurrences
//!
//! Jobs with `catchup = true` get one run per occurrence missed since their
//! last success. All other jobs drop missed occurrences and keep only the
//! next future one.

pub mod admission;
pub mod clock;
pub mod db;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod jitter;
pub mod lifecycle;
pub mod lock;
pub mod memory;
pub mod schedule;
pub mod service;
pub mod sqlite;
pub mod store;
pub mod types;

pub use admission::AdmissionController;
pub use clock::{Clock, ManualClock, SystemClock};
pub use dispatch::{DispatchOutcome, Dispatcher, ExecutionReport, Executor};
pub use engine::SchedulingEngine;
pub use error::{Result, SchedulerError};
pub use jitter::{JitterSource, NoJitter, RandomJitter, SeededJitter};
pub use lifecycle::{Completion, RunLifecycle};
pub use lock::{InFlight, JobLocks};
pub use memory::MemoryStore;
pub use schedule::DueCalculator;
pub use service::Scheduler;
pub use sqlite::SqliteStore;
pub use store::SchedulerStore;
pub use types::{
    Admission, ConcurrencyPolicy, JobDefinition, ReconcileReport, ResourceUsage, RunRecord,
    RunState, ScheduleOutcome, ScheduleState, TransitionOutcome,
};
