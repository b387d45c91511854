//! Workflow Execution Module
//!
//! Runs a job graph: resource-bounded scheduling, action rendering and the
//! executors that run jobs locally or on a cluster.
//!
//! # Architecture
//!
//! - [`engine`]: Loads, builds, schedules and reports one run
//! - [`scheduler`]: The coordinating loop
//! - [`executor`]: Local, cluster, dry-run and touch backends
//! - [`action`]: Shell, script and wrapper actions rendered for a job
//! - [`resources`]: The resource pool
//! - [`state`]: Per-job status records

pub mod action;
pub mod engine;
pub mod executor;
pub mod resources;
pub mod scheduler;
pub mod state;

pub use engine::{Engine, ExecutionMode, RunConfig};
pub use executor::{Executor, ExecutorSettings, JobEvent};
pub use resources::ResourcePool;
pub use scheduler::{RunSummary, Scheduler};
pub use state::{JobState, JobStatus};
