//! Job Graph
//!
//! - [`job`]: A rule instantiated with one wildcard binding
//! - [`graph`]: Arena of jobs addressed by stable ids
//! - [`builder`]: Target resolution, freshness checks and deferred expansion

pub mod builder;
pub mod graph;
pub mod job;

pub use builder::{BuildSettings, DagBuilder};
pub use graph::Dag;
pub use job::{Job, JobId, RunReason};
