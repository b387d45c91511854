//! Run Monitoring Module
//!
//! Tracks when jobs start and end during a run.
//!
//! # Components
//!
//! - [`ExecutionTimeline`]: job start/end times, Gantt chart and `--stats` output

pub mod timeline;

pub use timeline::{EventType, ExecutionTimeline, RunStats, TimelineEvent};
