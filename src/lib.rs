//! RuleForge - Rule-Based Workflow Engine
//!
//! Users declare production rules that turn input files into output files
//! through wildcard patterns such as `results/{sample}.txt`. RuleForge works
//! out which rules have to run for the requested targets, orders them into a
//! job graph and runs the jobs locally or on a cluster queue, within the
//! declared core and resource budget.
//!
//! # Architecture
//!
//! - [`workflow`]: Rules, wildcard patterns, the rule registry and metadata
//! - [`dag`]: Job graph construction and deferred expansion
//! - [`execution`]: Scheduler, executors and the run engine
//! - [`environment`]: Conda environments and wrapper resolution
//! - [`storage`]: Remote file providers
//! - [`monitoring`]: Execution timeline and run statistics
//!
//! # Example
//!
//! ```rust,no_run
//! use ruleforge::execution::{Engine, RunConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = RunConfig::new("/data/analysis");
//!     config.cores = Some(8);
//!
//!     let summary = Engine::new(config).run()?;
//!     if !summary.success() {
//!         eprintln!("{} jobs failed", summary.failed.len());
//!     }
//!     Ok(())
//! }
//! ```

pub mod dag;
pub mod environment;
pub mod errors;
pub mod execution;
pub mod monitoring;
pub mod storage;
pub mod workflow;

pub use errors::{Result, WorkflowError};
pub use execution::{Engine, ExecutionMode, RunConfig, RunSummary};
pub use workflow::{load_workflow, Rule, RuleRegistry};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "RuleForge";
