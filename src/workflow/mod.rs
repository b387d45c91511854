//! Rule Definition Module
//!
//! Provides data structures and utilities for declaring, parsing and
//! matching production rules.
//!
//! # Structure
//!
//! - [`model`]: Core data structures (Rule, InputSpec, OutputSpec, Action)
//! - [`wildcards`]: Pattern compilation, matching and rendering
//! - [`registry`]: Declared rules and their disambiguation order
//! - [`parser`]: YAML parsing and loading
//! - [`validator`]: Static rule checks
//! - [`metadata`]: Persisted rule hashes and incomplete markers

pub mod metadata;
pub mod model;
pub mod parser;
pub mod registry;
pub mod validator;
pub mod wildcards;

pub use metadata::{Metadata, MetadataStore};
pub use model::{Action, InputSpec, OutputSpec, Rule, ShadowMode};
pub use parser::{load_workflow, parse_workflow};
pub use registry::RuleRegistry;
pub use wildcards::{WildcardPattern, Wildcards};
