//! Rule Validation
//!
//! Static checks on declared rules, run before any job graph is built:
//! - Rule names are present and unique
//! - Patterns compile
//! - Logs and params only use wildcards the outputs bind
//! - Deferred inputs can learn their extra wildcards from their source
//! - Dynamic outputs actually contain dynamic wildcards

use std::collections::HashSet;

use log::{debug, info, warn};

use super::model::{Action, InputSpec, Rule};
use super::wildcards::{extract_wildcard_names, WildcardPattern};
use crate::errors::{Result, WorkflowError};

/// Validation error types for user-friendly error messages.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    EmptyWorkflow,
    EmptyRuleName,
    DuplicateRule(String),
    InvalidPattern { rule: String, message: String },
    ZeroThreads(String),
    UnboundWildcard { rule: String, field: &'static str, name: String },
    UnresolvableDeferredInput { rule: String, pattern: String, name: String },
    StaticDynamicOutput { rule: String, pattern: String },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyWorkflow => write!(f, "Workflow declares no rules"),
            Self::EmptyRuleName => write!(f, "A rule has an empty or whitespace-only name"),
            Self::DuplicateRule(name) => write!(f, "Duplicate rule name: '{}'", name),
            Self::InvalidPattern { rule, message } => write!(f, "Rule '{}': {}", rule, message),
            Self::ZeroThreads(rule) => write!(f, "Rule '{}' requests zero threads", rule),
            Self::UnboundWildcard { rule, field, name } => write!(
                f,
                "Rule '{}': {} uses wildcard '{{{}}}' that no output binds",
                rule, field, name
            ),
            Self::UnresolvableDeferredInput { rule, pattern, name } => write!(
                f,
                "Rule '{}': input '{}' uses wildcard '{{{}}}' that its source pattern does not provide",
                rule, pattern, name
            ),
            Self::StaticDynamicOutput { rule, pattern } => write!(
                f,
                "Rule '{}': dynamic output '{}' has no wildcards beyond those of the static outputs",
                rule, pattern
            ),
        }
    }
}

/// Validates a single rule's fields.
fn validate_rule(rule: &Rule) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if rule.name.trim().is_empty() {
        errors.push(ValidationError::EmptyRuleName);
        return errors;
    }

    let patterns = rule
        .input
        .iter()
        .map(|i| i.pattern())
        .chain(rule.input.iter().map(|i| i.source()))
        .chain(rule.output.iter().map(|o| o.pattern()))
        .chain(rule.log.iter().map(String::as_str));
    for pattern in patterns {
        if let Err(e) = WildcardPattern::parse(pattern) {
            errors.push(ValidationError::InvalidPattern {
                rule: rule.name.clone(),
                message: e.to_string(),
            });
        }
    }

    if rule.threads == 0 {
        errors.push(ValidationError::ZeroThreads(rule.name.clone()));
    }

    let bound = rule.output_wildcards();

    for log in &rule.log {
        for name in extract_wildcard_names(log) {
            if !bound.contains(&name) {
                errors.push(ValidationError::UnboundWildcard {
                    rule: rule.name.clone(),
                    field: "log",
                    name,
                });
            }
        }
    }

    for value in rule.params.values() {
        for name in extract_wildcard_names(value) {
            if !bound.contains(&name) {
                errors.push(ValidationError::UnboundWildcard {
                    rule: rule.name.clone(),
                    field: "params",
                    name,
                });
            }
        }
    }

    for input in &rule.input {
        if let InputSpec::Deferred { pattern, from } = input {
            let provided = extract_wildcard_names(from);
            for name in extract_wildcard_names(pattern) {
                if !bound.contains(&name) && !provided.contains(&name) {
                    errors.push(ValidationError::UnresolvableDeferredInput {
                        rule: rule.name.clone(),
                        pattern: pattern.clone(),
                        name,
                    });
                }
            }
        }
    }

    for output in rule.output.iter().filter(|o| o.is_dynamic()) {
        let has_dynamic = extract_wildcard_names(output.pattern())
            .iter()
            .any(|name| !bound.contains(name));
        if !has_dynamic {
            errors.push(ValidationError::StaticDynamicOutput {
                rule: rule.name.clone(),
                pattern: output.pattern().to_string(),
            });
        }
    }

    if let Action::Shell(command) = &rule.action {
        if command.contains("{output}") && rule.output.is_empty() {
            warn!("Rule '{}': command uses {{output}} but no output specified", rule.name);
        }
    }

    if rule.checkpoint && rule.output.is_empty() {
        warn!("Rule '{}' is a checkpoint without outputs", rule.name);
    }

    if rule.input.is_empty() {
        debug!("Rule '{}' has no inputs", rule.name);
    }

    errors
}

/// Validates all declared rules, reporting every problem at once.
pub fn validate_rules(rules: &[Rule]) -> Result<()> {
    info!("Validating {} rules", rules.len());

    if rules.is_empty() {
        return Err(WorkflowError::Validation(ValidationError::EmptyWorkflow.to_string()));
    }

    let mut all_errors = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();

    for rule in rules {
        if !rule.name.is_empty() && !seen.insert(rule.name.as_str()) {
            all_errors.push(ValidationError::DuplicateRule(rule.name.clone()));
        }
        all_errors.extend(validate_rule(rule));
    }

    if !all_errors.is_empty() {
        let messages: Vec<String> = all_errors.iter().map(|e| e.to_string()).collect();
        return Err(WorkflowError::Validation(messages.join("\n")));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn errors_of(rule: Rule) -> Vec<ValidationError> {
        validate_rule(&rule)
    }

    #[test]
    fn test_valid_rules() {
        let rules = vec![
            Rule::new("all").with_input("out/a.txt"),
            Rule::new("make")
                .with_input("data/{sample}.csv")
                .with_output("out/{sample}.txt")
                .with_log("logs/{sample}.log")
                .with_shell("cp {input} {output}"),
        ];
        assert!(validate_rules(&rules).is_ok());
    }

    #[test]
    fn test_empty_workflow() {
        let err = validate_rules(&[]).unwrap_err();
        assert!(err.to_string().contains("no rules"));
    }

    #[test]
    fn test_duplicate_rule() {
        let err = validate_rules(&[Rule::new("a"), Rule::new("a")]).unwrap_err();
        assert!(err.to_string().contains("Duplicate rule name: 'a'"));
    }

    #[test]
    fn test_empty_name() {
        assert_eq!(errors_of(Rule::new("  ")), vec![ValidationError::EmptyRuleName]);
    }

    #[test]
    fn test_log_wildcard_must_be_bound() {
        let errors = errors_of(
            Rule::new("a")
                .with_output("out/{sample}.txt")
                .with_log("logs/{other}.log"),
        );
        assert_eq!(errors.len(), 1);
        assert!(errors[0].to_string().contains("{other}"));
    }

    #[test]
    fn test_param_wildcard_must_be_bound() {
        let errors = errors_of(
            Rule::new("a")
                .with_output("out/{sample}.txt")
                .with_param("label", "{sample}-{lane}"),
        );
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn test_deferred_input_needs_source_wildcards() {
        let ok = errors_of(
            Rule::new("agg")
                .with_output("agg/{sample}.txt")
                .with_deferred_input("post/{sample}/{i}.txt", "clusters/{sample}/{i}.txt"),
        );
        assert!(ok.is_empty());

        let bad = errors_of(
            Rule::new("agg")
                .with_output("agg/{sample}.txt")
                .with_deferred_input("post/{sample}/{i}.txt", "clusters/{sample}.txt"),
        );
        assert_eq!(bad.len(), 1);
    }

    #[test]
    fn test_dynamic_output_needs_dynamic_wildcard() {
        let errors = errors_of(
            Rule::new("a")
                .with_output("out/{sample}.txt")
                .with_dynamic_output("out/{sample}.idx"),
        );
        assert!(matches!(errors[0], ValidationError::StaticDynamicOutput { .. }));
    }

    #[test]
    fn test_invalid_pattern_and_zero_threads() {
        let errors = errors_of(Rule::new("a").with_output("out/{x,(}.txt").with_threads(0));
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::DuplicateRule("test".to_string());
        assert!(err.to_string().contains("test"));

        let err = ValidationError::ZeroThreads("r".to_string());
        assert_eq!(err.to_string(), "Rule 'r' requests zero threads");
    }
}
