//! Rule Registry
//!
//! Holds the declared rules in declaration order together with the explicit
//! `ruleorder` used to break ties between rules that can produce the same
//! file. Output patterns are compiled once on registration.

use std::collections::BTreeSet;
use std::sync::Arc;

use log::debug;

use super::model::Rule;
use super::wildcards::{
    extract_wildcard_names, format_partial, PatternMatch, WildcardPattern, Wildcards,
};
use crate::errors::{MatchFailure, Result, WorkflowError};

#[derive(Debug)]
struct RegisteredRule {
    rule: Arc<Rule>,
    outputs: Vec<WildcardPattern>,
}

/// Declared rules plus their disambiguation order.
#[derive(Debug, Default)]
pub struct RuleRegistry {
    rules: Vec<RegisteredRule>,
    ruleorder: Vec<String>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry from rules in declaration order.
    pub fn from_rules(rules: Vec<Rule>) -> Result<Self> {
        let mut registry = Self::new();
        for rule in rules {
            registry.add_rule(rule)?;
        }
        Ok(registry)
    }

    /// Registers a rule after the ones already declared.
    pub fn add_rule(&mut self, rule: Rule) -> Result<()> {
        if self.rule(&rule.name).is_some() {
            return Err(WorkflowError::Validation(format!(
                "Rule '{}' is declared more than once",
                rule.name
            )));
        }

        let bound = rule.output_wildcards();
        let outputs = rule
            .output
            .iter()
            .map(|o| {
                if !o.is_dynamic() {
                    return WildcardPattern::parse(o.pattern());
                }
                // Dynamic placeholders are compared verbatim against partially
                // rendered consumer patterns, so their constraints are dropped.
                let unconstrained: Wildcards = extract_wildcard_names(o.pattern())
                    .into_iter()
                    .filter(|name| !bound.contains(name))
                    .map(|name| {
                        let placeholder = format!("{{{}}}", name);
                        (name, placeholder)
                    })
                    .collect();
                WildcardPattern::parse(&format_partial(o.pattern(), &unconstrained))
            })
            .collect::<Result<Vec<_>>>()?;

        self.rules.push(RegisteredRule {
            rule: Arc::new(rule),
            outputs,
        });
        Ok(())
    }

    /// Sets the tie-break ranking; earlier names win.
    pub fn set_ruleorder(&mut self, order: Vec<String>) -> Result<()> {
        for name in &order {
            if self.rule(name).is_none() {
                return Err(WorkflowError::Validation(format!(
                    "ruleorder references unknown rule '{}'",
                    name
                )));
            }
        }
        self.ruleorder = order;
        Ok(())
    }

    /// Marks rules that must run on the submitting host.
    pub fn set_localrules(&mut self, names: &[String]) -> Result<()> {
        for name in names {
            let entry = self
                .rules
                .iter_mut()
                .find(|r| &r.rule.name == name)
                .ok_or_else(|| {
                    WorkflowError::Validation(format!("localrules references unknown rule '{}'", name))
                })?;
            Arc::make_mut(&mut entry.rule).local = true;
        }
        Ok(())
    }

    pub fn rule(&self, name: &str) -> Option<&Arc<Rule>> {
        self.rules.iter().map(|r| &r.rule).find(|r| r.name == name)
    }

    /// Rules in declaration order.
    pub fn rules(&self) -> impl Iterator<Item = &Arc<Rule>> {
        self.rules.iter().map(|r| &r.rule)
    }

    /// The default target when none is requested.
    pub fn first_rule(&self) -> Option<&Arc<Rule>> {
        self.rules.first().map(|r| &r.rule)
    }

    /// Position of a rule in `ruleorder`, if ranked.
    pub fn rank(&self, name: &str) -> Option<usize> {
        self.ruleorder.iter().position(|n| n == name)
    }

    /// Position of a rule in declaration order.
    pub fn declaration_index(&self, name: &str) -> Option<usize> {
        self.rules.iter().position(|r| r.rule.name == name)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Candidate order: ranked rules first (by rank), then the rest in
    /// declaration order.
    fn search_order(&self) -> Vec<&RegisteredRule> {
        let mut ordered: Vec<(usize, &RegisteredRule)> = self.rules.iter().enumerate().collect();
        ordered.sort_by_key(|(index, r)| match self.rank(&r.rule.name) {
            Some(rank) => (0, rank, *index),
            None => (1, 0, *index),
        });
        ordered.into_iter().map(|(_, r)| r).collect()
    }

    /// Finds the single rule able to produce `path`.
    ///
    /// `allowed` filters which rules may be used as producers. Dynamic outputs
    /// are matched as well, so a partially rendered dynamic pattern finds the
    /// rule that declares it. Returns `Ok(None)` if no rule matches.
    pub fn find_producer<F>(&self, path: &str, allowed: F) -> Result<Option<(Arc<Rule>, Wildcards)>>
    where
        F: Fn(&Rule) -> bool,
    {
        // `None` bindings mark rules whose pattern matches in more than one way.
        let mut candidates: Vec<(&Arc<Rule>, Option<Wildcards>)> = Vec::new();

        for entry in self.search_order() {
            if !allowed(&entry.rule) {
                continue;
            }
            for (spec, pattern) in entry.rule.output.iter().zip(&entry.outputs) {
                match pattern.matches(path) {
                    PatternMatch::NoMatch => continue,
                    PatternMatch::Ambiguous => {
                        candidates.push((&entry.rule, None));
                        break;
                    }
                    PatternMatch::Unique(mut wildcards) => {
                        if spec.is_dynamic() {
                            // Placeholders matched against themselves are not
                            // bound by the producing job.
                            wildcards.retain(|name, value| *value != format!("{{{}}}", name));
                        }
                        candidates.push((&entry.rule, Some(wildcards)));
                        break;
                    }
                }
            }
        }

        let chosen = match candidates.len() {
            0 => return Ok(None),
            1 => candidates.remove(0),
            _ => self.disambiguate(path, candidates)?,
        };
        match chosen {
            (rule, Some(wildcards)) => {
                debug!("'{}' is produced by rule '{}' with {:?}", path, rule.name, wildcards);
                Ok(Some((Arc::clone(rule), wildcards)))
            }
            (rule, None) => Err(WorkflowError::RuleMatch {
                path: path.to_string(),
                reason: MatchFailure::AmbiguousBinding(rule.name.clone()),
            }),
        }
    }

    /// Picks the candidate ranked strictly above all others.
    fn disambiguate<'a>(
        &self,
        path: &str,
        mut candidates: Vec<(&'a Arc<Rule>, Option<Wildcards>)>,
    ) -> Result<(&'a Arc<Rule>, Option<Wildcards>)> {
        let ranks: Vec<Option<usize>> = candidates.iter().map(|(r, _)| self.rank(&r.name)).collect();

        let winner = ranks.iter().enumerate().find(|(i, rank)| match rank {
            Some(rank) => ranks
                .iter()
                .enumerate()
                .all(|(j, other)| j == *i || matches!(other, Some(o) if o > rank)),
            None => false,
        });

        match winner {
            Some((index, _)) => {
                let chosen = candidates.swap_remove(index);
                debug!("ruleorder selects '{}' for '{}'", chosen.0.name, path);
                Ok(chosen)
            }
            None => {
                let names: BTreeSet<String> = candidates.iter().map(|(r, _)| r.name.clone()).collect();
                Err(WorkflowError::RuleMatch {
                    path: path.to_string(),
                    reason: MatchFailure::AmbiguousRules(names.into_iter().collect()),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn produce(registry: &RuleRegistry, path: &str) -> Result<Option<(Arc<Rule>, Wildcards)>> {
        registry.find_producer(path, |_| true)
    }

    #[test]
    fn test_single_producer() {
        let registry = RuleRegistry::from_rules(vec![Rule::new("a")
            .with_input("data/{sample}.csv")
            .with_output("out/{sample}.txt")])
        .unwrap();

        let (rule, wc) = produce(&registry, "out/x.txt").unwrap().unwrap();
        assert_eq!(rule.name, "a");
        assert_eq!(wc["sample"], "x");
        assert!(produce(&registry, "other/x.txt").unwrap().is_none());
    }

    #[test]
    fn test_ambiguous_rules_without_ruleorder() {
        let registry = RuleRegistry::from_rules(vec![
            Rule::new("a").with_output("out/{x}.txt"),
            Rule::new("b").with_output("out/{x}.txt"),
        ])
        .unwrap();

        let err = produce(&registry, "out/1.txt").unwrap_err();
        match err {
            WorkflowError::RuleMatch {
                reason: MatchFailure::AmbiguousRules(names),
                ..
            } => assert_eq!(names, vec!["a", "b"]),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_ruleorder_breaks_tie() {
        let mut registry = RuleRegistry::from_rules(vec![
            Rule::new("a").with_output("out/{x}.txt"),
            Rule::new("b").with_output("out/{x}.txt"),
        ])
        .unwrap();
        registry
            .set_ruleorder(vec!["b".to_string(), "a".to_string()])
            .unwrap();

        let (rule, _) = produce(&registry, "out/1.txt").unwrap().unwrap();
        assert_eq!(rule.name, "b");
    }

    #[test]
    fn test_partial_ruleorder_is_still_ambiguous() {
        let mut registry = RuleRegistry::from_rules(vec![
            Rule::new("a").with_output("out/{x}.txt"),
            Rule::new("b").with_output("out/{x}.txt"),
            Rule::new("c").with_output("out/{x}.txt"),
        ])
        .unwrap();
        registry.set_ruleorder(vec!["a".to_string(), "b".to_string()]).unwrap();

        // "c" is unranked, so it cannot be ordered against "a".
        assert!(produce(&registry, "out/1.txt").is_err());
    }

    #[test]
    fn test_filter_excludes_rules() {
        let registry = RuleRegistry::from_rules(vec![
            Rule::new("a").with_output("out/{x}.txt"),
            Rule::new("b").with_output("out/{x}.txt"),
        ])
        .unwrap();

        let (rule, _) = registry
            .find_producer("out/1.txt", |r| r.name != "a")
            .unwrap()
            .unwrap();
        assert_eq!(rule.name, "b");
    }

    #[test]
    fn test_ambiguous_binding_within_rule() {
        let registry =
            RuleRegistry::from_rules(vec![Rule::new("a").with_output("{x}_{y}.txt")]).unwrap();
        let err = produce(&registry, "1_2_3.txt").unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::RuleMatch {
                reason: MatchFailure::AmbiguousBinding(_),
                ..
            }
        ));
    }

    #[test]
    fn test_ruleorder_prefers_specific_rule_over_ambiguous_generic() {
        let mut registry = RuleRegistry::from_rules(vec![
            Rule::new("specific").with_output("x_y_z.txt"),
            Rule::new("generic").with_output("{a}_{b}.txt"),
        ])
        .unwrap();
        registry
            .set_ruleorder(vec!["specific".to_string(), "generic".to_string()])
            .unwrap();

        let (rule, wc) = produce(&registry, "x_y_z.txt").unwrap().unwrap();
        assert_eq!(rule.name, "specific");
        assert!(wc.is_empty());
    }

    #[test]
    fn test_ambiguous_rule_winning_ruleorder_is_error() {
        let mut registry = RuleRegistry::from_rules(vec![
            Rule::new("specific").with_output("x_y_z.txt"),
            Rule::new("generic").with_output("{a}_{b}.txt"),
        ])
        .unwrap();
        registry
            .set_ruleorder(vec!["generic".to_string(), "specific".to_string()])
            .unwrap();

        let err = produce(&registry, "x_y_z.txt").unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::RuleMatch {
                reason: MatchFailure::AmbiguousBinding(name),
                ..
            } if name == "generic"
        ));
    }

    #[test]
    fn test_dynamic_output_matches_partial_pattern() {
        let registry = RuleRegistry::from_rules(vec![Rule::new("split")
            .with_input("raw/{sample}.txt")
            .with_dynamic_output("clusters/{sample}/{i}.txt")])
        .unwrap();

        let (rule, wc) = produce(&registry, "clusters/s1/{i}.txt").unwrap().unwrap();
        assert_eq!(rule.name, "split");
        assert_eq!(wc.len(), 1);
        assert_eq!(wc["sample"], "s1");
    }

    #[test]
    fn test_duplicate_rule_rejected() {
        let result = RuleRegistry::from_rules(vec![Rule::new("a"), Rule::new("a")]);
        assert!(matches!(result, Err(WorkflowError::Validation(_))));
    }

    #[test]
    fn test_localrules() {
        let mut registry =
            RuleRegistry::from_rules(vec![Rule::new("all"), Rule::new("work")]).unwrap();
        registry.set_localrules(&["all".to_string()]).unwrap();
        assert!(registry.rule("all").unwrap().local);
        assert!(!registry.rule("work").unwrap().local);
        assert!(registry.set_localrules(&["nope".to_string()]).is_err());
    }

    #[test]
    fn test_first_rule_and_order() {
        let registry =
            RuleRegistry::from_rules(vec![Rule::new("all"), Rule::new("work")]).unwrap();
        assert_eq!(registry.first_rule().unwrap().name, "all");
        assert_eq!(registry.declaration_index("work"), Some(1));
        assert_eq!(registry.len(), 2);
    }
}
