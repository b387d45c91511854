//! Wildcard Patterns
//!
//! File patterns interleave literal text with named placeholders:
//! - `{sample}` matches any non-empty string
//! - `{sample,[a-z]+}` restricts the placeholder with a regular expression
//!
//! A pattern is compiled once into an anchored regex. Matching a concrete path
//! yields the wildcard binding; rendering substitutes a binding back in.

use std::collections::BTreeMap;
use std::path::Path;

use log::debug;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use walkdir::WalkDir;

use crate::errors::{Result, WorkflowError};

/// Wildcard name to bound value. Ordered so that job signatures are stable.
pub type Wildcards = BTreeMap<String, String>;

/// Placeholder syntax: `{name}` or `{name,constraint}`. The constraint may
/// itself contain counted repetitions such as `\d{3}`.
static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\s*(?P<name>\w+?)(\s*,\s*(?P<constraint>([^{}]+|\{\d+(,\d+)?\})*))?\s*\}")
        .expect("placeholder regex is valid")
});

const DEFAULT_CONSTRAINT: &str = ".+";
const LAZY_CONSTRAINT: &str = ".+?";

/// Result of matching a path against a single pattern.
#[derive(Debug, Clone, PartialEq)]
pub enum PatternMatch {
    NoMatch,
    Unique(Wildcards),
    /// The path matches, but the placeholders can split it in several ways.
    Ambiguous,
}

/// A compiled wildcard pattern.
#[derive(Debug, Clone)]
pub struct WildcardPattern {
    source: String,
    names: Vec<String>,
    greedy: Regex,
    /// Present only when at least two unconstrained placeholders could
    /// compete for the same characters.
    lazy: Option<Regex>,
    /// Capture groups of repeated placeholders, paired with the wildcard name.
    repeats: Vec<(String, String)>,
}

impl WildcardPattern {
    /// Compiles a pattern.
    ///
    /// # Example
    ///
    /// ```
    /// use ruleforge::workflow::wildcards::{PatternMatch, WildcardPattern};
    ///
    /// let pattern = WildcardPattern::parse("out/{sample}.txt").unwrap();
    /// match pattern.matches("out/x.txt") {
    ///     PatternMatch::Unique(wc) => assert_eq!(wc["sample"], "x"),
    ///     other => panic!("unexpected {:?}", other),
    /// }
    /// ```
    pub fn parse(pattern: &str) -> Result<Self> {
        let mut names: Vec<String> = Vec::new();
        let mut repeats = Vec::new();
        let mut greedy = String::from("^");
        let mut lazy = String::from("^");
        let mut unconstrained = 0usize;
        let mut last = 0;

        for caps in PLACEHOLDER.captures_iter(pattern) {
            let Some(whole) = caps.get(0) else {
                continue;
            };
            let literal = regex::escape(&pattern[last..whole.start()]);
            greedy.push_str(&literal);
            lazy.push_str(&literal);
            last = whole.end();

            let name = caps["name"].to_string();
            let constraint = caps.name("constraint").map(|c| c.as_str().trim());
            if constraint.is_none() {
                unconstrained += 1;
            }
            let (greedy_body, lazy_body) = match constraint {
                Some(c) => (c, c),
                None => (DEFAULT_CONSTRAINT, LAZY_CONSTRAINT),
            };

            let group = if names.contains(&name) {
                let group = format!("rep__{}", repeats.len());
                repeats.push((group.clone(), name.clone()));
                group
            } else {
                names.push(name.clone());
                name
            };
            greedy.push_str(&format!("(?P<{}>{})", group, greedy_body));
            lazy.push_str(&format!("(?P<{}>{})", group, lazy_body));
        }

        let tail = regex::escape(&pattern[last..]);
        greedy.push_str(&tail);
        greedy.push('$');
        lazy.push_str(&tail);
        lazy.push('$');

        let compile = |re: &str| {
            Regex::new(re).map_err(|e| WorkflowError::InvalidPattern {
                pattern: pattern.to_string(),
                message: e.to_string(),
            })
        };

        let greedy = compile(&greedy)?;
        let lazy = if unconstrained > 0 && names.len() + repeats.len() > 1 {
            Some(compile(&lazy)?)
        } else {
            None
        };

        Ok(Self {
            source: pattern.to_string(),
            names,
            greedy,
            lazy,
            repeats,
        })
    }

    /// The pattern text as declared.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Unique wildcard names in order of first appearance.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn has_wildcards(&self) -> bool {
        !self.names.is_empty()
    }

    /// Matches a concrete path against the whole pattern.
    pub fn matches(&self, path: &str) -> PatternMatch {
        let Some(greedy) = self.greedy.captures(path).and_then(|c| self.binding(&c)) else {
            return PatternMatch::NoMatch;
        };

        if let Some(lazy_re) = &self.lazy {
            let lazy = lazy_re.captures(path).and_then(|c| self.binding(&c));
            if lazy.as_ref() != Some(&greedy) {
                debug!("Pattern '{}' splits '{}' in more than one way", self.source, path);
                return PatternMatch::Ambiguous;
            }
        }

        PatternMatch::Unique(greedy)
    }

    /// Extracts the binding, rejecting matches where a repeated placeholder
    /// captured a different value than its first occurrence.
    fn binding(&self, caps: &Captures<'_>) -> Option<Wildcards> {
        let mut wildcards = Wildcards::new();
        for name in &self.names {
            wildcards.insert(name.clone(), caps.name(name)?.as_str().to_string());
        }
        for (group, name) in &self.repeats {
            if caps.name(group)?.as_str() != wildcards[name] {
                return None;
            }
        }
        Some(wildcards)
    }

    /// Substitutes every placeholder; fails on a missing wildcard.
    pub fn render(&self, wildcards: &Wildcards) -> Result<String> {
        format_pattern(&self.source, wildcards)
    }

    /// Substitutes bound placeholders and keeps the others verbatim.
    pub fn render_partial(&self, wildcards: &Wildcards) -> String {
        format_partial(&self.source, wildcards)
    }
}

/// Renders a template (input, param, log or shadow path) from a binding.
pub fn format_pattern(template: &str, wildcards: &Wildcards) -> Result<String> {
    let mut missing = None;
    let rendered = PLACEHOLDER.replace_all(template, |caps: &Captures<'_>| {
        match wildcards.get(&caps["name"]) {
            Some(value) => value.clone(),
            None => {
                missing.get_or_insert_with(|| caps["name"].to_string());
                String::new()
            }
        }
    });

    match missing {
        Some(name) => Err(WorkflowError::UnboundWildcard {
            pattern: template.to_string(),
            name,
        }),
        None => Ok(rendered.into_owned()),
    }
}

/// Renders bound placeholders only. Unbound ones keep their declared text,
/// constraint included, so the result is itself a valid pattern.
pub fn format_partial(template: &str, wildcards: &Wildcards) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures<'_>| match wildcards.get(&caps["name"]) {
            Some(value) => value.clone(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Checks if a string contains wildcard syntax.
pub fn has_wildcards(text: &str) -> bool {
    PLACEHOLDER.is_match(text)
}

/// Extracts wildcard names from a pattern, in order, without duplicates.
///
/// # Example
/// ```
/// use ruleforge::workflow::wildcards::extract_wildcard_names;
///
/// let names = extract_wildcard_names("reads/{sample}_{lane,\\d+}.fastq");
/// assert_eq!(names, vec!["sample", "lane"]);
/// ```
pub fn extract_wildcard_names(pattern: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for caps in PLACEHOLDER.captures_iter(pattern) {
        let name = caps["name"].to_string();
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

/// Enumerates the bindings of every file under `root` whose relative path
/// matches `pattern`. The walk starts at the deepest literal directory of the
/// pattern. Results are sorted by path.
pub fn glob_wildcards(pattern: &WildcardPattern, root: &Path) -> Vec<Wildcards> {
    let source = pattern.as_str();
    let literal = match PLACEHOLDER.find(source) {
        Some(m) => &source[..m.start()],
        None => source,
    };
    let start_dir = match literal.rfind('/') {
        Some(idx) => root.join(&literal[..idx]),
        None => root.to_path_buf(),
    };
    if !start_dir.exists() {
        return Vec::new();
    }

    let mut found: Vec<(String, Wildcards)> = WalkDir::new(&start_dir)
        .follow_links(true)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            let relative = entry.path().strip_prefix(root).ok()?;
            let relative = relative.to_string_lossy().replace('\\', "/");
            match pattern.matches(&relative) {
                PatternMatch::Unique(wc) => Some((relative, wc)),
                _ => None,
            }
        })
        .collect();

    found.sort_by(|a, b| a.0.cmp(&b.0));
    found.into_iter().map(|(_, wc)| wc).collect()
}
