//! Job Graph Construction
//!
//! Resolves requested targets into a [`Dag`]:
//! 1. A required file that is up to date becomes a leaf and needs no job
//! 2. Otherwise its producing rule is instantiated and the job's inputs are
//!    resolved recursively
//! 3. A repeated (rule, wildcards) pair on the resolution stack is a cycle
//! 4. Inputs depending on a checkpoint or dynamic output stay deferred until
//!    that job finishes, then [`DagBuilder::expand_deferred`] splices in the
//!    jobs they need
//!
//! Boundary settings (`until`, `treat_as_source`, `omit_from`) restrict the
//! resulting graph. Resource requests larger than the pool are capped.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use log::{debug, info, warn};

use super::graph::{Dag, Signature};
use super::job::{DeferredInput, Job, JobId, RunReason};
use crate::errors::{MatchFailure, Result, WorkflowError};
use crate::storage::Storage;
use crate::workflow::metadata::Metadata;
use crate::workflow::model::{Action, InputSpec, Rule, CORES};
use crate::workflow::registry::RuleRegistry;
use crate::workflow::wildcards::{
    extract_wildcard_names, format_partial, format_pattern, glob_wildcards, WildcardPattern,
    Wildcards,
};

/// Force flags and graph boundaries.
#[derive(Debug, Clone, Default)]
pub struct BuildSettings {
    /// Rerun the jobs of the requested targets.
    pub force: bool,
    /// Rerun every job reachable from the targets.
    pub forceall: bool,
    /// Rerun every job of these rules.
    pub forcerun: BTreeSet<String>,
    /// Keep only jobs of these rules and their ancestors.
    pub until: BTreeSet<String>,
    /// Never use these rules as producers.
    pub treat_as_source: BTreeSet<String>,
    /// Drop jobs of these rules and everything downstream of them.
    pub omit_from: BTreeSet<String>,
}

/// How a required file is satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileStatus {
    /// Present and up to date; no job needed.
    Existing,
    Produced(JobId),
    Missing,
}

/// Builds and grows the job graph for one run.
#[derive(Debug)]
pub struct DagBuilder {
    registry: RuleRegistry,
    storage: Arc<Storage>,
    settings: BuildSettings,
    metadata: Metadata,
    limits: BTreeMap<String, u64>,
    job_slots: bool,
    fresh: HashSet<Signature>,
    stack: Vec<Signature>,
}

fn describe(signature: &Signature) -> String {
    let (rule, wildcards) = signature;
    if wildcards.is_empty() {
        return rule.clone();
    }
    let bindings: Vec<String> = wildcards.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    format!("{}[{}]", rule, bindings.join(","))
}

impl DagBuilder {
    pub fn new(registry: RuleRegistry, storage: Arc<Storage>) -> Self {
        Self {
            registry,
            storage,
            settings: BuildSettings::default(),
            metadata: Metadata::default(),
            limits: BTreeMap::new(),
            job_slots: false,
            fresh: HashSet::new(),
            stack: Vec::new(),
        }
    }

    pub fn with_settings(mut self, settings: BuildSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Metadata consulted for rule changes and incomplete outputs.
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Pool maxima that requested resources are capped to.
    pub fn with_limits(mut self, limits: BTreeMap<String, u64>) -> Self {
        self.limits = limits;
        self
    }

    /// Remote jobs run on cluster nodes, so their cores are not capped to
    /// the local pool.
    pub fn with_job_slots(mut self, enabled: bool) -> Self {
        self.job_slots = enabled;
        self
    }

    pub fn registry(&self) -> &RuleRegistry {
        &self.registry
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    fn validate_boundaries(&self) -> Result<()> {
        let sets = [
            ("forcerun", &self.settings.forcerun),
            ("until", &self.settings.until),
            ("treat-as-source", &self.settings.treat_as_source),
            ("omit-from", &self.settings.omit_from),
        ];
        for (flag, names) in sets {
            if let Some(unknown) = names.iter().find(|n| self.registry.rule(n).is_none()) {
                return Err(WorkflowError::Config(format!(
                    "--{} references unknown rule '{}'",
                    flag, unknown
                )));
            }
        }
        Ok(())
    }

    /// Resolves targets into the job graph. Each target is a file path or the
    /// name of a rule whose outputs have no wildcards. Without targets the
    /// first declared rule is built.
    pub fn build(&mut self, targets: &[String]) -> Result<Dag> {
        self.validate_boundaries()?;

        let targets: Vec<String> = if targets.is_empty() {
            let first = self
                .registry
                .first_rule()
                .ok_or_else(|| WorkflowError::Config("No rules declared".to_string()))?;
            vec![first.name.clone()]
        } else {
            targets.to_vec()
        };

        let mut dag = Dag::new();
        for target in &targets {
            self.stack.clear();
            if let Some(rule) = self.registry.rule(target).cloned() {
                if !rule.output_wildcards().is_empty() {
                    return Err(WorkflowError::Config(format!(
                        "Target rule '{}' has wildcards in its outputs; request a file instead",
                        rule.name
                    )));
                }
                match self.resolve_job(&mut dag, rule, Wildcards::new(), true)? {
                    Some(id) => dag.mark_target(id),
                    None => info!("Rule '{}' is up to date", target),
                }
                continue;
            }

            match self.resolve_file(&mut dag, Path::new(target), true)? {
                FileStatus::Produced(id) => dag.mark_target(id),
                FileStatus::Existing => info!("Target '{}' is up to date", target),
                FileStatus::Missing => {
                    return Err(WorkflowError::RuleMatch {
                        path: target.clone(),
                        reason: MatchFailure::NoProducer,
                    })
                }
            }
        }

        self.prune(&mut dag);
        dag.toposort()?;

        info!("Job graph contains {} jobs", dag.len());
        Ok(dag)
    }

    fn resolve_file(&mut self, dag: &mut Dag, path: &Path, is_target: bool) -> Result<FileStatus> {
        if let Some(id) = dag.producer_of(path) {
            return Ok(FileStatus::Produced(id));
        }

        let text = path.to_string_lossy();
        let treat_as_source = &self.settings.treat_as_source;
        let producer = self
            .registry
            .find_producer(&text, |rule| !treat_as_source.contains(&rule.name))?;

        let Some((rule, wildcards)) = producer else {
            return Ok(if self.storage.exists(path)? {
                FileStatus::Existing
            } else {
                FileStatus::Missing
            });
        };

        match self.resolve_job(dag, rule, wildcards, is_target) {
            Ok(Some(id)) => Ok(FileStatus::Produced(id)),
            Ok(None) => Ok(FileStatus::Existing),
            Err(WorkflowError::MissingInput { rule, files }) if self.storage.exists(path)? => {
                debug!(
                    "Using existing '{}' as-is; rule '{}' lacks inputs {:?}",
                    path.display(),
                    rule,
                    files
                );
                Ok(FileStatus::Existing)
            }
            Err(e) => Err(e),
        }
    }

    /// Finds or creates the job for a (rule, wildcards) pair. Returns `None`
    /// if the job is up to date.
    fn resolve_job(
        &mut self,
        dag: &mut Dag,
        rule: Arc<Rule>,
        wildcards: Wildcards,
        is_target: bool,
    ) -> Result<Option<JobId>> {
        if let Some(id) = dag.find(&rule.name, &wildcards) {
            return Ok(Some(id));
        }
        let signature: Signature = (rule.name.clone(), wildcards.clone());
        if self.fresh.contains(&signature) {
            return Ok(None);
        }
        self.check_recursion(&signature)?;

        self.stack.push(signature.clone());
        let result = self.instantiate(dag, &rule, wildcards, is_target);
        self.stack.pop();

        match result? {
            Some(job) => Ok(Some(dag.add_job(job))),
            None => {
                debug!("{} is up to date", describe(&signature));
                self.fresh.insert(signature);
                Ok(None)
            }
        }
    }

    /// Rejects a signature already on the stack, and a rule that reappears
    /// with a wildcard value that grew around its earlier value.
    fn check_recursion(&self, signature: &Signature) -> Result<()> {
        let (rule, wildcards) = signature;
        for (index, (other_rule, other)) in self.stack.iter().enumerate() {
            if other_rule != rule {
                continue;
            }
            let periodic = wildcards.iter().any(|(name, value)| {
                other
                    .get(name)
                    .is_some_and(|prev| prev != value && value.contains(prev.as_str()))
            });
            if other == wildcards || periodic {
                let mut chain: Vec<String> = self.stack[index..].iter().map(describe).collect();
                chain.push(describe(signature));
                return Err(WorkflowError::Recursion { chain });
            }
        }
        Ok(())
    }

    fn instantiate(
        &mut self,
        dag: &mut Dag,
        rule: &Arc<Rule>,
        wildcards: Wildcards,
        is_target: bool,
    ) -> Result<Option<Job>> {
        let output = rule
            .output
            .iter()
            .filter(|o| !o.is_dynamic())
            .map(|o| format_pattern(o.pattern(), &wildcards).map(PathBuf::from))
            .collect::<Result<Vec<_>>>()?;
        let dynamic_output: Vec<String> = rule
            .output
            .iter()
            .filter(|o| o.is_dynamic())
            .map(|o| format_partial(o.pattern(), &wildcards))
            .collect();
        let log = rule
            .log
            .iter()
            .map(|l| format_pattern(l, &wildcards).map(PathBuf::from))
            .collect::<Result<Vec<_>>>()?;
        let params = rule
            .params
            .iter()
            .map(|(k, v)| format_pattern(v, &wildcards).map(|v| (k.clone(), v)))
            .collect::<Result<BTreeMap<_, _>>>()?;

        let mut input = Vec::new();
        let mut deferred = Vec::new();
        let mut dependencies = BTreeSet::new();

        for spec in &rule.input {
            let unbound = extract_wildcard_names(spec.pattern())
                .iter()
                .any(|name| !wildcards.contains_key(name));
            if !unbound && matches!(spec, InputSpec::Path(_)) {
                input.push(PathBuf::from(format_pattern(spec.pattern(), &wildcards)?));
                continue;
            }

            let pattern = format_partial(spec.pattern(), &wildcards);
            let source = format_partial(spec.source(), &wildcards);
            match self.deferring_producer(dag, &source)? {
                Some(producer) => {
                    debug!("Input '{}' of rule '{}' waits for job {}", pattern, rule.name, producer);
                    dependencies.insert(producer);
                    deferred.push(DeferredInput {
                        pattern,
                        source,
                        producer,
                    });
                }
                None => input.extend(self.expand_from_disk(&pattern, &source)?),
            }
        }

        let mut missing = Vec::new();
        for path in &input {
            match self.resolve_file(dag, path, false)? {
                FileStatus::Produced(id) => {
                    dependencies.insert(id);
                }
                FileStatus::Existing => {}
                FileStatus::Missing => missing.push(path.clone()),
            }
        }
        if !missing.is_empty() {
            return Err(WorkflowError::MissingInput {
                rule: rule.name.clone(),
                files: missing,
            });
        }

        let forced = self.settings.forceall
            || self.settings.forcerun.contains(&rule.name)
            || (self.settings.force && is_target);
        let reason = if forced {
            Some(RunReason::Forced)
        } else {
            self.run_reason(rule, &input, &output, &dynamic_output, &dependencies)?
        };
        let Some(reason) = reason else {
            return Ok(None);
        };

        Ok(Some(Job {
            id: JobId(0),
            rule: Arc::clone(rule),
            wildcards,
            input,
            output,
            dynamic_output,
            log,
            params,
            resources: self.cap_resources(rule),
            dependencies,
            deferred,
            reason,
        }))
    }

    /// Decides whether a job has to run, given its resolved files.
    fn run_reason(
        &self,
        rule: &Rule,
        input: &[PathBuf],
        output: &[PathBuf],
        dynamic_output: &[String],
        dependencies: &BTreeSet<JobId>,
    ) -> Result<Option<RunReason>> {
        if output.is_empty() && dynamic_output.is_empty() {
            if !dependencies.is_empty() {
                return Ok(Some(RunReason::UpstreamRerun));
            }
            if rule.action != Action::None {
                return Ok(Some(RunReason::NoOutput));
            }
            return Ok(None);
        }

        let mut missing = Vec::new();
        let mut existing = Vec::new();
        for path in output {
            if self.storage.exists(path)? {
                existing.push(path.clone());
            } else {
                missing.push(path.clone());
            }
        }
        for pattern in dynamic_output {
            let found = self.glob_paths(pattern)?;
            if found.is_empty() {
                missing.push(PathBuf::from(pattern));
            }
            existing.extend(found);
        }
        if !missing.is_empty() {
            return Ok(Some(RunReason::MissingOutput(missing)));
        }

        let incomplete: Vec<PathBuf> = existing
            .iter()
            .filter(|p| self.metadata.is_incomplete(&p.to_string_lossy()))
            .cloned()
            .collect();
        if !incomplete.is_empty() {
            return Ok(Some(RunReason::Incomplete(incomplete)));
        }

        if self.metadata.rule_changed(rule) {
            return Ok(Some(RunReason::RuleChanged));
        }

        if !dependencies.is_empty() {
            return Ok(Some(RunReason::UpstreamRerun));
        }

        let mut oldest: Option<SystemTime> = None;
        for path in &existing {
            if let Some(mtime) = self.storage.mtime(path)? {
                oldest = Some(oldest.map_or(mtime, |o| o.min(mtime)));
            }
        }
        let Some(oldest) = oldest else {
            return Ok(None);
        };

        let mut updated = Vec::new();
        for path in input {
            if self.storage.mtime(path)?.is_some_and(|t| t > oldest) {
                updated.push(path.clone());
            }
        }
        if !updated.is_empty() {
            return Ok(Some(RunReason::UpdatedInput(updated)));
        }

        Ok(None)
    }

    fn cap_resources(&self, rule: &Rule) -> BTreeMap<String, u64> {
        let mut resources = rule.requested_resources();
        let remote = self.job_slots && !rule.local;
        for (name, amount) in resources.iter_mut() {
            if remote && name == CORES {
                continue;
            }
            if let Some(max) = self.limits.get(name) {
                if *amount > *max {
                    let overflow = WorkflowError::ResourceOverflow {
                        rule: rule.name.clone(),
                        resource: name.clone(),
                        requested: *amount,
                        available: *max,
                    };
                    warn!("{}", overflow);
                    *amount = *max;
                }
            }
        }
        resources
    }

    /// Job of a checkpoint or dynamic-output rule that the files matching
    /// `source` come from, if that job still has to run.
    fn deferring_producer(&mut self, dag: &mut Dag, source: &str) -> Result<Option<JobId>> {
        let bare: Wildcards = extract_wildcard_names(source)
            .into_iter()
            .map(|name| {
                let placeholder = format!("{{{}}}", name);
                (name, placeholder)
            })
            .collect();
        let probe = format_partial(source, &bare);

        // A checkpoint may declare the directory holding the files.
        let literal = probe.split('{').next().unwrap_or_default();
        let directories: Vec<String> = match literal.rfind('/') {
            Some(idx) => Path::new(&literal[..idx])
                .ancestors()
                .filter(|p| !p.as_os_str().is_empty())
                .map(|p| p.to_string_lossy().into_owned())
                .collect(),
            None => Vec::new(),
        };

        let treat_as_source = &self.settings.treat_as_source;
        let mut found = None;
        for candidate in std::iter::once(probe.clone()).chain(directories) {
            let producer = self.registry.find_producer(&candidate, |rule| {
                rule.defers_consumers() && !treat_as_source.contains(&rule.name)
            })?;
            if let Some((rule, wildcards)) = producer {
                if wildcards.values().all(|v| !v.contains('{')) {
                    found = Some((rule, wildcards));
                    break;
                }
            }
        }

        match found {
            Some((rule, wildcards)) => self.resolve_job(dag, rule, wildcards, false),
            None => Ok(None),
        }
    }

    /// Binds the remaining wildcards of `pattern` from the files on disk
    /// matching `source`.
    fn expand_from_disk(&self, pattern: &str, source: &str) -> Result<Vec<PathBuf>> {
        let compiled = WildcardPattern::parse(source)?;
        if !compiled.has_wildcards() {
            return Ok(vec![PathBuf::from(format_pattern(pattern, &Wildcards::new())?)]);
        }

        let mut paths: Vec<PathBuf> = Vec::new();
        for binding in glob_wildcards(&compiled, self.storage.workdir()) {
            let path = PathBuf::from(format_pattern(pattern, &binding)?);
            if !paths.contains(&path) {
                paths.push(path);
            }
        }
        debug!("Expanded '{}' from '{}' into {} files", pattern, source, paths.len());
        Ok(paths)
    }

    fn glob_paths(&self, pattern: &str) -> Result<Vec<PathBuf>> {
        let compiled = WildcardPattern::parse(pattern)?;
        glob_wildcards(&compiled, self.storage.workdir())
            .iter()
            .map(|binding| compiled.render(binding).map(PathBuf::from))
            .collect()
    }

    /// Re-resolves the inputs that waited for `finished` and splices the
    /// jobs they need into the graph. Returns the ids of the new jobs.
    pub fn expand_deferred(&mut self, dag: &mut Dag, finished: JobId) -> Result<Vec<JobId>> {
        let Some(producer) = dag.job(finished) else {
            return Ok(Vec::new());
        };
        let mut produced = Vec::new();
        for pattern in &producer.dynamic_output {
            produced.extend(self.glob_paths(pattern)?);
        }
        info!(
            "Job {} produced {} dynamic files; updating job graph",
            producer.display_name(),
            produced.len()
        );
        for path in produced {
            dag.register_output(finished, path);
        }

        let first_new = dag.next_id();
        let consumers: Vec<JobId> = dag
            .jobs()
            .filter(|j| j.deferred.iter().any(|d| d.producer == finished))
            .map(|j| j.id)
            .collect();

        for consumer in consumers {
            let Some(job) = dag.job_mut(consumer) else {
                continue;
            };
            let (ready, pending): (Vec<DeferredInput>, Vec<DeferredInput>) =
                job.deferred.drain(..).partition(|d| d.producer == finished);
            job.deferred = pending;
            let rule = job.rule.name.clone();

            let mut new_inputs = Vec::new();
            for deferred in &ready {
                new_inputs.extend(self.expand_from_disk(&deferred.pattern, &deferred.source)?);
            }

            self.stack.clear();
            let mut missing = Vec::new();
            for path in &new_inputs {
                match self.resolve_file(dag, path, false)? {
                    FileStatus::Produced(id) if id == consumer => {
                        return Err(WorkflowError::Recursion {
                            chain: vec![rule.clone(), rule],
                        })
                    }
                    FileStatus::Produced(id) => dag.add_dependency(consumer, id),
                    FileStatus::Existing => {}
                    FileStatus::Missing => missing.push(path.clone()),
                }
            }
            if !missing.is_empty() {
                return Err(WorkflowError::MissingInput {
                    rule,
                    files: missing,
                });
            }

            if let Some(job) = dag.job_mut(consumer) {
                debug!("Job {} gains inputs {:?}", job.display_name(), new_inputs);
                job.input.extend(new_inputs);
            }
        }

        self.prune(dag);
        let added: Vec<JobId> = dag.ids().into_iter().filter(|id| *id >= first_new).collect();
        if !added.is_empty() {
            info!("Deferred expansion added {} jobs", added.len());
        }
        Ok(added)
    }

    fn prune(&self, dag: &mut Dag) {
        if !self.settings.until.is_empty() {
            let roots: Vec<JobId> = dag
                .jobs()
                .filter(|j| self.settings.until.contains(&j.rule.name))
                .map(|j| j.id)
                .collect();
            let keep = dag.with_ancestors(roots);
            let drop: BTreeSet<JobId> = dag.ids().into_iter().filter(|id| !keep.contains(id)).collect();
            if !drop.is_empty() {
                info!("Dropping {} jobs beyond --until", drop.len());
                dag.remove(&drop);
            }
        }
        self.apply_omit(dag);
    }

    fn apply_omit(&self, dag: &mut Dag) {
        if self.settings.omit_from.is_empty() {
            return;
        }
        let mut drop = BTreeSet::new();
        for job in dag.jobs().filter(|j| self.settings.omit_from.contains(&j.rule.name)) {
            drop.insert(job.id);
            drop.extend(dag.transitive_dependents(job.id));
        }
        if !drop.is_empty() {
            info!("Dropping {} jobs from --omit-from", drop.len());
            dag.remove(&drop);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::MetadataStore;
    use std::fs::{self, File};
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    fn touch(dir: &Path, relative: &str) {
        let path = dir.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, relative).unwrap();
    }

    fn set_age(dir: &Path, relative: &str, secs_ago: u64) {
        let file = File::options().write(true).open(dir.join(relative)).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(secs_ago))
            .unwrap();
    }

    fn builder(dir: &TempDir, rules: Vec<Rule>) -> DagBuilder {
        let registry = RuleRegistry::from_rules(rules).unwrap();
        DagBuilder::new(registry, Arc::new(Storage::new(dir.path())))
    }

    fn rule_names(dag: &Dag) -> Vec<String> {
        let mut names: Vec<String> = dag.jobs().map(|j| j.rule.name.clone()).collect();
        names.sort();
        names
    }

    fn chain_rules() -> Vec<Rule> {
        vec![
            Rule::new("C").with_input("b.txt").with_output("c.txt").with_shell("cp {input} {output}"),
            Rule::new("B").with_input("a.txt").with_output("b.txt").with_shell("cp {input} {output}"),
            Rule::new("A").with_input("src.txt").with_output("a.txt").with_shell("cp {input} {output}"),
        ]
    }

    #[test]
    fn test_single_job_with_wildcard() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "data/x.csv");
        let mut builder = builder(
            &dir,
            vec![Rule::new("a")
                .with_input("data/{sample}.csv")
                .with_output("out/{sample}.txt")
                .with_param("label", "{sample}-run")],
        );

        let dag = builder.build(&["out/x.txt".to_string()]).unwrap();
        assert_eq!(dag.len(), 1);
        let job = dag.jobs().next().unwrap();
        assert_eq!(job.wildcards["sample"], "x");
        assert_eq!(job.input, vec![PathBuf::from("data/x.csv")]);
        assert_eq!(job.output, vec![PathBuf::from("out/x.txt")]);
        assert_eq!(job.params["label"], "x-run");
        assert!(matches!(job.reason, RunReason::MissingOutput(_)));
        assert!(dag.is_target(job.id));
    }

    #[test]
    fn test_ambiguous_rules_fail() {
        let dir = tempdir().unwrap();
        let mut builder = builder(
            &dir,
            vec![
                Rule::new("one").with_output("out/{x}.txt"),
                Rule::new("two").with_output("out/{x}.txt"),
            ],
        );

        let err = builder.build(&["out/1.txt".to_string()]).unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::RuleMatch {
                reason: MatchFailure::AmbiguousRules(_),
                ..
            }
        ));
        assert!(err.is_construction_error());
    }

    #[test]
    fn test_fresh_targets_yield_no_jobs() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "src.txt");
        touch(dir.path(), "a.txt");
        touch(dir.path(), "b.txt");
        touch(dir.path(), "c.txt");
        set_age(dir.path(), "src.txt", 400);
        set_age(dir.path(), "a.txt", 300);
        set_age(dir.path(), "b.txt", 200);
        set_age(dir.path(), "c.txt", 100);

        let mut builder = builder(&dir, chain_rules());
        let dag = builder.build(&["c.txt".to_string()]).unwrap();
        assert!(dag.is_empty());
    }

    #[test]
    fn test_updated_input_reruns_downstream() {
        let dir = tempdir().unwrap();
        for file in ["src.txt", "a.txt", "b.txt", "c.txt"] {
            touch(dir.path(), file);
        }
        set_age(dir.path(), "a.txt", 300);
        set_age(dir.path(), "b.txt", 200);
        set_age(dir.path(), "c.txt", 100);
        set_age(dir.path(), "src.txt", 10);

        let mut builder = builder(&dir, chain_rules());
        let dag = builder.build(&["c.txt".to_string()]).unwrap();
        assert_eq!(rule_names(&dag), vec!["A", "B", "C"]);

        let a = dag.jobs().find(|j| j.rule.name == "A").unwrap();
        assert_eq!(a.reason, RunReason::UpdatedInput(vec![PathBuf::from("src.txt")]));
        let c = dag.jobs().find(|j| j.rule.name == "C").unwrap();
        assert_eq!(c.reason, RunReason::UpstreamRerun);
    }

    #[test]
    fn test_toposort_orders_chain() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "src.txt");
        let mut builder = builder(&dir, chain_rules());
        let dag = builder.build(&["c.txt".to_string()]).unwrap();

        let order: Vec<String> = dag
            .toposort()
            .unwrap()
            .into_iter()
            .map(|id| dag.job(id).unwrap().rule.name.clone())
            .collect();
        assert_eq!(order, vec!["A", "B", "C"]);
    }

    #[test]
    fn test_cycle_is_recursion_error() {
        let dir = tempdir().unwrap();
        let mut builder = builder(
            &dir,
            vec![
                Rule::new("a").with_input("{x}.b").with_output("{x}.a"),
                Rule::new("b").with_input("{x}.a").with_output("{x}.b"),
            ],
        );

        match builder.build(&["t.a".to_string()]) {
            Err(WorkflowError::Recursion { chain }) => {
                assert_eq!(chain.first().unwrap(), "a[x=t]");
                assert_eq!(chain.last().unwrap(), "a[x=t]");
            }
            other => panic!("expected recursion error, got {:?}", other),
        }
    }

    #[test]
    fn test_growing_wildcard_is_recursion_error() {
        let dir = tempdir().unwrap();
        let mut builder = builder(
            &dir,
            vec![Rule::new("grow").with_input("{x}.txt.txt").with_output("{x}.txt")],
        );
        assert!(matches!(
            builder.build(&["a.txt".to_string()]),
            Err(WorkflowError::Recursion { .. })
        ));
    }

    #[test]
    fn test_missing_input() {
        let dir = tempdir().unwrap();
        let mut builder = builder(
            &dir,
            vec![Rule::new("a").with_input("data/{s}.csv").with_output("out/{s}.txt")],
        );

        match builder.build(&["out/x.txt".to_string()]) {
            Err(WorkflowError::MissingInput { rule, files }) => {
                assert_eq!(rule, "a");
                assert_eq!(files, vec![PathBuf::from("data/x.csv")]);
            }
            other => panic!("expected missing input, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_target_has_no_producer() {
        let dir = tempdir().unwrap();
        let mut builder = builder(&dir, vec![Rule::new("a").with_output("a.txt")]);
        assert!(matches!(
            builder.build(&["nope.txt".to_string()]),
            Err(WorkflowError::RuleMatch {
                reason: MatchFailure::NoProducer,
                ..
            })
        ));
    }

    #[test]
    fn test_existing_file_with_unsatisfiable_producer_is_used() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "a.txt");
        let mut builder = builder(&dir, chain_rules());
        let dag = builder.build(&["b.txt".to_string()]).unwrap();
        assert_eq!(rule_names(&dag), vec!["B"]);
    }

    #[test]
    fn test_until_keeps_ancestors_only() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "src.txt");
        let settings = BuildSettings {
            until: BTreeSet::from(["B".to_string()]),
            ..Default::default()
        };
        let mut builder = builder(&dir, chain_rules()).with_settings(settings);

        let dag = builder.build(&["c.txt".to_string()]).unwrap();
        assert_eq!(rule_names(&dag), vec!["A", "B"]);
    }

    #[test]
    fn test_omit_from_drops_descendants() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "src.txt");
        let settings = BuildSettings {
            omit_from: BTreeSet::from(["B".to_string()]),
            ..Default::default()
        };
        let mut builder = builder(&dir, chain_rules()).with_settings(settings);

        let dag = builder.build(&["c.txt".to_string()]).unwrap();
        assert_eq!(rule_names(&dag), vec!["A"]);
    }

    #[test]
    fn test_treat_as_source_uses_existing_output() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "a.txt");
        touch(dir.path(), "src.txt");
        set_age(dir.path(), "a.txt", 100);
        let settings = BuildSettings {
            treat_as_source: BTreeSet::from(["A".to_string()]),
            ..Default::default()
        };
        let mut builder = builder(&dir, chain_rules()).with_settings(settings);

        let dag = builder.build(&["c.txt".to_string()]).unwrap();
        assert_eq!(rule_names(&dag), vec!["B", "C"]);
    }

    #[test]
    fn test_unknown_boundary_rule_rejected() {
        let dir = tempdir().unwrap();
        let settings = BuildSettings {
            until: BTreeSet::from(["ghost".to_string()]),
            ..Default::default()
        };
        let mut builder = builder(&dir, chain_rules()).with_settings(settings);
        assert!(matches!(
            builder.build(&["c.txt".to_string()]),
            Err(WorkflowError::Config(_))
        ));
    }

    #[test]
    fn test_forcerun_and_force() {
        let dir = tempdir().unwrap();
        for (file, age) in [("src.txt", 400), ("a.txt", 300), ("b.txt", 200), ("c.txt", 100)] {
            touch(dir.path(), file);
            set_age(dir.path(), file, age);
        }

        let settings = BuildSettings {
            forcerun: BTreeSet::from(["B".to_string()]),
            ..Default::default()
        };
        let mut forced = builder(&dir, chain_rules()).with_settings(settings);
        let dag = forced.build(&["c.txt".to_string()]).unwrap();
        assert_eq!(rule_names(&dag), vec!["B", "C"]);

        let settings = BuildSettings {
            force: true,
            ..Default::default()
        };
        let mut target_only = builder(&dir, chain_rules()).with_settings(settings);
        let dag = target_only.build(&["c.txt".to_string()]).unwrap();
        assert_eq!(rule_names(&dag), vec!["C"]);

        let settings = BuildSettings {
            forceall: true,
            ..Default::default()
        };
        let mut everything = builder(&dir, chain_rules()).with_settings(settings);
        let dag = everything.build(&["c.txt".to_string()]).unwrap();
        assert_eq!(dag.len(), 3);
    }

    #[test]
    fn test_rule_target_and_default_target() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "data/x.csv");
        let rules = vec![
            Rule::new("all").with_input("out/x.txt"),
            Rule::new("a").with_input("data/{s}.csv").with_output("out/{s}.txt"),
        ];

        let mut builder = builder(&dir, rules);
        let dag = builder.build(&[]).unwrap();
        assert_eq!(rule_names(&dag), vec!["a", "all"]);
        let all = dag.jobs().find(|j| j.rule.name == "all").unwrap();
        assert!(dag.is_target(all.id));
        assert_eq!(all.dependencies.len(), 1);
    }

    #[test]
    fn test_rule_target_with_wildcards_rejected() {
        let dir = tempdir().unwrap();
        let mut builder = builder(&dir, vec![Rule::new("a").with_output("out/{s}.txt")]);
        assert!(matches!(
            builder.build(&["a".to_string()]),
            Err(WorkflowError::Config(_))
        ));
    }

    #[test]
    fn test_rule_change_forces_rerun() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "src.txt");
        touch(dir.path(), "a.txt");
        set_age(dir.path(), "src.txt", 100);

        let mut store = MetadataStore::in_memory();
        store.record_rule(&Rule::new("A").with_shell("old command"));

        let mut builder = builder(&dir, chain_rules()).with_metadata(store.data().clone());
        let dag = builder.build(&["a.txt".to_string()]).unwrap();
        assert_eq!(dag.jobs().next().unwrap().reason, RunReason::RuleChanged);
    }

    #[test]
    fn test_incomplete_output_forces_rerun() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "src.txt");
        touch(dir.path(), "a.txt");
        set_age(dir.path(), "src.txt", 100);

        let mut store = MetadataStore::in_memory();
        store.mark_incomplete([Path::new("a.txt")]);

        let mut builder = builder(&dir, chain_rules()).with_metadata(store.data().clone());
        let dag = builder.build(&["a.txt".to_string()]).unwrap();
        assert!(matches!(
            dag.jobs().next().unwrap().reason,
            RunReason::Incomplete(_)
        ));
    }

    #[test]
    fn test_resources_capped_to_pool() {
        let dir = tempdir().unwrap();
        let mut builder = builder(
            &dir,
            vec![Rule::new("big")
                .with_output("big.txt")
                .with_threads(16)
                .with_resource("mem_mb", 1000)],
        )
        .with_limits(BTreeMap::from([(CORES.to_string(), 4)]));

        let dag = builder.build(&["big.txt".to_string()]).unwrap();
        let job = dag.jobs().next().unwrap();
        assert_eq!(job.resources[CORES], 4);
        assert_eq!(job.threads(), 4);
        assert_eq!(job.resources["mem_mb"], 1000);
    }

    #[test]
    fn test_remote_cores_not_capped_with_job_slots() {
        let dir = tempdir().unwrap();
        let mut gather = Rule::new("gather").with_input("big.txt").with_output("all.txt").with_threads(16);
        gather.local = true;
        let mut builder = builder(
            &dir,
            vec![gather, Rule::new("big").with_output("big.txt").with_threads(16)],
        )
        .with_limits(BTreeMap::from([(CORES.to_string(), 2)]))
        .with_job_slots(true);

        let dag = builder.build(&["all.txt".to_string()]).unwrap();
        let threads: BTreeMap<String, u64> = dag
            .jobs()
            .map(|job| (job.rule.name.clone(), job.threads()))
            .collect();
        assert_eq!(threads["big"], 16);
        assert_eq!(threads["gather"], 2);
    }

    fn split_gather() -> Vec<Rule> {
        vec![
            Rule::new("gather")
                .with_input("chunks/{i}.txt")
                .with_output("gathered.txt")
                .with_shell("cat {input} > {output}"),
            Rule::new("split")
                .with_dynamic_output("chunks/{i}.txt")
                .checkpoint()
                .with_shell("split"),
        ]
    }

    #[test]
    fn test_deferred_expansion_after_checkpoint() {
        let dir = tempdir().unwrap();
        let mut builder = builder(&dir, split_gather());

        let mut dag = builder.build(&["gathered.txt".to_string()]).unwrap();
        assert_eq!(dag.len(), 2);
        let split = dag.jobs().find(|j| j.rule.name == "split").unwrap().id;
        let gather = dag.jobs().find(|j| j.rule.name == "gather").unwrap().id;
        {
            let job = dag.job(gather).unwrap();
            assert!(job.input.is_empty());
            assert!(job.has_pending_inputs());
            assert!(job.dependencies.contains(&split));
        }

        touch(dir.path(), "chunks/1.txt");
        touch(dir.path(), "chunks/2.txt");
        let added = builder.expand_deferred(&mut dag, split).unwrap();
        assert!(added.is_empty());

        let job = dag.job(gather).unwrap();
        assert!(!job.has_pending_inputs());
        assert_eq!(
            job.input,
            vec![PathBuf::from("chunks/1.txt"), PathBuf::from("chunks/2.txt")]
        );
        assert_eq!(dag.producer_of(Path::new("chunks/1.txt")), Some(split));
    }

    #[test]
    fn test_deferred_expansion_splices_new_jobs() {
        let dir = tempdir().unwrap();
        let rules = vec![
            Rule::new("aggregate")
                .with_deferred_input("post/{i}.txt", "clusters/{i}.txt")
                .with_output("summary.txt"),
            Rule::new("post")
                .with_input("clusters/{i}.txt")
                .with_output("post/{i}.txt")
                .with_shell("cp {input} {output}"),
            Rule::new("cluster")
                .with_dynamic_output("clusters/{i}.txt")
                .with_shell("make clusters"),
        ];
        let mut builder = builder(&dir, rules);

        let mut dag = builder.build(&["summary.txt".to_string()]).unwrap();
        assert_eq!(dag.len(), 2);
        let cluster = dag.jobs().find(|j| j.rule.name == "cluster").unwrap().id;

        touch(dir.path(), "clusters/a.txt");
        touch(dir.path(), "clusters/b.txt");
        let added = builder.expand_deferred(&mut dag, cluster).unwrap();
        assert_eq!(added.len(), 2);
        for id in &added {
            let job = dag.job(*id).unwrap();
            assert_eq!(job.rule.name, "post");
            assert!(job.dependencies.contains(&cluster));
        }

        let aggregate = dag.jobs().find(|j| j.rule.name == "aggregate").unwrap();
        assert!(added.iter().all(|id| aggregate.dependencies.contains(id)));
        assert!(dag.toposort().is_ok());
    }

    #[test]
    fn test_deferred_expansion_respects_boundaries() {
        let dir = tempdir().unwrap();
        let rules = vec![
            Rule::new("report")
                .with_input("summary.txt")
                .with_output("report.txt")
                .with_shell("cp {input} {output}"),
            Rule::new("aggregate")
                .with_deferred_input("post/{i}.txt", "clusters/{i}.txt")
                .with_output("summary.txt"),
            Rule::new("post")
                .with_input("clusters/{i}.txt")
                .with_output("post/{i}.txt")
                .with_shell("cp {input} {output}"),
            Rule::new("cluster")
                .with_dynamic_output("clusters/{i}.txt")
                .with_shell("make clusters"),
        ];
        let settings = BuildSettings {
            until: BTreeSet::from(["aggregate".to_string()]),
            omit_from: BTreeSet::from(["post".to_string()]),
            ..Default::default()
        };
        let mut builder = builder(&dir, rules).with_settings(settings);

        let mut dag = builder.build(&["report.txt".to_string()]).unwrap();
        assert_eq!(rule_names(&dag), vec!["aggregate", "cluster"]);
        let cluster = dag.jobs().find(|j| j.rule.name == "cluster").unwrap().id;

        touch(dir.path(), "clusters/a.txt");
        let added = builder.expand_deferred(&mut dag, cluster).unwrap();
        assert!(added.is_empty());
        assert_eq!(rule_names(&dag), vec!["cluster"]);
    }

    #[test]
    fn test_deferred_input_without_pending_producer_expands_now() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "chunks/1.txt");
        let mut builder = builder(&dir, split_gather());

        let dag = builder.build(&["gathered.txt".to_string()]).unwrap();
        assert_eq!(rule_names(&dag), vec!["gather"]);
        let gather = dag.jobs().next().unwrap();
        assert_eq!(gather.input, vec![PathBuf::from("chunks/1.txt")]);
        assert!(!gather.has_pending_inputs());
    }
}
