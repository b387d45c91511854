//! Job Graph
//!
//! Jobs live in an arena and are addressed by [`JobId`]. Ids are never
//! reused, so edges stay valid when deferred expansion appends jobs or
//! pruning removes them.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};

use log::debug;

use super::job::{Job, JobId};
use crate::errors::{Result, WorkflowError};
use crate::workflow::wildcards::Wildcards;

/// Identity of a job: its rule and wildcard binding.
pub type Signature = (String, Wildcards);

/// Arena of jobs plus producer to consumer edges.
#[derive(Debug, Default)]
pub struct Dag {
    slots: Vec<Option<Job>>,
    signatures: HashMap<Signature, JobId>,
    producers: HashMap<PathBuf, JobId>,
    dependents: BTreeMap<JobId, BTreeSet<JobId>>,
    targets: BTreeSet<JobId>,
}

impl Dag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a job, assigning the next id. Edges to its dependencies are
    /// recorded from `job.dependencies`.
    pub fn add_job(&mut self, mut job: Job) -> JobId {
        let id = JobId(self.slots.len());
        job.id = id;

        self.signatures
            .insert((job.rule.name.clone(), job.wildcards.clone()), id);
        for output in &job.output {
            self.producers.insert(output.clone(), id);
        }
        for dep in &job.dependencies {
            self.dependents.entry(*dep).or_default().insert(id);
        }

        debug!("Added job {}: {}", id, job.display_name());
        self.slots.push(Some(job));
        id
    }

    /// Id the next added job will receive.
    pub fn next_id(&self) -> JobId {
        JobId(self.slots.len())
    }

    /// Records that `consumer` needs the outputs of `producer`.
    pub fn add_dependency(&mut self, consumer: JobId, producer: JobId) {
        if let Some(job) = self.job_mut(consumer) {
            job.dependencies.insert(producer);
            self.dependents.entry(producer).or_default().insert(consumer);
        }
    }

    /// Registers an additional output discovered after the job ran.
    pub fn register_output(&mut self, id: JobId, path: PathBuf) {
        self.producers.insert(path, id);
    }

    pub fn job(&self, id: JobId) -> Option<&Job> {
        self.slots.get(id.0).and_then(Option::as_ref)
    }

    pub fn job_mut(&mut self, id: JobId) -> Option<&mut Job> {
        self.slots.get_mut(id.0).and_then(Option::as_mut)
    }

    /// Live jobs in id order.
    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.slots.iter().filter_map(Option::as_ref)
    }

    pub fn ids(&self) -> Vec<JobId> {
        self.jobs().map(|j| j.id).collect()
    }

    pub fn len(&self) -> usize {
        self.jobs().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn find(&self, rule: &str, wildcards: &Wildcards) -> Option<JobId> {
        self.signatures
            .get(&(rule.to_string(), wildcards.clone()))
            .copied()
    }

    pub fn producer_of(&self, path: &Path) -> Option<JobId> {
        self.producers.get(path).copied()
    }

    pub fn dependents(&self, id: JobId) -> impl Iterator<Item = JobId> + '_ {
        self.dependents.get(&id).into_iter().flatten().copied()
    }

    pub fn mark_target(&mut self, id: JobId) {
        self.targets.insert(id);
    }

    pub fn is_target(&self, id: JobId) -> bool {
        self.targets.contains(&id)
    }

    /// Every job reachable downstream of `id`, excluding `id` itself.
    pub fn transitive_dependents(&self, id: JobId) -> BTreeSet<JobId> {
        let mut found = BTreeSet::new();
        let mut queue: VecDeque<JobId> = self.dependents(id).collect();
        while let Some(next) = queue.pop_front() {
            if found.insert(next) {
                queue.extend(self.dependents(next));
            }
        }
        found
    }

    /// The given jobs plus everything they depend on, transitively.
    pub fn with_ancestors(&self, roots: impl IntoIterator<Item = JobId>) -> BTreeSet<JobId> {
        let mut found = BTreeSet::new();
        let mut stack: Vec<JobId> = roots.into_iter().collect();
        while let Some(next) = stack.pop() {
            if !found.insert(next) {
                continue;
            }
            if let Some(job) = self.job(next) {
                stack.extend(job.dependencies.iter().copied());
            }
        }
        found
    }

    /// Removes jobs and every index entry pointing at them.
    pub fn remove(&mut self, ids: &BTreeSet<JobId>) {
        for id in ids {
            if let Some(slot) = self.slots.get_mut(id.0) {
                if let Some(job) = slot.take() {
                    debug!("Pruned job {}: {}", id, job.display_name());
                }
            }
        }
        self.signatures.retain(|_, id| !ids.contains(id));
        self.producers.retain(|_, id| !ids.contains(id));
        self.targets.retain(|id| !ids.contains(id));
        self.dependents.retain(|id, _| !ids.contains(id));
        for consumers in self.dependents.values_mut() {
            consumers.retain(|id| !ids.contains(id));
        }
        for job in self.slots.iter_mut().flatten() {
            job.dependencies.retain(|id| !ids.contains(id));
        }
    }

    /// Orders jobs so that every producer precedes its consumers. Ties are
    /// broken by id.
    pub fn toposort(&self) -> Result<Vec<JobId>> {
        let mut indegree: BTreeMap<JobId, usize> = self
            .jobs()
            .map(|j| {
                let live = j.dependencies.iter().filter(|d| self.job(**d).is_some()).count();
                (j.id, live)
            })
            .collect();

        let mut ready: BTreeSet<JobId> = indegree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(indegree.len());

        while let Some(id) = ready.pop_first() {
            order.push(id);
            for consumer in self.dependents(id) {
                if let Some(degree) = indegree.get_mut(&consumer) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert(consumer);
                    }
                }
            }
        }

        if order.len() != indegree.len() {
            let chain = indegree
                .iter()
                .filter(|(_, degree)| **degree > 0)
                .filter_map(|(id, _)| self.job(*id).map(Job::display_name))
                .collect();
            return Err(WorkflowError::Recursion { chain });
        }
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::job::tests::sample_job;
    use crate::workflow::Rule;

    fn chain() -> (Dag, JobId, JobId, JobId) {
        let mut dag = Dag::new();
        let mut a = sample_job(0, Rule::new("a"));
        a.output.push(PathBuf::from("a.txt"));
        let a = dag.add_job(a);

        let mut b = sample_job(0, Rule::new("b"));
        b.dependencies.insert(a);
        let b = dag.add_job(b);

        let mut c = sample_job(0, Rule::new("c"));
        c.dependencies.insert(b);
        let c = dag.add_job(c);
        (dag, a, b, c)
    }

    #[test]
    fn test_add_and_lookup() {
        let (dag, a, _, _) = chain();
        assert_eq!(dag.len(), 3);
        assert_eq!(dag.producer_of(Path::new("a.txt")), Some(a));
        assert_eq!(dag.find("a", &Wildcards::new()), Some(a));
        assert!(dag.find("z", &Wildcards::new()).is_none());
    }

    #[test]
    fn test_toposort_places_producers_first() {
        let (mut dag, a, b, c) = chain();
        // A late job that b depends on still sorts before b.
        let late = dag.add_job(sample_job(0, Rule::new("late")));
        dag.add_dependency(b, late);

        let order = dag.toposort().unwrap();
        let pos = |id: JobId| order.iter().position(|x| *x == id).unwrap();
        assert!(pos(a) < pos(b));
        assert!(pos(late) < pos(b));
        assert!(pos(b) < pos(c));
    }

    #[test]
    fn test_transitive_dependents_and_ancestors() {
        let (dag, a, b, c) = chain();
        assert_eq!(dag.transitive_dependents(a), BTreeSet::from([b, c]));
        assert!(dag.transitive_dependents(c).is_empty());
        assert_eq!(dag.with_ancestors([b]), BTreeSet::from([a, b]));
    }

    #[test]
    fn test_remove_keeps_ids_stable() {
        let (mut dag, a, b, c) = chain();
        dag.remove(&BTreeSet::from([c]));
        assert_eq!(dag.len(), 2);
        assert!(dag.job(c).is_none());
        assert_eq!(dag.job(b).unwrap().id, b);
        assert_eq!(dag.dependents(b).count(), 0);

        let d = dag.add_job(sample_job(0, Rule::new("d")));
        assert_eq!(d, JobId(3));
        assert_eq!(dag.toposort().unwrap(), vec![a, b, d]);
    }

    #[test]
    fn test_toposort_reports_cycle() {
        let (mut dag, a, _, c) = chain();
        dag.add_dependency(a, c);
        assert!(matches!(dag.toposort(), Err(WorkflowError::Recursion { .. })));
    }
}
