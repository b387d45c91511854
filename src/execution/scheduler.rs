//! Job Scheduler
//!
//! The single coordinating loop of a run. It owns the job graph, the
//! resource pool, the metadata store and every job's state; executors only
//! talk back through [`JobEvent`]s on one channel.
//!
//! Each iteration promotes pending jobs whose dependencies finished, hands
//! as many ready jobs to the executor as the pool admits (highest priority
//! first, then rule declaration order, then job id), and then blocks until
//! the next event arrives.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::mpsc::{channel, Receiver, Sender};

use log::{debug, error, info, warn};

use super::executor::{Executor, JobEvent};
use super::resources::{ResourcePool, JOBS};
use super::state::{JobState, JobStatus};
use crate::dag::{Dag, DagBuilder, Job, JobId};
use crate::errors::{Result, WorkflowError};
use crate::monitoring::{EventType, ExecutionTimeline};
use crate::workflow::model::CORES;
use crate::workflow::MetadataStore;

/// Outcome of a run.
#[derive(Debug)]
pub struct RunSummary {
    pub total: usize,
    pub finished: usize,
    /// Failed jobs with their error.
    pub failed: Vec<(String, String)>,
    pub skipped: usize,
    pub interrupted: bool,
    /// Errors raised while growing the graph during the run.
    pub errors: Vec<String>,
    pub timeline: ExecutionTimeline,
}

impl RunSummary {
    pub fn success(&self) -> bool {
        self.failed.is_empty() && self.errors.is_empty() && !self.interrupted
    }

    /// Whether every job succeeded, or `Interrupted` if a signal stopped the run.
    pub fn outcome(&self) -> Result<bool> {
        if self.interrupted {
            return Err(WorkflowError::Interrupted);
        }
        Ok(self.success())
    }
}

/// Drives a job graph to completion.
pub struct Scheduler {
    dag: Dag,
    builder: DagBuilder,
    executor: Box<dyn Executor>,
    pool: ResourcePool,
    metadata: MetadataStore,
    states: BTreeMap<JobId, JobState>,
    /// Resources held by running jobs.
    held: BTreeMap<JobId, BTreeMap<String, u64>>,
    keep_going: bool,
    stopping: bool,
    interrupts: u32,
    errors: Vec<String>,
    timeline: ExecutionTimeline,
    tx: Sender<JobEvent>,
    rx: Receiver<JobEvent>,
}

impl Scheduler {
    pub fn new(
        dag: Dag,
        builder: DagBuilder,
        executor: Box<dyn Executor>,
        pool: ResourcePool,
        metadata: MetadataStore,
    ) -> Self {
        let (tx, rx) = channel();
        let states = dag.ids().into_iter().map(|id| (id, JobState::new())).collect();
        Self {
            dag,
            builder,
            executor,
            pool,
            metadata,
            states,
            held: BTreeMap::new(),
            keep_going: false,
            stopping: false,
            interrupts: 0,
            errors: Vec::new(),
            timeline: ExecutionTimeline::new(),
            tx,
            rx,
        }
    }

    /// Keep running independent jobs after a failure.
    pub fn with_keep_going(mut self, keep_going: bool) -> Self {
        self.keep_going = keep_going;
        self
    }

    /// Sender for external events such as interrupts.
    pub fn sender(&self) -> Sender<JobEvent> {
        self.tx.clone()
    }

    pub fn state(&self, id: JobId) -> Option<&JobState> {
        self.states.get(&id)
    }

    fn count(&self, pred: impl Fn(&JobStatus) -> bool) -> usize {
        self.states.values().filter(|s| pred(&s.status)).count()
    }

    fn running(&self) -> usize {
        self.count(|s| *s == JobStatus::Running)
    }

    /// Runs until no job is running, ready or pending.
    pub fn run(mut self) -> Result<RunSummary> {
        info!(
            "Scheduling {} jobs with {} executor",
            self.states.len(),
            self.executor.name()
        );

        loop {
            self.promote_ready();
            if !self.stopping {
                self.dispatch_ready();
            }

            if self.running() == 0 {
                break;
            }

            let event = self
                .rx
                .recv()
                .map_err(|e| WorkflowError::Config(format!("Event channel closed: {}", e)))?;
            self.handle(event);
        }

        self.executor.shutdown();

        let leftover: Vec<JobId> = self
            .states
            .iter()
            .filter(|(_, s)| !s.status.is_terminal())
            .map(|(id, _)| *id)
            .collect();
        if !leftover.is_empty() && !self.stopping {
            warn!("{} jobs could not be scheduled", leftover.len());
        }
        for id in leftover {
            if let Some(state) = self.states.get_mut(&id) {
                state.mark_skipped();
            }
        }

        if let Err(e) = self.metadata.save() {
            warn!("Failed to save metadata: {}", e);
        }
        Ok(self.summary())
    }

    fn summary(self) -> RunSummary {
        let failed = self
            .states
            .iter()
            .filter_map(|(id, s)| match &s.status {
                JobStatus::Failed(error) => Some((
                    self.dag.job(*id).map(|j| j.display_name()).unwrap_or_else(|| id.to_string()),
                    error.clone(),
                )),
                _ => None,
            })
            .collect();
        RunSummary {
            total: self.states.len(),
            finished: self.count(|s| *s == JobStatus::Finished),
            failed,
            skipped: self.count(|s| *s == JobStatus::Skipped),
            interrupted: self.interrupts > 0,
            errors: self.errors,
            timeline: self.timeline,
        }
    }

    /// Pending jobs whose dependencies all finished become ready.
    fn promote_ready(&mut self) {
        let ready: Vec<JobId> = self
            .states
            .iter()
            .filter(|(_, s)| s.status == JobStatus::Pending)
            .map(|(id, _)| *id)
            .filter(|id| match self.dag.job(*id) {
                Some(job) => {
                    !job.has_pending_inputs()
                        && job.dependencies.iter().all(|dep| {
                            self.states
                                .get(dep)
                                .map_or(true, |s| s.status == JobStatus::Finished)
                        })
                }
                None => false,
            })
            .collect();
        for id in ready {
            if let Some(state) = self.states.get_mut(&id) {
                state.mark_ready();
            }
        }
    }

    fn dispatch_order(&self, job: &Job) -> (Reverse<i64>, usize, JobId) {
        let declared = self
            .builder
            .registry()
            .declaration_index(&job.rule.name)
            .unwrap_or(usize::MAX);
        (Reverse(job.rule.priority), declared, job.id)
    }

    /// First-fit dispatch of ready jobs.
    fn dispatch_ready(&mut self) {
        let mut ready: Vec<&Job> = self
            .states
            .iter()
            .filter(|(_, s)| s.status == JobStatus::Ready)
            .filter_map(|(id, _)| self.dag.job(*id))
            .collect();
        ready.sort_by_key(|job| self.dispatch_order(job));
        let ready: Vec<JobId> = ready.into_iter().map(|j| j.id).collect();

        for id in ready {
            if self.stopping {
                break;
            }
            let Some(job) = self.dag.job(id).cloned() else {
                continue;
            };
            let claim = self.claim(&job);
            if !self.pool.grant(&claim) {
                continue;
            }
            self.held.insert(id, claim);
            if let Some(state) = self.states.get_mut(&id) {
                state.mark_running();
            }
            if self.executor.records_metadata() {
                self.metadata
                    .mark_incomplete(job.output.iter().map(|p| p.as_path()));
                if let Err(e) = self.metadata.save() {
                    warn!("Failed to save metadata: {}", e);
                }
            }

            info!("Starting {}", job);
            debug!("Reason: {}", job.reason);
            self.timeline.job_started(&job);

            if let Err(e) = self.executor.run(&job, self.tx.clone()) {
                self.job_failed(id, e.to_string());
            }
        }
    }

    /// Pool units a job holds while running. With job slots declared, a
    /// remote job takes one slot and its cores are spent on the cluster.
    fn claim(&self, job: &Job) -> BTreeMap<String, u64> {
        if job.is_local() || !self.pool.declares(JOBS) {
            return job.resources.clone();
        }
        let mut claim: BTreeMap<String, u64> = job
            .resources
            .iter()
            .filter(|(name, _)| name.as_str() != CORES)
            .map(|(name, amount)| (name.clone(), *amount))
            .collect();
        claim.insert(JOBS.to_string(), 1);
        claim
    }

    fn release(&mut self, id: JobId) {
        if let Some(resources) = self.held.remove(&id) {
            self.pool.release(&resources);
        }
    }

    fn handle(&mut self, event: JobEvent) {
        match event {
            JobEvent::Finished(id) => self.job_finished(id),
            JobEvent::Failed { id, error } => self.job_failed(id, error),
            JobEvent::StatusCheckRetry { id, attempt } => {
                if let Some(state) = self.states.get_mut(&id) {
                    state.record_status_retry(attempt);
                }
            }
            JobEvent::Interrupt => self.interrupt(),
        }
    }

    fn job_finished(&mut self, id: JobId) {
        if self.states.get(&id).map(|s| &s.status) != Some(&JobStatus::Running) {
            return;
        }
        self.release(id);
        if let Some(state) = self.states.get_mut(&id) {
            state.mark_finished();
        }
        self.timeline.add_event(id, EventType::Completed);

        let Some(job) = self.dag.job(id).cloned() else {
            return;
        };
        if self.executor.records_metadata() {
            self.metadata.record_rule(&job.rule);
            self.metadata
                .clear_incomplete(job.output.iter().map(|p| p.as_path()));
            if let Err(e) = self.metadata.save() {
                warn!("Failed to save metadata: {}", e);
            }
        }
        info!("Finished {}", job);

        if job.rule.defers_consumers() && !self.executor.records_metadata() {
            info!("Jobs waiting on the outputs of {} are determined at run time", job);
        } else if job.rule.defers_consumers() {
            match self.builder.expand_deferred(&mut self.dag, id) {
                Ok(added) => self.sync_states(&added),
                Err(e) => {
                    error!("Failed to update job graph after {}: {}", job, e);
                    self.errors.push(e.to_string());
                    self.stopping = true;
                }
            }
        }

        let done = self.count(|s| *s == JobStatus::Finished);
        let total = self.states.len();
        info!(
            "{} of {} steps ({}%) done",
            done,
            total,
            if total == 0 { 100 } else { done * 100 / total }
        );
    }

    /// Aligns job states with the graph after it changed.
    fn sync_states(&mut self, added: &[JobId]) {
        for id in added {
            self.states.entry(*id).or_default();
        }
        let removed: Vec<JobId> = self
            .states
            .iter()
            .filter(|(id, s)| self.dag.job(**id).is_none() && !s.status.is_terminal())
            .map(|(id, _)| *id)
            .collect();
        for id in removed {
            debug!("Job {} is no longer part of the graph", id);
            self.states.remove(&id);
        }
    }

    fn job_failed(&mut self, id: JobId, error: String) {
        if self.states.get(&id).map_or(true, |s| s.status.is_terminal()) {
            return;
        }
        self.release(id);
        if let Some(job) = self.dag.job(id) {
            error!("Job {} failed: {}", job, error);
            self.executor.cleanup(job, self.builder.storage());
            if self.executor.records_metadata() {
                self.metadata
                    .clear_incomplete(job.output.iter().map(|p| p.as_path()));
            }
        }
        if let Some(state) = self.states.get_mut(&id) {
            state.mark_failed(error);
        }
        self.timeline.add_event(id, EventType::Failed);

        let dependents: BTreeSet<JobId> = self.dag.transitive_dependents(id);
        for dependent in &dependents {
            if let Some(state) = self.states.get_mut(dependent) {
                state.mark_skipped();
            }
        }
        if !dependents.is_empty() {
            warn!("Skipping {} jobs that depend on job {}", dependents.len(), id);
        }

        if !self.keep_going && !self.stopping {
            self.stopping = true;
            let running = self.running();
            if running > 0 {
                warn!("Stopping after failure; waiting for {} running jobs", running);
            }
        }
    }

    fn interrupt(&mut self) {
        self.interrupts += 1;
        self.stopping = true;
        if self.interrupts == 1 {
            warn!(
                "Interrupted; terminating {} running jobs. Interrupt again to kill them.",
                self.running()
            );
            self.executor.terminate_all(false);
        } else {
            warn!("Killing running jobs");
            self.executor.terminate_all(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::BuildSettings;
    use crate::environment::LocalWrapperRepository;
    use crate::execution::action::ActionDispatcher;
    use crate::execution::executor::{ExecutorSettings, LocalExecutor};
    use crate::storage::Storage;
    use crate::workflow::{Rule, RuleRegistry};
    use std::fs;
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tempfile::tempdir;

    /// Runs jobs inline and records concurrent resource use.
    struct RecordingExecutor {
        fail: BTreeSet<String>,
        order: Arc<Mutex<Vec<String>>>,
    }

    impl Executor for RecordingExecutor {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn run(&mut self, job: &Job, events: Sender<JobEvent>) -> Result<()> {
            self.order.lock().unwrap().push(job.display_name());
            let event = if self.fail.contains(&job.rule.name) {
                JobEvent::Failed {
                    id: job.id,
                    error: "boom".to_string(),
                }
            } else {
                JobEvent::Finished(job.id)
            };
            events.send(event).unwrap();
            Ok(())
        }

        fn terminate_all(&mut self, _kill: bool) {}

        fn records_metadata(&self) -> bool {
            false
        }
    }

    fn diamond_registry() -> RuleRegistry {
        RuleRegistry::from_rules(vec![
            Rule::new("all").with_input("c.txt").with_input("d.txt"),
            Rule::new("c").with_input("a.txt").with_output("c.txt").with_shell("cat a.txt > c.txt"),
            Rule::new("d").with_output("d.txt").with_shell("echo d > d.txt"),
            Rule::new("a").with_output("a.txt").with_shell("echo a > a.txt"),
        ])
        .unwrap()
    }

    fn scheduler(dir: &Path, registry: RuleRegistry, executor: Box<dyn Executor>, cores: u64) -> Scheduler {
        let storage = Arc::new(Storage::new(dir));
        let mut builder = DagBuilder::new(registry, storage).with_settings(BuildSettings::default());
        let dag = builder.build(&[]).unwrap();
        Scheduler::new(dag, builder, executor, ResourcePool::new(cores), MetadataStore::in_memory())
    }

    fn recording(fail: &[&str]) -> (Box<dyn Executor>, Arc<Mutex<Vec<String>>>) {
        let order = Arc::new(Mutex::new(Vec::new()));
        let exec = RecordingExecutor {
            fail: fail.iter().map(|s| s.to_string()).collect(),
            order: Arc::clone(&order),
        };
        (Box::new(exec), order)
    }

    #[test]
    fn test_dependencies_run_first() {
        let dir = tempdir().unwrap();
        let (exec, order) = recording(&[]);
        let summary = scheduler(dir.path(), diamond_registry(), exec, 4).run().unwrap();

        assert!(summary.success());
        assert_eq!(summary.finished, 4);
        let order = order.lock().unwrap();
        let pos = |name: &str| order.iter().position(|n| n == name).unwrap();
        assert!(pos("a") < pos("c"));
        assert!(pos("c") < pos("all"));
        assert!(pos("d") < pos("all"));
    }

    #[test]
    fn test_failure_skips_dependents_fail_fast() {
        let dir = tempdir().unwrap();
        let (exec, order) = recording(&["d"]);
        let summary = scheduler(dir.path(), diamond_registry(), exec, 1).run().unwrap();

        assert!(!summary.success());
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].0, "d");
        // `d` is declared before `a`, so it runs first; nothing starts after it fails.
        assert_eq!(order.lock().unwrap().as_slice(), ["d"]);
        assert_eq!(summary.skipped, 3);
    }

    /// Rejects jobs of the given rule at submission time.
    struct RejectingExecutor {
        reject: String,
        order: Arc<Mutex<Vec<String>>>,
    }

    impl Executor for RejectingExecutor {
        fn name(&self) -> &'static str {
            "rejecting"
        }

        fn run(&mut self, job: &Job, events: Sender<JobEvent>) -> Result<()> {
            self.order.lock().unwrap().push(job.display_name());
            if job.rule.name == self.reject {
                return Err(WorkflowError::ClusterSubmission {
                    job: job.display_name(),
                    message: "queue rejected the job".to_string(),
                });
            }
            events.send(JobEvent::Finished(job.id)).unwrap();
            Ok(())
        }

        fn terminate_all(&mut self, _kill: bool) {}

        fn records_metadata(&self) -> bool {
            false
        }
    }

    #[test]
    fn test_rejected_submission_stops_dispatch_in_same_pass() {
        let dir = tempdir().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        let exec = RejectingExecutor {
            reject: "d".to_string(),
            order: Arc::clone(&order),
        };
        let summary = scheduler(dir.path(), diamond_registry(), Box::new(exec), 4).run().unwrap();

        assert_eq!(order.lock().unwrap().as_slice(), ["d"]);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.finished, 0);
        assert_eq!(summary.skipped, 3);
    }

    #[test]
    fn test_keep_going_runs_independent_branches() {
        let dir = tempdir().unwrap();
        let (exec, order) = recording(&["a"]);
        let summary = scheduler(dir.path(), diamond_registry(), exec, 1)
            .with_keep_going(true)
            .run()
            .unwrap();

        assert!(!summary.success());
        assert!(order.lock().unwrap().contains(&"d".to_string()));
        assert_eq!(summary.finished, 1);
        // `c` and `all` depend on the failed job.
        assert_eq!(summary.skipped, 2);
    }

    #[test]
    fn test_priority_orders_dispatch() {
        let dir = tempdir().unwrap();
        let registry = RuleRegistry::from_rules(vec![
            Rule::new("all").with_input("low.txt").with_input("high.txt"),
            Rule::new("low").with_output("low.txt").with_shell("true"),
            Rule::new("high").with_output("high.txt").with_shell("true").with_priority(10),
        ])
        .unwrap();
        let (exec, order) = recording(&[]);
        scheduler(dir.path(), registry, exec, 1).run().unwrap();

        assert_eq!(order.lock().unwrap().as_slice(), ["high", "low", "all"]);
    }

    #[test]
    fn test_interrupt_stops_dispatch() {
        let dir = tempdir().unwrap();
        let (exec, order) = recording(&[]);
        let sched = scheduler(dir.path(), diamond_registry(), exec, 1);
        sched.sender().send(JobEvent::Interrupt).unwrap();
        let summary = sched.run().unwrap();

        assert!(summary.interrupted);
        assert!(!summary.success());
        assert_eq!(order.lock().unwrap().len(), 1);
    }

    /// Executor that holds jobs until told to finish, to observe concurrency.
    struct SleepingExecutor {
        inner: LocalExecutor,
    }

    impl Executor for SleepingExecutor {
        fn name(&self) -> &'static str {
            "sleeping"
        }

        fn run(&mut self, job: &Job, events: Sender<JobEvent>) -> Result<()> {
            self.inner.run(job, events)
        }

        fn terminate_all(&mut self, kill: bool) {
            self.inner.terminate_all(kill)
        }

        fn shutdown(&mut self) {
            self.inner.shutdown()
        }
    }

    #[test]
    fn test_resource_pool_is_never_exceeded() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("running.log");
        // Each job appends +threads on start and -threads on exit.
        let body = format!(
            "echo +{{threads}} >> '{log}'; sleep 0.2; echo -{{threads}} >> '{log}'; touch {{output}}",
            log = log.display()
        );
        let mut rules = vec![Rule::new("all")];
        for (i, threads) in [2u64, 3, 1, 2, 4].iter().enumerate() {
            let name = format!("job{}", i);
            let output = format!("{}.txt", name);
            rules[0] = rules[0].clone().with_input(output.clone());
            rules.push(
                Rule::new(name)
                    .with_output(output)
                    .with_shell(body.clone())
                    .with_threads(*threads)
                    .with_resource("gpu", 1),
            );
        }
        let registry = RuleRegistry::from_rules(rules).unwrap();

        let storage = Arc::new(Storage::new(dir.path()));
        let actions = Arc::new(ActionDispatcher::new(
            Arc::clone(&storage),
            Arc::new(LocalWrapperRepository::new(dir.path())),
        ));
        let exec = SleepingExecutor {
            inner: LocalExecutor::new(actions, ExecutorSettings {
                latency_wait: Duration::from_secs(2),
                ..ExecutorSettings::default()
            }),
        };
        let mut builder = DagBuilder::new(registry, storage)
            .with_limits(BTreeMap::from([(CORES.to_string(), 4), ("gpu".to_string(), 2)]));
        let dag = builder.build(&[]).unwrap();
        let pool = ResourcePool::new(4).with_resource("gpu", 2);
        let summary = Scheduler::new(dag, builder, Box::new(exec), pool, MetadataStore::in_memory())
            .run()
            .unwrap();
        assert!(summary.success(), "{:?}", summary.failed);

        let mut cores = 0i64;
        let mut jobs = 0i64;
        for line in fs::read_to_string(&log).unwrap().lines() {
            let delta: i64 = line.trim().parse().unwrap();
            cores += delta;
            jobs += delta.signum();
            assert!(cores <= 4, "cores exceeded: {}", cores);
            assert!(jobs <= 2, "gpus exceeded: {}", jobs);
        }
        assert_eq!(cores, 0);
    }

    #[test]
    fn test_job_slots_bound_remote_jobs_not_threads() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("slots.log");
        let body = format!(
            "echo +{{threads}} >> '{log}'; sleep 0.2; echo -{{threads}} >> '{log}'; touch {{output}}",
            log = log.display()
        );
        let mut all = Rule::new("all");
        let mut rules = Vec::new();
        for i in 0..4 {
            let output = format!("remote{}.txt", i);
            all = all.with_input(output.clone());
            rules.push(
                Rule::new(format!("remote{}", i))
                    .with_output(output)
                    .with_shell(body.clone())
                    .with_threads(8),
            );
        }
        rules.insert(0, all);
        let registry = RuleRegistry::from_rules(rules).unwrap();

        let storage = Arc::new(Storage::new(dir.path()));
        let actions = Arc::new(ActionDispatcher::new(
            Arc::clone(&storage),
            Arc::new(LocalWrapperRepository::new(dir.path())),
        ));
        let exec = SleepingExecutor {
            inner: LocalExecutor::new(actions, ExecutorSettings::default()),
        };
        let pool = ResourcePool::new(1).with_resource(JOBS, 2);
        let mut builder = DagBuilder::new(registry, storage)
            .with_limits(pool.capacity().clone())
            .with_job_slots(true);
        let dag = builder.build(&[]).unwrap();
        let summary = Scheduler::new(dag, builder, Box::new(exec), pool, MetadataStore::in_memory())
            .run()
            .unwrap();
        assert!(summary.success(), "{:?}", summary.failed);

        let mut running = 0i64;
        let mut peak = 0i64;
        for line in fs::read_to_string(&log).unwrap().lines() {
            let delta: i64 = line.trim().parse().unwrap();
            assert_eq!(delta.abs(), 8);
            running += delta.signum();
            peak = peak.max(running);
            assert!(running <= 2, "job slots exceeded: {}", running);
        }
        assert_eq!(running, 0);
        assert_eq!(peak, 2);
        assert!(summary.outcome().unwrap());
    }

    #[test]
    fn test_first_interrupt_terminates_running_jobs() {
        let dir = tempdir().unwrap();
        let registry = RuleRegistry::from_rules(vec![Rule::new("slow")
            .with_output("slow.txt")
            .with_shell("sleep 30 && touch {output}")])
        .unwrap();

        let storage = Arc::new(Storage::new(dir.path()));
        let actions = Arc::new(ActionDispatcher::new(
            Arc::clone(&storage),
            Arc::new(LocalWrapperRepository::new(dir.path())),
        ));
        let exec = LocalExecutor::new(actions, ExecutorSettings::default());
        let mut builder = DagBuilder::new(registry, storage);
        let dag = builder.build(&[]).unwrap();
        let sched = Scheduler::new(dag, builder, Box::new(exec), ResourcePool::new(1), MetadataStore::in_memory());

        let events = sched.sender();
        let interrupter = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_secs(1));
            events.send(JobEvent::Interrupt).unwrap();
        });
        let started = std::time::Instant::now();
        let summary = sched.run().unwrap();
        interrupter.join().unwrap();

        assert!(summary.interrupted);
        assert!(matches!(summary.outcome(), Err(WorkflowError::Interrupted)));
        assert_eq!(summary.failed.len(), 1);
        assert!(started.elapsed() < Duration::from_secs(20));
        assert!(!dir.path().join("slow.txt").exists());
    }

    #[test]
    fn test_checkpoint_expansion_schedules_new_jobs() {
        let dir = tempdir().unwrap();
        let registry = RuleRegistry::from_rules(vec![
            Rule::new("all").with_input("summary.txt"),
            Rule::new("split")
                .with_output("chunks")
                .with_shell("mkdir -p chunks; echo 1 > chunks/a.txt; echo 2 > chunks/b.txt")
                .checkpoint(),
            Rule::new("process")
                .with_input("chunks/{c}.txt")
                .with_output("processed/{c}.txt")
                .with_shell("cat {input} > {output}"),
            Rule::new("gather")
                .with_deferred_input("processed/{c}.txt", "chunks/{c}.txt")
                .with_output("summary.txt")
                .with_shell("cat {input} > {output}"),
        ])
        .unwrap();

        let storage = Arc::new(Storage::new(dir.path()));
        let actions = Arc::new(ActionDispatcher::new(
            Arc::clone(&storage),
            Arc::new(LocalWrapperRepository::new(dir.path())),
        ));
        let exec = LocalExecutor::new(actions, ExecutorSettings {
            latency_wait: Duration::from_secs(2),
            ..ExecutorSettings::default()
        });
        let mut builder = DagBuilder::new(registry, storage);
        let dag = builder.build(&[]).unwrap();
        let initial = dag.len();
        let summary = Scheduler::new(dag, builder, Box::new(exec), ResourcePool::new(2), MetadataStore::in_memory())
            .run()
            .unwrap();

        assert!(summary.success(), "{:?} {:?}", summary.failed, summary.errors);
        assert_eq!(summary.total, initial + 2);
        assert_eq!(fs::read_to_string(dir.path().join("summary.txt")).unwrap(), "1\n2\n");
    }
}
