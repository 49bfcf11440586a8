//! The execution engine.
//!
//! The Manager flattens a flow into a schedule, runs one job at a time in
//! dependency order, and applies each response's directive to the
//! remaining schedule. A replaced or detoured job's uuid becomes live
//! again at the next index, so not-yet-started dependents wait for the
//! grafted work and their references resolve to its output.

use std::collections::{BTreeMap, HashMap, HashSet};

use crossbeam_channel::Sender;
use uuid::Uuid;

use skein_core::{JobStore, OnMissing, ResolveCache, ResolveError};

use crate::error::FlowError;
use crate::flow::{ExecutionOrder, Flow, FlowMember};
use crate::job::Job;
use crate::logging::RunLogger;
use crate::registry::FunctionRegistry;
use crate::response::{Directive, Graft, Response};
use crate::updates::{JobState, RunUpdate};

/// Explicit engine configuration; there is no ambient state.
#[derive(Debug, Clone, Default)]
pub struct ManagerOptions {
    /// Stop at the first failed job instead of continuing with
    /// independent work.
    pub fail_fast: bool,
}

/// Result of a run: every response keyed by `(uuid, index)`, the uuids
/// that were skipped, and the first error if any job failed.
#[derive(Debug, Default)]
pub struct RunOutcome {
    pub responses: HashMap<Uuid, BTreeMap<u32, Response>>,
    pub skipped: HashSet<Uuid>,
    pub error: Option<FlowError>,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// The highest-index response recorded for a uuid.
    pub fn latest_response(&self, uuid: Uuid) -> Option<&Response> {
        self.responses
            .get(&uuid)
            .and_then(|by_index| by_index.values().next_back())
    }
}

pub struct Manager {
    store: JobStore,
    registry: FunctionRegistry,
    options: ManagerOptions,
    updates: Option<Sender<RunUpdate>>,
    logger: Option<RunLogger>,
}

impl Manager {
    pub fn new(store: JobStore, registry: FunctionRegistry) -> Self {
        Self {
            store,
            registry,
            options: ManagerOptions::default(),
            updates: None,
            logger: None,
        }
    }

    pub fn with_options(mut self, options: ManagerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_updates(mut self, sender: Sender<RunUpdate>) -> Self {
        self.updates = Some(sender);
        self
    }

    pub fn with_logger(mut self, logger: RunLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Execute a flow to completion.
    ///
    /// Per-job failures are recorded in the outcome (dependents skipped,
    /// independent work continues); a structurally invalid graft or a
    /// backend failure while scheduling is fatal and returned as `Err`.
    pub fn run(&mut self, flow: Flow) -> Result<RunOutcome, FlowError> {
        self.store.connect()?;
        let mut schedule = Schedule::new();
        let first_jobs = schedule.ingest_flow(&flow, None)?;
        self.check_external_references(&schedule, &first_jobs)?;
        self.note_disconnected(&flow);
        self.log(&format!(
            "running flow '{}' with {} jobs",
            flow.name,
            first_jobs.len()
        ));

        let mut outcome = RunOutcome::default();
        let mut cache = ResolveCache::new();
        let mut stopped = false;

        while let Some(uuid) = schedule.next_ready() {
            let Some(job) = schedule.take(uuid) else {
                break;
            };
            self.emit(&job, JobState::Running);
            self.log(&format!(
                "running job '{}' ({}, index {})",
                job.name, job.uuid, job.index
            ));

            match job.run(&self.store, &self.registry, &mut cache) {
                Ok(response) => {
                    self.emit(&job, JobState::Completed);
                    let directive = response.directive.clone();
                    let stop_children = response.stop_children;
                    let stop_jobflow = response.stop_jobflow;
                    outcome
                        .responses
                        .entry(job.uuid)
                        .or_default()
                        .insert(job.index, response);

                    if let Some(directive) = directive {
                        self.apply_directive(&mut schedule, &job, &directive)?;
                    }
                    if stop_children {
                        self.skip_dependents(&mut schedule, &mut outcome, job.uuid);
                    }
                    if stop_jobflow {
                        self.log("stop requested, ending run");
                        stopped = true;
                        break;
                    }
                }
                Err(error) => {
                    self.emit(&job, JobState::Failed(error.to_string()));
                    self.log(&format!("job '{}' failed: {}", job.name, error));
                    self.skip_dependents(&mut schedule, &mut outcome, job.uuid);
                    if outcome.error.is_none() {
                        outcome.error = Some(error);
                    }
                    if self.options.fail_fast {
                        stopped = true;
                        break;
                    }
                }
            }
        }

        // Jobs left behind by an exhausted ready set can only be waiting
        // on each other.
        if !stopped && !schedule.is_empty() && outcome.error.is_none() {
            outcome.error = Some(FlowError::Cycle(flow.name.clone()));
        }
        Ok(outcome)
    }

    fn apply_directive(
        &mut self,
        schedule: &mut Schedule,
        current: &Job,
        directive: &Directive,
    ) -> Result<(), FlowError> {
        let (graft, takes_over) = match directive {
            Directive::Replace(graft) | Directive::Detour(graft) => (graft, true),
            Directive::Addition(graft) => (graft, false),
        };
        let new_jobs = match graft.clone() {
            Graft::Job(mut job) => {
                if takes_over {
                    job.uuid = current.uuid;
                    job.index = current.index + 1;
                }
                let allow = takes_over.then_some(current.uuid);
                schedule.ingest_job(job, allow)?
            }
            Graft::Flow(mut flow) => {
                if takes_over {
                    let leaf = flow
                        .leaf_uuid()
                        .ok_or_else(|| FlowError::Graft("grafted flow has no jobs".to_string()))?;
                    flow.rename_uuid(leaf, current.uuid);
                    flow.set_job_index(current.uuid, current.index + 1);
                }
                let allow = takes_over.then_some(current.uuid);
                schedule.ingest_flow(&flow, allow)?
            }
        };
        self.check_external_references(schedule, &new_jobs)?;
        let kind = match directive {
            Directive::Replace(_) => "replace",
            Directive::Detour(_) => "detour",
            Directive::Addition(_) => "addition",
        };
        self.log(&format!(
            "{} from '{}' grafted {} jobs",
            kind,
            current.name,
            new_jobs.len()
        ));
        Ok(())
    }

    /// References that point outside the scheduled closure must already
    /// resolve against the store, checked before the referencing jobs can
    /// run. Jobs that opt out of strict resolution are exempt.
    fn check_external_references(
        &self,
        schedule: &Schedule,
        new_jobs: &[Uuid],
    ) -> Result<(), FlowError> {
        for uuid in new_jobs {
            let Some(job) = schedule.get(*uuid) else {
                continue;
            };
            if !job.config.resolve_references
                || job.config.on_missing_references != OnMissing::Fail
            {
                continue;
            }
            for reference in job.input_references() {
                if schedule.in_closure(reference.uuid) {
                    continue;
                }
                if self.store.get_output_doc(reference.uuid, false)?.is_none() {
                    return Err(FlowError::Resolve(ResolveError::Missing {
                        uuid: reference.uuid,
                    }));
                }
            }
        }
        Ok(())
    }

    fn skip_dependents(&mut self, schedule: &mut Schedule, outcome: &mut RunOutcome, root: Uuid) {
        for job in schedule.remove_dependents(root) {
            self.emit(&job, JobState::Skipped);
            self.log(&format!("skipping job '{}' ({})", job.name, job.uuid));
            outcome.skipped.insert(job.uuid);
        }
    }

    fn note_disconnected(&mut self, flow: &Flow) {
        if flow.order != ExecutionOrder::Auto {
            return;
        }
        let graph = flow.graph();
        if graph.len() > 1 && graph.values().all(HashSet::is_empty) {
            self.log(&format!(
                "flow '{}' has no inter-job dependencies; running in declaration order",
                flow.name
            ));
        }
    }

    fn emit(&self, job: &Job, state: JobState) {
        if let Some(sender) = &self.updates {
            let _ = sender.send(RunUpdate {
                uuid: job.uuid,
                index: job.index,
                name: job.name.clone(),
                state,
            });
        }
    }

    fn log(&mut self, message: &str) {
        if let Some(logger) = &mut self.logger {
            logger.log(message);
        }
    }
}

/// Mutable run state: the not-yet-started jobs, their dependency sets and
/// declaration positions, and every uuid seen so far.
struct Schedule {
    jobs: HashMap<Uuid, Job>,
    deps: HashMap<Uuid, HashSet<Uuid>>,
    position: HashMap<Uuid, usize>,
    next_position: usize,
    closure: HashSet<Uuid>,
    flow_jobs: HashMap<Uuid, HashSet<Uuid>>,
}

impl Schedule {
    fn new() -> Self {
        Self {
            jobs: HashMap::new(),
            deps: HashMap::new(),
            position: HashMap::new(),
            next_position: 0,
            closure: HashSet::new(),
            flow_jobs: HashMap::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    fn get(&self, uuid: Uuid) -> Option<&Job> {
        self.jobs.get(&uuid)
    }

    fn take(&mut self, uuid: Uuid) -> Option<Job> {
        self.jobs.remove(&uuid)
    }

    fn in_closure(&self, uuid: Uuid) -> bool {
        self.closure.contains(&uuid)
    }

    /// Add a whole flow to the schedule. `allow` exempts one uuid from
    /// the collision check, for grafts that deliberately take over the
    /// current job's identity. Returns the uuids of the added jobs.
    fn ingest_flow(&mut self, flow: &Flow, allow: Option<Uuid>) -> Result<Vec<Uuid>, FlowError> {
        // A structurally unschedulable flow (internal cycle) is rejected
        // before anything is added.
        flow.ordered_jobs()?;
        for uuid in flow.closure_uuids() {
            if Some(uuid) != allow && self.closure.contains(&uuid) {
                return Err(FlowError::Graft(format!(
                    "uuid {uuid} is already part of this run"
                )));
            }
        }

        for sub in flow.flows() {
            self.closure.insert(sub.uuid);
            self.flow_jobs.insert(
                sub.uuid,
                sub.jobs().iter().map(|job| job.uuid).collect(),
            );
        }

        let mut added = Vec::new();
        for job in flow.jobs() {
            self.insert_job(job.clone());
            added.push(job.uuid);
        }
        self.apply_linear_chains(flow);
        Ok(added)
    }

    fn ingest_job(&mut self, job: Job, allow: Option<Uuid>) -> Result<Vec<Uuid>, FlowError> {
        if Some(job.uuid) != allow && self.closure.contains(&job.uuid) {
            return Err(FlowError::Graft(format!(
                "uuid {} is already part of this run",
                job.uuid
            )));
        }
        let uuid = job.uuid;
        self.insert_job(job);
        Ok(vec![uuid])
    }

    fn insert_job(&mut self, job: Job) {
        let mut deps = HashSet::new();
        for reference in job.input_references() {
            if reference.uuid == job.uuid {
                // A successor may read its predecessor's output; the
                // store already holds it.
                continue;
            }
            if let Some(members) = self.flow_jobs.get(&reference.uuid) {
                deps.extend(members.iter().copied());
            } else {
                deps.insert(reference.uuid);
            }
        }
        deps.remove(&job.uuid);
        self.closure.insert(job.uuid);
        self.deps.insert(job.uuid, deps);
        self.position.insert(job.uuid, self.next_position);
        self.next_position += 1;
        self.jobs.insert(job.uuid, job);
    }

    /// Declaration order is execution order for `Linear` flows: every job
    /// of a member waits for every job of the member declared before it.
    fn apply_linear_chains(&mut self, flow: &Flow) {
        if flow.order == ExecutionOrder::Linear {
            let member_sets: Vec<Vec<Uuid>> = flow
                .members()
                .iter()
                .map(|member| match member {
                    FlowMember::Job(job) => vec![job.uuid],
                    FlowMember::Flow(sub) => sub.jobs().iter().map(|job| job.uuid).collect(),
                })
                .collect();
            for pair in member_sets.windows(2) {
                for later in &pair[1] {
                    if let Some(deps) = self.deps.get_mut(later) {
                        deps.extend(pair[0].iter().copied());
                    }
                }
            }
        }
        for member in flow.members() {
            if let FlowMember::Flow(sub) = member {
                self.apply_linear_chains(sub);
            }
        }
    }

    /// A dependency is open while a job carrying its uuid has not run;
    /// uuids outside the schedule are satisfied by the store.
    fn next_ready(&self) -> Option<Uuid> {
        self.jobs
            .keys()
            .filter(|uuid| {
                self.deps
                    .get(*uuid)
                    .map(|deps| deps.iter().all(|dep| !self.jobs.contains_key(dep)))
                    .unwrap_or(true)
            })
            .min_by_key(|uuid| (self.position.get(*uuid).copied().unwrap_or(usize::MAX), **uuid))
            .copied()
    }

    /// Remove every not-yet-started job that transitively depends on
    /// `root` and return them.
    fn remove_dependents(&mut self, root: Uuid) -> Vec<Job> {
        let mut frontier = vec![root];
        let mut removed = Vec::new();
        while let Some(uuid) = frontier.pop() {
            let dependents: Vec<Uuid> = self
                .jobs
                .keys()
                .filter(|candidate| {
                    self.deps
                        .get(*candidate)
                        .map(|deps| deps.contains(&uuid))
                        .unwrap_or(false)
                })
                .copied()
                .collect();
            for dependent in dependents {
                if let Some(job) = self.jobs.remove(&dependent) {
                    frontier.push(dependent);
                    removed.push(job);
                }
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::FunctionToken;
    use serde_json::{json, Map};
    use skein_core::MemoryStore;

    fn math_registry() -> FunctionRegistry {
        let mut registry = FunctionRegistry::new();
        registry.register("math", "add", |inv| {
            let total: i64 = inv.args.iter().filter_map(|v| v.as_i64()).sum();
            Ok(json!(total).into())
        });
        registry
    }

    fn add_job(args: Vec<serde_json::Value>) -> Job {
        Job::new(FunctionToken::new("math", "add"), args, Map::new())
    }

    fn memory_manager() -> Manager {
        Manager::new(JobStore::new(Box::new(MemoryStore::new())), math_registry())
    }

    #[test]
    fn ready_jobs_follow_declaration_order() {
        let a = add_job(vec![json!(1)]);
        let b = add_job(vec![json!(2)]);
        let c = add_job(vec![a.output().to_value(), b.output().to_value()]);
        let order = [a.uuid, b.uuid, c.uuid];
        let flow = Flow::new("tie", vec![a.into(), b.into(), c.into()]).unwrap();

        let mut schedule = Schedule::new();
        schedule.ingest_flow(&flow, None).unwrap();
        let mut picked = Vec::new();
        while let Some(uuid) = schedule.next_ready() {
            picked.push(uuid);
            schedule.take(uuid);
        }
        assert_eq!(picked, order);
    }

    #[test]
    fn linear_flows_chain_independent_jobs() {
        let a = add_job(vec![json!(1)]);
        let b = add_job(vec![json!(2)]);
        let (a_uuid, b_uuid) = (a.uuid, b.uuid);
        let flow = Flow::new("chain", vec![a.into(), b.into()])
            .unwrap()
            .with_order(ExecutionOrder::Linear);

        let mut schedule = Schedule::new();
        schedule.ingest_flow(&flow, None).unwrap();
        // b is not ready until a has run.
        assert_eq!(schedule.next_ready(), Some(a_uuid));
        schedule.take(a_uuid);
        assert_eq!(schedule.next_ready(), Some(b_uuid));
    }

    #[test]
    fn unresolvable_external_references_abort_before_any_job_runs() {
        let dangling = skein_core::OutputReference::new(Uuid::new_v4(), 1);
        let job = add_job(vec![dangling.to_value()]);
        let flow = Flow::new("dangling", vec![job.into()]).unwrap();

        let mut manager = memory_manager();
        assert!(matches!(
            manager.run(flow),
            Err(FlowError::Resolve(ResolveError::Missing { .. }))
        ));
    }

    #[test]
    fn remove_dependents_is_transitive() {
        let a = add_job(vec![json!(1)]);
        let b = add_job(vec![a.output().to_value()]);
        let c = add_job(vec![b.output().to_value()]);
        let (a_uuid, b_uuid, c_uuid) = (a.uuid, b.uuid, c.uuid);
        let flow = Flow::new("chain", vec![a.into(), b.into(), c.into()]).unwrap();

        let mut schedule = Schedule::new();
        schedule.ingest_flow(&flow, None).unwrap();
        schedule.take(a_uuid);
        let removed: Vec<Uuid> = schedule
            .remove_dependents(a_uuid)
            .into_iter()
            .map(|job| job.uuid)
            .collect();
        assert!(removed.contains(&b_uuid));
        assert!(removed.contains(&c_uuid));
        assert!(schedule.is_empty());
    }
}
