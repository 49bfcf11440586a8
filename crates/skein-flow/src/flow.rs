//! Composable collections of jobs.
//!
//! A flow nests jobs and other flows to any depth, carries its own uuid,
//! and may expose an output expression: an arbitrary JSON shape whose
//! embedded references downstream jobs consume exactly like a single
//! reference. Flows are data; the Manager walks them into a schedule.

use std::collections::{BTreeSet, HashMap, HashSet};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use skein_core::{find_references, rename_references};

use crate::error::FlowError;
use crate::job::Job;
use crate::registry::FunctionToken;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FlowMember {
    Job(Job),
    Flow(Flow),
}

impl From<Job> for FlowMember {
    fn from(job: Job) -> Self {
        FlowMember::Job(job)
    }
}

impl From<Flow> for FlowMember {
    fn from(flow: Flow) -> Self {
        FlowMember::Flow(flow)
    }
}

/// Whether execution order comes from the dependency graph or from
/// declaration order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionOrder {
    #[default]
    Auto,
    Linear,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub uuid: Uuid,
    pub name: String,
    members: Vec<FlowMember>,
    /// Output expression: a JSON shape embedding references to member
    /// jobs. Resolved at read time, never stored as its own document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default)]
    pub order: ExecutionOrder,
    /// Uuids of the enclosing flows, outermost last.
    #[serde(default)]
    pub hosts: Vec<Uuid>,
}

impl Flow {
    /// Build a flow from jobs and sub-flows, stamping this flow's uuid
    /// onto every transitive member. Rejects duplicate uuids anywhere in
    /// the transitive closure.
    pub fn new(
        name: impl Into<String>,
        members: Vec<FlowMember>,
    ) -> Result<Self, FlowError> {
        let mut flow = Self {
            uuid: Uuid::new_v4(),
            name: name.into(),
            members,
            output: None,
            order: ExecutionOrder::Auto,
            hosts: Vec::new(),
        };
        let chain = [flow.uuid];
        for member in &mut flow.members {
            stamp_hosts(member, &chain);
        }
        flow.check_duplicates()?;
        Ok(flow)
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_order(mut self, order: ExecutionOrder) -> Self {
        self.order = order;
        self
    }

    pub fn members(&self) -> &[FlowMember] {
        &self.members
    }

    /// Append a member after construction, with the same stamping and
    /// duplicate check as [`Flow::new`].
    pub fn add(&mut self, member: impl Into<FlowMember>) -> Result<(), FlowError> {
        let mut member = member.into();
        let incoming = member_uuids(&member);
        let existing: HashSet<Uuid> = self.closure_uuids().into_iter().collect();
        if let Some(duplicate) = incoming.iter().find(|uuid| existing.contains(uuid)) {
            return Err(FlowError::Duplicate {
                uuid: *duplicate,
                name: self.name.clone(),
            });
        }
        let mut chain = vec![self.uuid];
        chain.extend_from_slice(&self.hosts);
        stamp_hosts(&mut member, &chain);
        self.members.push(member);
        Ok(())
    }

    /// Every uuid in the transitive closure, this flow's own included.
    pub fn closure_uuids(&self) -> Vec<Uuid> {
        let mut found = Vec::new();
        self.collect_uuids(&mut found);
        found
    }

    fn collect_uuids(&self, found: &mut Vec<Uuid>) {
        found.push(self.uuid);
        for member in &self.members {
            match member {
                FlowMember::Job(job) => found.push(job.uuid),
                FlowMember::Flow(flow) => flow.collect_uuids(found),
            }
        }
    }

    fn check_duplicates(&self) -> Result<(), FlowError> {
        let mut seen = HashSet::new();
        for uuid in self.closure_uuids() {
            if !seen.insert(uuid) {
                return Err(FlowError::Duplicate {
                    uuid,
                    name: self.name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Jobs of the transitive closure in declaration order.
    pub fn jobs(&self) -> Vec<&Job> {
        let mut found = Vec::new();
        self.collect_jobs(&mut found);
        found
    }

    fn collect_jobs<'a>(&'a self, found: &mut Vec<&'a Job>) {
        for member in &self.members {
            match member {
                FlowMember::Job(job) => found.push(job),
                FlowMember::Flow(flow) => flow.collect_jobs(found),
            }
        }
    }

    /// This flow plus every transitive sub-flow, outermost first.
    pub fn flows(&self) -> Vec<&Flow> {
        let mut found = Vec::new();
        self.collect_flows(&mut found);
        found
    }

    fn collect_flows<'a>(&'a self, found: &mut Vec<&'a Flow>) {
        found.push(self);
        for member in &self.members {
            if let FlowMember::Flow(flow) = member {
                flow.collect_flows(found);
            }
        }
    }

    /// Adjacency export over the transitive closure: an edge `A -> B`
    /// exists iff a reference in B's inputs carries A's uuid. References
    /// to a sub-flow's uuid depend on every job inside that sub-flow.
    pub fn graph(&self) -> HashMap<Uuid, HashSet<Uuid>> {
        let jobs = self.jobs();
        let job_uuids: HashSet<Uuid> = jobs.iter().map(|job| job.uuid).collect();
        let flow_jobs: HashMap<Uuid, Vec<Uuid>> = self
            .flows()
            .into_iter()
            .map(|flow| (flow.uuid, flow.jobs().iter().map(|job| job.uuid).collect()))
            .collect();

        let mut adjacency: HashMap<Uuid, HashSet<Uuid>> =
            jobs.iter().map(|job| (job.uuid, HashSet::new())).collect();
        for job in &jobs {
            for reference in job.input_references() {
                if reference.uuid == job.uuid {
                    continue;
                }
                if job_uuids.contains(&reference.uuid) {
                    adjacency
                        .entry(reference.uuid)
                        .or_default()
                        .insert(job.uuid);
                } else if let Some(members) = flow_jobs.get(&reference.uuid) {
                    for member in members {
                        if *member != job.uuid {
                            adjacency.entry(*member).or_default().insert(job.uuid);
                        }
                    }
                }
            }
        }
        adjacency
    }

    /// Jobs in execution order: declaration order for `Linear`, a stable
    /// topological order (ties by declaration) for `Auto`.
    pub fn ordered_jobs(&self) -> Result<Vec<&Job>, FlowError> {
        let jobs = self.jobs();
        if self.order == ExecutionOrder::Linear {
            return Ok(jobs);
        }

        let adjacency = self.graph();
        let mut graph: DiGraph<Uuid, ()> = DiGraph::new();
        let mut nodes: HashMap<Uuid, NodeIndex> = HashMap::with_capacity(jobs.len());
        for job in &jobs {
            nodes.insert(job.uuid, graph.add_node(job.uuid));
        }
        for (from, successors) in &adjacency {
            for to in successors {
                graph.add_edge(nodes[from], nodes[to], ());
            }
        }

        let position: HashMap<Uuid, usize> = jobs
            .iter()
            .enumerate()
            .map(|(at, job)| (job.uuid, at))
            .collect();
        let mut indegree: HashMap<Uuid, usize> = jobs
            .iter()
            .map(|job| {
                let incoming = graph
                    .neighbors_directed(nodes[&job.uuid], Direction::Incoming)
                    .count();
                (job.uuid, incoming)
            })
            .collect();
        let mut ready: BTreeSet<(usize, Uuid)> = indegree
            .iter()
            .filter(|(_, &incoming)| incoming == 0)
            .map(|(uuid, _)| (position[uuid], *uuid))
            .collect();

        let mut order = Vec::with_capacity(jobs.len());
        while let Some(&(at, uuid)) = ready.iter().next() {
            ready.remove(&(at, uuid));
            order.push(uuid);
            for successor in graph.neighbors_directed(nodes[&uuid], Direction::Outgoing) {
                let succ_uuid = graph[successor];
                if let Some(incoming) = indegree.get_mut(&succ_uuid) {
                    *incoming -= 1;
                    if *incoming == 0 {
                        ready.insert((position[&succ_uuid], succ_uuid));
                    }
                }
            }
        }
        if order.len() != jobs.len() {
            return Err(FlowError::Cycle(self.name.clone()));
        }

        let by_uuid: HashMap<Uuid, &Job> = jobs.iter().map(|job| (job.uuid, *job)).collect();
        Ok(order.into_iter().map(|uuid| by_uuid[&uuid]).collect())
    }

    /// The job whose output stands for the whole flow when it is grafted
    /// over an existing uuid: the single producer of the output
    /// expression when there is exactly one, otherwise the last job in
    /// declaration order.
    pub fn leaf_uuid(&self) -> Option<Uuid> {
        let jobs = self.jobs();
        if let Some(output) = &self.output {
            let mut producers: Vec<Uuid> = find_references(output)
                .into_iter()
                .map(|reference| reference.uuid)
                .collect();
            producers.sort_unstable();
            producers.dedup();
            if producers.len() == 1 && jobs.iter().any(|job| job.uuid == producers[0]) {
                return Some(producers[0]);
            }
        }
        jobs.last().map(|job| job.uuid)
    }

    /// Point every occurrence of `old` (job identities, references in
    /// member inputs and in output expressions) at `new`.
    pub fn rename_uuid(&mut self, old: Uuid, new: Uuid) {
        for member in &mut self.members {
            rename_member(member, old, new);
        }
        if let Some(output) = self.output.take() {
            self.output = Some(rename_references(&output, old, new));
        }
    }

    /// Overwrite the index of the job carrying `uuid`, if present.
    pub fn set_job_index(&mut self, uuid: Uuid, index: u32) {
        for member in &mut self.members {
            match member {
                FlowMember::Job(job) if job.uuid == uuid => job.index = index,
                FlowMember::Job(_) => {}
                FlowMember::Flow(flow) => flow.set_job_index(uuid, index),
            }
        }
    }

    /// Deep-update kwargs across every job in the closure that passes the
    /// filters. Returns how many jobs were updated.
    pub fn update_kwargs(
        &mut self,
        update: &Map<String, Value>,
        name_filter: Option<&str>,
        function_filter: Option<&FunctionToken>,
        merge: bool,
    ) -> usize {
        let mut applied = 0;
        for member in &mut self.members {
            match member {
                FlowMember::Job(job) => {
                    if job.update_kwargs(update, name_filter, function_filter, merge) {
                        applied += 1;
                    }
                }
                FlowMember::Flow(flow) => {
                    applied += flow.update_kwargs(update, name_filter, function_filter, merge);
                }
            }
        }
        applied
    }
}

fn stamp_hosts(member: &mut FlowMember, chain: &[Uuid]) {
    match member {
        FlowMember::Job(job) => job.hosts.extend_from_slice(chain),
        FlowMember::Flow(flow) => {
            flow.hosts.extend_from_slice(chain);
            for inner in &mut flow.members {
                stamp_hosts(inner, chain);
            }
        }
    }
}

fn member_uuids(member: &FlowMember) -> Vec<Uuid> {
    match member {
        FlowMember::Job(job) => vec![job.uuid],
        FlowMember::Flow(flow) => flow.closure_uuids(),
    }
}

fn rename_member(member: &mut FlowMember, old: Uuid, new: Uuid) {
    match member {
        FlowMember::Job(job) => {
            if job.uuid == old {
                job.uuid = new;
            }
            job.args = job
                .args
                .iter()
                .map(|value| rename_references(value, old, new))
                .collect();
            let kwargs: Map<String, Value> = job
                .kwargs
                .iter()
                .map(|(key, value)| (key.clone(), rename_references(value, old, new)))
                .collect();
            job.kwargs = kwargs;
        }
        FlowMember::Flow(flow) => flow.rename_uuid(old, new),
    }
}
