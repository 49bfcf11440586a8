//! The directive a running job hands back to the engine.
//!
//! Besides its output, a job may reshape the rest of the run: replace its
//! own unborn successors, detour its dependents through extra work, or
//! append unrelated work. Those three are mutually exclusive by
//! construction: [`Directive`] is a sum type, so a response cannot carry
//! a replace and a detour at once.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::flow::Flow;
use crate::job::Job;

/// New work carried by a directive: a single job or a whole flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Graft {
    Job(Job),
    Flow(Flow),
}

impl From<Job> for Graft {
    fn from(job: Job) -> Self {
        Graft::Job(job)
    }
}

impl From<Flow> for Graft {
    fn from(flow: Flow) -> Self {
        Graft::Flow(flow)
    }
}

/// How a response reshapes the remaining schedule.
///
/// `Replace` and `Detour` both graft work whose leaf takes over the
/// current job's uuid at the next index, so downstream references resolve
/// to the new work. `Addition` appends without touching any wiring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Directive {
    Replace(Graft),
    Detour(Graft),
    Addition(Graft),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Response {
    /// The value persisted as the job's output document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directive: Option<Directive>,

    /// Auxiliary data persisted alongside the output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stored_data: Option<Value>,

    /// Skip every not-yet-started job that transitively depends on this
    /// one.
    #[serde(default)]
    pub stop_children: bool,

    /// Terminate the whole run after this job.
    #[serde(default)]
    pub stop_jobflow: bool,
}

impl Response {
    pub fn new() -> Self {
        Self::default()
    }

    /// A plain response carrying only an output value.
    pub fn from_value(output: impl Into<Value>) -> Self {
        Self {
            output: Some(output.into()),
            ..Self::default()
        }
    }

    pub fn replace(graft: impl Into<Graft>) -> Self {
        Self {
            directive: Some(Directive::Replace(graft.into())),
            ..Self::default()
        }
    }

    pub fn detour(graft: impl Into<Graft>) -> Self {
        Self {
            directive: Some(Directive::Detour(graft.into())),
            ..Self::default()
        }
    }

    pub fn addition(graft: impl Into<Graft>) -> Self {
        Self {
            directive: Some(Directive::Addition(graft.into())),
            ..Self::default()
        }
    }

    pub fn with_output(mut self, output: impl Into<Value>) -> Self {
        self.output = Some(output.into());
        self
    }

    pub fn with_stored_data(mut self, data: impl Into<Value>) -> Self {
        self.stored_data = Some(data.into());
        self
    }

    pub fn with_stop_children(mut self) -> Self {
        self.stop_children = true;
        self
    }

    pub fn with_stop_jobflow(mut self) -> Self {
        self.stop_jobflow = true;
        self
    }
}
