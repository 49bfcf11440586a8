//! Deferred-call workflows: jobs, composable flows, runtime directives
//! and the single-threaded execution engine that drives them against a
//! job-output store.

pub mod error;
pub mod flow;
pub mod job;
pub mod logging;
pub mod manager;
pub mod registry;
pub mod response;
pub mod updates;

pub use error::FlowError;
pub use flow::{ExecutionOrder, Flow, FlowMember};
pub use job::{Job, JobConfig};
pub use logging::RunLogger;
pub use manager::{Manager, ManagerOptions, RunOutcome};
pub use registry::{FunctionRegistry, FunctionToken, Invocation, Outcome};
pub use response::{Directive, Graft, Response};
pub use updates::{JobState, RunUpdate};
