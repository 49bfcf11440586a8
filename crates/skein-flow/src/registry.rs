//! Function identity and lookup.
//!
//! Jobs do not own callable code; they carry a [`FunctionToken`], a
//! `(module, name)` pair that survives serialization, and the Manager
//! looks the token up in a [`FunctionRegistry`] at execution time.
//! Registration happens at startup; a token with no registration fails
//! the job, not the process.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use skein_core::JobStore;

use crate::response::Response;

/// Serializable identity of a job's function.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunctionToken {
    pub module: String,
    pub name: String,
}

impl FunctionToken {
    pub fn new(module: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for FunctionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.module, self.name)
    }
}

/// What a job function sees when called: its resolved positional and
/// keyword arguments, plus the job store when the job's config asks for
/// it.
pub struct Invocation<'a> {
    pub args: &'a [Value],
    pub kwargs: &'a Map<String, Value>,
    pub store: Option<&'a JobStore>,
}

/// What a job function returns: either a bare output value (wrapped into
/// a plain [`Response`] by the engine) or a full response carrying
/// schedule directives.
pub enum Outcome {
    Value(Value),
    Response(Response),
}

impl Outcome {
    pub fn into_response(self) -> Response {
        match self {
            Outcome::Value(value) => Response::from_value(value),
            Outcome::Response(response) => response,
        }
    }
}

impl From<Value> for Outcome {
    fn from(value: Value) -> Self {
        Outcome::Value(value)
    }
}

impl From<Response> for Outcome {
    fn from(response: Response) -> Self {
        Outcome::Response(response)
    }
}

pub type JobFn = dyn Fn(&Invocation) -> anyhow::Result<Outcome> + Send + Sync;

/// Startup-time mapping from function tokens to callables.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<FunctionToken, Arc<JobFn>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callable under `module::name` and return the token jobs
    /// should carry.
    pub fn register<F>(&mut self, module: &str, name: &str, function: F) -> FunctionToken
    where
        F: Fn(&Invocation) -> anyhow::Result<Outcome> + Send + Sync + 'static,
    {
        let token = FunctionToken::new(module, name);
        self.functions.insert(token.clone(), Arc::new(function));
        token
    }

    pub fn get(&self, token: &FunctionToken) -> Option<Arc<JobFn>> {
        self.functions.get(token).cloned()
    }

    pub fn contains(&self, token: &FunctionToken) -> bool {
        self.functions.contains_key(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tokens_round_trip_and_display() {
        let token = FunctionToken::new("math", "add");
        assert_eq!(token.to_string(), "math::add");
        let encoded = serde_json::to_value(&token).unwrap();
        let back: FunctionToken = serde_json::from_value(encoded).unwrap();
        assert_eq!(back, token);
    }

    #[test]
    fn registered_functions_are_callable_by_token() {
        let mut registry = FunctionRegistry::new();
        let token = registry.register("math", "double", |inv| {
            let x = inv.args[0].as_i64().unwrap_or(0);
            Ok(json!(x * 2).into())
        });

        let function = registry.get(&token).unwrap();
        let args = vec![json!(21)];
        let kwargs = Map::new();
        let outcome = function(&Invocation {
            args: &args,
            kwargs: &kwargs,
            store: None,
        })
        .unwrap();
        assert_eq!(outcome.into_response().output, Some(json!(42)));

        assert!(!registry.contains(&FunctionToken::new("math", "missing")));
    }
}
