//! A deferred function call with a stable identity.
//!
//! Building a job never runs anything: it captures a function token plus
//! argument trees (which may embed references to other jobs' outputs) and
//! mints a uuid. The uuid never changes afterwards; replacement mints a
//! successor with the same uuid and the next index.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use skein_core::{
    find_references, resolve_tree, JobStore, OnMissing, OutputDocument, OutputReference,
    ResolveCache,
};

use crate::error::FlowError;
use crate::registry::{FunctionRegistry, FunctionToken, Invocation};
use crate::response::Response;

/// Per-job directives the Manager honours.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Resolve references embedded in args/kwargs before calling the
    /// function.
    pub resolve_references: bool,

    /// Policy for references whose outputs are absent from the store.
    pub on_missing_references: OnMissing,

    /// Opaque settings forwarded to external executors.
    #[serde(default)]
    pub manager_config: Map<String, Value>,

    /// Hand the job store to the function through its invocation.
    pub expose_store: bool,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            resolve_references: true,
            on_missing_references: OnMissing::Fail,
            manager_config: Map::new(),
            expose_store: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub uuid: Uuid,
    pub index: u32,
    pub name: String,
    pub function: FunctionToken,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    /// Declarative description of the return type; carried, not enforced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    #[serde(default)]
    pub config: JobConfig,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Uuids of the enclosing flows, outermost last.
    #[serde(default)]
    pub hosts: Vec<Uuid>,
}

impl Job {
    pub fn new(function: FunctionToken, args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        let name = function.name.clone();
        Self {
            uuid: Uuid::new_v4(),
            index: 1,
            name,
            function,
            args,
            kwargs,
            output_schema: None,
            config: JobConfig::default(),
            metadata: Map::new(),
            hosts: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_config(mut self, config: JobConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_output_schema(mut self, schema: Value) -> Self {
        self.output_schema = Some(schema);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// The canonical reference to this job's top-level result. Narrow it
    /// with [`OutputReference::attr`] / [`OutputReference::item`].
    pub fn output(&self) -> OutputReference {
        OutputReference::new(self.uuid, self.index)
    }

    /// Every reference embedded in this job's inputs.
    pub fn input_references(&self) -> Vec<OutputReference> {
        let mut found = Vec::new();
        for arg in &self.args {
            found.extend(find_references(arg));
        }
        for value in self.kwargs.values() {
            found.extend(find_references(value));
        }
        found
    }

    /// Execute the deferred call: resolve inputs, invoke the function,
    /// normalize its return into a [`Response`], persist the output
    /// document and hand the response back.
    pub fn run(
        &self,
        store: &JobStore,
        registry: &FunctionRegistry,
        cache: &mut ResolveCache,
    ) -> Result<Response, FlowError> {
        let (args, kwargs) = if self.config.resolve_references {
            let on_missing = self.config.on_missing_references;
            let args = self
                .args
                .iter()
                .map(|value| resolve_tree(value, store, on_missing, cache))
                .collect::<Result<Vec<_>, _>>()?;
            let mut kwargs = Map::with_capacity(self.kwargs.len());
            for (key, value) in &self.kwargs {
                kwargs.insert(key.clone(), resolve_tree(value, store, on_missing, cache)?);
            }
            (args, kwargs)
        } else {
            (self.args.clone(), self.kwargs.clone())
        };

        let function = registry
            .get(&self.function)
            .ok_or_else(|| FlowError::UnknownFunction {
                token: self.function.clone(),
            })?;
        let invocation = Invocation {
            args: &args,
            kwargs: &kwargs,
            store: self.config.expose_store.then_some(store),
        };
        let response = function(&invocation)
            .map_err(|source| FlowError::Execution {
                name: self.name.clone(),
                uuid: self.uuid,
                index: self.index,
                source,
            })?
            .into_response();

        let mut doc = OutputDocument::new(
            self.uuid,
            self.index,
            self.name.clone(),
            response.output.clone().unwrap_or(Value::Null),
        );
        doc.metadata = self.metadata.clone();
        doc.hosts = self.hosts.clone();
        doc.stored_data = response.stored_data.clone();
        store.put_output(&doc)?;

        Ok(response)
    }

    /// Whether this job passes the given selection filters.
    pub fn matches(&self, name_filter: Option<&str>, function_filter: Option<&FunctionToken>) -> bool {
        if let Some(fragment) = name_filter {
            if !self.name.contains(fragment) {
                return false;
            }
        }
        if let Some(token) = function_filter {
            if &self.function != token {
                return false;
            }
        }
        true
    }

    /// Deep-update this job's kwargs. With `merge`, object values are
    /// merged key by key; otherwise each updated key is replaced whole.
    /// Filters restrict the update to matching jobs; returns whether it
    /// applied.
    pub fn update_kwargs(
        &mut self,
        update: &Map<String, Value>,
        name_filter: Option<&str>,
        function_filter: Option<&FunctionToken>,
        merge: bool,
    ) -> bool {
        if !self.matches(name_filter, function_filter) {
            return false;
        }
        for (key, value) in update {
            if merge {
                merge_value(self.kwargs.entry(key.clone()).or_insert(Value::Null), value);
            } else {
                self.kwargs.insert(key.clone(), value.clone());
            }
        }
        true
    }
}

fn merge_value(target: &mut Value, update: &Value) {
    match (target, update) {
        (Value::Object(existing), Value::Object(incoming)) => {
            for (key, value) in incoming {
                merge_value(existing.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
        (slot, other) => *slot = other.clone(),
    }
}
