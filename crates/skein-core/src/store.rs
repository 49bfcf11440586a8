//! The composite job-output store.
//!
//! Backends implement the small [`DocumentStore`] contract; the engine
//! talks to a [`JobStore`], which owns one docs store plus a set of named
//! auxiliary stores. Configured sub-fields of an output are routed into
//! auxiliary stores on write (leaving a stub behind) and spliced back in
//! on read, so large payloads never sit in the primary collection.

use std::collections::HashMap;

use serde_json::{json, Value};
use uuid::Uuid;

use crate::codec::{class_of, CLASS_KEY};
use crate::document::OutputDocument;
use crate::error::{ResolveError, StoreError};
use crate::reference::{resolve_tree, OnMissing};

/// Collection holding output documents.
pub const OUTPUTS: &str = "outputs";

/// Collection holding routed blobs inside an auxiliary store.
pub const BLOBS: &str = "blobs";

/// Class marker for the stub left behind when a subtree is routed away.
pub const BLOB_CLASS: &str = "BlobStub";

/// Sort direction for [`DocumentStore::query`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

/// A top-level field-equality query.
#[derive(Debug, Clone, Default)]
pub struct Query {
    fields: Vec<(String, Value)>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.push((field.into(), value.into()));
        self
    }

    pub fn matches(&self, doc: &Value) -> bool {
        self.fields
            .iter()
            .all(|(field, expected)| doc.get(field) == Some(expected))
    }
}

/// The abstract document store the engine consumes. Disk, database and
/// object-store backends live outside this crate; [`put`] is assumed
/// atomic per document.
///
/// [`put`]: DocumentStore::put
pub trait DocumentStore: Send + Sync {
    fn connect(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn put(&self, doc: Value, collection: &str) -> Result<(), StoreError>;

    fn query(
        &self,
        query: &Query,
        sort: Option<(&str, Order)>,
        limit: Option<usize>,
        collection: &str,
    ) -> Result<Vec<Value>, StoreError>;

    fn get_one(&self, query: &Query, collection: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.query(query, None, Some(1), collection)?.pop())
    }

    fn ensure_index(&self, _field: &str, _collection: &str) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Compare two JSON values for sorting: numbers numerically, strings
/// lexicographically, anything else equal.
pub(crate) fn compare_values(a: &Value, b: &Value) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => Ordering::Equal,
    }
}

/// Run-scoped memo of resolved outputs, keyed by `(uuid, index)`.
#[derive(Debug, Default)]
pub struct ResolveCache {
    entries: HashMap<(Uuid, u32), Value>,
}

impl ResolveCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, uuid: Uuid, index: u32) -> Option<&Value> {
        self.entries.get(&(uuid, index))
    }

    pub fn insert(&mut self, uuid: Uuid, index: u32, output: Value) {
        self.entries.insert((uuid, index), output);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

struct BlobRoute {
    /// Dot-separated path inside the output subtree.
    path: String,
    /// Name of the auxiliary store the subtree is routed to.
    store: String,
}

/// One docs store plus field-routed auxiliary stores.
pub struct JobStore {
    docs: Box<dyn DocumentStore>,
    routes: Vec<BlobRoute>,
    auxiliary: HashMap<String, Box<dyn DocumentStore>>,
}

impl JobStore {
    pub fn new(docs: Box<dyn DocumentStore>) -> Self {
        Self {
            docs,
            routes: Vec::new(),
            auxiliary: HashMap::new(),
        }
    }

    /// Route the output subtree at `field_path` into the named auxiliary
    /// store. Routes apply in registration order on every write.
    pub fn with_additional(
        mut self,
        field_path: impl Into<String>,
        name: impl Into<String>,
        store: Box<dyn DocumentStore>,
    ) -> Self {
        let name = name.into();
        self.routes.push(BlobRoute {
            path: field_path.into(),
            store: name.clone(),
        });
        self.auxiliary.insert(name, store);
        self
    }

    pub fn connect(&self) -> Result<(), StoreError> {
        self.docs.connect()?;
        self.docs.ensure_index("uuid", OUTPUTS)?;
        for store in self.auxiliary.values() {
            store.connect()?;
        }
        Ok(())
    }

    pub fn close(&self) -> Result<(), StoreError> {
        self.docs.close()?;
        for store in self.auxiliary.values() {
            store.close()?;
        }
        Ok(())
    }

    /// Write an output document, routing configured sub-fields away first.
    pub fn put_output(&self, doc: &OutputDocument) -> Result<(), StoreError> {
        let mut value = serde_json::to_value(doc)?;
        if let Some(output) = value.get_mut("output") {
            self.split_output(output)?;
        }
        self.docs.put(value, OUTPUTS)
    }

    fn split_output(&self, output: &mut Value) -> Result<(), StoreError> {
        for route in &self.routes {
            let Some(slot) = locate_mut(output, &route.path) else {
                continue;
            };
            let payload = slot.take();
            let store = self
                .auxiliary
                .get(&route.store)
                .ok_or_else(|| StoreError::UnknownStore(route.store.clone()))?;
            let blob_uuid = Uuid::new_v4();
            store.put(json!({ "blob_uuid": blob_uuid, "data": payload }), BLOBS)?;
            *slot = json!({
                CLASS_KEY: BLOB_CLASS,
                "blob_uuid": blob_uuid,
                "store": route.store,
            });
        }
        Ok(())
    }

    /// The latest stored document for a uuid, as a typed record. With
    /// `load` the output subtree is re-assembled from the auxiliary
    /// stores; without it, routed fields stay as stubs.
    pub fn get_output_doc(
        &self,
        uuid: Uuid,
        load: bool,
    ) -> Result<Option<OutputDocument>, StoreError> {
        let found = self.docs.query(
            &Query::new().eq("uuid", uuid.to_string()),
            Some(("index", Order::Desc)),
            Some(1),
            OUTPUTS,
        )?;
        let Some(mut raw) = found.into_iter().next() else {
            return Ok(None);
        };
        if load {
            if let Some(output) = raw.get_mut("output") {
                self.hydrate(output)?;
            }
        }
        Ok(Some(serde_json::from_value(raw)?))
    }

    /// The document at a specific index, shadowed or not. Replaced jobs
    /// leave their predecessors in the store; this reads past the default
    /// latest-index lookup.
    pub fn get_output_doc_at(
        &self,
        uuid: Uuid,
        index: u32,
        load: bool,
    ) -> Result<Option<OutputDocument>, StoreError> {
        let found = self.docs.get_one(
            &Query::new().eq("uuid", uuid.to_string()).eq("index", index),
            OUTPUTS,
        )?;
        let Some(mut raw) = found else {
            return Ok(None);
        };
        if load {
            if let Some(output) = raw.get_mut("output") {
                self.hydrate(output)?;
            }
        }
        Ok(Some(serde_json::from_value(raw)?))
    }

    /// Resolve the latest output value for a uuid.
    ///
    /// With `load`, stubs are re-hydrated and references embedded in the
    /// output are themselves resolved (aggregation outputs may point at
    /// further outputs; the recursion is finite because references form a
    /// DAG), and the result is memoized in `cache` by `(uuid, index)`.
    ///
    /// `Ok(None)` means the uuid has no stored output and `on_missing`
    /// permits that; the `Fail` policy turns the miss into an error here.
    pub fn get_output(
        &self,
        uuid: Uuid,
        on_missing: OnMissing,
        cache: &mut ResolveCache,
        load: bool,
    ) -> Result<Option<Value>, ResolveError> {
        let found = self.docs.query(
            &Query::new().eq("uuid", uuid.to_string()),
            Some(("index", Order::Desc)),
            Some(1),
            OUTPUTS,
        )?;
        let Some(mut raw) = found.into_iter().next() else {
            return match on_missing {
                OnMissing::Fail => Err(ResolveError::Missing { uuid }),
                _ => Ok(None),
            };
        };
        let index = raw
            .get("index")
            .and_then(Value::as_u64)
            .ok_or_else(|| ResolveError::Malformed(format!("document for {uuid} has no index")))?
            as u32;
        let mut output = raw
            .get_mut("output")
            .map(Value::take)
            .unwrap_or(Value::Null);
        if !load {
            return Ok(Some(output));
        }
        if let Some(hit) = cache.get(uuid, index) {
            return Ok(Some(hit.clone()));
        }
        self.hydrate(&mut output)?;
        let resolved = resolve_tree(&output, self, on_missing, cache)?;
        cache.insert(uuid, index, resolved.clone());
        Ok(Some(resolved))
    }

    fn hydrate(&self, value: &mut Value) -> Result<(), StoreError> {
        if let Some((store_name, blob_uuid)) = blob_stub(value)? {
            let store = self
                .auxiliary
                .get(&store_name)
                .ok_or_else(|| StoreError::UnknownStore(store_name.clone()))?;
            let found = store.get_one(
                &Query::new().eq("blob_uuid", blob_uuid.to_string()),
                BLOBS,
            )?;
            let mut blob = found.ok_or(StoreError::MissingBlob {
                blob_uuid,
                store: store_name,
            })?;
            *value = blob
                .get_mut("data")
                .map(Value::take)
                .unwrap_or(Value::Null);
            return Ok(());
        }
        match value {
            Value::Object(map) => {
                for inner in map.values_mut() {
                    self.hydrate(inner)?;
                }
            }
            Value::Array(items) => {
                for item in items {
                    self.hydrate(item)?;
                }
            }
            _ => {}
        }
        Ok(())
    }
}

fn blob_stub(value: &Value) -> Result<Option<(String, Uuid)>, StoreError> {
    let Some(map) = value.as_object() else {
        return Ok(None);
    };
    if class_of(map) != Some(BLOB_CLASS) {
        return Ok(None);
    }
    let store = map
        .get("store")
        .and_then(Value::as_str)
        .ok_or_else(|| StoreError::Backend("blob stub without a store name".to_string()))?;
    let blob_uuid = map
        .get("blob_uuid")
        .and_then(Value::as_str)
        .and_then(|raw| Uuid::parse_str(raw).ok())
        .ok_or_else(|| StoreError::Backend("blob stub without a blob uuid".to_string()))?;
    Ok(Some((store.to_string(), blob_uuid)))
}

fn locate_mut<'a>(value: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    let mut current = value;
    for part in path.split('.') {
        current = current.as_object_mut()?.get_mut(part)?;
    }
    Some(current)
}
