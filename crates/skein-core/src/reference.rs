//! Symbolic references to job outputs.
//!
//! An [`OutputReference`] stands in for the output of a job that may not
//! have run yet. References are plain data: appending a selector builds a
//! new reference and never touches a store. Resolution happens explicitly,
//! against a [`JobStore`](crate::store::JobStore), and always picks the
//! document with the largest stored index for the referenced uuid.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::codec::{class_of, CLASS_KEY};
use crate::error::ResolveError;
use crate::store::{JobStore, ResolveCache};

/// Class marker for encoded references.
pub const REFERENCE_CLASS: &str = "OutputReference";

/// Subscript key for an [`Selector::Item`] selector.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ItemKey {
    /// Ordered-sequence index; negative counts from the back.
    Index(i64),
    /// Mapping key.
    Key(String),
}

impl From<i64> for ItemKey {
    fn from(value: i64) -> Self {
        ItemKey::Index(value)
    }
}

impl From<i32> for ItemKey {
    fn from(value: i32) -> Self {
        ItemKey::Index(value as i64)
    }
}

impl From<usize> for ItemKey {
    fn from(value: usize) -> Self {
        ItemKey::Index(value as i64)
    }
}

impl From<&str> for ItemKey {
    fn from(value: &str) -> Self {
        ItemKey::Key(value.to_string())
    }
}

impl From<String> for ItemKey {
    fn from(value: String) -> Self {
        ItemKey::Key(value)
    }
}

/// One step of a reference's selector path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Selector {
    Attr(String),
    Item(ItemKey),
}

impl Selector {
    fn encode(&self) -> Value {
        match self {
            Selector::Attr(name) => json!({ "attr": name }),
            Selector::Item(ItemKey::Index(i)) => json!({ "item": i }),
            Selector::Item(ItemKey::Key(k)) => json!({ "item": k }),
        }
    }

    fn decode(value: &Value) -> Result<Self, ResolveError> {
        let map = value
            .as_object()
            .ok_or_else(|| ResolveError::Malformed("selector is not an object".to_string()))?;
        if let Some(attr) = map.get("attr") {
            let name = attr
                .as_str()
                .ok_or_else(|| ResolveError::Malformed("attr selector must be a string".to_string()))?;
            return Ok(Selector::Attr(name.to_string()));
        }
        match map.get("item") {
            Some(Value::String(key)) => Ok(Selector::Item(ItemKey::Key(key.clone()))),
            Some(item) => {
                let index = item.as_i64().ok_or_else(|| {
                    ResolveError::Malformed("item selector must be a string or integer".to_string())
                })?;
                Ok(Selector::Item(ItemKey::Index(index)))
            }
            None => Err(ResolveError::Malformed(
                "selector carries neither 'attr' nor 'item'".to_string(),
            )),
        }
    }

    fn describe(&self) -> String {
        match self {
            Selector::Attr(name) => format!(".{name}"),
            Selector::Item(ItemKey::Index(i)) => format!("[{i}]"),
            Selector::Item(ItemKey::Key(k)) => format!("[{k:?}]"),
        }
    }
}

/// Policy applied when a referenced output is absent from the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnMissing {
    /// Raise a resolution error.
    #[default]
    Fail,
    /// Return the reference unchanged, in encoded form.
    PassThrough,
    /// Substitute JSON null.
    Null,
}

/// A resolvable handle to the output of a specific `(uuid, index)` job,
/// optionally narrowed by a selector path into the stored value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OutputReference {
    pub uuid: Uuid,
    pub index: u32,
    pub path: Vec<Selector>,
}

impl OutputReference {
    pub fn new(uuid: Uuid, index: u32) -> Self {
        Self {
            uuid,
            index,
            path: Vec::new(),
        }
    }

    /// Narrow the reference by an attribute name. Builds a new reference;
    /// no lookup happens until [`OutputReference::resolve`].
    pub fn attr(&self, name: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.path.push(Selector::Attr(name.into()));
        next
    }

    /// Narrow the reference by a subscript (sequence index or mapping key).
    pub fn item(&self, key: impl Into<ItemKey>) -> Self {
        let mut next = self.clone();
        next.path.push(Selector::Item(key.into()));
        next
    }

    /// Copy of this reference pointing at a different uuid. Used when a
    /// grafted flow takes over the uuid of the job it stands in for.
    pub fn with_uuid(&self, uuid: Uuid) -> Self {
        let mut next = self.clone();
        next.uuid = uuid;
        next
    }

    /// The canonical encoded form carried inside argument trees.
    pub fn to_value(&self) -> Value {
        json!({
            CLASS_KEY: REFERENCE_CLASS,
            "uuid": self.uuid,
            "index": self.index,
            "attributes": self.path.iter().map(Selector::encode).collect::<Vec<_>>(),
        })
    }

    /// Whether the value is an encoded reference.
    pub fn is_reference(value: &Value) -> bool {
        value
            .as_object()
            .and_then(class_of)
            .map(|class| class == REFERENCE_CLASS)
            .unwrap_or(false)
    }

    /// Decode the canonical form. Fails on structurally broken encodings;
    /// returns `Ok(None)` for values that are not references at all.
    pub fn from_value(value: &Value) -> Result<Option<Self>, ResolveError> {
        let map = match value.as_object() {
            Some(map) if class_of(map) == Some(REFERENCE_CLASS) => map,
            _ => return Ok(None),
        };
        let uuid = map
            .get("uuid")
            .and_then(Value::as_str)
            .and_then(|raw| Uuid::parse_str(raw).ok())
            .ok_or_else(|| ResolveError::Malformed("reference without a uuid".to_string()))?;
        let index = map
            .get("index")
            .and_then(Value::as_u64)
            .ok_or_else(|| ResolveError::Malformed("reference without an index".to_string()))?
            as u32;
        let path = map
            .get("attributes")
            .and_then(Value::as_array)
            .map(|items| items.iter().map(Selector::decode).collect::<Result<Vec<_>, _>>())
            .transpose()?
            .unwrap_or_default();
        Ok(Some(Self { uuid, index, path }))
    }

    /// Look up the latest output for this uuid and apply the selector path
    /// left to right. Lookup misses follow `on_missing`; a selector that
    /// does not apply to the stored value is always an error.
    pub fn resolve(
        &self,
        store: &JobStore,
        on_missing: OnMissing,
        cache: &mut ResolveCache,
    ) -> Result<Value, ResolveError> {
        let mut current = match store.get_output(self.uuid, on_missing, cache, true)? {
            Some(output) => output,
            None => {
                return Ok(match on_missing {
                    OnMissing::PassThrough => self.to_value(),
                    _ => Value::Null,
                })
            }
        };
        for selector in &self.path {
            current = self.select(selector, &current)?;
        }
        Ok(current)
    }

    fn select(&self, selector: &Selector, value: &Value) -> Result<Value, ResolveError> {
        let bad_path = || ResolveError::BadPath {
            uuid: self.uuid,
            selector: selector.describe(),
        };
        match selector {
            Selector::Attr(name) => value
                .as_object()
                .and_then(|map| map.get(name))
                .cloned()
                .ok_or_else(bad_path),
            Selector::Item(ItemKey::Key(key)) => value
                .as_object()
                .and_then(|map| map.get(key))
                .cloned()
                .ok_or_else(bad_path),
            Selector::Item(ItemKey::Index(index)) => match value {
                Value::Array(items) => {
                    let len = items.len() as i64;
                    let at = if *index < 0 { len + index } else { *index };
                    if at < 0 || at >= len {
                        return Err(bad_path());
                    }
                    Ok(items[at as usize].clone())
                }
                // Mapping subscripted by an integer key.
                Value::Object(map) => map.get(&index.to_string()).cloned().ok_or_else(bad_path),
                _ => Err(bad_path()),
            },
        }
    }
}

/// Collect every reference embedded anywhere in a value tree, in
/// depth-first order. Malformed encodings are skipped; they surface as
/// errors at resolution time instead.
pub fn find_references(value: &Value) -> Vec<OutputReference> {
    let mut found = Vec::new();
    collect_references(value, &mut found);
    found
}

fn collect_references(value: &Value, found: &mut Vec<OutputReference>) {
    if let Ok(Some(reference)) = OutputReference::from_value(value) {
        found.push(reference);
        return;
    }
    match value {
        Value::Object(map) => {
            for inner in map.values() {
                collect_references(inner, found);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_references(item, found);
            }
        }
        _ => {}
    }
}

/// Walk a value tree and substitute every embedded reference with its
/// resolved value.
pub fn resolve_tree(
    value: &Value,
    store: &JobStore,
    on_missing: OnMissing,
    cache: &mut ResolveCache,
) -> Result<Value, ResolveError> {
    if let Some(reference) = OutputReference::from_value(value)? {
        return reference.resolve(store, on_missing, cache);
    }
    match value {
        Value::Object(map) => {
            let mut resolved = Map::with_capacity(map.len());
            for (key, inner) in map {
                resolved.insert(key.clone(), resolve_tree(inner, store, on_missing, cache)?);
            }
            Ok(Value::Object(resolved))
        }
        Value::Array(items) => {
            let mut resolved = Vec::with_capacity(items.len());
            for item in items {
                resolved.push(resolve_tree(item, store, on_missing, cache)?);
            }
            Ok(Value::Array(resolved))
        }
        other => Ok(other.clone()),
    }
}

/// Rewrite every reference to `old` so it points at `new`, leaving the
/// rest of the tree untouched. Used while grafting a flow over an
/// existing job's uuid.
pub fn rename_references(value: &Value, old: Uuid, new: Uuid) -> Value {
    if let Ok(Some(reference)) = OutputReference::from_value(value) {
        if reference.uuid == old {
            return reference.with_uuid(new).to_value();
        }
        return value.clone();
    }
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, inner)| (key.clone(), rename_references(inner, old, new)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| rename_references(item, old, new))
                .collect(),
        ),
        other => other.clone(),
    }
}
