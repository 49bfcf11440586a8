//! In-memory document store, the default backend for tests and
//! short-lived runs.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;

use crate::error::StoreError;
use crate::store::{compare_values, DocumentStore, Order, Query};

#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: Mutex<HashMap<String, Vec<Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DocumentStore for MemoryStore {
    fn put(&self, doc: Value, collection: &str) -> Result<(), StoreError> {
        let mut collections = self
            .collections
            .lock()
            .map_err(|_| StoreError::Backend("store mutex poisoned".to_string()))?;
        collections.entry(collection.to_string()).or_default().push(doc);
        Ok(())
    }

    fn query(
        &self,
        query: &Query,
        sort: Option<(&str, Order)>,
        limit: Option<usize>,
        collection: &str,
    ) -> Result<Vec<Value>, StoreError> {
        let collections = self
            .collections
            .lock()
            .map_err(|_| StoreError::Backend("store mutex poisoned".to_string()))?;
        let mut found: Vec<Value> = collections
            .get(collection)
            .map(|docs| docs.iter().filter(|doc| query.matches(doc)).cloned().collect())
            .unwrap_or_default();
        if let Some((field, order)) = sort {
            found.sort_by(|a, b| {
                let ordering = compare_values(
                    a.get(field).unwrap_or(&Value::Null),
                    b.get(field).unwrap_or(&Value::Null),
                );
                match order {
                    Order::Asc => ordering,
                    Order::Desc => ordering.reverse(),
                }
            });
        }
        if let Some(limit) = limit {
            found.truncate(limit);
        }
        Ok(found)
    }
}
