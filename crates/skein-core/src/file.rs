//! Disk-backed document store: one JSON file per collection under a base
//! directory, read-modify-written on every put. Suited to local runs and
//! tests; real deployments plug in an external backend.

use std::fs;
use std::path::PathBuf;

use serde_json::Value;

use crate::error::StoreError;
use crate::store::{compare_values, DocumentStore, Order, Query};

#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn collection_path(&self, collection: &str) -> PathBuf {
        self.dir.join(format!("{collection}.json"))
    }

    fn read_collection(&self, collection: &str) -> Result<Vec<Value>, StoreError> {
        let path = self.collection_path(collection);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&path)?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&content)?)
    }

    fn write_collection(&self, collection: &str, docs: &[Value]) -> Result<(), StoreError> {
        let content = serde_json::to_string_pretty(docs)?;
        fs::write(self.collection_path(collection), content)?;
        Ok(())
    }
}

impl DocumentStore for FileStore {
    fn connect(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    fn put(&self, doc: Value, collection: &str) -> Result<(), StoreError> {
        let mut docs = self.read_collection(collection)?;
        docs.push(doc);
        self.write_collection(collection, &docs)
    }

    fn query(
        &self,
        query: &Query,
        sort: Option<(&str, Order)>,
        limit: Option<usize>,
        collection: &str,
    ) -> Result<Vec<Value>, StoreError> {
        let mut found: Vec<Value> = self
            .read_collection(collection)?
            .into_iter()
            .filter(|doc| query.matches(doc))
            .collect();
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn documents_survive_a_new_handle() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store.connect().unwrap();
        store.put(json!({"uuid": "u1", "index": 1}), "outputs").unwrap();
        store.put(json!({"uuid": "u1", "index": 2}), "outputs").unwrap();

        // A fresh handle over the same directory sees the same documents.
        let reopened = FileStore::new(dir.path());
        let found = reopened
            .query(
                &Query::new().eq("uuid", "u1"),
                Some(("index", Order::Desc)),
                Some(1),
                "outputs",
            )
            .unwrap();
        assert_eq!(found[0]["index"], 2);
    }

    #[test]
    fn empty_collections_read_as_empty() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store.connect().unwrap();
        assert!(store
            .query(&Query::new(), None, None, "outputs")
            .unwrap()
            .is_empty());
    }
}
