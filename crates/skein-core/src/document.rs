//! The persisted shape of a completed job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// One completed execution of a job, stored in the `outputs` collection.
///
/// The primary lookup key is `(uuid, index)`; "the output of a uuid" means
/// the document with the largest index, so replacements shadow their
/// predecessors without deleting them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputDocument {
    pub uuid: Uuid,
    pub index: u32,
    pub output: Value,
    pub completed_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub hosts: Vec<Uuid>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stored_data: Option<Value>,
}

impl OutputDocument {
    pub fn new(uuid: Uuid, index: u32, name: impl Into<String>, output: Value) -> Self {
        Self {
            uuid,
            index,
            output,
            completed_at: Utc::now(),
            metadata: Map::new(),
            hosts: Vec::new(),
            name: name.into(),
            stored_data: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serde_round_trip() {
        let mut doc = OutputDocument::new(Uuid::new_v4(), 2, "make-things", json!({"x": 4}));
        doc.hosts = vec![Uuid::new_v4()];
        doc.stored_data = Some(json!({"trace": [1, 2]}));
        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(value["index"], 2);
        let back: OutputDocument = serde_json::from_value(value).unwrap();
        assert_eq!(back, doc);
    }
}
