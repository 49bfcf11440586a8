//! Canonical encoding of values that cross the store boundary.
//!
//! Every artifact is a JSON tree. Values that carry more type information
//! than plain JSON (datetimes, references, user-defined records) are
//! wrapped in an object with a class marker under [`CLASS_KEY`], so a
//! decoder can re-establish the original type. User classes are made known
//! through a [`Codec`] registry populated at startup.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Map, Value};
use thiserror::Error;

/// Key under which the class identifier of a wrapped value is stored.
pub const CLASS_KEY: &str = "@class";

/// Class marker for encoded datetimes.
pub const DATETIME_CLASS: &str = "Datetime";

/// Key under which a non-object payload is nested inside its wrapper.
pub const VALUE_KEY: &str = "value";

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("serialization error")]
    Serde(#[from] serde_json::Error),

    #[error("expected class '{expected}', found '{found}'")]
    ClassMismatch { expected: String, found: String },

    #[error("value carries no class marker")]
    MissingClass,

    #[error("unregistered class '{0}'")]
    UnknownClass(String),
}

/// A self-describing record: any serde type with a stable class name.
pub trait Encodable: Serialize + DeserializeOwned {
    fn class_name() -> &'static str;
}

/// Encode a record into its class-marked JSON form.
///
/// Records that serialize to an object get the marker injected in place;
/// anything else (enums serialized as strings, newtypes) is nested under
/// [`VALUE_KEY`].
pub fn encode<T: Encodable>(value: &T) -> Result<Value, CodecError> {
    let encoded = serde_json::to_value(value)?;
    Ok(match encoded {
        Value::Object(mut map) => {
            map.insert(CLASS_KEY.to_string(), json!(T::class_name()));
            Value::Object(map)
        }
        other => json!({ CLASS_KEY: T::class_name(), VALUE_KEY: other }),
    })
}

/// Invert [`encode`] for a known target type.
pub fn decode<T: Encodable>(value: &Value) -> Result<T, CodecError> {
    let map = value
        .as_object()
        .ok_or(CodecError::MissingClass)?;
    let found = class_of(map).ok_or(CodecError::MissingClass)?;
    if found != T::class_name() {
        return Err(CodecError::ClassMismatch {
            expected: T::class_name().to_string(),
            found: found.to_string(),
        });
    }
    let payload = match map.get(VALUE_KEY) {
        Some(inner) if map.len() == 2 => inner.clone(),
        _ => {
            let mut stripped = map.clone();
            stripped.remove(CLASS_KEY);
            Value::Object(stripped)
        }
    };
    Ok(serde_json::from_value(payload)?)
}

pub fn encode_datetime(value: &DateTime<Utc>) -> Value {
    json!({ CLASS_KEY: DATETIME_CLASS, VALUE_KEY: value.to_rfc3339() })
}

pub fn decode_datetime(value: &Value) -> Result<DateTime<Utc>, CodecError> {
    let map = value.as_object().ok_or(CodecError::MissingClass)?;
    let found = class_of(map).ok_or(CodecError::MissingClass)?;
    if found != DATETIME_CLASS {
        return Err(CodecError::ClassMismatch {
            expected: DATETIME_CLASS.to_string(),
            found: found.to_string(),
        });
    }
    let raw = map
        .get(VALUE_KEY)
        .and_then(Value::as_str)
        .ok_or(CodecError::MissingClass)?;
    let parsed = DateTime::parse_from_rfc3339(raw)
        .map_err(|e| CodecError::UnknownClass(format!("bad datetime '{raw}': {e}")))?;
    Ok(parsed.with_timezone(&Utc))
}

/// Returns the class marker of an encoded object, if present.
pub fn class_of(map: &Map<String, Value>) -> Option<&str> {
    map.get(CLASS_KEY).and_then(Value::as_str)
}

/// Startup-time registry of the classes a deployment knows how to decode.
///
/// The engine's own markers (references, datetimes, blob stubs) are
/// pre-registered; user records are added with [`Codec::register`]. The
/// registry's runtime job is [`Codec::check`]: verifying that a decoded
/// tree only carries known markers, so stored documents from a foreign
/// deployment fail loudly instead of leaking opaque wrappers.
#[derive(Debug, Clone)]
pub struct Codec {
    classes: HashSet<String>,
}

impl Codec {
    pub fn new() -> Self {
        let mut codec = Self {
            classes: HashSet::new(),
        };
        codec.register_name(DATETIME_CLASS);
        codec.register_name(crate::reference::REFERENCE_CLASS);
        codec.register_name(crate::store::BLOB_CLASS);
        codec
    }

    pub fn register<T: Encodable>(&mut self) {
        self.register_name(T::class_name());
    }

    pub fn register_name(&mut self, name: &str) {
        self.classes.insert(name.to_string());
    }

    pub fn is_known(&self, name: &str) -> bool {
        self.classes.contains(name)
    }

    /// Walk a tree and fail on any class marker this registry does not know.
    pub fn check(&self, value: &Value) -> Result<(), CodecError> {
        match value {
            Value::Object(map) => {
                if let Some(class) = class_of(map) {
                    if !self.is_known(class) {
                        return Err(CodecError::UnknownClass(class.to_string()));
                    }
                }
                for inner in map.values() {
                    self.check(inner)?;
                }
                Ok(())
            }
            Value::Array(items) => {
                for item in items {
                    self.check(item)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Sample {
        label: String,
        count: u32,
    }

    impl Encodable for Sample {
        fn class_name() -> &'static str {
            "Sample"
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    enum Mode {
        Fast,
        Careful,
    }

    impl Encodable for Mode {
        fn class_name() -> &'static str {
            "Mode"
        }
    }

    #[test]
    fn record_round_trip() {
        let sample = Sample {
            label: "x".to_string(),
            count: 3,
        };
        let encoded = encode(&sample).unwrap();
        assert_eq!(encoded[CLASS_KEY], "Sample");
        let decoded: Sample = decode(&encoded).unwrap();
        assert_eq!(decoded, sample);
    }

    #[test]
    fn enum_round_trip() {
        let encoded = encode(&Mode::Careful).unwrap();
        assert_eq!(encoded[VALUE_KEY], "careful");
        let decoded: Mode = decode(&encoded).unwrap();
        assert_eq!(decoded, Mode::Careful);
    }

    #[test]
    fn class_mismatch_is_rejected() {
        let sample = Sample {
            label: "x".to_string(),
            count: 3,
        };
        let encoded = encode(&sample).unwrap();
        assert!(matches!(
            decode::<Mode>(&encoded),
            Err(CodecError::ClassMismatch { .. })
        ));
    }

    #[test]
    fn datetime_round_trip() {
        let now = Utc::now();
        let decoded = decode_datetime(&encode_datetime(&now)).unwrap();
        assert_eq!(decoded, now);
    }

    #[test]
    fn registry_flags_unknown_classes() {
        let mut codec = Codec::new();
        let value = json!({
            "fine": {CLASS_KEY: DATETIME_CLASS, VALUE_KEY: "2026-01-01T00:00:00Z"},
            "bad": [{CLASS_KEY: "Mystery"}],
        });
        assert!(matches!(
            codec.check(&value),
            Err(CodecError::UnknownClass(name)) if name == "Mystery"
        ));
        codec.register_name("Mystery");
        assert!(codec.check(&value).is_ok());
    }
}
