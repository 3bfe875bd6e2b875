//! Document type stored in collections.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Result, SoloError, Value};

/// Field name of the primary key every stored document carries.
pub const ID_FIELD: &str = "_id";

/// A database document: an ordered map of field names to [`Value`]s.
///
/// Documents are the unit of storage. The engine requires every stored
/// document to carry an `_id` field that is not Null and not one of the
/// MinValue/MaxValue sentinels; `_id` is generated on insert when missing.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Document {
    fields: BTreeMap<String, Value>,
}

impl Document {
    /// Create an empty document.
    pub fn new() -> Self {
        Self {
            fields: BTreeMap::new(),
        }
    }

    /// Get a field value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Resolve a dotted path such as `address.city`. Missing segments and
    /// traversal through non-objects yield `Value::Null`.
    pub fn get_path(&self, path: &str) -> &Value {
        const NULL: Value = Value::Null;

        let mut current: &Value = match path.split_once('.') {
            None => return self.fields.get(path).unwrap_or(&NULL),
            Some((head, _)) => self.fields.get(head).unwrap_or(&NULL),
        };

        for segment in path.split('.').skip(1) {
            current = match current {
                Value::Object(map) => map.get(segment).unwrap_or(&NULL),
                _ => return &NULL,
            };
        }

        current
    }

    /// Set a field value, returning the previous value if present.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.fields.insert(key.into(), value.into())
    }

    /// Remove a field, returning its value if present.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.fields.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }

    /// The document's `_id` value, if set.
    pub fn id(&self) -> Option<&Value> {
        self.fields.get(ID_FIELD)
    }

    /// Set the `_id` field. Null and the sentinel values are rejected.
    pub fn set_id(&mut self, id: impl Into<Value>) -> Result<()> {
        let id = id.into();
        if id.is_null() || id.is_sentinel() {
            return Err(SoloError::InvalidId(id.to_string()));
        }
        self.fields.insert(ID_FIELD.to_string(), id);
        Ok(())
    }

    /// Serialize the document to its binary form.
    pub fn to_bytes(&self) -> Vec<u8> {
        Value::Object(self.fields.clone()).to_bytes()
    }

    /// Size of the binary form without serializing.
    pub fn encoded_len(&self) -> usize {
        1 + 4
            + self
                .fields
                .iter()
                .map(|(k, v)| 4 + k.len() + v.encoded_len())
                .sum::<usize>()
    }

    /// Deserialize a document from its binary form.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let (value, _) = Value::from_bytes(buf)?;
        match value {
            Value::Object(fields) => Ok(Self { fields }),
            other => Err(SoloError::Parse(format!(
                "expected an object document, got {}",
                other.data_type().display_name()
            ))),
        }
    }

    /// Convert to JSON representation.
    pub fn to_json(&self) -> serde_json::Value {
        Value::Object(self.fields.clone()).to_json()
    }

    /// Convert from JSON representation. Non-object JSON yields an error.
    pub fn from_json(json: serde_json::Value) -> Result<Self> {
        match Value::from_json(json) {
            Value::Object(fields) => Ok(Self { fields }),
            other => Err(SoloError::Parse(format!(
                "expected a JSON object, got {}",
                other.data_type().display_name()
            ))),
        }
    }
}

impl From<BTreeMap<String, Value>> for Document {
    fn from(fields: BTreeMap<String, Value>) -> Self {
        Self { fields }
    }
}

impl From<Document> for Value {
    fn from(doc: Document) -> Self {
        Value::Object(doc.fields)
    }
}

impl TryFrom<Value> for Document {
    type Error = SoloError;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::Object(fields) => Ok(Self { fields }),
            other => Err(SoloError::Parse(format!(
                "expected an object value, got {}",
                other.data_type().display_name()
            ))),
        }
    }
}

impl FromIterator<(String, Value)> for Document {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

impl std::ops::Index<&str> for Document {
    type Output = Value;

    fn index(&self, key: &str) -> &Self::Output {
        const NULL: Value = Value::Null;
        self.fields.get(key).unwrap_or(&NULL)
    }
}

impl std::fmt::Display for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", Value::Object(self.fields.clone()))
    }
}

/// Build a [`Document`] from `key => value` pairs.
///
/// ```
/// use solodb_common::doc;
///
/// let d = doc! { "_id" => 1, "name" => "ada" };
/// assert_eq!(d["name"].as_str(), Some("ada"));
/// ```
#[macro_export]
macro_rules! doc {
    () => { $crate::Document::new() };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut d = $crate::Document::new();
        $( d.set($key, $value); )+
        d
    }};
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_set_get_and_index() {
        let mut d = Document::new();
        d.set("name", "ada");
        d.set("age", 36);

        assert_eq!(d.get("name").unwrap().as_str(), Some("ada"));
        assert_eq!(d["age"].as_i32(), Some(36));
        assert!(d["missing"].is_null());
    }

    #[test]
    fn test_dotted_path() {
        let inner = doc! { "city" => "lisbon" };
        let mut d = doc! { "name" => "ada" };
        d.set("address", Value::from(inner));

        assert_eq!(d.get_path("address.city").as_str(), Some("lisbon"));
        assert!(d.get_path("address.zip").is_null());
        assert!(d.get_path("name.city").is_null());
        assert_eq!(d.get_path("name").as_str(), Some("ada"));
    }

    #[test]
    fn test_id_validation() {
        let mut d = Document::new();
        assert!(d.set_id(Value::Null).is_err());
        assert!(d.set_id(Value::MinValue).is_err());
        assert!(d.set_id(Value::MaxValue).is_err());
        d.set_id(1).unwrap();
        assert_eq!(d.id().unwrap().as_i32(), Some(1));
    }

    #[test]
    fn test_binary_round_trip() {
        let d = doc! { "_id" => 7, "name" => "grace", "score" => 9.5 };
        let bytes = d.to_bytes();
        assert_eq!(bytes.len(), d.encoded_len());

        let decoded = Document::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, d);
    }

    #[test]
    fn test_from_bytes_rejects_non_object() {
        let bytes = Value::Int32(3).to_bytes();
        assert!(Document::from_bytes(&bytes).is_err());
    }
}
