use crate::common::{Value, DOC_ID, FIELD_SEPARATOR};
use crate::errors::{ErrorKind, PlumeError, PlumeResult};
use crate::ID_GENERATOR;
use im::OrdMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{Debug, Display, Formatter};

const MIN_ID_VALUE: u64 = 1_000_000_000_000_000_000;
const MAX_ID_VALUE: u64 = 9_000_000_000_000_000_000;

/// A unique identifier for documents in a Plume datastore.
///
/// Each document is uniquely identified by a `DocId` stored in its `_id`
/// field. The id is generated with a snowflake-style generator at insert
/// time if not already present, so ids are unique and approximately ordered
/// by creation time. Valid id values lie in `[10^18, 9*10^18)`, which keeps
/// them clear of small user integers and inside the `i64` range used by the
/// datafile format.
#[derive(PartialEq, Eq, Ord, PartialOrd, Hash, Clone, Copy)]
pub struct DocId {
    id_value: u64,
}

impl DocId {
    /// Generates a new unique `DocId`.
    pub fn new() -> Self {
        DocId {
            id_value: ID_GENERATOR.get_id(),
        }
    }

    /// Creates a `DocId` from a specific value.
    ///
    /// The value must be within the valid range `[10^18, 9*10^18)`.
    pub fn create_id(id_value: u64) -> PlumeResult<DocId> {
        DocId::valid_id(id_value)?;
        Ok(DocId { id_value })
    }

    /// Gets the numeric value of this id.
    pub fn id_value(&self) -> u64 {
        self.id_value
    }

    pub(crate) fn valid_id(id_value: u64) -> PlumeResult<()> {
        if id_value >= MAX_ID_VALUE {
            log::error!("Id value {} is too large", id_value);
            return Err(PlumeError::new(
                &format!("Id value must be less than {}", MAX_ID_VALUE),
                ErrorKind::InvalidId,
            ));
        }
        if id_value < MIN_ID_VALUE {
            log::error!("Id value {} is too small", id_value);
            return Err(PlumeError::new(
                &format!("Id value must be greater than or equal to {}", MIN_ID_VALUE),
                ErrorKind::InvalidId,
            ));
        }
        Ok(())
    }
}

impl Default for DocId {
    fn default() -> Self {
        DocId::new()
    }
}

impl Debug for DocId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.id_value)
    }
}

impl Display for DocId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id_value)
    }
}

/// Represents a document in a Plume datastore.
///
/// Documents are composed of key-value pairs where the key is a [String]
/// and the value is a [Value]. Documents nest: a value may itself be a
/// document or an array.
///
/// Keys are stored literally; [Document::get] additionally understands
/// dot-separated paths (e.g. `location.city`) for reading embedded fields,
/// and [Document::put_path] for writing them. Query and update-spec
/// documents rely on literal dotted keys, so [Document::put] never expands
/// them.
///
/// The `_id` field is reserved for the document id and must hold a [DocId]
/// by the time the document is stored.
///
/// Internally a document is a persistent ordered map (`im::OrdMap`), so
/// cloning is O(1) and a cloned document can never be mutated through the
/// original. That makes whole-document log snapshots and deep-copy read
/// results cheap.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Document {
    data: OrdMap<String, Value>,
}

impl Document {
    /// Creates a new empty document.
    pub fn new() -> Self {
        Document {
            data: OrdMap::new(),
        }
    }

    pub(crate) fn from_map(data: OrdMap<String, Value>) -> Self {
        Document { data }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Iterates over the document's top-level entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.data.iter()
    }

    /// The document's top-level keys, in order.
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.data.keys()
    }

    /// Associates `value` with `key` in this document.
    ///
    /// The key is stored literally; a dotted key stays a single top-level
    /// entry (as used by query and update-spec documents). Use
    /// [Document::put_path] to write into an embedded field.
    ///
    /// Query and update-spec documents may carry any value under any key,
    /// `_id` included; [Document::validate_for_storage] is what enforces
    /// the reserved-field rules before a document is stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is empty.
    pub fn put<T: Into<Value>>(&mut self, key: &str, value: T) -> PlumeResult<()> {
        if key.is_empty() {
            log::error!("Document does not support empty key");
            return Err(PlumeError::new(
                "Document does not support empty key",
                ErrorKind::InvalidOperation,
            ));
        }

        self.data.insert(key.to_string(), value.into());
        Ok(())
    }

    /// Returns the [Value] associated with `key`, or [Value::Null] when the
    /// document contains no mapping for it.
    ///
    /// A literal key match wins; otherwise a dot-separated key is resolved
    /// as a path through embedded documents and arrays. A numeric path
    /// component indexes into an array; a non-numeric component applied to
    /// an array projects the field across its elements.
    pub fn get(&self, key: &str) -> Value {
        if let Some(value) = self.data.get(key) {
            return value.clone();
        }
        if !key.contains(FIELD_SEPARATOR) {
            return Value::Null;
        }

        let parts: Vec<&str> = key.split(FIELD_SEPARATOR).collect();
        match self.data.get(parts[0]) {
            Some(value) => get_path(value, &parts[1..]),
            None => Value::Null,
        }
    }

    /// Writes `value` at a dot-separated path, creating intermediate
    /// documents as needed. Numeric components index into arrays; writing
    /// one position past the end appends.
    pub fn put_path<T: Into<Value>>(&mut self, path: &str, value: T) -> PlumeResult<()> {
        if !path.contains(FIELD_SEPARATOR) {
            return self.put(path, value);
        }

        let parts: Vec<&str> = path.split(FIELD_SEPARATOR).collect();
        if parts.iter().any(|p| p.is_empty()) {
            log::error!("Invalid field path: {}", path);
            return Err(PlumeError::new(
                &format!("Invalid field path: {}", path),
                ErrorKind::ValidationError,
            ));
        }

        let existing = self.data.get(parts[0]).cloned();
        let updated = set_path(existing.as_ref(), &parts[1..], value.into())?;
        self.data.insert(parts[0].to_string(), updated);
        Ok(())
    }

    /// Removes the field at a dot-separated path. Returns whether a field
    /// was actually removed.
    pub fn remove_path(&mut self, path: &str) -> bool {
        if !path.contains(FIELD_SEPARATOR) {
            return self.data.remove(path).is_some();
        }

        let parts: Vec<&str> = path.split(FIELD_SEPARATOR).collect();
        let Some(existing) = self.data.get(parts[0]).cloned() else {
            return false;
        };
        let (updated, removed) = remove_path_value(&existing, &parts[1..]);
        if removed {
            self.data.insert(parts[0].to_string(), updated);
        }
        removed
    }

    /// The [DocId] stored in this document's `_id` field, if any.
    pub fn doc_id(&self) -> Option<DocId> {
        match self.data.get(DOC_ID) {
            Some(Value::Id(id)) => Some(*id),
            _ => None,
        }
    }

    pub fn has_id(&self) -> bool {
        self.doc_id().is_some()
    }

    /// Returns the document id, generating and assigning one when absent.
    pub fn ensure_id(&mut self) -> DocId {
        if let Some(id) = self.doc_id() {
            return id;
        }
        let id = DocId::new();
        self.data.insert(DOC_ID.to_string(), Value::Id(id));
        id
    }

    /// Converts a numeric top-level `_id` into a [Value::Id] when it falls
    /// inside the valid id range. Used when reparsing persisted records,
    /// where ids come back as plain integers.
    pub(crate) fn normalize_id(mut self) -> Self {
        if let Some(Value::I64(raw)) = self.data.get(DOC_ID).cloned() {
            if raw >= 0 {
                if let Ok(id) = DocId::create_id(raw as u64) {
                    self.data.insert(DOC_ID.to_string(), Value::Id(id));
                }
            }
        }
        self
    }

    /// Validates that this document can be stored: no key may start with
    /// `$` or contain the field separator, and `_id` must hold a [DocId].
    pub fn validate_for_storage(&self) -> PlumeResult<()> {
        for (key, value) in self.data.iter() {
            if key == DOC_ID {
                if !matches!(value, Value::Id(_)) {
                    log::error!("The _id field must hold a generated document id");
                    return Err(PlumeError::new(
                        "The _id field must hold a generated document id",
                        ErrorKind::ValidationError,
                    ));
                }
                continue;
            }
            validate_key(key)?;
            validate_value(value)?;
        }
        Ok(())
    }
}

fn validate_key(key: &str) -> PlumeResult<()> {
    if key.is_empty() {
        log::error!("Document does not support empty key");
        return Err(PlumeError::new(
            "Document does not support empty key",
            ErrorKind::ValidationError,
        ));
    }
    if key.starts_with('$') {
        log::error!("Field name {} cannot begin with '$'", key);
        return Err(PlumeError::new(
            &format!("Field name {} cannot begin with '$'", key),
            ErrorKind::ValidationError,
        ));
    }
    if key.contains(FIELD_SEPARATOR) {
        log::error!("Field name {} cannot contain '{}'", key, FIELD_SEPARATOR);
        return Err(PlumeError::new(
            &format!("Field name {} cannot contain '{}'", key, FIELD_SEPARATOR),
            ErrorKind::ValidationError,
        ));
    }
    Ok(())
}

fn validate_value(value: &Value) -> PlumeResult<()> {
    match value {
        Value::Document(doc) => {
            for (key, value) in doc.data.iter() {
                validate_key(key)?;
                validate_value(value)?;
            }
            Ok(())
        }
        Value::Array(items) => {
            for item in items {
                validate_value(item)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn get_path(value: &Value, parts: &[&str]) -> Value {
    if parts.is_empty() {
        return value.clone();
    }
    match value {
        Value::Document(doc) => match doc.data.get(parts[0]) {
            Some(next) => get_path(next, &parts[1..]),
            None => Value::Null,
        },
        Value::Array(items) => {
            if let Ok(index) = parts[0].parse::<usize>() {
                match items.get(index) {
                    Some(next) => get_path(next, &parts[1..]),
                    None => Value::Null,
                }
            } else {
                // project the remaining path across the array elements
                let collected: Vec<Value> =
                    items.iter().map(|item| get_path(item, parts)).collect();
                Value::Array(collected)
            }
        }
        _ => Value::Null,
    }
}

fn set_path(current: Option<&Value>, parts: &[&str], value: Value) -> PlumeResult<Value> {
    if parts.is_empty() {
        return Ok(value);
    }
    match current {
        None | Some(Value::Null) => {
            let mut doc = Document::new();
            let inner = set_path(None, &parts[1..], value)?;
            doc.data.insert(parts[0].to_string(), inner);
            Ok(Value::Document(doc))
        }
        Some(Value::Document(doc)) => {
            let mut doc = doc.clone();
            let existing = doc.data.get(parts[0]).cloned();
            let inner = set_path(existing.as_ref(), &parts[1..], value)?;
            doc.data.insert(parts[0].to_string(), inner);
            Ok(Value::Document(doc))
        }
        Some(Value::Array(items)) => {
            let index = parts[0].parse::<usize>().map_err(|_| {
                log::error!("Array field requires a numeric path component: {}", parts[0]);
                PlumeError::new(
                    &format!("Array field requires a numeric path component: {}", parts[0]),
                    ErrorKind::ValidationError,
                )
            })?;
            let mut items = items.clone();
            if index < items.len() {
                let inner = set_path(Some(&items[index].clone()), &parts[1..], value)?;
                items[index] = inner;
            } else if index == items.len() {
                items.push(set_path(None, &parts[1..], value)?);
            } else {
                log::error!("Array index {} out of bounds for length {}", index, items.len());
                return Err(PlumeError::new(
                    &format!("Array index {} out of bounds", index),
                    ErrorKind::ValidationError,
                ));
            }
            Ok(Value::Array(items))
        }
        Some(other) => {
            log::error!("Cannot set field {} on scalar value {}", parts[0], other);
            Err(PlumeError::new(
                &format!("Cannot set field {} on a scalar value", parts[0]),
                ErrorKind::ValidationError,
            ))
        }
    }
}

fn remove_path_value(value: &Value, parts: &[&str]) -> (Value, bool) {
    match value {
        Value::Document(doc) => {
            if parts.len() == 1 {
                let mut doc = doc.clone();
                let removed = doc.data.remove(parts[0]).is_some();
                return (Value::Document(doc), removed);
            }
            match doc.data.get(parts[0]) {
                Some(next) => {
                    let (updated, removed) = remove_path_value(next, &parts[1..]);
                    if removed {
                        let mut doc = doc.clone();
                        doc.data.insert(parts[0].to_string(), updated);
                        (Value::Document(doc), true)
                    } else {
                        (value.clone(), false)
                    }
                }
                None => (value.clone(), false),
            }
        }
        Value::Array(items) => {
            let Ok(index) = parts[0].parse::<usize>() else {
                return (value.clone(), false);
            };
            if index >= items.len() {
                return (value.clone(), false);
            }
            let mut items = items.clone();
            if parts.len() == 1 {
                items.remove(index);
                (Value::Array(items), true)
            } else {
                let (updated, removed) = remove_path_value(&items[index], &parts[1..]);
                if removed {
                    items[index] = updated;
                }
                (Value::Array(items), removed)
            }
        }
        _ => (value.clone(), false),
    }
}

impl Display for Document {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{")?;
        for (i, (key, value)) in self.data.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "\"{}\": {}", key, value)?;
        }
        write!(f, "}}")
    }
}

impl Debug for Document {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

impl Serialize for Document {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        Value::Document(self.clone()).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Document {
    fn deserialize<D>(deserializer: D) -> Result<Document, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Value::deserialize(deserializer)? {
            Value::Document(doc) => Ok(doc.normalize_id()),
            other => Err(serde::de::Error::custom(format!(
                "expected a document, got {}",
                other
            ))),
        }
    }
}

/// Strips the quotes `stringify!` leaves around string-literal keys in the
/// [doc!](crate::doc) macro.
pub fn normalize(value: &str) -> String {
    value.trim_matches('"').to_string()
}

/// Creates a Plume [Document] with JSON-like syntax.
///
/// # Examples
///
/// ```rust
/// use plume::doc;
///
/// let doc = doc! {
///     "name": "Alice",
///     "age": 30,
///     "location": { "city": "New York", "zip": 10001 },
///     "tags": ["admin", "user"]
/// };
/// assert_eq!(doc.len(), 4);
/// ```
#[macro_export]
macro_rules! doc {
    () => {
        $crate::collection::Document::new()
    };

    ($($key:tt : $value:tt),* $(,)?) => {
        {
            #[allow(unused_imports)]
            use $crate::doc_value;

            let mut doc = $crate::collection::Document::new();
            $(
                doc.put(&$crate::collection::normalize(stringify!($key)), $crate::doc_value!($value))
                    .expect(&format!("Failed to put value {} in document", stringify!($value)));
            )*
            doc
        }
    };
}

/// Helper macro to convert values for the [doc!](crate::doc) macro.
/// Handles nested documents, arrays, and expressions.
#[macro_export]
macro_rules! doc_value {
    ({ $($key:tt : $value:tt),* $(,)? }) => {
        {
            $crate::common::Value::Document($crate::doc!{ $($key : $value),* })
        }
    };

    ([ $($value:tt),* $(,)? ]) => {
        $crate::common::Value::Array(vec![$($crate::doc_value!($value)),*])
    };

    ($value:expr) => {
        $crate::common::Value::from($value)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_and_get_top_level_fields() {
        let mut doc = Document::new();
        doc.put("name", "Alice").unwrap();
        doc.put("age", 30).unwrap();
        assert_eq!(doc.get("name"), Value::String("Alice".to_string()));
        assert_eq!(doc.get("age"), Value::I64(30));
        assert_eq!(doc.get("missing"), Value::Null);
    }

    #[test]
    fn put_rejects_empty_key() {
        let mut doc = Document::new();
        let err = doc.put("", 1).unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::InvalidOperation);
    }

    #[test]
    fn raw_id_values_are_allowed_until_storage() {
        // query documents like {"_id": 42} must build without complaint;
        // only storage insists on a generated id
        let mut doc = Document::new();
        doc.put(DOC_ID, 42).unwrap();
        assert!(!doc.has_id());
        assert_eq!(
            doc.validate_for_storage().unwrap_err().kind(),
            &ErrorKind::ValidationError
        );

        doc.put(DOC_ID, Value::Id(DocId::new())).unwrap();
        assert!(doc.has_id());
        assert!(doc.validate_for_storage().is_ok());
    }

    #[test]
    fn put_stores_dotted_keys_literally() {
        // query documents rely on this: {"a.b": 1} addresses a path, it is
        // not a nested document
        let mut query = Document::new();
        query.put("location.city", "NY").unwrap();
        assert_eq!(query.keys().next().unwrap(), "location.city");
    }

    #[test]
    fn get_resolves_embedded_paths() {
        let doc = doc! {
            "location": {
                "city": "New York",
                "address": { "zip": 10001 }
            }
        };
        assert_eq!(doc.get("location.city"), Value::String("New York".to_string()));
        assert_eq!(doc.get("location.address.zip"), Value::I64(10001));
        assert_eq!(doc.get("location.missing"), Value::Null);
    }

    #[test]
    fn get_indexes_arrays_numerically() {
        let doc = doc! { "items": [10, 20, 30] };
        assert_eq!(doc.get("items.0"), Value::I64(10));
        assert_eq!(doc.get("items.2"), Value::I64(30));
        assert_eq!(doc.get("items.5"), Value::Null);
    }

    #[test]
    fn get_projects_fields_across_arrays() {
        let doc = doc! { "points": [{ "x": 1 }, { "x": 2 }] };
        assert_eq!(
            doc.get("points.x"),
            Value::Array(vec![Value::I64(1), Value::I64(2)])
        );
    }

    #[test]
    fn put_path_creates_intermediate_documents() {
        let mut doc = Document::new();
        doc.put_path("a.b.c", 5).unwrap();
        assert_eq!(doc.get("a.b.c"), Value::I64(5));
    }

    #[test]
    fn put_path_fails_on_scalar_intermediate() {
        let mut doc = doc! { "a": 1 };
        let err = doc.put_path("a.b", 5).unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::ValidationError);
    }

    #[test]
    fn put_path_writes_into_arrays() {
        let mut doc = doc! { "items": [{ "x": 1 }] };
        doc.put_path("items.0.x", 9).unwrap();
        assert_eq!(doc.get("items.0.x"), Value::I64(9));

        doc.put_path("items.1", 7).unwrap();
        assert_eq!(doc.get("items.1"), Value::I64(7));

        assert!(doc.put_path("items.9", 7).is_err());
    }

    #[test]
    fn remove_path_removes_fields() {
        let mut doc = doc! { "a": { "b": 1, "c": 2 }, "d": 3 };
        assert!(doc.remove_path("a.b"));
        assert_eq!(doc.get("a.b"), Value::Null);
        assert_eq!(doc.get("a.c"), Value::I64(2));
        assert!(doc.remove_path("d"));
        assert!(!doc.remove_path("missing.path"));
    }

    #[test]
    fn ensure_id_assigns_once() {
        let mut doc = doc! { "name": "Alice" };
        assert!(!doc.has_id());
        let id = doc.ensure_id();
        assert_eq!(doc.ensure_id(), id);
        assert_eq!(doc.doc_id(), Some(id));
    }

    #[test]
    fn validate_rejects_dollar_and_dotted_keys() {
        let mut doc = Document::new();
        doc.put("$set", 1).unwrap();
        assert_eq!(
            doc.validate_for_storage().unwrap_err().kind(),
            &ErrorKind::ValidationError
        );

        let mut doc = Document::new();
        doc.put("a.b", 1).unwrap();
        assert_eq!(
            doc.validate_for_storage().unwrap_err().kind(),
            &ErrorKind::ValidationError
        );

        // nested keys are checked too
        let doc = doc! { "outer": { "$inner": 1 } };
        assert!(doc.validate_for_storage().is_err());
    }

    #[test]
    fn validate_accepts_plain_documents() {
        let mut doc = doc! { "name": "Alice", "nested": { "x": [1, 2] } };
        doc.ensure_id();
        assert!(doc.validate_for_storage().is_ok());
    }

    #[test]
    fn clone_is_independent() {
        let mut original = doc! { "a": 1 };
        let snapshot = original.clone();
        original.put("a", 2).unwrap();
        original.put("b", 3).unwrap();
        assert_eq!(snapshot.get("a"), Value::I64(1));
        assert_eq!(snapshot.get("b"), Value::Null);
    }

    #[test]
    fn serde_round_trip_restores_the_id() {
        let mut doc = doc! { "bar": 1 };
        doc.ensure_id();
        let json = serde_json::to_string(&doc).unwrap();
        let parsed: Document = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, doc);
        assert_eq!(parsed.doc_id(), doc.doc_id());
    }

    #[test]
    fn doc_id_range_is_enforced() {
        assert!(DocId::create_id(MIN_ID_VALUE).is_ok());
        assert_eq!(
            DocId::create_id(MIN_ID_VALUE - 1).unwrap_err().kind(),
            &ErrorKind::InvalidId
        );
        assert_eq!(
            DocId::create_id(MAX_ID_VALUE).unwrap_err().kind(),
            &ErrorKind::InvalidId
        );
    }

    #[test]
    fn generated_ids_are_in_range() {
        for _ in 0..100 {
            let id = DocId::new();
            assert!(DocId::valid_id(id.id_value()).is_ok());
        }
    }
}
