use crate::collection::Document;
use crate::common::Value;
use crate::errors::{ErrorKind, PlumeError, PlumeResult};
use std::cmp::Ordering;
use std::sync::Arc;

/// Custom comparator for string values, injected through the datastore
/// options (e.g. for locale-aware ordering).
pub type StringComparator = Arc<dyn Fn(&str, &str) -> Ordering + Send + Sync>;

/// Evaluates MongoDB-style query documents against stored documents.
///
/// A query is itself a [Document]: plain fields express equality on a field
/// path, operator documents (`{"$lt": 5}`) express comparisons, and the
/// top-level `$and` / `$or` / `$not` keys combine sub-queries. An empty
/// query matches everything.
///
/// The matcher is pure: it never mutates either document.
#[derive(Clone, Default)]
pub struct Matcher {
    compare_strings: Option<StringComparator>,
}

impl Matcher {
    pub fn new(compare_strings: Option<StringComparator>) -> Self {
        Matcher { compare_strings }
    }

    /// Returns whether `doc` satisfies `query`. All top-level query clauses
    /// must hold (implicit and).
    pub fn matches(&self, doc: &Document, query: &Document) -> PlumeResult<bool> {
        for (key, query_value) in query.iter() {
            let clause = if key.starts_with('$') {
                self.match_logical(doc, key, query_value)?
            } else {
                self.match_field(doc, key, query_value)?
            };
            if !clause {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn match_logical(&self, doc: &Document, op: &str, operand: &Value) -> PlumeResult<bool> {
        match op {
            "$and" | "$or" => {
                let Value::Array(sub_queries) = operand else {
                    log::error!("{} operand must be an array of queries", op);
                    return Err(PlumeError::new(
                        &format!("{} operand must be an array of queries", op),
                        ErrorKind::FilterError,
                    ));
                };
                if sub_queries.is_empty() {
                    log::error!("{} operand cannot be empty", op);
                    return Err(PlumeError::new(
                        &format!("{} operand cannot be empty", op),
                        ErrorKind::FilterError,
                    ));
                }
                for sub_query in sub_queries {
                    let Value::Document(sub_query) = sub_query else {
                        return Err(PlumeError::new(
                            &format!("{} operand must contain only queries", op),
                            ErrorKind::FilterError,
                        ));
                    };
                    let matched = self.matches(doc, sub_query)?;
                    if matched && op == "$or" {
                        return Ok(true);
                    }
                    if !matched && op == "$and" {
                        return Ok(false);
                    }
                }
                Ok(op == "$and")
            }
            "$not" => {
                let Value::Document(sub_query) = operand else {
                    log::error!("$not operand must be a query");
                    return Err(PlumeError::new(
                        "$not operand must be a query",
                        ErrorKind::FilterError,
                    ));
                };
                Ok(!self.matches(doc, sub_query)?)
            }
            other => {
                log::error!("Unknown logical operator: {}", other);
                Err(PlumeError::new(
                    &format!("Unknown logical operator: {}", other),
                    ErrorKind::FilterError,
                ))
            }
        }
    }

    fn match_field(&self, doc: &Document, path: &str, query_value: &Value) -> PlumeResult<bool> {
        let doc_value = doc.get(path);
        self.value_matches(&doc_value, query_value)
    }

    /// Matches a single field value against either an operator document or
    /// a plain equality value.
    pub(crate) fn value_matches(&self, doc_value: &Value, query_value: &Value) -> PlumeResult<bool> {
        if let Value::Document(op_doc) = query_value {
            if is_operator_doc(op_doc) {
                for (op, operand) in op_doc.iter() {
                    if !self.apply_operator(doc_value, op, operand)? {
                        return Ok(false);
                    }
                }
                return Ok(true);
            }
        }
        Ok(value_equals(doc_value, query_value))
    }

    fn apply_operator(&self, doc_value: &Value, op: &str, operand: &Value) -> PlumeResult<bool> {
        match op {
            "$lt" => Ok(self.compare_any(doc_value, operand, |o| o == Ordering::Less)),
            "$lte" => Ok(self.compare_any(doc_value, operand, |o| o != Ordering::Greater)),
            "$gt" => Ok(self.compare_any(doc_value, operand, |o| o == Ordering::Greater)),
            "$gte" => Ok(self.compare_any(doc_value, operand, |o| o != Ordering::Less)),
            "$ne" => Ok(!value_equals(doc_value, operand)),
            "$in" => {
                let Value::Array(members) = operand else {
                    log::error!("$in operand must be an array");
                    return Err(PlumeError::new(
                        "$in operand must be an array",
                        ErrorKind::FilterError,
                    ));
                };
                Ok(members.iter().any(|member| value_equals(doc_value, member)))
            }
            "$nin" => {
                let Value::Array(members) = operand else {
                    log::error!("$nin operand must be an array");
                    return Err(PlumeError::new(
                        "$nin operand must be an array",
                        ErrorKind::FilterError,
                    ));
                };
                Ok(!members.iter().any(|member| value_equals(doc_value, member)))
            }
            "$exists" => {
                let wanted = operand.as_bool().unwrap_or(!operand.is_null());
                Ok(wanted == !doc_value.is_null())
            }
            "$regex" => {
                let Value::String(pattern) = operand else {
                    log::error!("$regex operand must be a string pattern");
                    return Err(PlumeError::new(
                        "$regex operand must be a string pattern",
                        ErrorKind::FilterError,
                    ));
                };
                let regex = regex::Regex::new(pattern).map_err(|err| {
                    log::error!("Invalid $regex pattern {}: {}", pattern, err);
                    PlumeError::new(
                        &format!("Invalid $regex pattern: {}", err),
                        ErrorKind::FilterError,
                    )
                })?;
                Ok(any_element(doc_value, |value| {
                    value.as_str().map(|s| regex.is_match(s)).unwrap_or(false)
                }))
            }
            "$size" => {
                let Some(expected) = operand.as_i64() else {
                    log::error!("$size operand must be an integer");
                    return Err(PlumeError::new(
                        "$size operand must be an integer",
                        ErrorKind::FilterError,
                    ));
                };
                match doc_value {
                    Value::Array(items) => Ok(items.len() as i64 == expected),
                    _ => Ok(false),
                }
            }
            other => {
                log::error!("Unknown comparison operator: {}", other);
                Err(PlumeError::new(
                    &format!("Unknown comparison operator: {}", other),
                    ErrorKind::FilterError,
                ))
            }
        }
    }

    /// Applies an ordering predicate against the document value, or against
    /// any element when the document value is an array.
    fn compare_any(
        &self,
        doc_value: &Value,
        operand: &Value,
        predicate: impl Fn(Ordering) -> bool,
    ) -> bool {
        any_element(doc_value, |value| {
            self.compare_values(value, operand)
                .map(&predicate)
                .unwrap_or(false)
        })
    }

    /// Ordering between two values for range operators. Only values of
    /// comparable types order; mixed-type comparisons never match.
    pub(crate) fn compare_values(&self, a: &Value, b: &Value) -> Option<Ordering> {
        if a.is_number() && b.is_number() {
            return a.partial_cmp(b);
        }
        match (a, b) {
            (Value::String(a), Value::String(b)) => match &self.compare_strings {
                Some(comparator) => Some(comparator(a, b)),
                None => Some(a.cmp(b)),
            },
            _ => None,
        }
    }
}

/// Equality with array-membership semantics: an array field matches a
/// non-array query value when any element equals it.
fn value_equals(doc_value: &Value, query_value: &Value) -> bool {
    if doc_value == query_value {
        return true;
    }
    match (doc_value, query_value) {
        (Value::Array(items), other) if !matches!(other, Value::Array(_)) => {
            items.iter().any(|item| item == other)
        }
        _ => false,
    }
}

fn any_element(doc_value: &Value, predicate: impl Fn(&Value) -> bool) -> bool {
    match doc_value {
        Value::Array(items) => items.iter().any(predicate),
        other => predicate(other),
    }
}

/// A document whose keys all start with `$` is an operator document, not a
/// literal sub-document to compare against.
pub(crate) fn is_operator_doc(doc: &Document) -> bool {
    !doc.is_empty() && doc.keys().all(|key| key.starts_with('$'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;

    fn matcher() -> Matcher {
        Matcher::default()
    }

    #[test]
    fn empty_query_matches_everything() {
        assert!(matcher().matches(&doc! { "a": 1 }, &doc! {}).unwrap());
        assert!(matcher().matches(&Document::new(), &doc! {}).unwrap());
    }

    #[test]
    fn equality_on_top_level_fields() {
        let doc = doc! { "name": "Alice", "age": 30 };
        assert!(matcher().matches(&doc, &doc! { "name": "Alice" }).unwrap());
        assert!(!matcher().matches(&doc, &doc! { "name": "Bob" }).unwrap());
        assert!(matcher().matches(&doc, &doc! { "age": 30.0 }).unwrap());
    }

    #[test]
    fn equality_on_embedded_paths() {
        let doc = doc! { "location": { "city": "NY" } };
        assert!(matcher()
            .matches(&doc, &doc! { "location.city": "NY" })
            .unwrap());
        assert!(!matcher()
            .matches(&doc, &doc! { "location.city": "LA" })
            .unwrap());
    }

    #[test]
    fn subdocument_equality_is_exact() {
        let doc = doc! { "loc": { "city": "NY", "zip": 1 } };
        assert!(matcher()
            .matches(&doc, &doc! { "loc": { "city": "NY", "zip": 1 } })
            .unwrap());
        // partial subdocument does not match wholesale
        assert!(!matcher()
            .matches(&doc, &doc! { "loc": { "city": "NY" } })
            .unwrap());
    }

    #[test]
    fn array_membership_equality() {
        let doc = doc! { "tags": ["red", "blue"] };
        assert!(matcher().matches(&doc, &doc! { "tags": "red" }).unwrap());
        assert!(!matcher().matches(&doc, &doc! { "tags": "green" }).unwrap());
        assert!(matcher()
            .matches(&doc, &doc! { "tags": ["red", "blue"] })
            .unwrap());
    }

    #[test]
    fn comparison_operators() {
        let doc = doc! { "age": 30 };
        assert!(matcher().matches(&doc, &doc! { "age": { "$lt": 40 } }).unwrap());
        assert!(matcher().matches(&doc, &doc! { "age": { "$lte": 30 } }).unwrap());
        assert!(matcher().matches(&doc, &doc! { "age": { "$gt": 20 } }).unwrap());
        assert!(matcher().matches(&doc, &doc! { "age": { "$gte": 30 } }).unwrap());
        assert!(!matcher().matches(&doc, &doc! { "age": { "$gt": 30 } }).unwrap());
        // ranges combine
        assert!(matcher()
            .matches(&doc, &doc! { "age": { "$gt": 20, "$lt": 40 } })
            .unwrap());
    }

    #[test]
    fn comparisons_never_match_across_types() {
        let doc = doc! { "age": "thirty" };
        assert!(!matcher().matches(&doc, &doc! { "age": { "$lt": 40 } }).unwrap());
    }

    #[test]
    fn string_comparisons_use_custom_comparator() {
        let reversed: StringComparator = Arc::new(|a, b| b.cmp(a));
        let matcher = Matcher::new(Some(reversed));
        let doc = doc! { "name": "b" };
        // under the reversed order, "b" < "a"
        assert!(matcher
            .matches(&doc, &doc! { "name": { "$lt": "a" } })
            .unwrap());
    }

    #[test]
    fn ne_in_nin_exists() {
        let doc = doc! { "n": 5 };
        assert!(matcher().matches(&doc, &doc! { "n": { "$ne": 6 } }).unwrap());
        assert!(!matcher().matches(&doc, &doc! { "n": { "$ne": 5 } }).unwrap());
        assert!(matcher()
            .matches(&doc, &doc! { "n": { "$in": [4, 5, 6] } })
            .unwrap());
        assert!(matcher()
            .matches(&doc, &doc! { "n": { "$nin": [7, 8] } })
            .unwrap());
        assert!(matcher()
            .matches(&doc, &doc! { "n": { "$exists": true } })
            .unwrap());
        assert!(matcher()
            .matches(&doc, &doc! { "missing": { "$exists": false } })
            .unwrap());
    }

    #[test]
    fn in_requires_array_operand() {
        let doc = doc! { "n": 5 };
        let err = matcher()
            .matches(&doc, &doc! { "n": { "$in": 5 } })
            .unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::FilterError);
    }

    #[test]
    fn regex_matches_strings() {
        let doc = doc! { "name": "alice" };
        assert!(matcher()
            .matches(&doc, &doc! { "name": { "$regex": "^al" } })
            .unwrap());
        assert!(!matcher()
            .matches(&doc, &doc! { "name": { "$regex": "^bob" } })
            .unwrap());
        assert!(matcher()
            .matches(&doc! { "n": 5 }, &doc! { "n": { "$regex": "x" } })
            .map(|m| !m)
            .unwrap());
    }

    #[test]
    fn size_operator() {
        let doc = doc! { "tags": ["a", "b"] };
        assert!(matcher()
            .matches(&doc, &doc! { "tags": { "$size": 2 } })
            .unwrap());
        assert!(!matcher()
            .matches(&doc, &doc! { "tags": { "$size": 3 } })
            .unwrap());
    }

    #[test]
    fn logical_combinators() {
        let doc = doc! { "a": 1, "b": 2 };
        assert!(matcher()
            .matches(&doc, &doc! { "$and": [{ "a": 1 }, { "b": 2 }] })
            .unwrap());
        assert!(matcher()
            .matches(&doc, &doc! { "$or": [{ "a": 9 }, { "b": 2 }] })
            .unwrap());
        assert!(matcher()
            .matches(&doc, &doc! { "$not": { "a": 9 } })
            .unwrap());
        assert!(!matcher()
            .matches(&doc, &doc! { "$and": [{ "a": 1 }, { "b": 9 }] })
            .unwrap());
    }

    #[test]
    fn logical_operand_errors() {
        let doc = doc! { "a": 1 };
        assert!(matcher().matches(&doc, &doc! { "$and": 1 }).is_err());
        assert!(matcher().matches(&doc, &doc! { "$or": [] }).is_err());
        assert!(matcher().matches(&doc, &doc! { "$nor": [{ "a": 1 }] }).is_err());
    }

    #[test]
    fn unknown_comparison_operator_errors() {
        let doc = doc! { "a": 1 };
        let err = matcher()
            .matches(&doc, &doc! { "a": { "$near": 1 } })
            .unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::FilterError);
    }

    #[test]
    fn comparison_applies_to_array_elements() {
        let doc = doc! { "scores": [3, 12, 7] };
        assert!(matcher()
            .matches(&doc, &doc! { "scores": { "$gt": 10 } })
            .unwrap());
        assert!(!matcher()
            .matches(&doc, &doc! { "scores": { "$gt": 20 } })
            .unwrap());
    }
}
