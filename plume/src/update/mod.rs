use crate::collection::Document;
use crate::common::{Value, DOC_ID};
use crate::errors::{ErrorKind, PlumeError, PlumeResult};
use crate::filter::Matcher;

/// Applies an update specification to a document, yielding the new version.
///
/// A spec without `$`-operators replaces the document wholesale (keeping
/// its `_id`). Otherwise every key must be an operator; the supported set
/// is `$set`, `$unset`, `$inc`, `$min`, `$max`, `$push`, `$addToSet`,
/// `$pop` and `$pull`. Operator arguments map field paths (dot notation
/// allowed) to operands.
///
/// The input document is never mutated; errors leave no partial result
/// behind.
pub(crate) fn apply(doc: &Document, spec: &Document) -> PlumeResult<Document> {
    let operator_count = spec.keys().filter(|key| key.starts_with('$')).count();

    if operator_count == 0 {
        return replace(doc, spec);
    }
    if operator_count != spec.len() {
        log::error!("Cannot mix update operators and plain fields in one update");
        return Err(PlumeError::new(
            "Cannot mix update operators and plain fields in one update",
            ErrorKind::ValidationError,
        ));
    }

    let mut result = doc.clone();
    for (op, arg) in spec.iter() {
        let Value::Document(fields) = arg else {
            log::error!("{} operand must be a document of field paths", op);
            return Err(PlumeError::new(
                &format!("{} operand must be a document of field paths", op),
                ErrorKind::ValidationError,
            ));
        };
        for (path, operand) in fields.iter() {
            guard_id_path(path)?;
            apply_operator(&mut result, op, path, operand)?;
        }
    }
    Ok(result)
}

fn replace(doc: &Document, spec: &Document) -> PlumeResult<Document> {
    let mut result = spec.clone();
    match (spec.doc_id(), doc.doc_id()) {
        (Some(new_id), Some(old_id)) if new_id != old_id => {
            log::error!("Cannot change the _id of a document");
            return Err(PlumeError::new(
                "Cannot change the _id of a document",
                ErrorKind::ValidationError,
            ));
        }
        _ => {}
    }
    if let Some(id) = doc.doc_id() {
        result.put(DOC_ID, Value::Id(id))?;
    }
    Ok(result)
}

fn guard_id_path(path: &str) -> PlumeResult<()> {
    if path == DOC_ID || path.starts_with("_id.") {
        log::error!("Cannot change the _id of a document");
        return Err(PlumeError::new(
            "Cannot change the _id of a document",
            ErrorKind::ValidationError,
        ));
    }
    Ok(())
}

fn apply_operator(
    result: &mut Document,
    op: &str,
    path: &str,
    operand: &Value,
) -> PlumeResult<()> {
    match op {
        "$set" => result.put_path(path, operand.clone()),
        "$unset" => {
            result.remove_path(path);
            Ok(())
        }
        "$inc" => {
            if !operand.is_number() {
                log::error!("$inc operand for {} must be a number", path);
                return Err(PlumeError::new(
                    &format!("$inc operand for {} must be a number", path),
                    ErrorKind::ValidationError,
                ));
            }
            let current = result.get(path);
            let incremented = match (&current, operand) {
                (Value::Null, _) => operand.clone(),
                (Value::I64(a), Value::I64(b)) => Value::I64(a + b),
                (a, b) if a.is_number() => {
                    // mixed integer/float arithmetic widens to float
                    Value::F64(a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0))
                }
                _ => {
                    log::error!("Cannot $inc non-numeric field {}", path);
                    return Err(PlumeError::new(
                        &format!("Cannot $inc non-numeric field {}", path),
                        ErrorKind::ValidationError,
                    ));
                }
            };
            result.put_path(path, incremented)
        }
        "$min" | "$max" => {
            let current = result.get(path);
            let take = current.is_null()
                || (op == "$min" && operand < &current)
                || (op == "$max" && operand > &current);
            if take {
                result.put_path(path, operand.clone())?;
            }
            Ok(())
        }
        "$push" => {
            let mut items = array_field(result, path)?;
            items.extend(each_values(operand)?);
            result.put_path(path, Value::Array(items))
        }
        "$addToSet" => {
            let mut items = array_field(result, path)?;
            for value in each_values(operand)? {
                if !items.contains(&value) {
                    items.push(value);
                }
            }
            result.put_path(path, Value::Array(items))
        }
        "$pop" => {
            let Some(direction) = operand.as_i64() else {
                log::error!("$pop operand for {} must be an integer", path);
                return Err(PlumeError::new(
                    &format!("$pop operand for {} must be an integer", path),
                    ErrorKind::ValidationError,
                ));
            };
            let mut items = match result.get(path) {
                Value::Array(items) => items,
                other => {
                    log::error!("Cannot $pop from non-array field {} ({})", path, other);
                    return Err(PlumeError::new(
                        &format!("Cannot $pop from non-array field {}", path),
                        ErrorKind::ValidationError,
                    ));
                }
            };
            if direction > 0 {
                items.pop();
            } else if direction < 0 && !items.is_empty() {
                items.remove(0);
            }
            result.put_path(path, Value::Array(items))
        }
        "$pull" => {
            let mut items = match result.get(path) {
                Value::Array(items) => items,
                other => {
                    log::error!("Cannot $pull from non-array field {} ({})", path, other);
                    return Err(PlumeError::new(
                        &format!("Cannot $pull from non-array field {}", path),
                        ErrorKind::ValidationError,
                    ));
                }
            };
            let matcher = Matcher::default();
            let mut failure = None;
            items.retain(|item| match matcher.value_matches(item, operand) {
                Ok(matched) => !matched,
                Err(err) => {
                    failure.get_or_insert(err);
                    true
                }
            });
            if let Some(err) = failure {
                return Err(err);
            }
            result.put_path(path, Value::Array(items))
        }
        other => {
            log::error!("Unknown update operator: {}", other);
            Err(PlumeError::new(
                &format!("Unknown update operator: {}", other),
                ErrorKind::ValidationError,
            ))
        }
    }
}

/// Current array value at `path`, treating a missing field as an empty
/// array (for `$push`/`$addToSet` creating the field).
fn array_field(result: &Document, path: &str) -> PlumeResult<Vec<Value>> {
    match result.get(path) {
        Value::Array(items) => Ok(items),
        Value::Null => Ok(Vec::new()),
        other => {
            log::error!("Cannot append to non-array field {} ({})", path, other);
            Err(PlumeError::new(
                &format!("Cannot append to non-array field {}", path),
                ErrorKind::ValidationError,
            ))
        }
    }
}

/// Resolves a `$push`/`$addToSet` operand into the values to append,
/// honoring the `$each` modifier.
fn each_values(operand: &Value) -> PlumeResult<Vec<Value>> {
    if let Value::Document(doc) = operand {
        if doc.keys().any(|key| key == "$each") {
            if doc.len() != 1 {
                log::error!("$each cannot be combined with other modifiers");
                return Err(PlumeError::new(
                    "$each cannot be combined with other modifiers",
                    ErrorKind::ValidationError,
                ));
            }
            return match doc.get("$each") {
                Value::Array(items) => Ok(items),
                _ => {
                    log::error!("$each operand must be an array");
                    Err(PlumeError::new(
                        "$each operand must be an array",
                        ErrorKind::ValidationError,
                    ))
                }
            };
        }
    }
    Ok(vec![operand.clone()])
}
