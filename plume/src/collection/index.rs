use crate::collection::document::{DocId, Document};
use crate::common::Value;
use crate::errors::{ErrorKind, PlumeError, PlumeResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

/// Options for creating an index over a field path.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IndexOptions {
    /// Reject two documents holding the same value for the indexed field.
    pub unique: bool,
    /// Skip documents where the indexed field is missing or null.
    pub sparse: bool,
}

impl IndexOptions {
    pub fn unique() -> Self {
        IndexOptions {
            unique: true,
            sparse: false,
        }
    }
}

/// Persistent description of an index, as written to the datafile in an
/// index-definition marker record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDefinition {
    pub field_name: String,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub sparse: bool,
}

impl IndexDefinition {
    pub fn new(field_name: &str, options: IndexOptions) -> Self {
        IndexDefinition {
            field_name: field_name.to_string(),
            unique: options.unique,
            sparse: options.sparse,
        }
    }
}

/// An ordered secondary index over one field path.
///
/// The index maps each observed field value to the ids of the documents
/// holding it. An array-valued field is indexed under each distinct element
/// (multi-key). A missing or null field is indexed under [Value::Null]
/// unless the index is sparse, in which case the document is skipped.
///
/// All mutating operations either fully apply or leave the index exactly as
/// it was; a unique-constraint violation mid-way is rolled back before the
/// error is returned.
pub(crate) struct DocIndex {
    definition: IndexDefinition,
    tree: BTreeMap<Value, Vec<DocId>>,
}

impl DocIndex {
    pub fn new(definition: IndexDefinition) -> Self {
        DocIndex {
            definition,
            tree: BTreeMap::new(),
        }
    }

    pub fn definition(&self) -> &IndexDefinition {
        &self.definition
    }

    pub fn field_name(&self) -> &str {
        &self.definition.field_name
    }

    pub fn is_unique(&self) -> bool {
        self.definition.unique
    }

    pub fn is_sparse(&self) -> bool {
        self.definition.sparse
    }

    /// The index keys this document contributes, or `None` when the
    /// document is skipped (sparse index, field absent).
    fn keys_for(&self, doc: &Document) -> Option<Vec<Value>> {
        let value = doc.get(&self.definition.field_name);
        match value {
            Value::Null if self.is_sparse() => None,
            Value::Array(items) => {
                // multi-key: one entry per distinct element
                let distinct: BTreeSet<Value> = items.into_iter().collect();
                if distinct.is_empty() {
                    if self.is_sparse() {
                        None
                    } else {
                        Some(vec![Value::Null])
                    }
                } else {
                    Some(distinct.into_iter().collect())
                }
            }
            other => Some(vec![other]),
        }
    }

    /// Adds one document. On a unique violation every key added so far is
    /// removed again before the error is returned.
    pub fn insert_one(&mut self, id: DocId, doc: &Document) -> PlumeResult<()> {
        let Some(keys) = self.keys_for(doc) else {
            return Ok(());
        };

        let mut added: Vec<Value> = Vec::with_capacity(keys.len());
        for key in keys {
            if self.is_unique() {
                if let Some(existing) = self.tree.get(&key) {
                    if !existing.is_empty() {
                        for undo in &added {
                            remove_id(&mut self.tree, undo, id);
                        }
                        log::error!(
                            "Unique constraint violated for field {} with value {}",
                            self.definition.field_name,
                            key
                        );
                        return Err(PlumeError::new(
                            &format!(
                                "Unique constraint violated for field {}",
                                self.definition.field_name
                            ),
                            ErrorKind::UniqueConstraintViolation,
                        ));
                    }
                }
            }
            self.tree.entry(key.clone()).or_default().push(id);
            added.push(key);
        }
        Ok(())
    }

    /// Adds a document without checking constraints. Only used to restore
    /// a previously-held state during rollback.
    fn insert_unchecked(&mut self, id: DocId, doc: &Document) {
        if let Some(keys) = self.keys_for(doc) {
            for key in keys {
                self.tree.entry(key).or_default().push(id);
            }
        }
    }

    /// Removes one document's entries. Removing a document that was never
    /// indexed is a no-op.
    pub fn remove_one(&mut self, id: DocId, doc: &Document) {
        if let Some(keys) = self.keys_for(doc) {
            for key in keys {
                remove_id(&mut self.tree, &key, id);
            }
        }
    }

    /// Replaces a document's entries. On a unique violation the old entries
    /// are restored and the index is left unchanged.
    pub fn update_one(&mut self, id: DocId, old: &Document, new: &Document) -> PlumeResult<()> {
        self.remove_one(id, old);
        if let Err(err) = self.insert_one(id, new) {
            self.insert_unchecked(id, old);
            return Err(err);
        }
        Ok(())
    }

    /// Reverts a previous [DocIndex::update_one]. Restoring an earlier
    /// state cannot violate constraints.
    pub fn revert_one(&mut self, id: DocId, old: &Document, new: &Document) {
        self.remove_one(id, new);
        self.insert_unchecked(id, old);
    }

    /// Ids of documents holding `key` for the indexed field.
    pub fn lookup(&self, key: &Value) -> Vec<DocId> {
        self.tree.get(key).cloned().unwrap_or_default()
    }

    /// Ids of documents holding any of `keys`, deduplicated.
    pub fn lookup_in(&self, keys: &[Value]) -> Vec<DocId> {
        let mut ids: Vec<DocId> = keys.iter().flat_map(|key| self.lookup(key)).collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Ids of documents whose indexed value lies within the given bounds.
    pub fn lookup_range(&self, lower: Bound<&Value>, upper: Bound<&Value>) -> Vec<DocId> {
        let mut ids: Vec<DocId> = self
            .tree
            .range((lower, upper))
            .flat_map(|(_, ids)| ids.iter().copied())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    #[cfg(test)]
    fn entry_count(&self) -> usize {
        self.tree.values().map(|ids| ids.len()).sum()
    }
}

fn remove_id(tree: &mut BTreeMap<Value, Vec<DocId>>, key: &Value, id: DocId) {
    if let Some(ids) = tree.get_mut(key) {
        ids.retain(|existing| *existing != id);
        if ids.is_empty() {
            tree.remove(key);
        }
    }
}
