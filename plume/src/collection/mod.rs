pub mod document;
pub(crate) mod index;

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

use crate::common::{Value, DOC_ID};
use crate::errors::{ErrorKind, PlumeError, PlumeResult};
use crate::filter::{is_operator_doc, Matcher, StringComparator};
use crate::update;

pub use document::{normalize, DocId, Document};
pub use index::{IndexDefinition, IndexOptions};

use index::DocIndex;

/// Options for [update](crate::Datastore::update) calls.
#[derive(Clone, Copy, Default)]
pub struct UpdateOptions {
    /// Update every matching document instead of only the first one.
    pub multi: bool,
    /// Insert a document built from the query and the update when
    /// nothing matches.
    pub upsert: bool,
}

impl UpdateOptions {
    pub fn multi() -> Self {
        UpdateOptions {
            multi: true,
            upsert: false,
        }
    }

    pub fn upsert() -> Self {
        UpdateOptions {
            multi: false,
            upsert: true,
        }
    }
}

/// Options for [remove](crate::Datastore::remove) calls.
#[derive(Clone, Copy, Default)]
pub struct RemoveOptions {
    /// Remove every matching document instead of only the first one.
    pub multi: bool,
}

impl RemoveOptions {
    pub fn multi() -> Self {
        RemoveOptions { multi: true }
    }
}

/// Result of an update pass, carrying the new document versions.
#[derive(Debug)]
pub struct UpdateResult {
    pub updated: Vec<Document>,
    pub upserted: bool,
}

impl UpdateResult {
    pub fn num_affected(&self) -> usize {
        self.updated.len()
    }
}

/// The in-memory working set: every document keyed by id, plus one
/// [DocIndex] per indexed field. All reads and writes go through here;
/// the persistence layer only replays into it and journals out of it.
pub(crate) struct IndexedCollection {
    documents: BTreeMap<DocId, Document>,
    indexes: HashMap<String, DocIndex>,
    matcher: Matcher,
    custom_string_order: bool,
}

impl IndexedCollection {
    pub fn new(compare_strings: Option<StringComparator>) -> Self {
        IndexedCollection {
            documents: BTreeMap::new(),
            indexes: HashMap::new(),
            matcher: Matcher::new(compare_strings.clone()),
            custom_string_order: compare_strings.is_some(),
        }
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    /// Drops all documents and indexes, keeping the matcher configuration.
    pub fn reset(&mut self) {
        self.documents.clear();
        self.indexes.clear();
    }

    /// Inserts a new document, assigning an id when it has none. Fails on
    /// id collisions and unique index violations, leaving the collection
    /// untouched.
    pub fn insert(&mut self, mut doc: Document) -> PlumeResult<Document> {
        // validate first: a non-id value under _id must fail the insert
        // rather than be silently replaced by a generated id
        doc.validate_for_storage()?;
        doc.ensure_id();
        let id = expect_id(&doc)?;
        if self.documents.contains_key(&id) {
            log::error!("A document with id {} already exists", id);
            return Err(PlumeError::new(
                &format!("A document with id {} already exists", id),
                ErrorKind::UniqueConstraintViolation,
            ));
        }
        self.add_to_indexes(id, &doc)?;
        self.documents.insert(id, doc.clone());
        Ok(doc)
    }

    /// Inserts a batch of documents. If any insert fails, the documents
    /// inserted so far are taken out again and the error is returned.
    pub fn insert_all(&mut self, docs: Vec<Document>) -> PlumeResult<Vec<Document>> {
        let mut inserted = Vec::with_capacity(docs.len());
        for doc in docs {
            match self.insert(doc) {
                Ok(stored) => inserted.push(stored),
                Err(err) => {
                    for stored in &inserted {
                        if let Some(id) = stored.doc_id() {
                            self.documents.remove(&id);
                            self.remove_from_indexes(id, stored);
                        }
                    }
                    return Err(err);
                }
            }
        }
        Ok(inserted)
    }

    /// Replays a journaled document during load. The id is mandatory; an
    /// existing version under the same id is replaced.
    pub fn insert_loaded(&mut self, doc: Document) -> PlumeResult<()> {
        doc.validate_for_storage()?;
        let id = doc.doc_id().ok_or_else(|| {
            log::error!("Journaled document is missing its id");
            PlumeError::new("Journaled document is missing its id", ErrorKind::InvalidId)
        })?;
        if let Some(old) = self.documents.remove(&id) {
            self.remove_from_indexes(id, &old);
        }
        self.add_to_indexes(id, &doc)?;
        self.documents.insert(id, doc);
        Ok(())
    }

    /// Updates matching documents with the given spec. Index maintenance
    /// is batch-atomic: either every affected document is reindexed or,
    /// on a unique violation, none is.
    pub fn update(
        &mut self,
        query: &Document,
        spec: &Document,
        options: UpdateOptions,
    ) -> PlumeResult<UpdateResult> {
        let mut pairs: Vec<(DocId, Document, Document)> = Vec::new();
        for id in self.candidates(query)? {
            let doc = self.documents.get(&id).ok_or_else(|| {
                log::error!("Index entry points at missing document {}", id);
                PlumeError::new(
                    &format!("Index entry points at missing document {}", id),
                    ErrorKind::InternalError,
                )
            })?;
            if !self.matcher.matches(doc, query)? {
                continue;
            }
            let new = update::apply(doc, spec)?;
            new.validate_for_storage()?;
            pairs.push((id, doc.clone(), new));
            if !options.multi {
                break;
            }
        }

        if pairs.is_empty() {
            if !options.upsert {
                return Ok(UpdateResult {
                    updated: Vec::new(),
                    upserted: false,
                });
            }
            let seed = upsert_seed(query)?;
            let fresh = update::apply(&seed, spec)?;
            let stored = self.insert(fresh)?;
            return Ok(UpdateResult {
                updated: vec![stored],
                upserted: true,
            });
        }

        self.reindex_pairs(&pairs)?;
        let mut updated = Vec::with_capacity(pairs.len());
        for (id, _, new) in pairs {
            self.documents.insert(id, new.clone());
            updated.push(new);
        }
        Ok(UpdateResult {
            updated,
            upserted: false,
        })
    }

    /// Removes matching documents and returns their ids.
    pub fn remove(&mut self, query: &Document, options: RemoveOptions) -> PlumeResult<Vec<DocId>> {
        let mut removed = Vec::new();
        for id in self.candidates(query)? {
            let Some(doc) = self.documents.get(&id) else {
                continue;
            };
            if self.matcher.matches(doc, query)? {
                removed.push(id);
                if !options.multi {
                    break;
                }
            }
        }
        for id in &removed {
            if let Some(doc) = self.documents.remove(id) {
                self.remove_from_indexes(*id, &doc);
            }
        }
        Ok(removed)
    }

    pub fn find(&self, query: &Document) -> PlumeResult<Vec<Document>> {
        let mut results = Vec::new();
        for id in self.candidates(query)? {
            let Some(doc) = self.documents.get(&id) else {
                continue;
            };
            if self.matcher.matches(doc, query)? {
                results.push(doc.clone());
            }
        }
        Ok(results)
    }

    pub fn find_one(&self, query: &Document) -> PlumeResult<Option<Document>> {
        for id in self.candidates(query)? {
            let Some(doc) = self.documents.get(&id) else {
                continue;
            };
            if self.matcher.matches(doc, query)? {
                return Ok(Some(doc.clone()));
            }
        }
        Ok(None)
    }

    pub fn count(&self, query: &Document) -> PlumeResult<usize> {
        let mut count = 0;
        for id in self.candidates(query)? {
            let Some(doc) = self.documents.get(&id) else {
                continue;
            };
            if self.matcher.matches(doc, query)? {
                count += 1;
            }
        }
        Ok(count)
    }

    pub fn get_all(&self) -> Vec<Document> {
        self.documents.values().cloned().collect()
    }

    /// Builds an index over the current documents. Returns `false` when
    /// the field is already indexed (or is `_id`, which is always keyed).
    /// A unique violation while building leaves no partial index behind.
    pub fn ensure_index(&mut self, definition: IndexDefinition) -> PlumeResult<bool> {
        if definition.field_name.is_empty() {
            log::error!("Cannot index an empty field name");
            return Err(PlumeError::new(
                "Cannot index an empty field name",
                ErrorKind::IndexingError,
            ));
        }
        if definition.field_name == DOC_ID || self.indexes.contains_key(&definition.field_name) {
            return Ok(false);
        }
        let mut index = DocIndex::new(definition);
        for (id, doc) in &self.documents {
            index.insert_one(*id, doc)?;
        }
        self.indexes.insert(index.field_name().to_string(), index);
        Ok(true)
    }

    pub fn remove_index(&mut self, field_name: &str) -> bool {
        self.indexes.remove(field_name).is_some()
    }

    pub fn index_definitions(&self) -> Vec<IndexDefinition> {
        let mut definitions: Vec<IndexDefinition> = self
            .indexes
            .values()
            .map(|index| index.definition().clone())
            .collect();
        definitions.sort_by(|a, b| a.field_name.cmp(&b.field_name));
        definitions
    }

    fn add_to_indexes(&mut self, id: DocId, doc: &Document) -> PlumeResult<()> {
        let mut touched = Vec::new();
        let fields: Vec<String> = self.indexes.keys().cloned().collect();
        for field in fields {
            if let Some(index) = self.indexes.get_mut(&field) {
                if let Err(err) = index.insert_one(id, doc) {
                    for done in touched {
                        if let Some(index) = self.indexes.get_mut(&done) {
                            index.remove_one(id, doc);
                        }
                    }
                    return Err(err);
                }
                touched.push(field);
            }
        }
        Ok(())
    }

    fn remove_from_indexes(&mut self, id: DocId, doc: &Document) {
        for index in self.indexes.values_mut() {
            index.remove_one(id, doc);
        }
    }

    /// Moves every (old, new) pair across all indexes, undoing the whole
    /// batch when any single move hits a unique violation.
    fn reindex_pairs(&mut self, pairs: &[(DocId, Document, Document)]) -> PlumeResult<()> {
        let fields: Vec<String> = self.indexes.keys().cloned().collect();
        let mut applied: Vec<(usize, String)> = Vec::new();
        for (pair_idx, (id, old, new)) in pairs.iter().enumerate() {
            for field in &fields {
                let Some(index) = self.indexes.get_mut(field) else {
                    continue;
                };
                if let Err(err) = index.update_one(*id, old, new) {
                    for (done_idx, done_field) in applied.iter().rev() {
                        let (done_id, done_old, done_new) = &pairs[*done_idx];
                        if let Some(index) = self.indexes.get_mut(done_field) {
                            index.revert_one(*done_id, done_old, done_new);
                        }
                    }
                    return Err(err);
                }
                applied.push((pair_idx, field.clone()));
            }
        }
        Ok(())
    }

    /// Candidate ids for a query: when the first query field has an index
    /// and a usable predicate (equality, `$in`, or a range), the index
    /// narrows the scan; otherwise every document is a candidate. The
    /// matcher re-checks each candidate, so over-approximation is fine.
    fn candidates(&self, query: &Document) -> PlumeResult<Vec<DocId>> {
        for (field, query_value) in query.iter() {
            let Some(index) = self.indexes.get(field) else {
                continue;
            };
            match query_value {
                Value::Document(op_doc) if is_operator_doc(op_doc) => {
                    if let Some(ids) = self.candidates_from_operators(index, op_doc) {
                        return Ok(ids);
                    }
                }
                Value::Document(_) | Value::Array(_) => {}
                // a sparse index has no entry for docs missing the field,
                // so it cannot answer null-equality queries
                Value::Null if index.is_sparse() => {}
                scalar => return Ok(index.lookup(scalar)),
            }
        }
        Ok(self.documents.keys().copied().collect())
    }

    fn candidates_from_operators(
        &self,
        index: &DocIndex,
        op_doc: &Document,
    ) -> Option<Vec<DocId>> {
        if let Value::Array(keys) = op_doc.get("$in") {
            // null membership reaches docs a sparse index never keyed
            if index.is_sparse() && keys.contains(&Value::Null) {
                return None;
            }
            return Some(index.lookup_in(&keys));
        }
        let mut lower = Bound::Unbounded;
        let mut upper = Bound::Unbounded;
        let mut bounded = false;
        for (op, operand) in op_doc.iter() {
            // index order and a custom string comparator disagree, so
            // string ranges must go through a full scan
            if self.custom_string_order && matches!(operand, Value::String(_)) {
                return None;
            }
            match op.as_str() {
                "$gt" => lower = Bound::Excluded(operand),
                "$gte" => lower = Bound::Included(operand),
                "$lt" => upper = Bound::Excluded(operand),
                "$lte" => upper = Bound::Included(operand),
                _ => continue,
            }
            bounded = true;
        }
        if bounded {
            Some(index.lookup_range(lower, upper))
        } else {
            None
        }
    }
}

fn expect_id(doc: &Document) -> PlumeResult<DocId> {
    doc.doc_id().ok_or_else(|| {
        log::error!("Document has no id after ensure_id");
        PlumeError::new(
            "Document has no id after ensure_id",
            ErrorKind::InternalError,
        )
    })
}

/// Seed document for an upsert: the equality fields of the query, with
/// operator predicates left out. Dotted query keys become real paths.
fn upsert_seed(query: &Document) -> PlumeResult<Document> {
    let mut seed = Document::new();
    for (field, value) in query.iter() {
        if field.starts_with('$') {
            continue;
        }
        if let Value::Document(doc) = value {
            if is_operator_doc(doc) {
                continue;
            }
        }
        seed.put_path(field, value.clone())?;
    }
    Ok(seed)
}
