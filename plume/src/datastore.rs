use std::path::PathBuf;
use std::sync::mpsc::{channel, Receiver};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::collection::{
    Document, IndexDefinition, IndexedCollection, RemoveOptions, UpdateOptions, UpdateResult,
};
use crate::errors::{ErrorKind, PlumeError, PlumeResult};
use crate::executor::Executor;
use crate::filter::StringComparator;
use crate::persistence::{LogRecord, Persistence, SerializationHook};

/// Configuration for opening a [Datastore].
///
/// ```rust
/// use plume::{doc, DatastoreOptions};
///
/// let datastore = DatastoreOptions::new()
///     .in_memory_only()
///     .autoload()
///     .open()
///     .unwrap();
/// assert_eq!(datastore.count_sync(doc! {}).unwrap(), 0);
/// ```
#[derive(Clone)]
pub struct DatastoreOptions {
    filename: Option<PathBuf>,
    in_memory_only: bool,
    autoload: bool,
    auto_compaction_threshold: usize,
    corrupt_alert_threshold: f64,
    after_serialization: Option<SerializationHook>,
    before_deserialization: Option<SerializationHook>,
    compare_strings: Option<StringComparator>,
}

impl Default for DatastoreOptions {
    fn default() -> Self {
        DatastoreOptions {
            filename: None,
            in_memory_only: false,
            autoload: false,
            auto_compaction_threshold: 0,
            corrupt_alert_threshold: crate::common::DEFAULT_CORRUPT_ALERT_THRESHOLD,
            after_serialization: None,
            before_deserialization: None,
            compare_strings: None,
        }
    }
}

impl DatastoreOptions {
    pub fn new() -> Self {
        DatastoreOptions::default()
    }

    /// Backs the datastore with the given file. Without a filename the
    /// datastore is in-memory only.
    pub fn filename(mut self, filename: impl Into<PathBuf>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    /// Never touches the disk, even when a filename is set.
    pub fn in_memory_only(mut self) -> Self {
        self.in_memory_only = true;
        self
    }

    /// Loads the datafile as soon as the datastore is opened. Without
    /// autoload, operations queue up until [Datastore::load_database] is
    /// called.
    pub fn autoload(mut self) -> Self {
        self.autoload = true;
        self
    }

    /// Compacts the datafile automatically after this many journaled
    /// lines. Zero disables automatic compaction.
    pub fn auto_compaction_threshold(mut self, appends: usize) -> Self {
        self.auto_compaction_threshold = appends;
        self
    }

    /// Maximum tolerated share of corrupt journal lines at load time,
    /// between 0 and 1.
    pub fn corrupt_alert_threshold(mut self, threshold: f64) -> Self {
        self.corrupt_alert_threshold = threshold;
        self
    }

    /// Transforms each serialized line before it is written, e.g. for
    /// encryption. Requires a matching [before_deserialization]
    /// (DatastoreOptions::before_deserialization) hook.
    pub fn after_serialization(mut self, hook: SerializationHook) -> Self {
        self.after_serialization = Some(hook);
        self
    }

    /// Inverse of [after_serialization](DatastoreOptions::after_serialization),
    /// applied to each line read back from the datafile.
    pub fn before_deserialization(mut self, hook: SerializationHook) -> Self {
        self.before_deserialization = Some(hook);
        self
    }

    /// Custom string ordering for query comparisons, e.g. a
    /// locale-aware collation.
    pub fn compare_strings(mut self, comparator: StringComparator) -> Self {
        self.compare_strings = Some(comparator);
        self
    }

    /// Opens the datastore. Fails when the serialization hooks are not
    /// inverse functions of each other.
    pub fn open(self) -> PlumeResult<Datastore> {
        let in_memory = self.in_memory_only || self.filename.is_none();
        let filename = self.filename.unwrap_or_default();
        let persistence = Persistence::new(
            &filename,
            in_memory,
            self.corrupt_alert_threshold,
            self.after_serialization,
            self.before_deserialization,
        )?;
        let collection = IndexedCollection::new(self.compare_strings);

        let datastore = Datastore {
            inner: Arc::new(DatastoreInner {
                state: Mutex::new(State {
                    collection,
                    persistence,
                }),
                executor: Executor::new(),
                auto_compaction_threshold: self.auto_compaction_threshold,
            }),
        };
        if self.autoload {
            datastore.load_database(|result| {
                if let Err(err) = result {
                    log::error!("Autoload failed: {}", err);
                }
            });
        }
        Ok(datastore)
    }
}

struct State {
    collection: IndexedCollection,
    persistence: Persistence,
}

struct DatastoreInner {
    state: Mutex<State>,
    executor: Executor,
    auto_compaction_threshold: usize,
}

/// An embedded, file-backed document datastore.
///
/// Every operation is queued onto a single worker thread and executed in
/// submission order, so a read issued after a write always observes it.
/// Callback-style methods hand their result to the given closure on the
/// worker thread; the `_sync` variants block the caller until the
/// operation has run.
///
/// `Datastore` is cheap to clone and the clones share one queue and one
/// datafile.
#[derive(Clone)]
pub struct Datastore {
    inner: Arc<DatastoreInner>,
}

impl Datastore {
    /// Loads (or reloads) the datafile, then releases any queued
    /// operations. On a load failure the queue stays parked, so
    /// operations never run against a half-loaded state.
    pub fn load_database(&self, callback: impl FnOnce(PlumeResult<()>) + Send + 'static) {
        let inner = self.inner.clone();
        self.inner.executor.push(
            Box::new(move || {
                let result = {
                    let mut state = inner.state.lock();
                    let State {
                        collection,
                        persistence,
                    } = &mut *state;
                    persistence.load_database(collection)
                };
                if result.is_ok() {
                    inner.executor.process_buffer();
                }
                callback(result);
            }),
            true,
        );
    }

    /// Inserts a document, assigning an `_id` when it has none, and
    /// journals it.
    pub fn insert(
        &self,
        doc: Document,
        callback: impl FnOnce(PlumeResult<Document>) + Send + 'static,
    ) {
        let threshold = self.inner.auto_compaction_threshold;
        self.execute(
            move |state| {
                let stored = state.collection.insert(doc)?;
                state
                    .persistence
                    .persist_new_state(&[LogRecord::Doc(stored.clone())])?;
                maybe_compact(state, threshold);
                Ok(stored)
            },
            callback,
        );
    }

    /// Inserts a batch of documents atomically: either all of them are
    /// stored or none is.
    pub fn insert_all(
        &self,
        docs: Vec<Document>,
        callback: impl FnOnce(PlumeResult<Vec<Document>>) + Send + 'static,
    ) {
        let threshold = self.inner.auto_compaction_threshold;
        self.execute(
            move |state| {
                let stored = state.collection.insert_all(docs)?;
                let records: Vec<LogRecord> =
                    stored.iter().cloned().map(LogRecord::Doc).collect();
                state.persistence.persist_new_state(&records)?;
                maybe_compact(state, threshold);
                Ok(stored)
            },
            callback,
        );
    }

    /// Updates documents matching `query` with the update spec. See
    /// [UpdateOptions] for multi and upsert behavior.
    pub fn update(
        &self,
        query: Document,
        spec: Document,
        options: UpdateOptions,
        callback: impl FnOnce(PlumeResult<UpdateResult>) + Send + 'static,
    ) {
        let threshold = self.inner.auto_compaction_threshold;
        self.execute(
            move |state| {
                let result = state.collection.update(&query, &spec, options)?;
                let records: Vec<LogRecord> =
                    result.updated.iter().cloned().map(LogRecord::Doc).collect();
                state.persistence.persist_new_state(&records)?;
                maybe_compact(state, threshold);
                Ok(result)
            },
            callback,
        );
    }

    /// Removes documents matching `query`, journaling one tombstone per
    /// removed document. The callback receives the number removed.
    pub fn remove(
        &self,
        query: Document,
        options: RemoveOptions,
        callback: impl FnOnce(PlumeResult<usize>) + Send + 'static,
    ) {
        let threshold = self.inner.auto_compaction_threshold;
        self.execute(
            move |state| {
                let removed = state.collection.remove(&query, options)?;
                let records: Vec<LogRecord> =
                    removed.iter().copied().map(LogRecord::Remove).collect();
                state.persistence.persist_new_state(&records)?;
                maybe_compact(state, threshold);
                Ok(removed.len())
            },
            callback,
        );
    }

    pub fn find(
        &self,
        query: Document,
        callback: impl FnOnce(PlumeResult<Vec<Document>>) + Send + 'static,
    ) {
        self.execute(move |state| state.collection.find(&query), callback);
    }

    pub fn find_one(
        &self,
        query: Document,
        callback: impl FnOnce(PlumeResult<Option<Document>>) + Send + 'static,
    ) {
        self.execute(move |state| state.collection.find_one(&query), callback);
    }

    pub fn count(
        &self,
        query: Document,
        callback: impl FnOnce(PlumeResult<usize>) + Send + 'static,
    ) {
        self.execute(move |state| state.collection.count(&query), callback);
    }

    pub fn get_all(&self, callback: impl FnOnce(PlumeResult<Vec<Document>>) + Send + 'static) {
        self.execute(move |state| Ok(state.collection.get_all()), callback);
    }

    /// Builds an index over the given field and journals it so the index
    /// is rebuilt on every load. The callback receives `false` when the
    /// field was already indexed.
    pub fn ensure_index(
        &self,
        definition: IndexDefinition,
        callback: impl FnOnce(PlumeResult<bool>) + Send + 'static,
    ) {
        self.execute(
            move |state| {
                let created = state.collection.ensure_index(definition.clone())?;
                if created {
                    state
                        .persistence
                        .persist_new_state(&[LogRecord::IndexCreated(definition)])?;
                }
                Ok(created)
            },
            callback,
        );
    }

    /// Drops the index on the given field. The callback receives whether
    /// an index existed.
    pub fn remove_index(
        &self,
        field_name: &str,
        callback: impl FnOnce(PlumeResult<bool>) + Send + 'static,
    ) {
        let field_name = field_name.to_string();
        self.execute(
            move |state| {
                let existed = state.collection.remove_index(&field_name);
                if existed {
                    state
                        .persistence
                        .persist_new_state(&[LogRecord::IndexRemoved(field_name)])?;
                }
                Ok(existed)
            },
            callback,
        );
    }

    /// Rewrites the datafile to one line per live document.
    pub fn compact_datafile(&self, callback: impl FnOnce(PlumeResult<()>) + Send + 'static) {
        self.execute(
            move |state| {
                let State {
                    collection,
                    persistence,
                } = state;
                persistence.persist_cached_database(collection)
            },
            callback,
        );
    }

    pub fn load_database_sync(&self) -> PlumeResult<()> {
        let (tx, rx) = channel();
        self.load_database(move |result| {
            let _ = tx.send(result);
        });
        wait(rx)
    }

    pub fn insert_sync(&self, doc: Document) -> PlumeResult<Document> {
        let (tx, rx) = channel();
        self.insert(doc, move |result| {
            let _ = tx.send(result);
        });
        wait(rx)
    }

    pub fn insert_all_sync(&self, docs: Vec<Document>) -> PlumeResult<Vec<Document>> {
        let (tx, rx) = channel();
        self.insert_all(docs, move |result| {
            let _ = tx.send(result);
        });
        wait(rx)
    }

    pub fn update_sync(
        &self,
        query: Document,
        spec: Document,
        options: UpdateOptions,
    ) -> PlumeResult<UpdateResult> {
        let (tx, rx) = channel();
        self.update(query, spec, options, move |result| {
            let _ = tx.send(result);
        });
        wait(rx)
    }

    pub fn remove_sync(&self, query: Document, options: RemoveOptions) -> PlumeResult<usize> {
        let (tx, rx) = channel();
        self.remove(query, options, move |result| {
            let _ = tx.send(result);
        });
        wait(rx)
    }

    pub fn find_sync(&self, query: Document) -> PlumeResult<Vec<Document>> {
        let (tx, rx) = channel();
        self.find(query, move |result| {
            let _ = tx.send(result);
        });
        wait(rx)
    }

    pub fn find_one_sync(&self, query: Document) -> PlumeResult<Option<Document>> {
        let (tx, rx) = channel();
        self.find_one(query, move |result| {
            let _ = tx.send(result);
        });
        wait(rx)
    }

    pub fn count_sync(&self, query: Document) -> PlumeResult<usize> {
        let (tx, rx) = channel();
        self.count(query, move |result| {
            let _ = tx.send(result);
        });
        wait(rx)
    }

    pub fn get_all_sync(&self) -> PlumeResult<Vec<Document>> {
        let (tx, rx) = channel();
        self.get_all(move |result| {
            let _ = tx.send(result);
        });
        wait(rx)
    }

    pub fn ensure_index_sync(&self, definition: IndexDefinition) -> PlumeResult<bool> {
        let (tx, rx) = channel();
        self.ensure_index(definition, move |result| {
            let _ = tx.send(result);
        });
        wait(rx)
    }

    pub fn remove_index_sync(&self, field_name: &str) -> PlumeResult<bool> {
        let (tx, rx) = channel();
        self.remove_index(field_name, move |result| {
            let _ = tx.send(result);
        });
        wait(rx)
    }

    pub fn compact_datafile_sync(&self) -> PlumeResult<()> {
        let (tx, rx) = channel();
        self.compact_datafile(move |result| {
            let _ = tx.send(result);
        });
        wait(rx)
    }

    fn execute<T, F, C>(&self, op: F, callback: C)
    where
        T: Send + 'static,
        F: FnOnce(&mut State) -> PlumeResult<T> + Send + 'static,
        C: FnOnce(PlumeResult<T>) + Send + 'static,
    {
        let inner = self.inner.clone();
        self.inner.executor.push(
            Box::new(move || {
                // run the callback outside the state lock; a slow or
                // panicking callback must not block the datastore
                let result = {
                    let mut state = inner.state.lock();
                    op(&mut state)
                };
                callback(result);
            }),
            false,
        );
    }
}

/// A failed automatic compaction only costs disk space, never data, so
/// it is logged and the triggering operation still succeeds.
fn maybe_compact(state: &mut State, threshold: usize) {
    if threshold == 0 || state.persistence.appends_since_compaction() < threshold {
        return;
    }
    let State {
        collection,
        persistence,
    } = state;
    if let Err(err) = persistence.persist_cached_database(collection) {
        log::warn!("Automatic compaction failed: {}", err);
    }
}

fn wait<T>(rx: Receiver<PlumeResult<T>>) -> PlumeResult<T> {
    rx.recv().map_err(|_| {
        log::error!("Datastore worker dropped the operation");
        PlumeError::new(
            "Datastore worker dropped the operation",
            ErrorKind::InternalError,
        )
    })?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::IndexOptions;
    use crate::common::Value;
    use crate::doc;
    use std::fs;
    use std::time::Duration;
    use tempfile::tempdir;

    // Setup only one time throughout the project.
    // It will take effect during test, project wide
    #[ctor::ctor]
    fn init() {
        colog::init();
    }

    fn in_memory() -> Datastore {
        DatastoreOptions::new()
            .in_memory_only()
            .autoload()
            .open()
            .unwrap()
    }

    #[test]
    fn a_read_issued_after_a_write_observes_it() {
        let datastore = in_memory();
        // no waiting on the insert callback; submission order is enough
        datastore.insert(doc! { "bar": 1 }, |_| {});
        let found = datastore.find_sync(doc! { "bar": 1 }).unwrap();
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn a_panicking_callback_does_not_poison_the_datastore() {
        let datastore = in_memory();
        datastore.insert(doc! { "n": 1 }, |_| panic!("user callback"));
        datastore.insert(doc! { "n": 2 }, |_| {});
        assert_eq!(datastore.count_sync(doc! {}).unwrap(), 2);
    }

    #[test]
    fn operations_queue_up_until_the_database_is_loaded() {
        let datastore = DatastoreOptions::new().in_memory_only().open().unwrap();
        let (tx, rx) = channel();
        datastore.find(doc! {}, move |result| {
            let _ = tx.send(result);
        });
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        datastore.load_database_sync().unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap().is_ok());
    }

    #[test]
    fn writes_survive_a_reopen() {
        let dir = tempdir().unwrap();
        let filename = dir.path().join("data.db");
        {
            let datastore = DatastoreOptions::new()
                .filename(&filename)
                .autoload()
                .open()
                .unwrap();
            datastore.insert_sync(doc! { "name": "alice" }).unwrap();
            datastore.insert_sync(doc! { "name": "bob" }).unwrap();
            datastore
                .update_sync(
                    doc! { "name": "alice" },
                    doc! { "$set": { "admin": true } },
                    UpdateOptions::default(),
                )
                .unwrap();
            datastore
                .remove_sync(doc! { "name": "bob" }, RemoveOptions::default())
                .unwrap();
        }

        let datastore = DatastoreOptions::new()
            .filename(&filename)
            .autoload()
            .open()
            .unwrap();
        let all = datastore.get_all_sync().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].get("name"), Value::from("alice"));
        assert_eq!(all[0].get("admin"), Value::Bool(true));
    }

    #[test]
    fn indexes_survive_a_reopen() {
        let dir = tempdir().unwrap();
        let filename = dir.path().join("data.db");
        {
            let datastore = DatastoreOptions::new()
                .filename(&filename)
                .autoload()
                .open()
                .unwrap();
            assert!(datastore
                .ensure_index_sync(IndexDefinition::new("email", IndexOptions::unique()))
                .unwrap());
            datastore.insert_sync(doc! { "email": "a@x" }).unwrap();
        }

        let datastore = DatastoreOptions::new()
            .filename(&filename)
            .autoload()
            .open()
            .unwrap();
        let err = datastore.insert_sync(doc! { "email": "a@x" }).unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::UniqueConstraintViolation);
        assert!(datastore.remove_index_sync("email").unwrap());
        datastore.insert_sync(doc! { "email": "a@x" }).unwrap();
    }

    #[test]
    fn upsert_inserts_when_nothing_matches() {
        let datastore = in_memory();
        let result = datastore
            .update_sync(
                doc! { "name": "carol" },
                doc! { "$set": { "active": true } },
                UpdateOptions::upsert(),
            )
            .unwrap();
        assert!(result.upserted);
        assert_eq!(datastore.count_sync(doc! { "name": "carol" }).unwrap(), 1);
    }

    #[test]
    fn compaction_shrinks_the_datafile() {
        let dir = tempdir().unwrap();
        let filename = dir.path().join("data.db");
        let datastore = DatastoreOptions::new()
            .filename(&filename)
            .autoload()
            .open()
            .unwrap();

        let stored = datastore.insert_sync(doc! { "v": 0 }).unwrap();
        for v in 1..5 {
            datastore
                .update_sync(
                    doc! { "_id": (stored.get("_id")) },
                    doc! { "$set": { "v": v } },
                    UpdateOptions::default(),
                )
                .unwrap();
        }
        assert_eq!(fs::read_to_string(&filename).unwrap().lines().count(), 5);

        datastore.compact_datafile_sync().unwrap();
        assert_eq!(fs::read_to_string(&filename).unwrap().lines().count(), 1);
        assert_eq!(datastore.count_sync(doc! { "v": 4 }).unwrap(), 1);
    }

    #[test]
    fn auto_compaction_keeps_the_datafile_dense() {
        let dir = tempdir().unwrap();
        let filename = dir.path().join("data.db");
        let datastore = DatastoreOptions::new()
            .filename(&filename)
            .autoload()
            .auto_compaction_threshold(2)
            .open()
            .unwrap();

        let stored = datastore.insert_sync(doc! { "v": 0 }).unwrap();
        for v in 1..10 {
            datastore
                .update_sync(
                    doc! { "_id": (stored.get("_id")) },
                    doc! { "$set": { "v": v } },
                    UpdateOptions::default(),
                )
                .unwrap();
        }
        // one live document; the journal never grows past the threshold
        assert!(fs::read_to_string(&filename).unwrap().lines().count() <= 2);
        assert_eq!(datastore.count_sync(doc! { "v": 9 }).unwrap(), 1);
    }

    #[test]
    fn in_memory_datastores_leave_no_files_behind() {
        let dir = tempdir().unwrap();
        let filename = dir.path().join("data.db");
        let datastore = DatastoreOptions::new()
            .filename(&filename)
            .in_memory_only()
            .autoload()
            .open()
            .unwrap();
        datastore.insert_sync(doc! { "n": 1 }).unwrap();
        assert!(!filename.exists());
    }

    #[test]
    fn clones_share_the_same_state() {
        let datastore = in_memory();
        let clone = datastore.clone();
        datastore.insert_sync(doc! { "n": 1 }).unwrap();
        assert_eq!(clone.count_sync(doc! {}).unwrap(), 1);
    }

    #[test]
    fn custom_string_comparator_orders_queries() {
        let case_insensitive: StringComparator =
            Arc::new(|a, b| a.to_lowercase().cmp(&b.to_lowercase()));
        let datastore = DatastoreOptions::new()
            .in_memory_only()
            .autoload()
            .compare_strings(case_insensitive)
            .open()
            .unwrap();
        datastore.insert_sync(doc! { "name": "ALICE" }).unwrap();
        let found = datastore
            .find_sync(doc! { "name": { "$gte": "alice", "$lte": "alice" } })
            .unwrap();
        assert_eq!(found.len(), 1);
    }
}
