use std::collections::BTreeMap;
use std::fs;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::collection::{DocId, Document, IndexDefinition, IndexedCollection};
use crate::common::{Value, DELETED_MARKER, DOC_ID, INDEX_CREATED_MARKER, INDEX_REMOVED_MARKER};
use crate::errors::{ErrorKind, PlumeError, PlumeResult};

/// Transforms one serialized line before it hits the disk (or after it is
/// read back). Used in pairs: `before_deserialization` must invert
/// `after_serialization`.
pub type SerializationHook = Arc<dyn Fn(&str) -> String + Send + Sync>;

const TEMP_SUFFIX: &str = "~";

/// One entry of the append-only journal. Every line of the datafile is
/// the JSON form of one of these.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum LogRecord {
    /// A full document version; replay keeps the last one per id.
    Doc(Document),
    /// A tombstone, `{"$deleted":true,"_id":...}`.
    Remove(DocId),
    /// `{"$indexCreated":{"fieldName":...}}`.
    IndexCreated(IndexDefinition),
    /// `{"$indexRemoved":"field"}`.
    IndexRemoved(String),
}

/// Owns the datafile: journals every write as one line, replays the
/// journal at load time, and rewrites the file from the in-memory state
/// during compaction.
pub(crate) struct Persistence {
    filename: PathBuf,
    in_memory: bool,
    corrupt_alert_threshold: f64,
    after_serialization: Option<SerializationHook>,
    before_deserialization: Option<SerializationHook>,
    appends_since_compaction: usize,
}

impl Persistence {
    pub fn new(
        filename: &Path,
        in_memory: bool,
        corrupt_alert_threshold: f64,
        after_serialization: Option<SerializationHook>,
        before_deserialization: Option<SerializationHook>,
    ) -> PlumeResult<Self> {
        verify_hooks_are_inverse(&after_serialization, &before_deserialization)?;
        Ok(Persistence {
            filename: filename.to_path_buf(),
            in_memory,
            corrupt_alert_threshold,
            after_serialization,
            before_deserialization,
            appends_since_compaction: 0,
        })
    }

    pub fn appends_since_compaction(&self) -> usize {
        self.appends_since_compaction
    }

    /// Replays the datafile into `collection` and rewrites it in
    /// normalized form. A missing file or directory is created. Lines
    /// that fail to parse count as corrupt; when their share exceeds the
    /// alert threshold the load fails instead of silently dropping data.
    pub fn load_database(&mut self, collection: &mut IndexedCollection) -> PlumeResult<()> {
        collection.reset();
        self.appends_since_compaction = 0;
        if self.in_memory {
            return Ok(());
        }

        self.ensure_datafile()?;
        let raw = fs::read_to_string(&self.filename)?;

        let mut docs: BTreeMap<DocId, Document> = BTreeMap::new();
        let mut definitions: Vec<IndexDefinition> = Vec::new();
        let mut total = 0usize;
        let mut corrupt = 0usize;
        for line in raw.lines() {
            if line.is_empty() {
                continue;
            }
            total += 1;
            match self.parse_record(line) {
                Ok(LogRecord::Doc(doc)) => {
                    // parse_record guarantees the id
                    if let Some(id) = doc.doc_id() {
                        docs.insert(id, doc);
                    }
                }
                Ok(LogRecord::Remove(id)) => {
                    docs.remove(&id);
                }
                Ok(LogRecord::IndexCreated(definition)) => {
                    definitions.retain(|d| d.field_name != definition.field_name);
                    definitions.push(definition);
                }
                Ok(LogRecord::IndexRemoved(field_name)) => {
                    definitions.retain(|d| d.field_name != field_name);
                }
                Err(err) => {
                    log::warn!("Skipping corrupt journal line: {}", err);
                    corrupt += 1;
                }
            }
        }

        if total > 0 && corrupt as f64 / total as f64 > self.corrupt_alert_threshold {
            log::error!(
                "{} of {} journal lines are corrupt in {}",
                corrupt,
                total,
                self.filename.display()
            );
            return Err(PlumeError::new(
                &format!(
                    "{} of {} journal lines are corrupt in {}",
                    corrupt,
                    total,
                    self.filename.display()
                ),
                ErrorKind::FileCorrupted,
            ));
        }

        for definition in definitions {
            collection.ensure_index(definition)?;
        }
        for (_, doc) in docs {
            collection.insert_loaded(doc)?;
        }
        log::debug!(
            "Loaded {} documents from {}",
            collection.len(),
            self.filename.display()
        );

        self.persist_cached_database(collection)
    }

    /// Appends the given records to the journal and syncs the file.
    pub fn persist_new_state(&mut self, records: &[LogRecord]) -> PlumeResult<()> {
        if self.in_memory || records.is_empty() {
            return Ok(());
        }
        let mut payload = String::new();
        for record in records {
            payload.push_str(&self.serialize_record(record)?);
            payload.push('\n');
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.filename)?;
        file.write_all(payload.as_bytes())?;
        file.sync_all()?;
        self.appends_since_compaction += records.len();
        Ok(())
    }

    /// Rewrites the whole datafile from the in-memory state: index
    /// definitions first, then one line per live document. The new
    /// content goes to a temporary file that atomically replaces the
    /// journal, so a crash mid-compaction loses nothing.
    pub fn persist_cached_database(
        &mut self,
        collection: &IndexedCollection,
    ) -> PlumeResult<()> {
        if self.in_memory {
            return Ok(());
        }

        let mut payload = String::new();
        for definition in collection.index_definitions() {
            payload.push_str(&self.serialize_record(&LogRecord::IndexCreated(definition))?);
            payload.push('\n');
        }
        for doc in collection.get_all() {
            payload.push_str(&self.serialize_record(&LogRecord::Doc(doc))?);
            payload.push('\n');
        }

        let temp_filename = self.temp_filename();
        let mut temp = File::create(&temp_filename)?;
        temp.write_all(payload.as_bytes())?;
        temp.sync_all()?;
        drop(temp);
        fs::rename(&temp_filename, &self.filename)?;
        sync_parent_dir(&self.filename)?;
        self.appends_since_compaction = 0;
        Ok(())
    }

    fn serialize_record(&self, record: &LogRecord) -> PlumeResult<String> {
        let line = match record {
            LogRecord::Doc(doc) => serde_json::to_string(doc)?,
            LogRecord::Remove(id) => {
                let mut tombstone = Document::new();
                tombstone.put(DELETED_MARKER, true)?;
                tombstone.put(DOC_ID, Value::Id(*id))?;
                serde_json::to_string(&tombstone)?
            }
            LogRecord::IndexCreated(definition) => {
                let mut details = Document::new();
                details.put("fieldName", definition.field_name.as_str())?;
                details.put("unique", definition.unique)?;
                details.put("sparse", definition.sparse)?;
                let mut marker = Document::new();
                marker.put(INDEX_CREATED_MARKER, Value::Document(details))?;
                serde_json::to_string(&marker)?
            }
            LogRecord::IndexRemoved(field_name) => {
                let mut marker = Document::new();
                marker.put(INDEX_REMOVED_MARKER, field_name.as_str())?;
                serde_json::to_string(&marker)?
            }
        };
        Ok(match &self.after_serialization {
            Some(hook) => hook(&line),
            None => line,
        })
    }

    fn parse_record(&self, line: &str) -> PlumeResult<LogRecord> {
        let line = match &self.before_deserialization {
            Some(hook) => hook(line),
            None => line.to_string(),
        };
        let doc: Document = serde_json::from_str(&line)?;

        if doc.get(DELETED_MARKER) == Value::Bool(true) {
            let id = doc.doc_id().ok_or_else(|| {
                PlumeError::new("Tombstone without an id", ErrorKind::FileCorrupted)
            })?;
            return Ok(LogRecord::Remove(id));
        }
        if let Value::Document(def) = doc.get(INDEX_CREATED_MARKER) {
            let Value::String(field_name) = def.get("fieldName") else {
                return Err(PlumeError::new(
                    "Index marker without a field name",
                    ErrorKind::FileCorrupted,
                ));
            };
            return Ok(LogRecord::IndexCreated(IndexDefinition {
                field_name,
                unique: def.get("unique") == Value::Bool(true),
                sparse: def.get("sparse") == Value::Bool(true),
            }));
        }
        if let Value::String(field_name) = doc.get(INDEX_REMOVED_MARKER) {
            return Ok(LogRecord::IndexRemoved(field_name));
        }

        if doc.doc_id().is_none() {
            return Err(PlumeError::new(
                "Journaled document without an id",
                ErrorKind::FileCorrupted,
            ));
        }
        Ok(LogRecord::Doc(doc))
    }

    fn ensure_datafile(&self) -> PlumeResult<()> {
        if let Some(parent) = self.filename.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        if !self.filename.exists() {
            File::create(&self.filename)?.sync_all()?;
        }
        Ok(())
    }

    fn temp_filename(&self) -> PathBuf {
        let mut name = self.filename.as_os_str().to_os_string();
        name.push(TEMP_SUFFIX);
        PathBuf::from(name)
    }
}

fn sync_parent_dir(filename: &Path) -> PlumeResult<()> {
    if let Some(parent) = filename.parent() {
        if !parent.as_os_str().is_empty() {
            File::open(parent)?.sync_all()?;
        }
    }
    Ok(())
}

/// Rejects hook pairs that do not invert each other, before any data is
/// at stake.
fn verify_hooks_are_inverse(
    after: &Option<SerializationHook>,
    before: &Option<SerializationHook>,
) -> PlumeResult<()> {
    let identity: SerializationHook = Arc::new(|line: &str| line.to_string());
    let after = after.as_ref().unwrap_or(&identity);
    let before = before.as_ref().unwrap_or(&identity);
    let probes = [
        "something to serialize",
        "{\"_id\":1000000000000000001,\"probe\":true}",
        "",
    ];
    for probe in probes {
        if before(&after(probe)) != probe {
            log::error!("Serialization hooks are not inverse functions");
            return Err(PlumeError::new(
                "Serialization hooks are not inverse functions",
                ErrorKind::ValidationError,
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::IndexOptions;
    use crate::doc;
    use tempfile::tempdir;

    fn open(filename: &Path) -> Persistence {
        Persistence::new(filename, false, 0.1, None, None).unwrap()
    }

    fn journal(persistence: &mut Persistence, collection: &mut IndexedCollection, n: i64) {
        let stored = collection.insert(doc! { "n": n }).unwrap();
        persistence
            .persist_new_state(&[LogRecord::Doc(stored)])
            .unwrap();
    }

    #[test]
    fn load_creates_missing_file_and_directories() {
        let dir = tempdir().unwrap();
        let filename = dir.path().join("deep/nested/data.db");
        let mut persistence = open(&filename);
        let mut collection = IndexedCollection::new(None);
        persistence.load_database(&mut collection).unwrap();
        assert!(filename.exists());
        assert_eq!(collection.len(), 0);
    }

    #[test]
    fn journaled_writes_survive_a_reload() {
        let dir = tempdir().unwrap();
        let filename = dir.path().join("data.db");
        let mut persistence = open(&filename);
        let mut collection = IndexedCollection::new(None);
        persistence.load_database(&mut collection).unwrap();

        for n in 0..5 {
            journal(&mut persistence, &mut collection, n);
        }
        let stored = collection.find_one(&doc! { "n": 2 }).unwrap().unwrap();
        persistence
            .persist_new_state(&[LogRecord::Remove(stored.doc_id().unwrap())])
            .unwrap();

        let mut reloaded = IndexedCollection::new(None);
        open(&filename).load_database(&mut reloaded).unwrap();
        assert_eq!(reloaded.len(), 4);
        assert_eq!(reloaded.count(&doc! { "n": 2 }).unwrap(), 0);
    }

    #[test]
    fn replay_keeps_the_last_version_per_id() {
        let dir = tempdir().unwrap();
        let filename = dir.path().join("data.db");
        let mut persistence = open(&filename);
        let mut collection = IndexedCollection::new(None);
        persistence.load_database(&mut collection).unwrap();

        let stored = collection.insert(doc! { "v": 1 }).unwrap();
        let mut newer = stored.clone();
        newer.put("v", 2).unwrap();
        persistence
            .persist_new_state(&[LogRecord::Doc(stored), LogRecord::Doc(newer)])
            .unwrap();

        let mut reloaded = IndexedCollection::new(None);
        open(&filename).load_database(&mut reloaded).unwrap();
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.count(&doc! { "v": 2 }).unwrap(), 1);
    }

    #[test]
    fn a_truncated_tail_is_tolerated() {
        let dir = tempdir().unwrap();
        let filename = dir.path().join("data.db");
        let mut persistence = open(&filename);
        let mut collection = IndexedCollection::new(None);
        persistence.load_database(&mut collection).unwrap();
        for n in 0..20 {
            journal(&mut persistence, &mut collection, n);
        }

        // a crash mid-append leaves a half-written last line
        let mut file = OpenOptions::new().append(true).open(&filename).unwrap();
        file.write_all(b"{\"_id\":100000000000").unwrap();
        drop(file);

        let mut reloaded = IndexedCollection::new(None);
        open(&filename).load_database(&mut reloaded).unwrap();
        assert_eq!(reloaded.len(), 20);
    }

    #[test]
    fn too_many_corrupt_lines_fail_the_load() {
        let dir = tempdir().unwrap();
        let filename = dir.path().join("data.db");
        fs::write(&filename, "not json\nstill not json\n{\"broken\n").unwrap();

        let mut collection = IndexedCollection::new(None);
        let err = open(&filename)
            .load_database(&mut collection)
            .unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::FileCorrupted);
    }

    #[test]
    fn compaction_drops_superseded_lines_and_is_idempotent() {
        let dir = tempdir().unwrap();
        let filename = dir.path().join("data.db");
        let mut persistence = open(&filename);
        let mut collection = IndexedCollection::new(None);
        persistence.load_database(&mut collection).unwrap();

        let stored = collection.insert(doc! { "v": 1 }).unwrap();
        persistence
            .persist_new_state(&[LogRecord::Doc(stored.clone())])
            .unwrap();
        let mut newer = stored;
        newer.put("v", 2).unwrap();
        collection.insert_loaded(newer.clone()).unwrap();
        persistence
            .persist_new_state(&[LogRecord::Doc(newer)])
            .unwrap();
        assert_eq!(fs::read_to_string(&filename).unwrap().lines().count(), 2);

        persistence.persist_cached_database(&collection).unwrap();
        let compacted = fs::read_to_string(&filename).unwrap();
        assert_eq!(compacted.lines().count(), 1);
        assert_eq!(persistence.appends_since_compaction(), 0);

        persistence.persist_cached_database(&collection).unwrap();
        assert_eq!(fs::read_to_string(&filename).unwrap(), compacted);
        assert!(!filename.with_extension("db~").exists());
    }

    #[test]
    fn index_markers_rebuild_indexes_on_load() {
        let dir = tempdir().unwrap();
        let filename = dir.path().join("data.db");
        let mut persistence = open(&filename);
        let mut collection = IndexedCollection::new(None);
        persistence.load_database(&mut collection).unwrap();

        collection
            .ensure_index(IndexDefinition::new("email", IndexOptions::unique()))
            .unwrap();
        persistence
            .persist_new_state(&[LogRecord::IndexCreated(IndexDefinition::new(
                "email",
                IndexOptions::unique(),
            ))])
            .unwrap();
        journal(&mut persistence, &mut collection, 1);

        let mut reloaded = IndexedCollection::new(None);
        open(&filename).load_database(&mut reloaded).unwrap();
        let definitions = reloaded.index_definitions();
        assert_eq!(definitions.len(), 1);
        assert_eq!(definitions[0].field_name, "email");
        assert!(definitions[0].unique);

        persistence
            .persist_new_state(&[LogRecord::IndexRemoved("email".to_string())])
            .unwrap();
        let mut reloaded = IndexedCollection::new(None);
        open(&filename).load_database(&mut reloaded).unwrap();
        assert!(reloaded.index_definitions().is_empty());
    }

    #[test]
    fn serialization_hooks_apply_to_every_line() {
        let dir = tempdir().unwrap();
        let filename = dir.path().join("data.db");
        let after: SerializationHook = Arc::new(|line: &str| format!("raw:{}", line));
        let before: SerializationHook =
            Arc::new(|line: &str| line.strip_prefix("raw:").unwrap_or(line).to_string());

        let mut persistence =
            Persistence::new(&filename, false, 0.1, Some(after.clone()), Some(before.clone()))
                .unwrap();
        let mut collection = IndexedCollection::new(None);
        persistence.load_database(&mut collection).unwrap();
        journal(&mut persistence, &mut collection, 7);

        let raw = fs::read_to_string(&filename).unwrap();
        assert!(raw.lines().all(|line| line.starts_with("raw:")));

        let mut reloaded = IndexedCollection::new(None);
        Persistence::new(&filename, false, 0.1, Some(after), Some(before))
            .unwrap()
            .load_database(&mut reloaded)
            .unwrap();
        assert_eq!(reloaded.count(&doc! { "n": 7 }).unwrap(), 1);
    }

    #[test]
    fn non_inverse_hooks_are_rejected_up_front() {
        let after: SerializationHook = Arc::new(|line: &str| format!("raw:{}", line));
        let err = Persistence::new(Path::new("x.db"), false, 0.1, Some(after), None)
            .err()
            .unwrap();
        assert_eq!(err.kind(), &ErrorKind::ValidationError);
    }

    #[test]
    fn append_to_an_unwritable_path_fails() {
        let dir = tempdir().unwrap();
        let mut persistence = open(dir.path());
        let err = persistence
            .persist_new_state(&[LogRecord::IndexRemoved("x".to_string())])
            .unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::IOError);
        assert_eq!(persistence.appends_since_compaction(), 0);
    }

    #[test]
    fn in_memory_mode_never_touches_the_disk() {
        let dir = tempdir().unwrap();
        let filename = dir.path().join("data.db");
        let mut persistence = Persistence::new(&filename, true, 0.1, None, None).unwrap();
        let mut collection = IndexedCollection::new(None);
        persistence.load_database(&mut collection).unwrap();
        journal(&mut persistence, &mut collection, 1);
        assert!(!filename.exists());
    }
}
