pub mod planner;
pub mod tokenizer;

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tantivy::collector::{Count, TopDocs};
use tantivy::query::{AllQuery, TermQuery};
use tantivy::schema::*;
use tantivy::{Index, IndexReader, IndexWriter, ReloadPolicy, Searcher, TantivyDocument};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::index_lock::IndexLock;
use crate::store::NoteStore;
use tokenizer::{NoteTokenizer, NOTE_TOKENIZER};

/// Current schema version - increment this when index structure changes
const SCHEMA_VERSION: u32 = 1;

const METADATA_FILE: &str = "cmdnote_meta.json";
const SEGMENTS_DIR: &str = "segments";
const LOCKS_DIR: &str = "locks";

/// Single writer thread; note edits are small and one at a time
const WRITER_MEMORY_BUDGET: usize = 20_000_000;

/// Metadata for version tracking and auto-regeneration
#[derive(Serialize, Deserialize, Clone)]
struct IndexMetadata {
    /// Application version that created this index
    app_version: String,
    /// Schema version for compatibility checking
    schema_version: u32,
    /// Repository the index was built for
    repo_path: String,
    /// When the index was created
    created_at: String,
}

impl IndexMetadata {
    fn new(repo_path: &Path) -> Self {
        Self {
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            schema_version: SCHEMA_VERSION,
            repo_path: repo_path.to_string_lossy().to_string(),
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    fn is_compatible(&self) -> bool {
        self.schema_version == SCHEMA_VERSION
    }
}

/// Field handles of an opened index
#[derive(Clone, Copy)]
pub struct Fields {
    pub path: Field,
    pub title: Field,
    pub body: Field,
}

impl Fields {
    fn resolve(schema: &Schema) -> Result<Self> {
        let field = |name: &str| {
            schema
                .get_field(name)
                .map_err(|e| Error::IndexCorruption(format!("missing field `{}`: {}", name, e)))
        };
        Ok(Self {
            path: field("path")?,
            title: field("title")?,
            body: field("body")?,
        })
    }
}

fn build_schema() -> Schema {
    let mut schema_builder = Schema::builder();

    // Positions are kept for phrase queries
    let text_options = TextOptions::default().set_indexing_options(
        TextFieldIndexing::default()
            .set_tokenizer(NOTE_TOKENIZER)
            .set_index_option(IndexRecordOption::WithFreqsAndPositions),
    );

    schema_builder.add_text_field("path", STRING | STORED);
    schema_builder.add_text_field("title", text_options.clone());
    schema_builder.add_text_field("body", text_options);
    schema_builder.build()
}

/// A change already applied to the note store, reported to the index
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChange {
    Written(String),
    Removed(String),
    Renamed { from: String, to: String },
}

/// Difference between the note store and the index
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConsistencyReport {
    /// Notes in the store that the index does not know
    pub unindexed: Vec<String>,
    /// Index entries without a note in the store
    pub orphaned: Vec<String>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.unindexed.is_empty() && self.orphaned.is_empty()
    }
}

/// Persistent inverted index over the notes of one repository.
///
/// The engine holds no open index between calls. Every access goes through
/// [`IndexEngine::read`] or [`IndexEngine::write`], which take the index lock,
/// open the index, run the operation and release everything again.
pub struct IndexEngine {
    index_dir: PathBuf,
    segments_dir: PathBuf,
    repo_dir: PathBuf,
    lock: IndexLock,
}

impl IndexEngine {
    /// Open the repository's index, creating it on first use.
    /// An index written with another schema version is discarded and rebuilt from the store.
    pub fn open(config: &Config, store: &NoteStore) -> Result<Self> {
        let index_dir = config.index_dir();
        let engine = Self {
            segments_dir: index_dir.join(SEGMENTS_DIR),
            lock: IndexLock::new(
                index_dir.join(LOCKS_DIR),
                Duration::from_millis(config.lock_timeout_ms),
            ),
            repo_dir: config.repo_dir().to_path_buf(),
            index_dir,
        };

        let needs_rebuild = {
            let _guard = engine.lock.acquire_exclusive()?;
            engine.prepare_on_disk()?
        };

        if needs_rebuild {
            let count = engine.rebuild(store)?;
            log::info!("[IndexEngine] Rebuilt index from store: {} notes", count);
        }
        Ok(engine)
    }

    /// Create or validate the on-disk index. Returns true when it was created or
    /// regenerated and has to be filled from the store. Caller holds the exclusive lock.
    fn prepare_on_disk(&self) -> Result<bool> {
        let mut regenerated = false;
        let has_index = self.segments_dir.join("meta.json").exists();

        if has_index {
            match self.read_metadata() {
                Some(metadata) if metadata.is_compatible() => {}
                Some(metadata) => {
                    log::warn!(
                        "[IndexEngine] Schema version mismatch: index={}, current={}. Regenerating...",
                        metadata.schema_version,
                        SCHEMA_VERSION
                    );
                    self.delete_segments()?;
                    regenerated = true;
                }
                None => {
                    log::warn!("[IndexEngine] No metadata found (old/corrupted index). Regenerating...");
                    self.delete_segments()?;
                    regenerated = true;
                }
            }
        }

        if !self.segments_dir.join("meta.json").exists() {
            fs::create_dir_all(&self.segments_dir).map_err(|e| Error::io(&self.segments_dir, e))?;
            Index::create_in_dir(&self.segments_dir, build_schema())?;
            self.write_metadata(&IndexMetadata::new(&self.repo_dir))?;
            log::info!("[IndexEngine] Created empty index at {:?}", self.segments_dir);
            // Notes may predate the index
            regenerated = true;
        } else {
            // Fail fast on an index that cannot be opened at all
            self.open_index()?;
        }

        Ok(regenerated)
    }

    fn read_metadata(&self) -> Option<IndexMetadata> {
        let content = fs::read_to_string(self.index_dir.join(METADATA_FILE)).ok()?;
        serde_json::from_str(&content).ok()
    }

    fn write_metadata(&self, metadata: &IndexMetadata) -> Result<()> {
        let metadata_path = self.index_dir.join(METADATA_FILE);
        let content = serde_json::to_string_pretty(metadata)
            .map_err(|e| Error::IndexCorruption(format!("failed to serialize metadata: {}", e)))?;
        let mut file = fs::File::create(&metadata_path).map_err(|e| Error::io(&metadata_path, e))?;
        file.write_all(content.as_bytes())
            .map_err(|e| Error::io(&metadata_path, e))?;
        file.sync_all().map_err(|e| Error::io(&metadata_path, e))?;
        Ok(())
    }

    fn delete_segments(&self) -> Result<()> {
        log::info!("[IndexEngine] Deleting index segments for regeneration: {:?}", self.segments_dir);
        fs::remove_dir_all(&self.segments_dir).map_err(|e| Error::io(&self.segments_dir, e))
    }

    fn open_index(&self) -> Result<(Index, Fields)> {
        let index = Index::open_in_dir(&self.segments_dir)?;
        index.tokenizers().register(NOTE_TOKENIZER, NoteTokenizer);
        let fields = Fields::resolve(&index.schema())?;
        Ok((index, fields))
    }

    fn open_reader(index: &Index) -> Result<IndexReader> {
        let reader: IndexReader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;
        Ok(reader)
    }

    /// Run a read-only operation under the shared lock
    pub fn read<T>(&self, f: impl FnOnce(&Searcher, Fields) -> Result<T>) -> Result<T> {
        let _guard = self.lock.acquire_shared()?;
        let (index, fields) = self.open_index()?;
        let reader = Self::open_reader(&index)?;
        let searcher = reader.searcher();
        f(&searcher, fields)
    }

    /// Run a mutation under the exclusive lock.
    ///
    /// On success the changes are committed, the post-conditions recorded by the
    /// session are verified and the writer is closed. On error the changes are
    /// rolled back. The lock is released on every path.
    pub fn write<T>(&self, f: impl FnOnce(&mut IndexSession) -> Result<T>) -> Result<T> {
        let _guard = self.lock.acquire_exclusive()?;
        let (index, fields) = self.open_index()?;
        let reader = Self::open_reader(&index)?;
        let writer: IndexWriter = index.writer_with_num_threads(1, WRITER_MEMORY_BUDGET)?;

        let mut session = IndexSession {
            writer,
            reader,
            fields,
            expected: HashMap::new(),
        };

        match f(&mut session) {
            Ok(value) => {
                session.close()?;
                Ok(value)
            }
            Err(e) => {
                session.abort();
                Err(e)
            }
        }
    }

    /// Index `content` under `title`, replacing whatever was indexed for it before
    pub fn add_document(&self, title: &str, content: &[u8]) -> Result<()> {
        self.write(|session| session.add_document(title, content))
    }

    /// Drop every posting of `title`. Fails with `NotFound` if it was never indexed.
    pub fn remove_document(&self, title: &str) -> Result<()> {
        self.write(|session| session.remove_document(title))
    }

    /// Bring the index in line with a change already made to the store.
    ///
    /// Removing or renaming a note the index never held is not an error: the
    /// store is authoritative, so the index only has to end up without it.
    pub fn apply(&self, change: &StoreChange, store: &NoteStore) -> Result<()> {
        log::debug!("[IndexEngine] Applying {:?}", change);
        match change {
            StoreChange::Written(title) => {
                let content = store.read(title)?;
                self.write(|session| session.add_document(title, &content))
            }
            StoreChange::Removed(title) => {
                if store.exists(title) {
                    return Err(Error::InvalidArgument(format!(
                        "{} was reported removed but is still in the store",
                        title
                    )));
                }
                self.write(|session| session.forget(title))
            }
            StoreChange::Renamed { from, to } => {
                if store.exists(from) {
                    return Err(Error::InvalidArgument(format!(
                        "{} was reported renamed but is still in the store",
                        from
                    )));
                }
                let content = store.read(to)?;
                self.write(|session| {
                    session.forget(from)?;
                    session.add_document(to, &content)
                })
            }
        }
    }

    /// Throw away every posting and index the whole store again
    pub fn rebuild(&self, store: &NoteStore) -> Result<usize> {
        let titles = store.list()?;
        log::info!("[IndexEngine] Rebuilding index from {} notes", titles.len());

        // Reading is the slow part; do it in parallel before taking the lock
        let notes: Vec<(String, Vec<u8>)> = titles
            .par_iter()
            .map(|title| store.read(title).map(|content| (title.clone(), content)))
            .collect::<Result<_>>()?;

        self.write(|session| {
            session.clear()?;
            for (title, content) in &notes {
                session.add_document(title, content)?;
            }
            Ok(notes.len())
        })
    }

    pub fn contains(&self, title: &str) -> Result<bool> {
        self.read(|searcher, fields| Ok(count_title(searcher, fields, title)? > 0))
    }

    /// Every indexed title, sorted
    pub fn indexed_titles(&self) -> Result<Vec<String>> {
        self.read(|searcher, fields| {
            let num_docs = searcher.num_docs() as usize;
            if num_docs == 0 {
                return Ok(Vec::new());
            }
            let top_docs = searcher.search(&AllQuery, &TopDocs::with_limit(num_docs))?;
            let mut titles = BTreeSet::new();
            for (_score, address) in top_docs {
                let doc: TantivyDocument = searcher.doc(address)?;
                titles.insert(stored_title(&doc, fields)?);
            }
            Ok(titles.into_iter().collect())
        })
    }

    /// Compare the index against the store
    pub fn check(&self, store: &NoteStore) -> Result<ConsistencyReport> {
        let stored: BTreeSet<String> = store.list()?.into_iter().collect();
        let indexed: BTreeSet<String> = self.indexed_titles()?.into_iter().collect();
        Ok(ConsistencyReport {
            unindexed: stored.difference(&indexed).cloned().collect(),
            orphaned: indexed.difference(&stored).cloned().collect(),
        })
    }
}

/// An open writer on the index, handed to the closure of [`IndexEngine::write`]
pub struct IndexSession {
    writer: IndexWriter,
    reader: IndexReader,
    fields: Fields,
    /// title -> whether it must be indexed once the session commits
    expected: HashMap<String, bool>,
}

impl IndexSession {
    pub fn add_document(&mut self, title: &str, content: &[u8]) -> Result<()> {
        let body = String::from_utf8_lossy(content);
        self.writer.delete_term(Term::from_field_text(self.fields.path, title));

        let mut doc = TantivyDocument::new();
        doc.add_text(self.fields.path, title);
        doc.add_text(self.fields.title, title);
        doc.add_text(self.fields.body, &body);
        self.writer.add_document(doc)?;

        self.expected.insert(title.to_string(), true);
        log::debug!("[IndexSession] Indexed {} ({} bytes)", title, content.len());
        Ok(())
    }

    pub fn remove_document(&mut self, title: &str) -> Result<()> {
        if !self.is_indexed(title)? {
            return Err(Error::NotFound(format!("{} (not in search index)", title)));
        }
        self.writer.delete_term(Term::from_field_text(self.fields.path, title));
        self.expected.insert(title.to_string(), false);
        log::debug!("[IndexSession] Removed {}", title);
        Ok(())
    }

    /// Delete every document
    pub fn clear(&mut self) -> Result<()> {
        self.writer.delete_all_documents()?;
        for present in self.expected.values_mut() {
            *present = false;
        }
        Ok(())
    }

    /// Make sure `title` is gone from the index after commit. A title that
    /// was never indexed is only logged; the store change it follows already happened.
    pub fn forget(&mut self, title: &str) -> Result<()> {
        match self.remove_document(title) {
            Err(Error::NotFound(_)) => {
                log::warn!("[IndexSession] {} was not indexed, nothing to remove", title);
                self.expected.insert(title.to_string(), false);
                Ok(())
            }
            other => other,
        }
    }

    /// Whether `title` is indexed, counting this session's uncommitted changes
    fn is_indexed(&self, title: &str) -> Result<bool> {
        if let Some(&present) = self.expected.get(title) {
            return Ok(present);
        }
        let searcher = self.reader.searcher();
        Ok(count_title(&searcher, self.fields, title)? > 0)
    }

    fn close(mut self) -> Result<()> {
        self.writer.commit()?;
        self.reader.reload()?;

        let searcher = self.reader.searcher();
        for (title, &present) in &self.expected {
            let count = count_title(&searcher, self.fields, title)?;
            let holds = if present { count == 1 } else { count == 0 };
            if !holds {
                log::error!(
                    "[IndexSession] Post-condition failed for {}: expected present={}, found {} documents",
                    title,
                    present,
                    count
                );
                return Err(Error::IndexCorruption(format!(
                    "{} is indexed {} times after commit, expected {}",
                    title,
                    count,
                    if present { 1 } else { 0 }
                )));
            }
        }

        self.writer.wait_merging_threads()?;
        Ok(())
    }

    fn abort(mut self) {
        if let Err(e) = self.writer.rollback() {
            log::error!("[IndexSession] Rollback failed: {}", e);
        }
    }
}

fn count_title(searcher: &Searcher, fields: Fields, title: &str) -> Result<usize> {
    let query = TermQuery::new(
        Term::from_field_text(fields.path, title),
        IndexRecordOption::Basic,
    );
    Ok(searcher.search(&query, &Count)?)
}

pub(crate) fn stored_title(doc: &TantivyDocument, fields: Fields) -> Result<String> {
    doc.get_first(fields.path)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| Error::IndexCorruption("document without a stored path".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup(temp_dir: &TempDir) -> (NoteStore, IndexEngine) {
        let config = Config::new(temp_dir.path()).with_lock_timeout_ms(2_000);
        let store = NoteStore::new(&config).unwrap();
        let engine = IndexEngine::open(&config, &store).unwrap();
        (store, engine)
    }

    #[test]
    fn test_created_empty_on_first_use() {
        let temp_dir = TempDir::new().unwrap();
        let (_store, engine) = setup(&temp_dir);

        assert!(temp_dir.path().join(".notes.index").join(METADATA_FILE).exists());
        assert!(engine.indexed_titles().unwrap().is_empty());
    }

    #[test]
    fn test_add_document_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let (_store, engine) = setup(&temp_dir);

        engine.add_document("a.txt", b"first version").unwrap();
        engine.add_document("a.txt", b"second version").unwrap();

        assert_eq!(engine.indexed_titles().unwrap(), vec!["a.txt".to_string()]);
    }

    #[test]
    fn test_remove_unknown_document_is_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let (_store, engine) = setup(&temp_dir);

        match engine.remove_document("never.txt") {
            Err(Error::NotFound(msg)) => assert!(msg.contains("never.txt")),
            other => panic!("Expected NotFound, got: {:?}", other),
        }
    }

    #[test]
    fn test_failed_unit_is_rolled_back() {
        let temp_dir = TempDir::new().unwrap();
        let (_store, engine) = setup(&temp_dir);

        let result = engine.write(|session| {
            session.add_document("a.txt", b"should not survive")?;
            session.remove_document("missing.txt")
        });
        assert!(matches!(result, Err(Error::NotFound(_))));
        assert!(!engine.contains("a.txt").unwrap(), "Rolled-back add must not be visible");

        // Lock must have been released by the failed unit
        engine.add_document("b.txt", b"fine").unwrap();
        assert!(engine.contains("b.txt").unwrap());
    }

    #[test]
    fn test_apply_rejects_changes_the_store_does_not_show() {
        let temp_dir = TempDir::new().unwrap();
        let (store, engine) = setup(&temp_dir);

        store.write("kept.txt", b"still here").unwrap();
        engine.apply(&StoreChange::Written("kept.txt".into()), &store).unwrap();

        let result = engine.apply(&StoreChange::Removed("kept.txt".into()), &store);
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        assert!(engine.contains("kept.txt").unwrap());

        let result = engine.apply(&StoreChange::Written("ghost.txt".into()), &store);
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_apply_tolerates_notes_the_index_never_held() {
        let temp_dir = TempDir::new().unwrap();
        let (store, engine) = setup(&temp_dir);

        // Written behind the engine's back, so never indexed
        store.write("removed.txt", b"unindexed").unwrap();
        store.write("moved.txt", b"unindexed too").unwrap();
        assert!(!engine.contains("removed.txt").unwrap());

        store.remove("removed.txt").unwrap();
        engine.apply(&StoreChange::Removed("removed.txt".into()), &store).unwrap();

        store.rename("moved.txt", "arrived.txt").unwrap();
        engine
            .apply(
                &StoreChange::Renamed {
                    from: "moved.txt".into(),
                    to: "arrived.txt".into(),
                },
                &store,
            )
            .unwrap();

        assert_eq!(engine.indexed_titles().unwrap(), vec!["arrived.txt".to_string()]);
        assert!(engine.check(&store).unwrap().is_consistent());
    }

    #[test]
    fn test_schema_mismatch_triggers_rebuild() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::new(temp_dir.path());
        let store = NoteStore::new(&config).unwrap();
        store.write("one.txt", b"alpha").unwrap();
        store.write("two/three.txt", b"beta").unwrap();

        {
            let engine = IndexEngine::open(&config, &store).unwrap();
            engine.add_document("one.txt", b"alpha").unwrap();
        }

        // Pretend an older release wrote the index
        let meta_path = config.index_dir().join(METADATA_FILE);
        let mut metadata: IndexMetadata =
            serde_json::from_str(&fs::read_to_string(&meta_path).unwrap()).unwrap();
        metadata.schema_version = SCHEMA_VERSION + 100;
        fs::write(&meta_path, serde_json::to_string(&metadata).unwrap()).unwrap();

        let engine = IndexEngine::open(&config, &store).unwrap();
        assert_eq!(
            engine.indexed_titles().unwrap(),
            vec!["one.txt".to_string(), "two/three.txt".to_string()]
        );
        assert!(engine.check(&store).unwrap().is_consistent());
    }

    #[test]
    fn test_check_reports_divergence() {
        let temp_dir = TempDir::new().unwrap();
        let (store, engine) = setup(&temp_dir);

        store.write("unindexed.txt", b"written behind our back").unwrap();
        engine.add_document("orphan.txt", b"no file").unwrap();

        let report = engine.check(&store).unwrap();
        assert_eq!(report.unindexed, vec!["unindexed.txt".to_string()]);
        assert_eq!(report.orphaned, vec!["orphan.txt".to_string()]);

        engine.rebuild(&store).unwrap();
        assert!(engine.check(&store).unwrap().is_consistent());
    }

    #[test]
    fn test_unreadable_index_is_corruption() {
        let temp_dir = TempDir::new().unwrap();
        let (_store, engine) = setup(&temp_dir);

        fs::write(
            temp_dir.path().join(".notes.index").join(SEGMENTS_DIR).join("meta.json"),
            "not json at all",
        )
        .unwrap();

        assert!(matches!(engine.contains("a.txt"), Err(Error::IndexCorruption(_))));
    }
}
