use std::path::PathBuf;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::process::ProgramLauncher;
use crate::search::planner::QueryPlanner;
use crate::search::{ConsistencyReport, IndexEngine, StoreChange};
use crate::store::NoteStore;

/// One note repository: its files and the index kept in step with them.
///
/// Every store mutation is followed by the matching [`StoreChange`]
/// notification to the index engine. The two steps are not atomic; a crash in
/// between leaves a divergence that [`Notebook::check`] reports and
/// [`Notebook::rebuild_index`] repairs.
pub struct Notebook {
    config: Config,
    store: NoteStore,
    index: IndexEngine,
}

impl Notebook {
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        let store = NoteStore::new(&config)?;
        let index = IndexEngine::open(&config, &store)?;
        log::debug!("[Notebook] Opened repository {:?}", config.repo_dir());
        Ok(Self { config, store, index })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &NoteStore {
        &self.store
    }

    pub fn index(&self) -> &IndexEngine {
        &self.index
    }

    pub fn list(&self) -> Result<Vec<String>> {
        self.store.list()
    }

    pub fn read(&self, title: &str) -> Result<Vec<u8>> {
        self.store.read(title)
    }

    /// Path of an existing note
    pub fn note_path(&self, title: &str) -> Result<PathBuf> {
        if !self.store.exists(title) {
            return Err(Error::NotFound(title.to_string()));
        }
        self.store.path(title)
    }

    pub fn write(&self, title: &str, content: &[u8]) -> Result<()> {
        self.store.write(title, content)?;
        self.index
            .apply(&StoreChange::Written(title.to_string()), &self.store)
    }

    /// Let the configured editor write the note, then index whatever it left behind
    pub fn edit<L: ProgramLauncher>(&self, title: &str, launcher: &L) -> Result<()> {
        let path = self.store.prepare(title)?;
        let launched = launcher.launch(&self.config.editor, &path);

        if self.store.exists(title) {
            self.index
                .apply(&StoreChange::Written(title.to_string()), &self.store)?;
        } else {
            log::info!("[Notebook] Editor left no file for {}, nothing to index", title);
        }
        launched
    }

    /// Open a note with the configured pager
    pub fn view<L: ProgramLauncher>(&self, title: &str, launcher: &L) -> Result<()> {
        let path = self.note_path(title)?;
        launcher.launch(&self.config.pager, &path)
    }

    pub fn remove(&self, title: &str) -> Result<()> {
        self.store.remove(title)?;
        self.index
            .apply(&StoreChange::Removed(title.to_string()), &self.store)
    }

    /// Rename a note; fails with `AlreadyExists` rather than overwrite `new`
    pub fn rename(&self, old: &str, new: &str) -> Result<()> {
        self.store.rename(old, new)?;
        self.index.apply(
            &StoreChange::Renamed {
                from: old.to_string(),
                to: new.to_string(),
            },
            &self.store,
        )
    }

    /// Titles matching `keywords`, most relevant first
    pub fn search(&self, keywords: &str) -> Result<Vec<String>> {
        QueryPlanner::new(&self.index).query(keywords)
    }

    pub fn rebuild_index(&self) -> Result<usize> {
        self.index.rebuild(&self.store)
    }

    pub fn check(&self) -> Result<ConsistencyReport> {
        self.index.check(&self.store)
    }
}
