use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Directory under the repository root holding the search index.
/// Anything whose relative path starts with this name is not a note.
pub const INDEX_DIR_NAME: &str = ".notes.index";

/// File name of the configuration next to the executable
pub const CONFIG_FILE_NAME: &str = "conf.json";

const DEFAULT_LOCK_TIMEOUT_MS: u64 = 10_000;

fn default_lock_timeout_ms() -> u64 {
    DEFAULT_LOCK_TIMEOUT_MS
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Program used to write notes
    pub editor: String,
    /// Program used to read notes (older files call it `browser`)
    #[serde(alias = "browser")]
    pub pager: String,
    /// Root directory of the note repository
    pub local_repo_dir: PathBuf,
    /// How long to wait for the index lock before giving up
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

impl Config {
    /// Config rooted at `repo_dir` with the platform's default programs
    pub fn new(repo_dir: impl Into<PathBuf>) -> Self {
        Self {
            editor: default_program("EDITOR", "nano"),
            pager: default_program("PAGER", "less"),
            local_repo_dir: repo_dir.into(),
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
        }
    }

    pub fn with_programs(mut self, editor: &str, pager: &str) -> Self {
        self.editor = editor.to_string();
        self.pager = pager.to_string();
        self
    }

    pub fn with_lock_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.lock_timeout_ms = timeout_ms;
        self
    }

    /// Load a configuration file, writing the defaults out first if it is missing.
    /// The default repository is `cmd_notes` beside the configuration file.
    pub fn load_or_init(path: &Path) -> Result<Self> {
        if path.exists() {
            return Self::load(path);
        }
        let repo_dir = path
            .parent()
            .map(|p| p.join("cmd_notes"))
            .unwrap_or_else(|| PathBuf::from("cmd_notes"));
        let config = Self::new(repo_dir);
        log::info!("No configuration at {:?}, writing defaults", path);
        config.dump(path)?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse {:?}: {}", path, e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn dump(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("failed to serialize config: {}", e)))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        let mut file = fs::File::create(path).map_err(|e| Error::io(path, e))?;
        file.write_all(content.as_bytes())
            .map_err(|e| Error::io(path, e))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.editor.trim().is_empty() {
            return Err(Error::Config("`editor` must not be empty".into()));
        }
        if self.pager.trim().is_empty() {
            return Err(Error::Config("`pager` must not be empty".into()));
        }
        if self.local_repo_dir.as_os_str().is_empty() {
            return Err(Error::Config("`localRepoDir` must not be empty".into()));
        }
        Ok(())
    }

    pub fn repo_dir(&self) -> &Path {
        &self.local_repo_dir
    }

    pub fn index_dir(&self) -> PathBuf {
        self.local_repo_dir.join(INDEX_DIR_NAME)
    }
}

/// `conf.json` next to the running executable
pub fn default_config_path() -> Result<PathBuf> {
    let exe = std::env::current_exe()
        .map_err(|e| Error::Config(format!("cannot locate executable: {}", e)))?;
    let dir = exe
        .parent()
        .ok_or_else(|| Error::Config(format!("executable {:?} has no parent", exe)))?;
    Ok(dir.join(CONFIG_FILE_NAME))
}

fn default_program(env_var: &str, unix_fallback: &str) -> String {
    if let Ok(program) = std::env::var(env_var) {
        if !program.trim().is_empty() {
            return program;
        }
    }
    if cfg!(windows) {
        "notepad".to_string()
    } else {
        unix_fallback.to_string()
    }
}
