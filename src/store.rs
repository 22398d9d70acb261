//! File-backed note registry.
//!
//! A note is a regular file under the repository root and its title is the
//! `/`-separated path relative to that root. The index subtree lives under the
//! same root and is never reported as a note.

use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

use walkdir::WalkDir;

use crate::config::{Config, INDEX_DIR_NAME};
use crate::error::{Error, Result};

/// Suffix of the temp file used while a note is being written
const TEMP_SUFFIX: &str = ".cmdnote-tmp";

pub struct NoteStore {
    root: PathBuf,
}

impl NoteStore {
    /// Open the store rooted at the configured repository, creating the root if needed
    pub fn new(config: &Config) -> Result<Self> {
        let root = config.repo_dir().to_path_buf();
        if !root.exists() {
            log::info!("[NoteStore] Creating repository root {:?}", root);
            fs::create_dir_all(&root).map_err(|e| Error::io(&root, e))?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// All note titles, in traversal order.
    ///
    /// Files whose name cannot be a title (not UTF-8, or rejected by
    /// [`validate_title`]) are skipped with a warning, so every listed title
    /// can be read back.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut titles = Vec::new();
        let walker = WalkDir::new(&self.root)
            .min_depth(1)
            .into_iter()
            .filter_entry(|entry| {
                !(entry.depth() == 1 && entry.file_name().to_string_lossy().starts_with(INDEX_DIR_NAME))
            });

        for entry in walker {
            let entry = entry.map_err(|e| {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| self.root.clone());
                Error::io(path, io::Error::other(e.to_string()))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if name.ends_with(TEMP_SUFFIX) {
                continue;
            }
            match self.title_of(entry.path()) {
                Some(title) => match validate_title(&title) {
                    Ok(()) => titles.push(title),
                    Err(e) => log::warn!("[NoteStore] Skipping {:?}: {}", entry.path(), e),
                },
                None => log::warn!("[NoteStore] Skipping {:?}: file name is not valid UTF-8", entry.path()),
            }
        }
        Ok(titles)
    }

    pub fn read(&self, title: &str) -> Result<Vec<u8>> {
        let path = self.path(title)?;
        fs::read(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => Error::NotFound(title.to_string()),
            _ => Error::io(&path, e),
        })
    }

    /// Write a note, creating parent directories and replacing any previous content
    pub fn write(&self, title: &str, content: &[u8]) -> Result<()> {
        let path = self.prepare(title)?;
        atomic_write_file(&path, content)?;
        log::debug!("[NoteStore] Wrote {} ({} bytes)", title, content.len());
        Ok(())
    }

    /// Resolve a title and create its parent directories, ready for an editor to write it
    pub fn prepare(&self, title: &str) -> Result<PathBuf> {
        let path = self.path(title)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        Ok(path)
    }

    pub fn remove(&self, title: &str) -> Result<()> {
        let path = self.existing_path(title)?;
        fs::remove_file(&path).map_err(|e| Error::io(&path, e))?;
        log::debug!("[NoteStore] Removed {}", title);
        Ok(())
    }

    /// Rename a note. An existing destination is never overwritten.
    pub fn rename(&self, old: &str, new: &str) -> Result<()> {
        let old_path = self.existing_path(old)?;
        let new_path = self.path(new)?;
        if old_path == new_path {
            return Err(Error::InvalidArgument(format!(
                "cannot rename {} onto itself",
                old
            )));
        }
        if new_path.exists() {
            return Err(Error::AlreadyExists(new.to_string()));
        }
        if let Some(parent) = new_path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        fs::rename(&old_path, &new_path).map_err(|e| Error::io(&old_path, e))?;
        log::debug!("[NoteStore] Renamed {} -> {}", old, new);
        Ok(())
    }

    pub fn exists(&self, title: &str) -> bool {
        self.path(title).map(|p| p.is_file()).unwrap_or(false)
    }

    /// Absolute path of a note, whether or not it exists
    pub fn path(&self, title: &str) -> Result<PathBuf> {
        validate_title(title)?;
        Ok(title.split('/').fold(self.root.clone(), |path, part| path.join(part)))
    }

    fn existing_path(&self, title: &str) -> Result<PathBuf> {
        let path = self.path(title)?;
        if !path.is_file() {
            return Err(Error::NotFound(title.to_string()));
        }
        Ok(path)
    }

    fn title_of(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let parts = rel
            .components()
            .map(|c| c.as_os_str().to_str().map(str::to_string))
            .collect::<Option<Vec<String>>>()?;
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("/"))
        }
    }
}

/// Check that a title is a plain relative path inside the repository and outside the index
pub fn validate_title(title: &str) -> Result<()> {
    let invalid = |reason: &str| Err(Error::InvalidArgument(format!("note title `{}` {}", title, reason)));

    if title.trim().is_empty() {
        return invalid("is empty");
    }
    if title.contains('\\') {
        return invalid("must use `/` as separator");
    }
    if Path::new(title).is_absolute() || title.starts_with('/') {
        return invalid("must be relative to the repository root");
    }
    for part in title.split('/') {
        if part.is_empty() || part == "." || part == ".." {
            return invalid("contains an empty, `.` or `..` component");
        }
        if !matches!(Path::new(part).components().next(), Some(Component::Normal(_))) {
            return invalid("contains an invalid component");
        }
    }
    if title.starts_with(INDEX_DIR_NAME) {
        return invalid("points into the index directory");
    }
    if title.ends_with(TEMP_SUFFIX) {
        return invalid("uses a reserved suffix");
    }
    Ok(())
}

/// Write to a temp file in the same directory, then rename over the target,
/// so a half-written note is never seen by the index or by a reader.
fn atomic_write_file(path: &Path, content: &[u8]) -> Result<()> {
    let file_name = path.file_name().unwrap_or_default().to_string_lossy();
    let temp_path = path.with_file_name(format!("{}{}", file_name, TEMP_SUFFIX));

    let mut file = fs::File::create(&temp_path).map_err(|e| Error::io(&temp_path, e))?;
    file.write_all(content).map_err(|e| Error::io(&temp_path, e))?;
    file.sync_all().map_err(|e| Error::io(&temp_path, e))?;
    drop(file);

    fs::rename(&temp_path, path).map_err(|e| Error::io(path, e))?;
    Ok(())
}
