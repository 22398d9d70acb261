use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Errors raised by the note store, the index and the interactive loop
#[derive(Error, Debug)]
pub enum Error {
    #[error("note not found: {0}")]
    NotFound(String),

    #[error("note already exists: {0}")]
    AlreadyExists(String),

    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("search index is corrupted: {0} (run `cmdnote --reindex` to rebuild it)")]
    IndexCorruption(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("external program `{program}` failed: {reason}")]
    ExternalProcess { program: String, reason: String },

    #[error("search index is locked by {holder}; gave up after {waited_ms}ms")]
    LockTimeout { holder: String, waited_ms: u128 },

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        Error::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Fatal errors terminate the running command. The rest are reported
    /// and the caller carries on (interactive loops re-prompt).
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::InvalidQuery(_) | Error::ExternalProcess { .. })
    }
}

impl From<tantivy::TantivyError> for Error {
    fn from(e: tantivy::TantivyError) -> Self {
        Error::IndexCorruption(e.to_string())
    }
}
