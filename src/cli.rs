use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use clap::Parser;

use crate::config::{default_config_path, Config};
use crate::error::{Error, Result};
use crate::notebook::Notebook;
use crate::process::SystemLauncher;
use crate::session::InteractiveSession;

#[derive(Parser, Debug, Default)]
#[command(name = "cmdnote")]
#[command(version, about = "Plain-file notes with full-text search")]
pub struct Cli {
    /// Read a note with the configured pager
    #[arg(short, long, value_name = "NOTENAME")]
    pub read: Option<String>,

    /// Write a note with the configured editor
    #[arg(short, long, value_name = "NOTENAME")]
    pub write: Option<String>,

    /// Take the content for --write from standard input instead of the editor
    #[arg(long, requires = "write")]
    pub stdin: bool,

    /// List all notes
    #[arg(short, long)]
    pub list: bool,

    /// Search notes by keywords
    #[arg(short, long, value_name = "KEYWORDS")]
    pub search: Option<String>,

    /// Inspect the notes of --list or --search interactively
    #[arg(short, long)]
    pub interactive: bool,

    /// Remove a note
    #[arg(long, value_name = "NOTENAME")]
    pub remove: Option<String>,

    /// Rename a note
    #[arg(long, value_name = "OLDNAME:NEWNAME")]
    pub rename: Option<String>,

    /// Rebuild the search index from the note files
    #[arg(long)]
    pub reindex: bool,

    /// Compare the search index against the note files
    #[arg(long)]
    pub check: bool,

    /// Configuration file (defaults to conf.json next to the executable)
    #[arg(long, env = "CMDNOTE_CONFIG", value_name = "PATH")]
    pub config: Option<PathBuf>,
}

/// `old:new` argument of --rename
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenamePair {
    pub old: String,
    pub new: String,
}

impl FromStr for RenamePair {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        match parts.as_slice() {
            [old, new] if !old.trim().is_empty() && !new.trim().is_empty() => Ok(Self {
                old: old.to_string(),
                new: new.to_string(),
            }),
            _ => Err(Error::InvalidArgument(format!(
                "--rename takes an arg in <oldname:newname> format, got `{}`",
                s
            ))),
        }
    }
}

/// Execute the flags in a fixed order: read, write, list, search, remove, rename, reindex, check
pub fn run(cli: Cli) -> Result<()> {
    // Composite arguments are validated before anything touches the repository
    let rename = cli.rename.as_deref().map(RenamePair::from_str).transpose()?;

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => default_config_path()?,
    };
    let config = Config::load_or_init(&config_path)?;
    let notebook = Notebook::open(config)?;
    let launcher = SystemLauncher;

    if let Some(title) = &cli.read {
        non_fatal(notebook.view(title, &launcher))?;
    }

    if let Some(title) = &cli.write {
        if cli.stdin {
            let mut content = Vec::new();
            io::stdin()
                .read_to_end(&mut content)
                .map_err(|e| Error::io(Path::new("<stdin>"), e))?;
            notebook.write(title, &content)?;
        } else {
            non_fatal(notebook.edit(title, &launcher))?;
        }
    }

    if cli.list {
        let titles = notebook.list()?;
        show(&notebook, titles, cli.interactive, &launcher)?;
    }

    if let Some(keywords) = &cli.search {
        let titles = match notebook.search(keywords) {
            Ok(titles) => titles,
            Err(e @ Error::InvalidQuery(_)) => {
                warn(&e);
                Vec::new()
            }
            Err(e) => return Err(e),
        };
        show(&notebook, titles, cli.interactive, &launcher)?;
    }

    if let Some(title) = &cli.remove {
        notebook.remove(title)?;
    }

    if let Some(pair) = &rename {
        notebook.rename(&pair.old, &pair.new)?;
    }

    if cli.reindex {
        let count = notebook.rebuild_index()?;
        println!("Reindexed {} notes", count);
    }

    if cli.check {
        let report = notebook.check()?;
        for title in &report.unindexed {
            println!("not indexed: {}", title);
        }
        for title in &report.orphaned {
            println!("indexed but missing: {}", title);
        }
        if !report.is_consistent() {
            return Err(Error::IndexCorruption(format!(
                "{} notes not indexed, {} index entries without a note",
                report.unindexed.len(),
                report.orphaned.len()
            )));
        }
        println!("Index is consistent with the notes");
    }

    Ok(())
}

fn show(notebook: &Notebook, titles: Vec<String>, interactive: bool, launcher: &SystemLauncher) -> Result<()> {
    if interactive {
        let stdin = io::stdin();
        let stdout = io::stdout();
        InteractiveSession::new(
            titles,
            notebook.store(),
            launcher,
            &notebook.config().pager,
            stdin.lock(),
            stdout.lock(),
        )
        .run()?;
        return Ok(());
    }

    let stdout = io::stdout();
    let mut out = stdout.lock();
    for title in titles {
        writeln!(out, "{}", title).map_err(|e| Error::io(Path::new("<stdout>"), e))?;
    }
    Ok(())
}

/// Report recoverable errors and carry on
fn non_fatal(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if !e.is_fatal() => {
            warn(&e);
            Ok(())
        }
        other => other,
    }
}

fn warn(e: &Error) {
    log::warn!("{}", e);
    eprintln!("warning: {}", e);
}
