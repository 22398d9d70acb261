//! cmdnote keeps notes as plain files under a repository root and maintains a
//! full-text index next to them, updated on every write, remove and rename.

pub mod cli;
pub mod config;
pub mod error;
pub mod index_lock;
pub mod notebook;
pub mod process;
pub mod search;
pub mod session;
pub mod store;

pub use config::Config;
pub use error::{Error, Result};
pub use notebook::Notebook;
pub use search::planner::QueryPlanner;
pub use search::{ConsistencyReport, IndexEngine, StoreChange};
pub use store::NoteStore;
