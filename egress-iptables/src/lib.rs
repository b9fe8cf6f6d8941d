pub mod backend;
pub mod chain;
pub mod features;
pub mod lock;
pub mod memory;
pub mod restore;
pub mod rule;
pub mod table;

use thiserror::Error;

pub use backend::{Backend, CommandBackend, IpVersion};
pub use chain::Chain;
pub use features::{BackendMode, Features};
pub use lock::{DataplaneLock, DummyLock, SharedLock};
pub use memory::MemoryBackend;
pub use rule::{Action, MatchCriteria, Rule};
pub use table::{InsertMode, Table, TableOptions};

#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("`{command}` failed: {message}")]
    CommandFailed { command: String, message: String },

    #[error("invalid restore input at line {line}: {message}")]
    InvalidRestoreInput { line: usize, message: String },

    #[error("failed to render delete: {0}")]
    DeleteRendering(String),

    #[error("failed to parse iptables version: {0}")]
    VersionParse(String),

    #[error("regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("failed to program table {table} after {attempts} attempts: {source}")]
    RetriesExhausted {
        table: String,
        attempts: usize,
        #[source]
        source: Box<Error>,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
