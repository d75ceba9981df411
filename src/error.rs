//! Error types for latchdb.

use thiserror::Error;

use crate::types::Key;

/// Top-level error type for all engine operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed schema descriptor or open request.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A handle for this database name is already open.
    #[error("database '{0}' is already open")]
    AlreadyOpen(String),

    /// The database handle was closed.
    #[error("database '{0}' is closed")]
    Closed(String),

    /// `drop` requires the handle to be closed first.
    #[error("database '{0}' must be closed before it can be dropped")]
    NotClosed(String),

    /// A schema upgrade was requested while a handle for the name is open.
    #[error("upgrade of database '{0}' blocked: a handle is still open")]
    UpgradeBlocked(String),

    /// A version change was requested while other connections are live.
    #[error("database '{0}' blocked: {1} live connection(s) prevent the version change")]
    Blocked(String, usize),

    /// The named table does not exist in the database.
    #[error("table '{table}' not found in database '{database}'")]
    UnknownTable { database: String, table: String },

    /// Payload or builder-usage validation failure.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A bulk update was issued without any set or del clause.
    #[error("bulk update requires at least one set or del clause")]
    MissingMutation,

    /// Failure reported by the backing store.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Synchronous validation failures: record shape, key shape, and
/// builder-option conflicts. Raised before any store command is admitted.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("record must be a JSON object")]
    NotAnObject,

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("record is missing primary key field '{field}' of table '{table}'")]
    MissingKeyField { table: String, field: String },

    #[error("'{option}' cannot be combined with 'count'")]
    ConflictsWithCount { option: &'static str },

    #[error("'count' cannot be combined with the previously selected options")]
    CountConflict,

    #[error("'equals' was already specified")]
    EqualsAlreadySet,

    #[error("'equals' cannot be combined with lower or upper bounds")]
    EqualsWithBounds,

    #[error("the {which} bound was already specified")]
    BoundAlreadySet { which: &'static str },

    #[error("the keyvalue projection requires a selected index")]
    KeyValueNeedsIndex,
}

/// Failures surfaced by the backing store while executing an admitted
/// command. Any such failure aborts the whole command with no partial
/// effects.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("duplicate primary key {key} in table '{table}'")]
    DuplicateKey { table: String, key: Key },

    #[error("unique index '{index}' violated by key {key}")]
    UniqueViolation { index: String, key: Key },

    #[error("table '{0}' not found in store")]
    UnknownTable(String),

    #[error("index '{index}' not found on table '{table}'")]
    UnknownIndex { table: String, index: String },

    #[error("primary key of record {key} in table '{table}' was modified by a bulk update")]
    PrimaryKeyChanged { table: String, key: Key },

    #[error("store task unavailable")]
    Disconnected,
}

pub type Result<T> = std::result::Result<T, Error>;
