//! The per-table handle: direct writes, builder factories, and eager
//! admission.
//!
//! Every operation here is admitted synchronously: validation runs, a
//! write guard is taken, and the store command is enqueued before the
//! returned [`Pending`] exists. That is what makes "admitted in call
//! order, resolved in admission order" hold per table.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::trace;

use crate::api::delete::BulkDelete;
use crate::api::pending::{Pending, PendingWrites};
use crate::api::query::Query;
use crate::api::update::BulkUpdate;
use crate::error::{Error, Result, ValidationError};
use crate::store::plan::WriteOp;
use crate::store::{Command, StoreLink};
use crate::types::{Key, KeySpec};

/// A handle to one table of an open database. Cheap to clone.
#[derive(Clone)]
pub struct Table {
    inner: Arc<TableInner>,
}

struct TableInner {
    name: String,
    database: String,
    key: KeySpec,
    closed: Arc<AtomicBool>,
    pending: PendingWrites,
    link: StoreLink,
}

impl Table {
    pub(crate) fn new(
        name: String,
        database: String,
        key: KeySpec,
        closed: Arc<AtomicBool>,
        link: StoreLink,
    ) -> Self {
        Table {
            inner: Arc::new(TableInner {
                name,
                database,
                key,
                closed,
                pending: PendingWrites::default(),
                link,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn database(&self) -> &str {
        &self.inner.database
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed(self.inner.database.clone()));
        }
        Ok(())
    }

    pub(crate) fn pending(&self) -> &PendingWrites {
        &self.inner.pending
    }

    pub(crate) fn link(&self) -> &StoreLink {
        &self.inner.link
    }

    /// Shape check applied before any write is admitted: the payload must
    /// be an object, and when the table declares a non-generated key path
    /// the field must be present and key-typed.
    pub(crate) fn validate_record(&self, record: &Value) -> Result<()> {
        if !record.is_object() {
            return Err(ValidationError::NotAnObject.into());
        }
        if let Some(path) = &self.inner.key.path {
            match record.get(path) {
                Some(value) => {
                    Key::from_value(value)?;
                }
                None if self.inner.key.auto_increment => {}
                None => {
                    return Err(ValidationError::MissingKeyField {
                        table: self.inner.name.clone(),
                        field: path.clone(),
                    }
                    .into());
                }
            }
        }
        Ok(())
    }

    fn admit_write(&self, op: WriteOp) -> Result<Pending<Vec<Key>>> {
        let guard = self.inner.pending.acquire();
        let (tx, rx) = oneshot::channel();
        self.inner.link.send(Command::Apply { op, reply: tx })?;
        trace!(table = %self.inner.name, "write admitted");
        Ok(Pending::new(rx, vec![guard]))
    }

    /// Inserts one record. Resolves with the assigned key (a one-element
    /// list, matching `insert_many`).
    pub fn insert(&self, record: Value) -> Result<Pending<Vec<Key>>> {
        self.insert_many(vec![record])
    }

    /// Inserts a batch. Resolves with the assigned keys in input order;
    /// any duplicate-key or unique-index collision fails the whole batch.
    pub fn insert_many(&self, records: Vec<Value>) -> Result<Pending<Vec<Key>>> {
        self.ensure_open()?;
        for record in &records {
            self.validate_record(record)?;
        }
        self.admit_write(WriteOp::Insert {
            table: self.inner.name.clone(),
            records,
        })
    }

    /// Inserts or replaces one record by its primary key.
    pub fn update(&self, record: Value) -> Result<Pending<Vec<Key>>> {
        self.update_many(vec![record])
    }

    pub fn update_many(&self, records: Vec<Value>) -> Result<Pending<Vec<Key>>> {
        self.ensure_open()?;
        for record in &records {
            self.validate_record(record)?;
        }
        self.admit_write(WriteOp::Upsert {
            table: self.inner.name.clone(),
            records,
        })
    }

    /// Removes one record. Removing an absent key succeeds and still
    /// reports the key.
    pub fn remove(&self, key: impl Into<Key>) -> Result<Pending<Vec<Key>>> {
        self.remove_many(vec![key.into()])
    }

    pub fn remove_many(&self, keys: Vec<Key>) -> Result<Pending<Vec<Key>>> {
        self.ensure_open()?;
        self.admit_write(WriteOp::Delete {
            table: self.inner.name.clone(),
            keys,
        })
    }

    /// Deletes every record. The key generator is not reset.
    pub fn truncate(&self) -> Result<Pending<()>> {
        self.ensure_open()?;
        let guard = self.inner.pending.acquire();
        let (tx, rx) = oneshot::channel();
        self.inner.link.send(Command::Clear {
            table: self.inner.name.clone(),
            reply: tx,
        })?;
        trace!(table = %self.inner.name, "truncate admitted");
        Ok(Pending::new(rx, vec![guard]))
    }

    pub fn query(&self) -> Query {
        Query::new(self.clone())
    }

    pub fn bulk_update(&self) -> BulkUpdate {
        BulkUpdate::new(self.clone())
    }

    pub fn bulk_delete(&self) -> BulkDelete {
        BulkDelete::new(self.clone())
    }
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.inner.name)
            .field("database", &self.inner.database)
            .finish_non_exhaustive()
    }
}
