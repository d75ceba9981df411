//! The database handle published by a successful open.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use crate::api::registry::RegistryInner;
use crate::api::table::Table;
use crate::api::transaction::Transaction;
use crate::error::{Error, Result};
use crate::store::StoreLink;

/// A handle to an open database. Cloning is cheap; all clones share the
/// closed flag, so closing any clone closes them all.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

struct DatabaseInner {
    name: String,
    version: u32,
    closed: Arc<AtomicBool>,
    tables: HashMap<String, Table>,
    link: StoreLink,
    registry: Arc<RegistryInner>,
}

impl Database {
    pub(crate) fn new(
        name: String,
        version: u32,
        closed: Arc<AtomicBool>,
        tables: HashMap<String, Table>,
        link: StoreLink,
        registry: Arc<RegistryInner>,
    ) -> Self {
        Database {
            inner: Arc::new(DatabaseInner {
                name,
                version,
                closed,
                tables,
                link,
                registry,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn version(&self) -> u32 {
        self.inner.version
    }

    /// Names of the store's tables at open time, sorted.
    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.tables.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn table(&self, name: &str) -> Option<Table> {
        self.inner.tables.get(name).cloned()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Marks the handle closed and releases its store connection.
    /// Idempotent; every subsequent table operation fails with `Closed`.
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            self.inner.link.connections.fetch_sub(1, Ordering::SeqCst);
            debug!(database = %self.inner.name, "database closed");
        }
    }

    /// Destroys the backing store and removes the registry entry. The
    /// handle must be closed first.
    #[allow(clippy::should_implement_trait)]
    pub fn drop(self) -> Result<()> {
        if !self.is_closed() {
            return Err(Error::NotClosed(self.inner.name.clone()));
        }
        self.inner.registry.release(&self.inner.name);
        debug!(database = %self.inner.name, "database dropped");
        Ok(())
    }

    /// Starts an empty multi-table transaction.
    pub fn transaction(&self) -> Result<Transaction> {
        if self.is_closed() {
            return Err(Error::Closed(self.inner.name.clone()));
        }
        Ok(Transaction::new(self.clone()))
    }

    pub(crate) fn link(&self) -> &StoreLink {
        &self.inner.link
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.inner.name)
            .field("version", &self.inner.version)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
