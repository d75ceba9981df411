//! The registry: owns every backing store in the process and admits opens.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::try_join_all;
use parking_lot::Mutex;
use tracing::debug;

use crate::api::database::Database;
use crate::api::table::Table;
use crate::error::{Error, Result};
use crate::store::StoreLink;
use crate::store::data::StoreData;
use crate::types::{SchemaDescriptor, TableSpec};

/// Entry point of the engine. One registry owns a set of named backing
/// stores; stores survive handle close/reopen and are destroyed only by
/// [`Database::drop`].
///
/// Cloning is cheap and every clone addresses the same stores.
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

#[derive(Default)]
pub(crate) struct RegistryInner {
    /// Backing stores by database name. Presence here is durability: a
    /// closed database keeps its entry until dropped.
    stores: Mutex<HashMap<String, StoreLink>>,
    /// Closed flag of the most recently opened handle per name.
    handles: Mutex<HashMap<String, Arc<AtomicBool>>>,
}

impl RegistryInner {
    /// Destroys the backing store and forgets the handle entry.
    pub(crate) fn release(&self, name: &str) {
        self.stores.lock().remove(name);
        self.handles.lock().remove(name);
    }
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    /// Opens (and if the requested version is ahead of the store, upgrades)
    /// a database, publishing one [`Database`] handle with a [`Table`]
    /// handle per store table.
    pub async fn open(&self, descriptor: SchemaDescriptor) -> Result<Database> {
        let SchemaDescriptor {
            name,
            version,
            tables,
        } = descriptor;
        if name.is_empty() {
            return Err(Error::Configuration(
                "database name must not be empty".into(),
            ));
        }
        if version == 0 {
            return Err(Error::Configuration(
                "database version must be at least 1".into(),
            ));
        }

        let mut handles = self.inner.handles.lock();
        if let Some(flag) = handles.get(&name) {
            if !flag.load(Ordering::SeqCst) {
                return Err(Error::AlreadyOpen(name));
            }
        }

        let link = self
            .inner
            .stores
            .lock()
            .entry(name.clone())
            .or_insert_with(|| StoreLink::spawn(&name))
            .clone();

        {
            let mut data = link.data.write();
            if version < data.version {
                return Err(Error::Configuration(format!(
                    "requested version {version} of database '{name}' is below the current version {}",
                    data.version
                )));
            }
            if version > data.version {
                // An upgrade requires that no handle is open and no peer
                // connection is live; the AlreadyOpen check above already
                // excludes both today, so these hold the invariant at the
                // point the upgrade relies on it.
                if handles.get(&name).is_some_and(|f| !f.load(Ordering::SeqCst)) {
                    return Err(Error::UpgradeBlocked(name));
                }
                let peers = link.connections.load(Ordering::SeqCst);
                if peers > 0 {
                    return Err(Error::Blocked(name, peers));
                }
                upgrade(&mut data, &name, &tables)?;
                data.version = version;
                debug!(database = %name, version, "schema upgrade applied");
            }
        }

        let closed = Arc::new(AtomicBool::new(false));
        let table_handles: HashMap<String, Table> = link
            .data
            .read()
            .tables
            .iter()
            .map(|(table_name, table)| {
                (
                    table_name.clone(),
                    Table::new(
                        table_name.clone(),
                        name.clone(),
                        table.key.clone(),
                        Arc::clone(&closed),
                        link.clone(),
                    ),
                )
            })
            .collect();
        link.connections.fetch_add(1, Ordering::SeqCst);
        handles.insert(name.clone(), Arc::clone(&closed));
        debug!(database = %name, version, tables = table_handles.len(), "database opened");
        Ok(Database::new(
            name,
            version,
            closed,
            table_handles,
            link,
            Arc::clone(&self.inner),
        ))
    }

    /// Whether the last handle opened under `name` has been closed.
    /// `None` if the name was never opened (or was dropped).
    pub fn is_closed(&self, name: &str) -> Option<bool> {
        self.inner
            .handles
            .lock()
            .get(name)
            .map(|flag| flag.load(Ordering::SeqCst))
    }

    /// Resolves when every given operation resolves, in input order, or
    /// fails with the first failure.
    pub async fn wait<T, F>(&self, ops: impl IntoIterator<Item = F>) -> Result<Vec<T>>
    where
        F: Future<Output = Result<T>>,
    {
        try_join_all(ops).await
    }
}

/// Reconciles the store's tables with the descriptor on a scratch copy,
/// swapping it in only if every step succeeded. Runs at most once per
/// version step and is never retried.
fn upgrade(
    data: &mut StoreData,
    database: &str,
    tables: &std::collections::BTreeMap<String, TableSpec>,
) -> Result<()> {
    let mut scratch = data.clone();
    for (table_name, spec) in tables {
        let exists = scratch.tables.contains_key(table_name);
        if spec.drop {
            if exists {
                scratch.tables.remove(table_name);
                debug!(database, table = %table_name, "table dropped");
            }
            continue;
        }
        for index in &spec.indexes {
            if index.name.is_empty() || index.columns.is_empty() {
                return Err(Error::Configuration(format!(
                    "index declarations on table '{table_name}' of '{database}' need a name and at least one column"
                )));
            }
        }
        if !exists {
            if spec.key.path.is_none() && !spec.key.auto_increment {
                return Err(Error::Configuration(format!(
                    "table '{table_name}' of '{database}' must declare a key path or auto-increment"
                )));
            }
            scratch.tables.insert(
                table_name.clone(),
                crate::store::data::TableData::new(table_name, spec.key.clone(), &spec.indexes),
            );
            debug!(database, table = %table_name, "table created");
        } else if let Some(table) = scratch.tables.get_mut(table_name) {
            for index in &spec.indexes {
                if !table.indexes.contains_key(&index.name) {
                    table.add_index(index.clone())?;
                    debug!(database, table = %table_name, index = %index.name, "index created");
                }
            }
            for dropped in &spec.delindexes {
                table.indexes.remove(dropped);
            }
        }
    }
    *data = scratch;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::plan::WriteOp;
    use crate::types::{IndexSpec, KeySpec, SchemaDescriptor};
    use serde_json::json;

    #[test]
    fn upgrade_creates_and_drops_tables() {
        let mut data = StoreData::new();
        let declared = SchemaDescriptor::new("db", 1)
            .table("kanji", TableSpec::new(KeySpec::path("key")))
            .tables;
        upgrade(&mut data, "db", &declared).unwrap();
        assert!(data.tables.contains_key("kanji"));

        let declared = SchemaDescriptor::new("db", 2)
            .table("kanji", TableSpec::dropped())
            .tables;
        upgrade(&mut data, "db", &declared).unwrap();
        assert!(data.tables.is_empty());
    }

    #[test]
    fn upgrade_rejects_keyless_tables_and_nameless_indexes() {
        let mut data = StoreData::new();
        let declared = SchemaDescriptor::new("db", 1)
            .table("t", TableSpec::new(KeySpec::default()))
            .tables;
        assert!(matches!(
            upgrade(&mut data, "db", &declared).unwrap_err(),
            Error::Configuration(_)
        ));

        let declared = SchemaDescriptor::new("db", 1)
            .table(
                "t",
                TableSpec::new(KeySpec::path("key")).index(IndexSpec::composite("bad", vec![])),
            )
            .tables;
        assert!(matches!(
            upgrade(&mut data, "db", &declared).unwrap_err(),
            Error::Configuration(_)
        ));
        assert!(data.tables.is_empty());
    }

    #[test]
    fn failed_backfill_leaves_the_store_untouched() {
        let mut data = StoreData::new();
        let declared = SchemaDescriptor::new("db", 1)
            .table("kanji", TableSpec::new(KeySpec::path("key")))
            .tables;
        upgrade(&mut data, "db", &declared).unwrap();
        data.apply(WriteOp::Insert {
            table: "kanji".to_string(),
            records: vec![
                json!({"key": "a", "level": 1}),
                json!({"key": "b", "level": 1}),
            ],
        })
        .unwrap();

        let declared = SchemaDescriptor::new("db", 2)
            .table(
                "kanji",
                TableSpec::new(KeySpec::path("key"))
                    .index(IndexSpec::new("level", "level").unique()),
            )
            .tables;
        assert!(upgrade(&mut data, "db", &declared).is_err());
        assert!(data.tables["kanji"].indexes.is_empty());
        assert_eq!(data.tables["kanji"].rows.len(), 2);
    }
}
