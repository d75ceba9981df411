//! Multi-table atomic transactions.

use std::collections::BTreeMap;

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::trace;

use crate::api::database::Database;
use crate::api::pending::{Pending, WriteGuard};
use crate::api::table::Table;
use crate::error::{Error, Result};
use crate::store::Command;
use crate::store::plan::{TxUnit, UnitOp};
use crate::types::{Key, TransactionReport};

/// Accumulates write units across tables and commits them as one atomic
/// batch. Obtained from [`Database::transaction`].
///
/// Accumulation is pure local bookkeeping: a transaction that is never
/// committed has no durable side effects, and pending-write counters move
/// only at [`commit`](Transaction::commit).
#[derive(Debug)]
pub struct Transaction {
    database: Database,
    units: Vec<TxUnit>,
}

impl Transaction {
    pub(crate) fn new(database: Database) -> Self {
        Transaction {
            database,
            units: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    fn handle(&self, table: &str) -> Result<Table> {
        self.database.table(table).ok_or_else(|| Error::UnknownTable {
            database: self.database.name().to_string(),
            table: table.to_string(),
        })
    }

    pub fn insert(&mut self, table: &str, record: Value) -> Result<&mut Self> {
        self.insert_many(table, vec![record])
    }

    pub fn insert_many(&mut self, table: &str, records: Vec<Value>) -> Result<&mut Self> {
        let handle = self.handle(table)?;
        for record in &records {
            handle.validate_record(record)?;
        }
        for record in records {
            self.units.push(TxUnit {
                table: table.to_string(),
                op: UnitOp::Insert(record),
            });
        }
        Ok(self)
    }

    pub fn update(&mut self, table: &str, record: Value) -> Result<&mut Self> {
        self.update_many(table, vec![record])
    }

    pub fn update_many(&mut self, table: &str, records: Vec<Value>) -> Result<&mut Self> {
        let handle = self.handle(table)?;
        for record in &records {
            handle.validate_record(record)?;
        }
        for record in records {
            self.units.push(TxUnit {
                table: table.to_string(),
                op: UnitOp::Update(record),
            });
        }
        Ok(self)
    }

    pub fn remove(&mut self, table: &str, key: impl Into<Key>) -> Result<&mut Self> {
        self.remove_many(table, vec![key.into()])
    }

    pub fn remove_many(&mut self, table: &str, keys: Vec<Key>) -> Result<&mut Self> {
        self.handle(table)?;
        for key in keys {
            self.units.push(TxUnit {
                table: table.to_string(),
                op: UnitOp::Remove(key),
            });
        }
        Ok(self)
    }

    /// Admits the whole batch as one store command. Units replay in
    /// accumulation order against scratch copies of the touched tables;
    /// any failure aborts the lot. Each touched table's pending-write
    /// counter is held for the commit's duration, sized by its unit count.
    ///
    /// An empty transaction resolves to an empty report without touching
    /// the store.
    pub fn commit(self) -> Result<Pending<TransactionReport>> {
        if self.database.is_closed() {
            return Err(Error::Closed(self.database.name().to_string()));
        }
        if self.units.is_empty() {
            return Ok(Pending::ready(Ok(TransactionReport::default())));
        }
        let mut unit_counts: BTreeMap<String, usize> = BTreeMap::new();
        for unit in &self.units {
            *unit_counts.entry(unit.table.clone()).or_default() += 1;
        }
        let mut guards: Vec<WriteGuard> = Vec::with_capacity(unit_counts.len());
        for (table, count) in &unit_counts {
            if let Some(handle) = self.database.table(table) {
                guards.push(handle.pending().acquire_many(*count));
            }
        }
        let (tx, rx) = oneshot::channel();
        self.database.link().send(Command::Commit {
            units: self.units,
            reply: tx,
        })?;
        trace!(
            database = %self.database.name(),
            tables = unit_counts.len(),
            "transaction admitted"
        );
        Ok(Pending::new(rx, guards))
    }
}
