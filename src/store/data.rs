//! In-memory backing store: rows, materialized secondary indexes, and the
//! execution of admitted commands.
//!
//! Every multi-record write and every transaction commit runs against a
//! scratch copy of the touched tables and swaps it in only on success, so a
//! failed command leaves no partial effects.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

use serde_json::Value;

use crate::error::{Error, Result, StoreError, ValidationError};
use crate::store::plan::{DelRule, MutatePlan, Projection, QueryPlan, SweepPlan, TxUnit, UnitOp, WriteOp};
use crate::types::{
    FieldOp, IndexPair, IndexSpec, Key, KeyBound, KeyRange, KeySpec, QueryOutput, RecordView,
    TableOutcome, TransactionReport,
};

/// A materialized secondary index: index key to the set of primary keys
/// carrying it.
#[derive(Debug, Clone)]
pub(crate) struct IndexData {
    pub spec: IndexSpec,
    pub entries: BTreeMap<Key, BTreeSet<Key>>,
}

impl IndexData {
    fn new(spec: IndexSpec) -> Self {
        IndexData {
            spec,
            entries: BTreeMap::new(),
        }
    }
}

/// One table: primary-key spec, rows ordered by key, secondary indexes, and
/// the auto-increment sequence. The sequence survives `clear`; only
/// dropping the store resets it.
#[derive(Debug, Clone)]
pub(crate) struct TableData {
    pub name: String,
    pub key: KeySpec,
    pub rows: BTreeMap<Key, Value>,
    pub indexes: BTreeMap<String, IndexData>,
    pub auto_seq: u64,
}

impl TableData {
    pub(crate) fn new(name: &str, key: KeySpec, indexes: &[IndexSpec]) -> Self {
        TableData {
            name: name.to_string(),
            key,
            rows: BTreeMap::new(),
            indexes: indexes
                .iter()
                .map(|spec| (spec.name.clone(), IndexData::new(spec.clone())))
                .collect(),
            auto_seq: 0,
        }
    }

    /// Builds and backfills a new index over the existing rows. A unique
    /// violation in the backfill fails without touching the table.
    pub(crate) fn add_index(&mut self, spec: IndexSpec) -> Result<()> {
        let mut index = IndexData::new(spec);
        for (pk, record) in &self.rows {
            let Some(ik) = index_key(&index.spec.columns, record) else {
                continue;
            };
            if index.spec.unique && index.entries.contains_key(&ik) {
                return Err(StoreError::UniqueViolation {
                    index: index.spec.name.clone(),
                    key: ik,
                }
                .into());
            }
            index.entries.entry(ik).or_default().insert(pk.clone());
        }
        self.indexes.insert(index.spec.name.clone(), index);
        Ok(())
    }

    /// Resolves the primary key for an incoming record, consuming the
    /// auto-increment sequence and injecting the generated key when the
    /// table declares a key path.
    fn resolve_key(&mut self, record: &mut Value) -> Result<Key> {
        match &self.key.path {
            Some(path) => match record.get(path) {
                Some(v) => Key::from_value(v).map_err(Error::from),
                None if self.key.auto_increment => {
                    self.auto_seq += 1;
                    let key = Key::Number(self.auto_seq as f64);
                    if let Value::Object(map) = record {
                        map.insert(path.clone(), key.to_value());
                    }
                    Ok(key)
                }
                None => Err(ValidationError::MissingKeyField {
                    table: self.name.clone(),
                    field: path.clone(),
                }
                .into()),
            },
            // No key path: the table was created auto-increment and keys
            // live outside the record.
            None => {
                self.auto_seq += 1;
                Ok(Key::Number(self.auto_seq as f64))
            }
        }
    }

    fn insert_record(&mut self, mut record: Value) -> Result<Key> {
        let key = self.resolve_key(&mut record)?;
        if self.rows.contains_key(&key) {
            return Err(StoreError::DuplicateKey {
                table: self.name.clone(),
                key,
            }
            .into());
        }
        self.index_link(&record, &key)?;
        self.rows.insert(key.clone(), record);
        Ok(key)
    }

    fn upsert_record(&mut self, mut record: Value) -> Result<Key> {
        let key = self.resolve_key(&mut record)?;
        if let Some(old) = self.rows.get(&key).cloned() {
            self.index_unlink(&old, &key);
        }
        self.index_link(&record, &key)?;
        self.rows.insert(key.clone(), record);
        Ok(key)
    }

    /// Removing an absent key is a no-op success.
    fn remove_record(&mut self, key: &Key) {
        if let Some(old) = self.rows.remove(key) {
            self.index_unlink(&old, key);
        }
    }

    fn clear(&mut self) {
        self.rows.clear();
        for index in self.indexes.values_mut() {
            index.entries.clear();
        }
    }

    fn index_link(&mut self, record: &Value, pk: &Key) -> Result<()> {
        for index in self.indexes.values_mut() {
            let Some(ik) = index_key(&index.spec.columns, record) else {
                continue;
            };
            if index.spec.unique
                && index.entries.get(&ik).is_some_and(|pks| !pks.is_empty())
            {
                return Err(StoreError::UniqueViolation {
                    index: index.spec.name.clone(),
                    key: ik,
                }
                .into());
            }
            index.entries.entry(ik).or_default().insert(pk.clone());
        }
        Ok(())
    }

    fn index_unlink(&mut self, record: &Value, pk: &Key) {
        for index in self.indexes.values_mut() {
            let Some(ik) = index_key(&index.spec.columns, record) else {
                continue;
            };
            if let Some(pks) = index.entries.get_mut(&ik) {
                pks.remove(pk);
                if pks.is_empty() {
                    index.entries.remove(&ik);
                }
            }
        }
    }

    fn count(&self, index: Option<&str>, range: &KeyRange) -> Result<u64> {
        if is_empty_span(range) {
            return Ok(0);
        }
        let bounds = range_bounds(range);
        match index {
            None => Ok(self.rows.range::<Key, _>(bounds).count() as u64),
            Some(name) => {
                let index = self.index(name)?;
                Ok(index
                    .entries
                    .range::<Key, _>(bounds)
                    .map(|(_, pks)| pks.len() as u64)
                    .sum())
            }
        }
    }

    fn index(&self, name: &str) -> Result<&IndexData> {
        self.indexes.get(name).ok_or_else(|| {
            StoreError::UnknownIndex {
                table: self.name.clone(),
                index: name.to_string(),
            }
            .into()
        })
    }

    /// Primary keys hit by an ascending cursor over the range, the order in
    /// which bulk passes visit records.
    fn cursor_keys(&self, index: Option<&str>, range: &KeyRange) -> Result<Vec<Key>> {
        if is_empty_span(range) {
            return Ok(Vec::new());
        }
        let bounds = range_bounds(range);
        match index {
            None => Ok(self.rows.range::<Key, _>(bounds).map(|(k, _)| k.clone()).collect()),
            Some(name) => {
                let index = self.index(name)?;
                Ok(index
                    .entries
                    .range::<Key, _>(bounds)
                    .flat_map(|(_, pks)| pks.iter().cloned())
                    .collect())
            }
        }
    }

    fn scan_primary(&self, plan: &QueryPlan) -> Result<QueryOutput> {
        if matches!(plan.projection, Projection::Pairs) {
            return Err(ValidationError::KeyValueNeedsIndex.into());
        }
        let mut records = Vec::new();
        let mut keys = Vec::new();
        if !is_empty_span(&plan.range) {
            let bounds = range_bounds(&plan.range);
            let iter: Box<dyn Iterator<Item = (&Key, &Value)>> = if plan.descending {
                Box::new(self.rows.range::<Key, _>(bounds).rev())
            } else {
                Box::new(self.rows.range::<Key, _>(bounds))
            };
            let mut taken = 0usize;
            for (key, record) in iter {
                if plan.cap != 0 && taken >= plan.cap {
                    break;
                }
                if let Some(filter) = &plan.filter {
                    if !filter(record) {
                        continue;
                    }
                }
                match plan.projection {
                    Projection::Records => records.push(record.clone()),
                    Projection::Keys => keys.push(key.clone()),
                    Projection::Pairs => unreachable!("rejected above"),
                }
                taken += 1;
            }
        }
        Ok(match plan.projection {
            Projection::Records => QueryOutput::Records(records),
            _ => QueryOutput::Keys(keys),
        })
    }

    fn scan_index(&self, name: &str, plan: &QueryPlan) -> Result<QueryOutput> {
        let index = self.index(name)?;
        let mut hits: Vec<(&Key, &Key)> = Vec::new();
        if !is_empty_span(&plan.range) {
            let bounds = range_bounds(&plan.range);
            if plan.descending {
                for (ik, pks) in index.entries.range::<Key, _>(bounds).rev() {
                    if plan.distinct {
                        if let Some(pk) = pks.first() {
                            hits.push((ik, pk));
                        }
                    } else {
                        for pk in pks.iter().rev() {
                            hits.push((ik, pk));
                        }
                    }
                }
            } else {
                for (ik, pks) in index.entries.range::<Key, _>(bounds) {
                    if plan.distinct {
                        if let Some(pk) = pks.first() {
                            hits.push((ik, pk));
                        }
                    } else {
                        for pk in pks {
                            hits.push((ik, pk));
                        }
                    }
                }
            }
        }

        let mut records = Vec::new();
        let mut keys = Vec::new();
        let mut pairs = Vec::new();
        let mut taken = 0usize;
        for (ik, pk) in hits {
            if plan.cap != 0 && taken >= plan.cap {
                break;
            }
            let Some(record) = self.rows.get(pk) else {
                continue;
            };
            if let Some(filter) = &plan.filter {
                if !filter(record) {
                    continue;
                }
            }
            match plan.projection {
                Projection::Records => records.push(record.clone()),
                Projection::Keys => keys.push(pk.clone()),
                Projection::Pairs => pairs.push(IndexPair {
                    primary: pk.clone(),
                    index: ik.clone(),
                }),
            }
            taken += 1;
        }
        Ok(match plan.projection {
            Projection::Records => QueryOutput::Records(records),
            Projection::Keys => QueryOutput::Keys(keys),
            Projection::Pairs => QueryOutput::Pairs(pairs),
        })
    }
}

/// Per-store state: the committed version and every table.
#[derive(Debug, Clone)]
pub(crate) struct StoreData {
    pub version: u32,
    pub tables: BTreeMap<String, TableData>,
}

impl StoreData {
    pub(crate) fn new() -> Self {
        StoreData {
            version: 0,
            tables: BTreeMap::new(),
        }
    }

    fn table(&self, name: &str) -> Result<&TableData> {
        self.tables
            .get(name)
            .ok_or_else(|| StoreError::UnknownTable(name.to_string()).into())
    }

    fn scratch(&self, name: &str) -> Result<TableData> {
        self.table(name).cloned()
    }

    /// Applies a single-table write batch atomically.
    pub(crate) fn apply(&mut self, op: WriteOp) -> Result<Vec<Key>> {
        match op {
            WriteOp::Insert { table, records } => {
                let mut scratch = self.scratch(&table)?;
                let keys = records
                    .into_iter()
                    .map(|r| scratch.insert_record(r))
                    .collect::<Result<Vec<_>>>()?;
                self.tables.insert(table, scratch);
                Ok(keys)
            }
            WriteOp::Upsert { table, records } => {
                let mut scratch = self.scratch(&table)?;
                let keys = records
                    .into_iter()
                    .map(|r| scratch.upsert_record(r))
                    .collect::<Result<Vec<_>>>()?;
                self.tables.insert(table, scratch);
                Ok(keys)
            }
            WriteOp::Delete { table, keys } => {
                let mut scratch = self.scratch(&table)?;
                for key in &keys {
                    scratch.remove_record(key);
                }
                self.tables.insert(table, scratch);
                Ok(keys)
            }
        }
    }

    pub(crate) fn clear(&mut self, table: &str) -> Result<()> {
        self.tables
            .get_mut(table)
            .ok_or_else(|| Error::from(StoreError::UnknownTable(table.to_string())))?
            .clear();
        Ok(())
    }

    /// Replays transaction units against scratch copies of every touched
    /// table and swaps them all in only if every unit succeeded.
    pub(crate) fn commit(&mut self, units: Vec<TxUnit>) -> Result<TransactionReport> {
        let mut scratch: BTreeMap<String, TableData> = BTreeMap::new();
        for unit in &units {
            if !scratch.contains_key(&unit.table) {
                scratch.insert(unit.table.clone(), self.scratch(&unit.table)?);
            }
        }
        let mut report = TransactionReport::default();
        for TxUnit { table, op } in units {
            let data = scratch
                .get_mut(&table)
                .ok_or_else(|| Error::from(StoreError::UnknownTable(table.clone())))?;
            let outcome: &mut TableOutcome = report.tables.entry(table.clone()).or_default();
            match op {
                UnitOp::Insert(record) => outcome.insert.push(data.insert_record(record)?),
                UnitOp::Update(record) => outcome.update.push(data.upsert_record(record)?),
                UnitOp::Remove(key) => {
                    data.remove_record(&key);
                    outcome.remove.push(key);
                }
            }
        }
        for (name, data) in scratch {
            self.tables.insert(name, data);
        }
        Ok(report)
    }

    pub(crate) fn query(&self, plan: &QueryPlan) -> Result<QueryOutput> {
        let data = self.table(&plan.table)?;
        if plan.count {
            return Ok(QueryOutput::Count(
                data.count(plan.index.as_deref(), &plan.range)?,
            ));
        }
        match &plan.index {
            None => data.scan_primary(plan),
            Some(name) => data.scan_index(name, plan),
        }
    }

    /// One write-capable pass: per record, apply every set (derivations see
    /// earlier sets), then every del, then persist. A pass that changes a
    /// record's primary key aborts the whole mutation.
    pub(crate) fn mutate(&mut self, plan: MutatePlan) -> Result<Vec<Key>> {
        let mut scratch = self.scratch(&plan.table)?;
        let pks = scratch.cursor_keys(plan.index.as_deref(), &plan.range)?;
        let mut written = Vec::with_capacity(pks.len());
        for pk in pks {
            let Some(old) = scratch.rows.get(&pk).cloned() else {
                continue;
            };
            let mut record = old.clone();
            for (field, op) in &plan.sets {
                let value = match op {
                    FieldOp::Literal(v) => v.clone(),
                    FieldOp::Derived(f) => f(&RecordView::new(&record)),
                };
                if let Value::Object(map) = &mut record {
                    map.insert(field.clone(), value);
                }
            }
            for rule in &plan.dels {
                let drop_field = match rule {
                    DelRule::Field(field) => Some(field),
                    DelRule::When(field, predicate) => {
                        predicate(&RecordView::new(&record)).then_some(field)
                    }
                };
                if let (Some(field), Value::Object(map)) = (drop_field, &mut record) {
                    map.remove(field);
                }
            }
            if let Some(path) = scratch.key.path.clone() {
                let new_key = match record.get(&path) {
                    Some(v) => Some(Key::from_value(v)?),
                    None => None,
                };
                if new_key.as_ref() != Some(&pk) {
                    return Err(StoreError::PrimaryKeyChanged {
                        table: plan.table.clone(),
                        key: pk,
                    }
                    .into());
                }
            }
            scratch.index_unlink(&old, &pk);
            scratch.index_link(&record, &pk)?;
            scratch.rows.insert(pk.clone(), record);
            written.push(pk);
        }
        self.tables.insert(plan.table, scratch);
        Ok(written)
    }

    /// Deletes every record in the range whose filter is absent or true.
    pub(crate) fn sweep(&mut self, plan: SweepPlan) -> Result<Vec<Key>> {
        let mut scratch = self.scratch(&plan.table)?;
        let pks = scratch.cursor_keys(plan.index.as_deref(), &plan.range)?;
        let mut deleted = Vec::new();
        for pk in pks {
            let hit = match (&plan.filter, scratch.rows.get(&pk)) {
                (None, Some(_)) => true,
                (Some(filter), Some(record)) => filter(&RecordView::new(record)),
                (_, None) => false,
            };
            if hit {
                scratch.remove_record(&pk);
                deleted.push(pk);
            }
        }
        self.tables.insert(plan.table, scratch);
        Ok(deleted)
    }
}

/// Computes a record's key under an index, or `None` when any indexed
/// column is missing or holds a non-key value (such records are simply not
/// indexed).
pub(crate) fn index_key(columns: &[String], record: &Value) -> Option<Key> {
    if columns.len() == 1 {
        Key::from_value(record.get(&columns[0])?).ok()
    } else {
        columns
            .iter()
            .map(|c| record.get(c).and_then(|v| Key::from_value(v).ok()))
            .collect::<Option<Vec<_>>>()
            .map(Key::Composite)
    }
}

/// An inverted or degenerate-open span matches nothing; `BTreeMap::range`
/// panics on such bounds, so they are filtered out up front.
fn is_empty_span(range: &KeyRange) -> bool {
    match range {
        KeyRange::Only(_) => false,
        KeyRange::Span {
            lower: Some(lo),
            upper: Some(hi),
        } => lo.key > hi.key || (lo.key == hi.key && (lo.open || hi.open)),
        KeyRange::Span { .. } => false,
    }
}

fn range_bounds(range: &KeyRange) -> (Bound<&Key>, Bound<&Key>) {
    fn endpoint(bound: &KeyBound) -> Bound<&Key> {
        if bound.open {
            Bound::Excluded(&bound.key)
        } else {
            Bound::Included(&bound.key)
        }
    }
    match range {
        KeyRange::Only(key) => (Bound::Included(key), Bound::Included(key)),
        KeyRange::Span { lower, upper } => (
            lower.as_ref().map(endpoint).unwrap_or(Bound::Unbounded),
            upper.as_ref().map(endpoint).unwrap_or(Bound::Unbounded),
        ),
    }
}
