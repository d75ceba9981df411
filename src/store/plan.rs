//! Compiled execution plans handed from the builders to the store task.
//!
//! Builders validate and compile synchronously; the store executes plans
//! without further interpretation of builder state.

use serde_json::Value;

use crate::types::{FieldOp, Key, KeyRange, RecordView};

/// Predicate over a candidate record, applied after range matching.
pub(crate) type RecordPredicate = Box<dyn Fn(&Value) -> bool + Send>;

/// Predicate over a record view, used by bulk deletes and `del_if`.
pub(crate) type ViewPredicate = Box<dyn Fn(&RecordView<'_>) -> bool + Send>;

/// What a query scan yields per hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Projection {
    Records,
    Keys,
    Pairs,
}

/// A compiled query: range, direction, projection, and limits.
pub(crate) struct QueryPlan {
    pub table: String,
    pub index: Option<String>,
    pub range: KeyRange,
    pub descending: bool,
    pub distinct: bool,
    pub projection: Projection,
    /// 0 means no cap.
    pub cap: usize,
    pub count: bool,
    pub filter: Option<RecordPredicate>,
}

/// A field-deletion rule in a bulk update.
pub(crate) enum DelRule {
    Field(String),
    When(String, ViewPredicate),
}

/// A compiled bulk update: one write-capable pass over the range applying
/// every set, then every del, per record.
pub(crate) struct MutatePlan {
    pub table: String,
    pub index: Option<String>,
    pub range: KeyRange,
    pub sets: Vec<(String, FieldOp)>,
    pub dels: Vec<DelRule>,
}

/// A compiled bulk delete.
pub(crate) struct SweepPlan {
    pub table: String,
    pub index: Option<String>,
    pub range: KeyRange,
    pub filter: Option<ViewPredicate>,
}

/// A single-table write batch.
#[derive(Debug)]
pub(crate) enum WriteOp {
    Insert { table: String, records: Vec<Value> },
    Upsert { table: String, records: Vec<Value> },
    Delete { table: String, keys: Vec<Key> },
}

/// One accumulated transaction unit.
#[derive(Debug)]
pub(crate) struct TxUnit {
    pub table: String,
    pub op: UnitOp,
}

#[derive(Debug)]
pub(crate) enum UnitOp {
    Insert(Value),
    Update(Value),
    Remove(Key),
}
