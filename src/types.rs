//! Core data types: keys, ranges, schema descriptors, and result shapes.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ValidationError;

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// An ordered store key.
///
/// Keys sort by type first (numbers before strings before composites) and
/// within a type by their natural order; numbers use a total order so a key
/// set is always well-defined. Null, boolean, and object values are not
/// valid keys and are rejected at extraction time.
#[derive(Debug, Clone)]
pub enum Key {
    Number(f64),
    String(String),
    Composite(Vec<Key>),
}

impl Key {
    fn rank(&self) -> u8 {
        match self {
            Key::Number(_) => 0,
            Key::String(_) => 1,
            Key::Composite(_) => 2,
        }
    }

    /// Extracts a key from a JSON value, rejecting types the store cannot
    /// order.
    pub fn from_value(value: &Value) -> Result<Self, ValidationError> {
        match value {
            Value::Number(n) => n
                .as_f64()
                .filter(|f| f.is_finite())
                .map(Key::Number)
                .ok_or_else(|| ValidationError::InvalidKey("non-finite number".into())),
            Value::String(s) => Ok(Key::String(s.clone())),
            Value::Array(items) => items
                .iter()
                .map(Key::from_value)
                .collect::<Result<Vec<_>, _>>()
                .map(Key::Composite),
            Value::Null => Err(ValidationError::InvalidKey("null is not a valid key".into())),
            Value::Bool(_) => Err(ValidationError::InvalidKey(
                "booleans are not valid keys".into(),
            )),
            Value::Object(_) => Err(ValidationError::InvalidKey(
                "objects are not valid keys".into(),
            )),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Key::Number(n) => serde_json::Number::from_f64(*n)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Key::String(s) => Value::String(s.clone()),
            Key::Composite(parts) => Value::Array(parts.iter().map(Key::to_value).collect()),
        }
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Key {}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Key::Number(a), Key::Number(b)) => a.total_cmp(b),
            (Key::String(a), Key::String(b)) => a.cmp(b),
            (Key::Composite(a), Key::Composite(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Number(n) => write!(f, "{n}"),
            Key::String(s) => write!(f, "'{s}'"),
            Key::Composite(parts) => {
                write!(f, "[")?;
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{part}")?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<f64> for Key {
    fn from(v: f64) -> Self {
        Key::Number(v)
    }
}

impl From<i32> for Key {
    fn from(v: i32) -> Self {
        Key::Number(v as f64)
    }
}

impl From<i64> for Key {
    fn from(v: i64) -> Self {
        Key::Number(v as f64)
    }
}

impl From<u64> for Key {
    fn from(v: u64) -> Self {
        Key::Number(v as f64)
    }
}

impl From<&str> for Key {
    fn from(v: &str) -> Self {
        Key::String(v.to_string())
    }
}

impl From<String> for Key {
    fn from(v: String) -> Self {
        Key::String(v)
    }
}

impl From<Vec<Key>> for Key {
    fn from(v: Vec<Key>) -> Self {
        Key::Composite(v)
    }
}

// ---------------------------------------------------------------------------
// Ranges
// ---------------------------------------------------------------------------

/// One endpoint of a key span. `open` excludes the endpoint itself.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyBound {
    pub key: Key,
    pub open: bool,
}

/// A compiled key range: either a single exact key or a span with optional
/// endpoints on either side. An absent endpoint is unbounded.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyRange {
    Only(Key),
    Span {
        lower: Option<KeyBound>,
        upper: Option<KeyBound>,
    },
}

impl KeyRange {
    pub fn unbounded() -> Self {
        KeyRange::Span {
            lower: None,
            upper: None,
        }
    }

    pub fn only(key: impl Into<Key>) -> Self {
        KeyRange::Only(key.into())
    }

    pub fn lower(key: impl Into<Key>, open: bool) -> Self {
        KeyRange::Span {
            lower: Some(KeyBound {
                key: key.into(),
                open,
            }),
            upper: None,
        }
    }

    pub fn upper(key: impl Into<Key>, open: bool) -> Self {
        KeyRange::Span {
            lower: None,
            upper: Some(KeyBound {
                key: key.into(),
                open,
            }),
        }
    }

    pub fn span(
        lower: impl Into<Key>,
        upper: impl Into<Key>,
        open_lower: bool,
        open_upper: bool,
    ) -> Self {
        KeyRange::Span {
            lower: Some(KeyBound {
                key: lower.into(),
                open: open_lower,
            }),
            upper: Some(KeyBound {
                key: upper.into(),
                open: open_upper,
            }),
        }
    }

    pub fn contains(&self, key: &Key) -> bool {
        match self {
            KeyRange::Only(k) => k == key,
            KeyRange::Span { lower, upper } => {
                let above = lower.as_ref().is_none_or(|b| {
                    if b.open {
                        *key > b.key
                    } else {
                        *key >= b.key
                    }
                });
                let below = upper.as_ref().is_none_or(|b| {
                    if b.open {
                        *key < b.key
                    } else {
                        *key <= b.key
                    }
                });
                above && below
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Schema descriptors
// ---------------------------------------------------------------------------

/// Primary key declaration for a table. A declared path extracts the key
/// from the record (and receives generated keys when `auto_increment` is
/// set); without a path the table must be auto-increment and keys live
/// outside the record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeySpec {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub auto_increment: bool,
}

impl KeySpec {
    pub fn path(path: impl Into<String>) -> Self {
        KeySpec {
            path: Some(path.into()),
            auto_increment: false,
        }
    }

    pub fn auto() -> Self {
        KeySpec {
            path: None,
            auto_increment: true,
        }
    }

    pub fn path_auto(path: impl Into<String>) -> Self {
        KeySpec {
            path: Some(path.into()),
            auto_increment: true,
        }
    }
}

/// Secondary index declaration. Multi-column indexes produce composite
/// index keys; records missing any indexed column are not indexed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSpec {
    pub name: String,
    pub columns: Vec<String>,
    #[serde(default)]
    pub unique: bool,
}

impl IndexSpec {
    pub fn new(name: impl Into<String>, column: impl Into<String>) -> Self {
        IndexSpec {
            name: name.into(),
            columns: vec![column.into()],
            unique: false,
        }
    }

    pub fn composite(name: impl Into<String>, columns: Vec<String>) -> Self {
        IndexSpec {
            name: name.into(),
            columns,
            unique: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// Per-table declaration inside a schema descriptor. During an upgrade,
/// `drop` deletes an existing table, `delindexes` removes the named
/// secondary indexes, and any index absent from the store is created and
/// backfilled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSpec {
    pub key: KeySpec,
    #[serde(default)]
    pub indexes: Vec<IndexSpec>,
    #[serde(default)]
    pub delindexes: Vec<String>,
    #[serde(default)]
    pub drop: bool,
}

impl TableSpec {
    pub fn new(key: KeySpec) -> Self {
        TableSpec {
            key,
            indexes: Vec::new(),
            delindexes: Vec::new(),
            drop: false,
        }
    }

    pub fn index(mut self, index: IndexSpec) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn drop_index(mut self, name: impl Into<String>) -> Self {
        self.delindexes.push(name.into());
        self
    }

    /// Marks an existing table for deletion at upgrade time.
    pub fn dropped() -> Self {
        TableSpec {
            key: KeySpec::default(),
            indexes: Vec::new(),
            delindexes: Vec::new(),
            drop: true,
        }
    }
}

/// The open request: database name, requested version, and the table
/// declarations to reconcile when the version moves forward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    pub name: String,
    pub version: u32,
    #[serde(default)]
    pub tables: BTreeMap<String, TableSpec>,
}

impl SchemaDescriptor {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        SchemaDescriptor {
            name: name.into(),
            version,
            tables: BTreeMap::new(),
        }
    }

    pub fn table(mut self, name: impl Into<String>, spec: TableSpec) -> Self {
        self.tables.insert(name.into(), spec);
        self
    }
}

// ---------------------------------------------------------------------------
// Query results
// ---------------------------------------------------------------------------

/// An index scan hit projected as a key pair.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexPair {
    pub primary: Key,
    pub index: Key,
}

/// The resolved shape of a query, one variant per projection mode.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutput {
    Count(u64),
    Records(Vec<Value>),
    Keys(Vec<Key>),
    Pairs(Vec<IndexPair>),
}

impl QueryOutput {
    pub fn count(self) -> Option<u64> {
        match self {
            QueryOutput::Count(n) => Some(n),
            _ => None,
        }
    }

    pub fn records(self) -> Option<Vec<Value>> {
        match self {
            QueryOutput::Records(r) => Some(r),
            _ => None,
        }
    }

    pub fn keys(self) -> Option<Vec<Key>> {
        match self {
            QueryOutput::Keys(k) => Some(k),
            _ => None,
        }
    }

    pub fn pairs(self) -> Option<Vec<IndexPair>> {
        match self {
            QueryOutput::Pairs(p) => Some(p),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Transaction results
// ---------------------------------------------------------------------------

/// Keys affected in one table by a committed transaction, grouped by the
/// kind of unit that produced them, in accumulation order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableOutcome {
    pub insert: Vec<Key>,
    pub update: Vec<Key>,
    pub remove: Vec<Key>,
}

/// Per-table outcome of a committed transaction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionReport {
    pub tables: BTreeMap<String, TableOutcome>,
}

// ---------------------------------------------------------------------------
// Field mutations
// ---------------------------------------------------------------------------

/// Read-only view over a record handed to derivations and predicates.
pub struct RecordView<'a>(&'a Value);

impl<'a> RecordView<'a> {
    pub(crate) fn new(record: &'a Value) -> Self {
        RecordView(record)
    }

    pub fn record(&self) -> &'a Value {
        self.0
    }

    pub fn get(&self, field: &str) -> Option<&'a Value> {
        self.0.get(field)
    }

    pub fn str(&self, field: &str) -> Option<&'a str> {
        self.get(field).and_then(Value::as_str)
    }

    pub fn number(&self, field: &str) -> Option<f64> {
        self.get(field).and_then(Value::as_f64)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.get(field).is_some()
    }
}

/// A field replacement in a bulk update: either a literal value or a
/// derivation over the record's current fields. Derivations see the effect
/// of earlier `set` clauses applied to the same record.
pub enum FieldOp {
    Literal(Value),
    Derived(Box<dyn Fn(&RecordView<'_>) -> Value + Send>),
}

impl FieldOp {
    pub fn literal(value: impl Into<Value>) -> Self {
        FieldOp::Literal(value.into())
    }

    pub fn derived(f: impl Fn(&RecordView<'_>) -> Value + Send + 'static) -> Self {
        FieldOp::Derived(Box::new(f))
    }
}

impl fmt::Debug for FieldOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldOp::Literal(v) => f.debug_tuple("Literal").field(v).finish(),
            FieldOp::Derived(_) => f.write_str("Derived(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_type_order_is_number_string_composite() {
        let n = Key::from(1);
        let s = Key::from("a");
        let c = Key::Composite(vec![Key::from(1)]);
        assert!(n < s);
        assert!(s < c);
    }

    #[test]
    fn keys_order_within_type() {
        assert!(Key::from(2) < Key::from(10));
        assert!(Key::from("apple") < Key::from("banana"));
        assert!(
            Key::Composite(vec![Key::from(1), Key::from("a")])
                < Key::Composite(vec![Key::from(1), Key::from("b")])
        );
    }

    #[test]
    fn invalid_key_types_are_rejected() {
        assert!(Key::from_value(&json!(null)).is_err());
        assert!(Key::from_value(&json!(true)).is_err());
        assert!(Key::from_value(&json!({"k": 1})).is_err());
        assert!(Key::from_value(&json!([1, null])).is_err());
        assert!(Key::from_value(&json!([1, "a"])).is_ok());
    }

    #[test]
    fn range_contains_honors_open_and_closed_endpoints() {
        let closed = KeyRange::span(1, 3, false, false);
        assert!(closed.contains(&Key::from(1)));
        assert!(closed.contains(&Key::from(3)));

        let open = KeyRange::span(1, 3, true, true);
        assert!(!open.contains(&Key::from(1)));
        assert!(open.contains(&Key::from(2)));
        assert!(!open.contains(&Key::from(3)));

        let only = KeyRange::only("k");
        assert!(only.contains(&Key::from("k")));
        assert!(!only.contains(&Key::from("l")));

        assert!(KeyRange::unbounded().contains(&Key::from(42)));
    }

    #[test]
    fn descriptor_round_trips_through_json() {
        let descriptor = SchemaDescriptor::new("app", 2)
            .table(
                "kanji",
                TableSpec::new(KeySpec::path("key")).index(IndexSpec::new("order", "order").unique()),
            )
            .table("scratch", TableSpec::dropped());
        let encoded = serde_json::to_string(&descriptor).unwrap();
        let decoded: SchemaDescriptor = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.name, "app");
        assert_eq!(decoded.version, 2);
        assert!(decoded.tables["scratch"].drop);
        assert!(decoded.tables["kanji"].indexes[0].unique);
    }
}
