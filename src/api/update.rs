//! The bulk update builder: one write-capable pass that rewrites every
//! record in a range.

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::trace;

use crate::api::pending::Pending;
use crate::api::table::Table;
use crate::error::{Error, Result};
use crate::store::Command;
use crate::store::plan::{DelRule, MutatePlan};
use crate::types::{FieldOp, Key, KeyRange, RecordView};

/// Accumulates field replacements and deletions, then applies them in one
/// pass over the range. Obtained from [`Table::bulk_update`].
///
/// Unlike [`Query`](crate::Query), the range methods here overwrite each
/// other: the last bound call before `go` wins wholesale.
pub struct BulkUpdate {
    table: Table,
    index: Option<String>,
    range: Option<KeyRange>,
    sets: Vec<(String, FieldOp)>,
    dels: Vec<DelRule>,
}

impl BulkUpdate {
    pub(crate) fn new(table: Table) -> Self {
        BulkUpdate {
            table,
            index: None,
            range: None,
            sets: Vec::new(),
            dels: Vec::new(),
        }
    }

    pub fn index(mut self, name: &str) -> Self {
        self.index = Some(name.to_string());
        self
    }

    pub fn equals(mut self, key: impl Into<Key>) -> Self {
        self.range = Some(KeyRange::only(key));
        self
    }

    pub fn lower_bound(mut self, key: impl Into<Key>, open: bool) -> Self {
        self.range = Some(KeyRange::lower(key, open));
        self
    }

    pub fn upper_bound(mut self, key: impl Into<Key>, open: bool) -> Self {
        self.range = Some(KeyRange::upper(key, open));
        self
    }

    pub fn bounds(
        mut self,
        lower: impl Into<Key>,
        upper: impl Into<Key>,
        open_lower: bool,
        open_upper: bool,
    ) -> Self {
        self.range = Some(KeyRange::span(lower, upper, open_lower, open_upper));
        self
    }

    /// Replaces `field` with a literal value in every matched record.
    pub fn set(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.sets.push((field.to_string(), FieldOp::Literal(value.into())));
        self
    }

    /// Replaces `field` with a value derived from the record. Earlier `set`
    /// clauses applied to the same record are visible to the derivation.
    pub fn set_from(
        mut self,
        field: &str,
        derive: impl Fn(&RecordView<'_>) -> Value + Send + 'static,
    ) -> Self {
        self.sets.push((field.to_string(), FieldOp::derived(derive)));
        self
    }

    /// Adds a field mutation in its tagged form.
    pub fn set_op(mut self, field: &str, op: FieldOp) -> Self {
        self.sets.push((field.to_string(), op));
        self
    }

    /// Deletes `field` from every matched record. Deletions run after all
    /// replacements.
    pub fn del(mut self, field: &str) -> Self {
        self.dels.push(DelRule::Field(field.to_string()));
        self
    }

    pub fn del_many(mut self, fields: Vec<String>) -> Self {
        for field in fields {
            self.dels.push(DelRule::Field(field));
        }
        self
    }

    /// Deletes `field` only from records matching the predicate.
    pub fn del_if(
        mut self,
        field: &str,
        predicate: impl Fn(&RecordView<'_>) -> bool + Send + 'static,
    ) -> Self {
        self.dels
            .push(DelRule::When(field.to_string(), Box::new(predicate)));
        self
    }

    /// Admits the pass. Resolves with the written primary keys in cursor
    /// order. Fails synchronously with `MissingMutation` when no set or
    /// del clause was given.
    pub fn go(self) -> Result<Pending<Vec<Key>>> {
        self.table.ensure_open()?;
        if self.sets.is_empty() && self.dels.is_empty() {
            return Err(Error::MissingMutation);
        }
        let plan = MutatePlan {
            table: self.table.name().to_string(),
            index: self.index,
            range: self.range.unwrap_or_else(KeyRange::unbounded),
            sets: self.sets,
            dels: self.dels,
        };
        let guard = self.table.pending().acquire();
        let (tx, rx) = oneshot::channel();
        self.table.link().send(Command::Mutate { plan, reply: tx })?;
        trace!(table = %self.table.name(), "bulk update admitted");
        Ok(Pending::new(rx, vec![guard]))
    }
}
